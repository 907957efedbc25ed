//! Pure momentum factor math.
//!
//! # Invariants
//! - Every factor is in `[0, 1]`, so the weighted sum is too; the final
//!   score is still clamped.
//! - Without new events every factor is non-increasing in `now_ms`.

use crate::clock::MS_PER_DAY;
use crate::config::MomentumConfig;
use crate::model::activity::{ActivityEvent, ActivityKind, EntityType};
use crate::model::project::MomentumTrend;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

pub const RECENCY_WEIGHT: f64 = 0.40;
pub const COMPLETION_WEIGHT: f64 = 0.30;
pub const ACTIONABILITY_WEIGHT: f64 = 0.20;
pub const FREQUENCY_WEIGHT: f64 = 0.10;

/// The four normalized inputs of a momentum score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MomentumFactors {
    pub recency: f64,
    pub completion: f64,
    pub actionability: f64,
    pub frequency: f64,
}

impl MomentumFactors {
    pub fn score(&self) -> f64 {
        let raw = RECENCY_WEIGHT * self.recency
            + COMPLETION_WEIGHT * self.completion
            + ACTIONABILITY_WEIGHT * self.actionability
            + FREQUENCY_WEIGHT * self.frequency;
        clamp_unit(raw)
    }
}

/// Everything the factor math reads about one project.
pub struct ScoreInput<'a> {
    pub now_ms: i64,
    pub last_activity_at: Option<i64>,
    pub has_next_action: bool,
    /// Project events with `occurred_at` inside the widest window in use.
    pub events: &'a [ActivityEvent],
}

/// Earliest timestamp (exclusive) whose events can influence any factor.
pub fn event_horizon(config: &MomentumConfig, now_ms: i64, last_activity_at: Option<i64>) -> i64 {
    let completion = days_ms(config.completion_window_days);
    let frequency = days_ms(config.frequency_window_days);
    let anchor = last_activity_at.unwrap_or(now_ms).min(now_ms);
    (anchor - completion).min(now_ms - frequency)
}

pub fn compute_factors(config: &MomentumConfig, input: &ScoreInput<'_>) -> MomentumFactors {
    MomentumFactors {
        recency: recency(config, input.now_ms, input.last_activity_at),
        completion: completion_rate(config, input),
        actionability: if input.has_next_action { 1.0 } else { 0.0 },
        frequency: frequency(config, input),
    }
}

pub fn recency(config: &MomentumConfig, now_ms: i64, last_activity_at: Option<i64>) -> f64 {
    let Some(last) = last_activity_at else {
        return 0.0;
    };
    let days = (now_ms - last).max(0) as f64 / MS_PER_DAY as f64;
    clamp_unit(config.recency_after_days(days))
}

/// Completed tasks in the window ending now over tasks touched in the window
/// ending at the last activity.
fn completion_rate(config: &MomentumConfig, input: &ScoreInput<'_>) -> f64 {
    let Some(last) = input.last_activity_at else {
        return 0.0;
    };
    let window = days_ms(config.completion_window_days);
    let anchor = last.min(input.now_ms);

    let touched: BTreeSet<Uuid> = input
        .events
        .iter()
        .filter(|event| event.entity_type == EntityType::Task)
        .filter(|event| event.occurred_at > anchor - window && event.occurred_at <= anchor)
        .map(|event| event.entity_uuid)
        .collect();
    if touched.is_empty() {
        return 0.0;
    }

    let completed = input
        .events
        .iter()
        .filter(|event| event.entity_type == EntityType::Task)
        .filter(|event| event.kind == ActivityKind::Completed)
        .filter(|event| {
            event.occurred_at > input.now_ms - window && event.occurred_at <= input.now_ms
        })
        .filter(|event| touched.contains(&event.entity_uuid))
        .map(|event| event.entity_uuid)
        .collect::<BTreeSet<Uuid>>()
        .len();

    clamp_unit(completed as f64 / touched.len() as f64)
}

/// Distinct UTC days with activity over the window length.
fn frequency(config: &MomentumConfig, input: &ScoreInput<'_>) -> f64 {
    let window = days_ms(config.frequency_window_days);
    let days: BTreeSet<i64> = input
        .events
        .iter()
        .filter(|event| {
            event.occurred_at > input.now_ms - window && event.occurred_at <= input.now_ms
        })
        .map(|event| event.occurred_at.div_euclid(MS_PER_DAY))
        .collect();
    clamp_unit(days.len() as f64 / f64::from(config.frequency_window_days.max(1)))
}

pub fn trend(config: &MomentumConfig, current: f64, previous: Option<f64>) -> MomentumTrend {
    let Some(previous) = previous else {
        return MomentumTrend::Stable;
    };
    let delta = current - previous;
    if delta > config.trend_epsilon {
        MomentumTrend::Improving
    } else if delta < -config.trend_epsilon {
        MomentumTrend::Declining
    } else {
        MomentumTrend::Stable
    }
}

pub(crate) fn days_ms(days: u32) -> i64 {
    i64::from(days) * MS_PER_DAY
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::{compute_factors, trend, MomentumFactors, ScoreInput};
    use crate::clock::MS_PER_DAY;
    use crate::config::MomentumConfig;
    use crate::model::activity::{ActivityEvent, ActivityKind, EntityType, Origin};
    use crate::model::project::MomentumTrend;
    use uuid::Uuid;

    fn task_event(id: i64, task: Uuid, kind: ActivityKind, at: i64) -> ActivityEvent {
        ActivityEvent {
            id,
            entity_type: EntityType::Task,
            entity_uuid: task,
            project_uuid: None,
            kind,
            origin: Origin::Store,
            value: None,
            occurred_at: at,
        }
    }

    #[test]
    fn weights_sum_to_one() {
        let full = MomentumFactors {
            recency: 1.0,
            completion: 1.0,
            actionability: 1.0,
            frequency: 1.0,
        };
        assert!((full.score() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn fresh_activity_scores_recency_and_completion() {
        let config = MomentumConfig::default();
        let now = 30 * MS_PER_DAY;
        let done = Uuid::new_v4();
        let open = Uuid::new_v4();
        let events = vec![
            task_event(1, done, ActivityKind::Created, now - 2 * MS_PER_DAY),
            task_event(2, open, ActivityKind::Created, now - 2 * MS_PER_DAY),
            task_event(3, done, ActivityKind::Completed, now),
        ];
        let factors = compute_factors(
            &config,
            &ScoreInput {
                now_ms: now,
                last_activity_at: Some(now),
                has_next_action: true,
                events: &events,
            },
        );
        assert!((factors.recency - 1.0).abs() < 1e-9);
        assert!((factors.completion - 0.5).abs() < 1e-9);
        assert_eq!(factors.actionability, 1.0);
        assert!((factors.frequency - 2.0 / 14.0).abs() < 1e-9);
    }

    #[test]
    fn factors_never_increase_without_events() {
        let config = MomentumConfig::default();
        let start = 100 * MS_PER_DAY;
        let task = Uuid::new_v4();
        let events = vec![
            task_event(1, task, ActivityKind::Created, start - MS_PER_DAY),
            task_event(2, task, ActivityKind::Completed, start),
        ];

        let mut previous = f64::INFINITY;
        for hour in 0..(24 * 20) {
            let now = start + i64::from(hour) * 3_600_000;
            let score = compute_factors(
                &config,
                &ScoreInput {
                    now_ms: now,
                    last_activity_at: Some(start),
                    has_next_action: false,
                    events: &events,
                },
            )
            .score();
            assert!((0.0..=1.0).contains(&score));
            assert!(score <= previous, "score rose at hour {hour}");
            previous = score;
        }
        assert!(previous < 0.01);
    }

    #[test]
    fn trend_uses_epsilon_band() {
        let config = MomentumConfig::default();
        assert_eq!(trend(&config, 0.5, None), MomentumTrend::Stable);
        assert_eq!(trend(&config, 0.5, Some(0.48)), MomentumTrend::Stable);
        assert_eq!(trend(&config, 0.7, Some(0.5)), MomentumTrend::Improving);
        assert_eq!(trend(&config, 0.2, Some(0.5)), MomentumTrend::Declining);
    }
}
