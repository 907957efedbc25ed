//! Background timer driving reconcile and momentum recompute.
//!
//! # Invariants
//! - One worker thread per scheduler; ticks never overlap each other.
//! - Manual triggers and timer ticks run through the same engine, so the
//!   per-project locks still arbitrate against any other caller.
//! - `stop` cancels the in-flight cycle between projects, joins the thread
//!   and re-arms the engine's cancellation token, so later manual cycles on
//!   the same engine run normally.

use crate::model::project::ProjectId;
use crate::momentum::MomentumReport;
use crate::sync::engine::SyncEngine;
use crate::sync::report::CycleReport;
use log::{info, warn};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What caused a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickTrigger {
    Timer,
    Manual,
}

impl TickTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Manual => "manual",
        }
    }
}

/// Delivered to the sink after every tick.
#[derive(Debug)]
pub enum SchedulerEvent {
    Sync {
        trigger: TickTrigger,
        report: CycleReport,
    },
    Momentum {
        trigger: TickTrigger,
        result: Result<MomentumReport, String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerIntervals {
    pub sync: Duration,
    pub momentum: Duration,
}

enum Command {
    SyncNow,
    RecomputeNow(Option<ProjectId>),
    Stop,
}

pub struct SyncScheduler {
    commands: Sender<Command>,
    engine: Arc<SyncEngine>,
    handle: Option<JoinHandle<()>>,
}

impl SyncScheduler {
    /// Starts with the intervals from the engine's `[scheduler]` config.
    pub fn start<F>(engine: Arc<SyncEngine>, sink: F) -> std::io::Result<Self>
    where
        F: Fn(SchedulerEvent) + Send + 'static,
    {
        let config = &engine.config().scheduler;
        let intervals = SchedulerIntervals {
            sync: Duration::from_secs(config.sync_interval_secs),
            momentum: Duration::from_secs(config.momentum_interval_secs),
        };
        Self::start_with_intervals(engine, intervals, sink)
    }

    pub fn start_with_intervals<F>(
        engine: Arc<SyncEngine>,
        intervals: SchedulerIntervals,
        sink: F,
    ) -> std::io::Result<Self>
    where
        F: Fn(SchedulerEvent) + Send + 'static,
    {
        let (commands, inbox) = mpsc::channel::<Command>();
        let worker_engine = Arc::clone(&engine);

        let handle = thread::Builder::new()
            .name("momentum-scheduler".to_string())
            .spawn(move || {
                let mut next_sync = Instant::now() + intervals.sync;
                let mut next_momentum = Instant::now() + intervals.momentum;
                loop {
                    let wait = next_sync
                        .min(next_momentum)
                        .saturating_duration_since(Instant::now());
                    match inbox.recv_timeout(wait) {
                        Ok(Command::SyncNow) => {
                            sync_tick(&worker_engine, TickTrigger::Manual, &sink);
                        }
                        Ok(Command::RecomputeNow(project)) => {
                            momentum_tick(&worker_engine, project, TickTrigger::Manual, &sink);
                        }
                        Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }

                    let now = Instant::now();
                    if now >= next_sync {
                        sync_tick(&worker_engine, TickTrigger::Timer, &sink);
                        next_sync = Instant::now() + intervals.sync;
                    }
                    if now >= next_momentum {
                        momentum_tick(&worker_engine, None, TickTrigger::Timer, &sink);
                        next_momentum = Instant::now() + intervals.momentum;
                    }
                }
                info!("event=scheduler_stop module=sync status=ok");
            })?;

        info!(
            "event=scheduler_start module=sync status=ok sync_interval_ms={} momentum_interval_ms={}",
            intervals.sync.as_millis(),
            intervals.momentum.as_millis()
        );
        Ok(Self {
            commands,
            engine,
            handle: Some(handle),
        })
    }

    /// Queues an immediate reconcile.
    pub fn sync_now(&self) {
        if self.commands.send(Command::SyncNow).is_err() {
            warn!("event=scheduler_tick module=sync status=skip reason=stopped kind=sync");
        }
    }

    /// Queues an immediate momentum recompute.
    pub fn recompute_now(&self, project: Option<ProjectId>) {
        if self.commands.send(Command::RecomputeNow(project)).is_err() {
            warn!("event=scheduler_tick module=sync status=skip reason=stopped kind=momentum");
        }
    }

    /// Cancels the in-flight cycle, stops the thread and waits for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let token = self.engine.cancellation_token();
        token.cancel();
        let _ = self.commands.send(Command::Stop);
        if handle.join().is_err() {
            warn!("event=scheduler_stop module=sync status=error reason=worker_panicked");
        }
        token.reset();
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sync_tick<F: Fn(SchedulerEvent)>(engine: &SyncEngine, trigger: TickTrigger, sink: &F) {
    let report = engine.reconcile();
    info!(
        "event=scheduler_tick module=sync status=ok kind=sync trigger={} cycle_id={} aborted={}",
        trigger.as_str(),
        report.cycle_id,
        report.aborted.is_some()
    );
    sink(SchedulerEvent::Sync { trigger, report });
}

fn momentum_tick<F: Fn(SchedulerEvent)>(
    engine: &SyncEngine,
    project: Option<ProjectId>,
    trigger: TickTrigger,
    sink: &F,
) {
    let result = engine.recompute_momentum(project).map_err(|err| err.to_string());
    let status = if result.is_ok() { "ok" } else { "error" };
    info!(
        "event=scheduler_tick module=sync status={} kind=momentum trigger={}",
        status,
        trigger.as_str()
    );
    sink(SchedulerEvent::Momentum { trigger, result });
}

#[cfg(test)]
mod tests {
    use super::{SchedulerEvent, SchedulerIntervals, SyncScheduler, TickTrigger};
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::db::open_db_in_memory;
    use crate::sync::engine::SyncEngine;
    use crate::sync::source::MemoryDocumentSource;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn engine() -> Arc<SyncEngine> {
        let store = Arc::new(Mutex::new(open_db_in_memory().unwrap()));
        Arc::new(SyncEngine::new(
            store,
            Arc::new(MemoryDocumentSource::new()),
            EngineConfig::default(),
            Arc::new(ManualClock::new(1_000)),
        ))
    }

    #[test]
    fn manual_triggers_run_and_reach_the_sink() {
        let (tx, rx) = mpsc::channel();
        let sink_tx = Mutex::new(tx);
        let scheduler = SyncScheduler::start_with_intervals(
            engine(),
            SchedulerIntervals {
                sync: Duration::from_secs(3_600),
                momentum: Duration::from_secs(3_600),
            },
            move |event| {
                if let Ok(tx) = sink_tx.lock() {
                    let _ = tx.send(event);
                }
            },
        )
        .unwrap();

        scheduler.sync_now();
        scheduler.recompute_now(None);
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            first,
            SchedulerEvent::Sync {
                trigger: TickTrigger::Manual,
                ..
            }
        ));
        assert!(matches!(
            second,
            SchedulerEvent::Momentum {
                trigger: TickTrigger::Manual,
                result: Ok(_)
            }
        ));
        scheduler.stop();
    }

    #[test]
    fn stopping_leaves_the_engine_usable_for_manual_cycles() {
        let engine = engine();
        let scheduler = SyncScheduler::start_with_intervals(
            Arc::clone(&engine),
            SchedulerIntervals {
                sync: Duration::from_secs(3_600),
                momentum: Duration::from_secs(3_600),
            },
            |_| {},
        )
        .unwrap();

        scheduler.stop();

        assert!(!engine.cancellation_token().is_cancelled());
        let report = engine.reconcile();
        assert!(!report.cancelled);
        assert!(report.aborted.is_none());
    }

    #[test]
    fn timer_ticks_fire_on_interval() {
        let (tx, rx) = mpsc::channel();
        let sink_tx = Mutex::new(tx);
        let scheduler = SyncScheduler::start_with_intervals(
            engine(),
            SchedulerIntervals {
                sync: Duration::from_millis(20),
                momentum: Duration::from_secs(3_600),
            },
            move |event| {
                if let Ok(tx) = sink_tx.lock() {
                    let _ = tx.send(event);
                }
            },
        )
        .unwrap();

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            event,
            SchedulerEvent::Sync {
                trigger: TickTrigger::Timer,
                ..
            }
        ));
        drop(scheduler);
    }
}
