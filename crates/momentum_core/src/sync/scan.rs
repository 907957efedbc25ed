//! Parallel fingerprint + decode phase.
//!
//! # Responsibility
//! - Fan documents out over a bounded pool of worker threads and fan the
//!   results back in, keyed by path.
//! - Bound every read+digest+decode by the per-document timeout.
//!
//! # Invariants
//! - At most `workers` jobs run at once. A job past its deadline is reported
//!   as `TimedOut`, its late result is dropped, and a replacement worker
//!   keeps the pool at full width.
//! - Documents whose digest equals the known baseline digest are not parsed.
//! - Cancellation is checked before each document, never mid-document.

use crate::config::ScanConfig;
use crate::model::sync::Fingerprint;
use crate::sync::codec::{self, CodecError, DecodedDocument};
use crate::sync::fingerprint::fingerprint_of;
use crate::sync::source::{DocumentSource, SourceError};
use crate::sync::CancellationToken;
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// One document to fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanJob {
    pub path: String,
    /// Digest of the last agreed baseline, if the path is linked.
    pub known_digest: Option<String>,
}

/// Result of reading one document.
#[derive(Debug, Clone)]
pub struct ScannedDocument {
    pub path: String,
    pub fingerprint: Fingerprint,
    pub bytes: Vec<u8>,
    /// `None` when the digest matched the known digest and parsing was skipped.
    pub decoded: Option<Result<DecodedDocument, CodecError>>,
}

impl ScannedDocument {
    /// Whether the document is byte-identical to its known baseline.
    pub fn matches_known_digest(&self) -> bool {
        self.decoded.is_none()
    }

    /// Decoded form, parsing on demand when the scan skipped it.
    pub fn decode(&self) -> Result<DecodedDocument, CodecError> {
        match &self.decoded {
            Some(result) => result.clone(),
            None => codec::decode(&self.bytes),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ScanOutcome {
    Read(ScannedDocument),
    Failed(SourceError),
    Cancelled,
}

enum WorkerMessage {
    Started { index: usize },
    Finished { index: usize, outcome: ScanOutcome },
}

type JobQueue = Arc<Mutex<Receiver<(usize, ScanJob)>>>;

/// Bounded worker pool over a [`DocumentSource`].
pub struct DocumentScanner {
    source: Arc<dyn DocumentSource>,
    workers: usize,
    timeout: Duration,
    max_document_bytes: u64,
}

impl DocumentScanner {
    pub fn new(source: Arc<dyn DocumentSource>, config: &ScanConfig) -> Self {
        Self {
            source,
            workers: config.workers.max(1),
            timeout: config.document_timeout(),
            max_document_bytes: config.max_document_bytes,
        }
    }

    /// Scans `jobs` and returns one outcome per job path.
    pub fn scan(
        &self,
        jobs: Vec<ScanJob>,
        observed_at: i64,
        cancel: &CancellationToken,
    ) -> BTreeMap<String, ScanOutcome> {
        let total = jobs.len();
        let mut outcomes = BTreeMap::new();
        if total == 0 {
            return outcomes;
        }

        let paths: Vec<String> = jobs.iter().map(|job| job.path.clone()).collect();
        let (job_tx, job_rx) = mpsc::channel::<(usize, ScanJob)>();
        let queue: JobQueue = Arc::new(Mutex::new(job_rx));
        let (result_tx, result_rx) = mpsc::channel::<WorkerMessage>();

        for (index, job) in jobs.into_iter().enumerate() {
            // The receiver lives in `queue`, so sending cannot fail here.
            let _ = job_tx.send((index, job));
        }
        drop(job_tx);

        let mut spawned = 0;
        let mut next_worker_id = 0;
        for _ in 0..self.workers.min(total) {
            if self.spawn_worker(next_worker_id, &queue, &result_tx, observed_at, cancel) {
                spawned += 1;
            }
            next_worker_id += 1;
        }
        if spawned == 0 {
            warn!("event=scan_pool module=sync status=warn reason=spawn_failed mode=inline");
            return self.scan_inline(&queue, observed_at, cancel);
        }

        let mut results: HashMap<usize, ScanOutcome> = HashMap::with_capacity(total);
        let mut in_flight: HashMap<usize, Instant> = HashMap::new();
        let mut abandoned: HashSet<usize> = HashSet::new();

        while results.len() < total {
            let wait = in_flight
                .values()
                .map(|started| self.timeout.saturating_sub(started.elapsed()))
                .min()
                .unwrap_or(self.timeout)
                .max(Duration::from_millis(1));

            match result_rx.recv_timeout(wait) {
                Ok(WorkerMessage::Started { index }) => {
                    in_flight.insert(index, Instant::now());
                }
                Ok(WorkerMessage::Finished { index, outcome }) => {
                    in_flight.remove(&index);
                    if !abandoned.contains(&index) {
                        results.insert(index, outcome);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let expired: Vec<usize> = in_flight
                .iter()
                .filter(|(_, started)| started.elapsed() >= self.timeout)
                .map(|(index, _)| *index)
                .collect();
            for index in expired {
                in_flight.remove(&index);
                abandoned.insert(index);
                warn!(
                    "event=document_unavailable module=sync status=warn reason=timeout timeout_ms={}",
                    self.timeout.as_millis()
                );
                results.insert(
                    index,
                    ScanOutcome::Failed(SourceError::TimedOut {
                        after_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    }),
                );
                self.spawn_worker(next_worker_id, &queue, &result_tx, observed_at, cancel);
                next_worker_id += 1;
            }
        }

        for (index, path) in paths.into_iter().enumerate() {
            let outcome = results.remove(&index).unwrap_or(ScanOutcome::Cancelled);
            outcomes.insert(path, outcome);
        }
        debug!(
            "event=scan_pool module=sync status=ok documents={} workers_spawned={}",
            total, next_worker_id
        );
        outcomes
    }

    fn spawn_worker(
        &self,
        worker_id: usize,
        queue: &JobQueue,
        results: &Sender<WorkerMessage>,
        observed_at: i64,
        cancel: &CancellationToken,
    ) -> bool {
        let queue = Arc::clone(queue);
        let results = results.clone();
        let source = Arc::clone(&self.source);
        let cancel = cancel.clone();
        let max_bytes = self.max_document_bytes;

        let spawned = thread::Builder::new()
            .name(format!("scan-worker-{worker_id}"))
            .spawn(move || loop {
                let next = match queue.lock() {
                    Ok(jobs) => jobs.recv(),
                    Err(_) => return,
                };
                let Ok((index, job)) = next else {
                    return;
                };
                if cancel.is_cancelled() {
                    if results
                        .send(WorkerMessage::Finished {
                            index,
                            outcome: ScanOutcome::Cancelled,
                        })
                        .is_err()
                    {
                        return;
                    }
                    continue;
                }
                if results.send(WorkerMessage::Started { index }).is_err() {
                    return;
                }
                let outcome = scan_one(source.as_ref(), &job, max_bytes, observed_at);
                if results.send(WorkerMessage::Finished { index, outcome }).is_err() {
                    return;
                }
            });

        match spawned {
            Ok(_) => true,
            Err(err) => {
                warn!(
                    "event=scan_pool module=sync status=warn reason=spawn_failed error={}",
                    err
                );
                false
            }
        }
    }

    fn scan_inline(
        &self,
        queue: &JobQueue,
        observed_at: i64,
        cancel: &CancellationToken,
    ) -> BTreeMap<String, ScanOutcome> {
        let mut outcomes = BTreeMap::new();
        let Ok(jobs) = queue.lock() else {
            return outcomes;
        };
        while let Ok((_, job)) = jobs.try_recv() {
            let outcome = if cancel.is_cancelled() {
                ScanOutcome::Cancelled
            } else {
                scan_one(self.source.as_ref(), &job, self.max_document_bytes, observed_at)
            };
            outcomes.insert(job.path, outcome);
        }
        outcomes
    }
}

fn scan_one(
    source: &dyn DocumentSource,
    job: &ScanJob,
    max_bytes: u64,
    observed_at: i64,
) -> ScanOutcome {
    let meta = match source.metadata(&job.path) {
        Ok(meta) => meta,
        Err(err) => return ScanOutcome::Failed(err),
    };
    if meta.size_bytes > max_bytes {
        return ScanOutcome::Failed(SourceError::TooLarge {
            size_bytes: meta.size_bytes,
            limit: max_bytes,
        });
    }
    let bytes = match source.read(&job.path) {
        Ok(bytes) => bytes,
        Err(err) => return ScanOutcome::Failed(err),
    };
    if bytes.len() as u64 > max_bytes {
        return ScanOutcome::Failed(SourceError::TooLarge {
            size_bytes: bytes.len() as u64,
            limit: max_bytes,
        });
    }

    let fingerprint = fingerprint_of(&job.path, &bytes, meta, observed_at);
    let decoded = if job.known_digest.as_deref() == Some(fingerprint.digest.as_str()) {
        None
    } else {
        Some(codec::decode(&bytes))
    };

    ScanOutcome::Read(ScannedDocument {
        path: job.path.clone(),
        fingerprint,
        bytes,
        decoded,
    })
}

#[cfg(test)]
mod tests {
    use super::{DocumentScanner, ScanJob, ScanOutcome};
    use crate::config::ScanConfig;
    use crate::sync::fingerprint::digest;
    use crate::sync::source::{MemoryDocumentSource, SourceError};
    use crate::sync::CancellationToken;
    use std::sync::Arc;
    use std::time::Duration;

    fn job(path: &str) -> ScanJob {
        ScanJob {
            path: path.to_string(),
            known_digest: None,
        }
    }

    fn config(workers: usize, timeout_ms: u64) -> ScanConfig {
        ScanConfig {
            workers,
            document_timeout_ms: timeout_ms,
            ..ScanConfig::default()
        }
    }

    #[test]
    fn scans_every_document_and_skips_parse_for_known_digest() {
        let source = Arc::new(MemoryDocumentSource::new());
        for index in 0..12 {
            source.put(&format!("doc-{index:02}.md"), format!("# note {index}\n"));
        }
        let scanner = DocumentScanner::new(source.clone(), &config(3, 5_000));

        let mut jobs: Vec<ScanJob> = (0..12).map(|index| job(&format!("doc-{index:02}.md"))).collect();
        jobs[0].known_digest = Some(digest(b"# note 0\n"));

        let outcomes = scanner.scan(jobs, 1, &CancellationToken::new());
        assert_eq!(outcomes.len(), 12);
        match &outcomes["doc-00.md"] {
            ScanOutcome::Read(doc) => assert!(doc.matches_known_digest()),
            other => panic!("unexpected outcome {other:?}"),
        }
        match &outcomes["doc-05.md"] {
            ScanOutcome::Read(doc) => assert!(doc.decoded.as_ref().unwrap().is_ok()),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn slow_document_times_out_without_stalling_the_rest() {
        let source = Arc::new(MemoryDocumentSource::new());
        source.put("slow.md", "slow");
        source.put("a.md", "a");
        source.put("b.md", "b");
        source.delay_reads("slow.md", Duration::from_millis(600));
        let scanner = DocumentScanner::new(source.clone(), &config(2, 50));

        let outcomes = scanner.scan(
            vec![job("slow.md"), job("a.md"), job("b.md")],
            1,
            &CancellationToken::new(),
        );
        assert!(matches!(
            outcomes["slow.md"],
            ScanOutcome::Failed(SourceError::TimedOut { .. })
        ));
        assert!(matches!(outcomes["a.md"], ScanOutcome::Read(_)));
        assert!(matches!(outcomes["b.md"], ScanOutcome::Read(_)));
    }

    #[test]
    fn oversized_and_missing_documents_fail_individually() {
        let source = Arc::new(MemoryDocumentSource::new());
        source.put("big.md", "x".repeat(64));
        let scanner = DocumentScanner::new(
            source.clone(),
            &ScanConfig {
                max_document_bytes: 16,
                ..config(2, 5_000)
            },
        );
        let outcomes = scanner.scan(vec![job("big.md"), job("gone.md")], 1, &CancellationToken::new());
        assert!(matches!(
            outcomes["big.md"],
            ScanOutcome::Failed(SourceError::TooLarge { .. })
        ));
        assert!(matches!(
            outcomes["gone.md"],
            ScanOutcome::Failed(SourceError::NotFound)
        ));
    }

    #[test]
    fn cancelled_token_skips_remaining_documents() {
        let source = Arc::new(MemoryDocumentSource::new());
        source.put("a.md", "a");
        source.put("b.md", "b");
        let scanner = DocumentScanner::new(source.clone(), &config(2, 5_000));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcomes = scanner.scan(vec![job("a.md"), job("b.md")], 1, &cancel);
        assert!(outcomes
            .values()
            .all(|outcome| matches!(outcome, ScanOutcome::Cancelled)));
    }
}
