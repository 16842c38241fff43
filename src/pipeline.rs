//! Runs a batch of records through resolver, engine and aggregator on a
//! bounded worker pool, flushing rows in input order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::aggregator::aggregate;
use crate::config::EnricherConfig;
use crate::engine::LookupEngine;
use crate::model::{Candidate, Record, ResultRow, RowStatus, Verdict, VerdictStatus};
use crate::resolver::CandidateResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
}

/// Receives each row once it is final, in input order.
pub trait ProgressReporter: Send + Sync {
    fn row_finalized(&self, row: &ResultRow, progress: Progress);
}

impl<A: ProgressReporter, B: ProgressReporter> ProgressReporter for (A, B) {
    fn row_finalized(&self, row: &ResultRow, progress: Progress) {
        self.0.row_finalized(row, progress);
        self.1.row_finalized(row, progress);
    }
}

pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn row_finalized(&self, row: &ResultRow, progress: Progress) {
        match row.status() {
            RowStatus::Valid => info!(
                "[{}/{}] {} -> {}",
                progress.processed,
                progress.total,
                row.record.name,
                row.email().unwrap_or_default()
            ),
            RowStatus::Skipped => warn!(
                "[{}/{}] {} skipped: {}",
                progress.processed,
                progress.total,
                row.record.name,
                row.skipped.as_deref().unwrap_or_default()
            ),
            status => info!(
                "[{}/{}] {} -> {}",
                progress.processed,
                progress.total,
                row.record.name,
                status.as_str()
            ),
        }
    }
}

/// Run-level cancellation. `cancel` stops dispatch; `halt` drops in-flight work.
pub struct RunControl {
    cancel: watch::Sender<bool>,
    halt: watch::Sender<bool>,
}

impl RunControl {
    pub fn new() -> Arc<Self> {
        Arc::new(RunControl {
            cancel: watch::channel(false).0,
            halt: watch::channel(false).0,
        })
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    fn halt(&self) {
        self.halt.send_replace(true);
    }

    async fn halted(&self) {
        let mut rx = self.halt.subscribe();
        let _ = rx.wait_for(|h| *h).await;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub rows: Vec<ResultRow>,
    pub total: usize,
    /// Rows emitted, skipped ones included.
    pub completed: usize,
    /// Records dropped because they were unfinished when the run was cancelled.
    pub cancelled: usize,
    pub skipped: usize,
    /// Underlying stage calls (cache hits excluded).
    pub probes: usize,
}

pub struct Pipeline {
    resolver: CandidateResolver,
    workers: usize,
    stop_on_first_valid: bool,
    cancel_grace: Duration,
}

type Outcome = (usize, usize, Option<Verdict>);

impl Pipeline {
    pub fn new(config: &EnricherConfig) -> Self {
        Pipeline {
            resolver: CandidateResolver::new(config.max_candidates),
            workers: config.workers.max(1),
            stop_on_first_valid: config.stop_on_first_valid,
            cancel_grace: config.cancel_grace(),
        }
    }

    pub async fn run(
        &self,
        records: Vec<Record>,
        engine: Arc<LookupEngine>,
        control: Arc<RunControl>,
        reporter: &dyn ProgressReporter,
    ) -> RunReport {
        let total = records.len();
        info!("Starting run over {} records with {} workers", total, self.workers);

        let mut emitter = Emitter::new(total, reporter);
        let mut pending = vec![0usize; total];
        let mut verdicts: Vec<Vec<(usize, Verdict)>> = vec![Vec::new(); total];
        let mut jobs: Vec<Candidate> = Vec::new();
        let mut skipped = 0;

        for (index, record) in records.iter().enumerate() {
            match self.resolver.resolve(index, record) {
                Ok(candidates) if !candidates.is_empty() => {
                    debug!("Record {} resolved to {} candidates", index, candidates.len());
                    pending[index] = candidates.len();
                    jobs.extend(candidates);
                }
                Ok(_) => emitter.insert(aggregate(index, record.clone(), &[])),
                Err(e) => {
                    skipped += 1;
                    emitter.insert(ResultRow::skipped(index, record.clone(), e.to_string()));
                }
            }
        }
        emitter.flush();

        let first_valid: Arc<Vec<AtomicUsize>> =
            Arc::new((0..total).map(|_| AtomicUsize::new(usize::MAX)).collect());
        let (tx, mut rx) = mpsc::unbounded_channel::<Outcome>();
        let dispatcher = tokio::spawn(dispatch(
            jobs,
            engine.clone(),
            control.clone(),
            tx,
            first_valid,
            self.workers,
            self.stop_on_first_valid,
        ));

        let mut grace_deadline: Option<Instant> = None;
        loop {
            let message = match grace_deadline {
                None => tokio::select! {
                    biased;
                    _ = control.cancelled() => {
                        let dropped = emitter.drop_unfinished();
                        info!(
                            "Run cancelled: {} unfinished record(s) dropped, waiting up to {:?} for in-flight checks",
                            dropped, self.cancel_grace
                        );
                        grace_deadline = Some(Instant::now() + self.cancel_grace);
                        continue;
                    }
                    m = rx.recv() => m,
                },
                Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(m) => m,
                    Err(_) => {
                        warn!("Grace period expired, abandoning in-flight checks");
                        break;
                    }
                },
            };
            let Some((index, ordinal, verdict)) = message else { break };

            if emitter.is_dropped(index) {
                continue;
            }
            if let Some(v) = verdict {
                verdicts[index].push((ordinal, v));
            }
            pending[index] -= 1;
            if pending[index] == 0 {
                let row = aggregate(index, records[index].clone(), &verdicts[index]);
                emitter.insert(row);
                emitter.flush();
            }
        }

        // dispatch joins its tasks, so every browser lease is back before shutdown
        control.halt();
        if let Err(e) = dispatcher.await {
            warn!("Dispatcher ended abnormally: {}", e);
        }
        engine.shutdown().await;

        let report = emitter.finish(skipped, engine.probes());
        info!(
            "Run finished: {}/{} records completed, {} cancelled, {} skipped, {} checks",
            report.completed, report.total, report.cancelled, report.skipped, report.probes
        );
        report
    }

    /// Looks up one record outside any batch; the engine is shut down after.
    pub async fn verify_one(&self, record: Record, engine: Arc<LookupEngine>) -> ResultRow {
        let fallback = record.clone();
        let mut report = self.run(vec![record], engine, RunControl::new(), &LogReporter).await;
        report.rows.pop().unwrap_or_else(|| aggregate(0, fallback, &[]))
    }
}

async fn dispatch(
    jobs: Vec<Candidate>,
    engine: Arc<LookupEngine>,
    control: Arc<RunControl>,
    tx: mpsc::UnboundedSender<Outcome>,
    first_valid: Arc<Vec<AtomicUsize>>,
    workers: usize,
    stop_on_first_valid: bool,
) {
    let slots = Arc::new(Semaphore::new(workers));
    let mut tasks = JoinSet::new();

    for candidate in jobs {
        let permit = tokio::select! {
            biased;
            _ = control.cancelled() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let engine = engine.clone();
        let control = control.clone();
        let tx = tx.clone();
        let first_valid = first_valid.clone();

        tasks.spawn(async move {
            let _permit = permit;
            let record = candidate.record;
            let ordinal = candidate.ordinal;

            // an earlier candidate already won, this one cannot change the row
            if stop_on_first_valid && first_valid[record].load(Ordering::SeqCst) < ordinal {
                let _ = tx.send((record, ordinal, None));
                return;
            }

            let verdict = tokio::select! {
                v = engine.verify(&candidate) => v,
                _ = control.halted() => return,
            };
            if verdict.status == VerdictStatus::Valid {
                first_valid[record].fetch_min(ordinal, Ordering::SeqCst);
            }
            let _ = tx.send((record, ordinal, Some(verdict)));
        });
    }
    drop(tx);

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!("Candidate task failed: {}", e);
        }
    }
}

/// Buffers finished rows and releases them in input order.
struct Emitter<'a> {
    reporter: &'a dyn ProgressReporter,
    total: usize,
    buffer: BTreeMap<usize, ResultRow>,
    finished: Vec<bool>,
    dropped: Vec<bool>,
    next: usize,
    rows: Vec<ResultRow>,
}

impl<'a> Emitter<'a> {
    fn new(total: usize, reporter: &'a dyn ProgressReporter) -> Self {
        Emitter {
            reporter,
            total,
            buffer: BTreeMap::new(),
            finished: vec![false; total],
            dropped: vec![false; total],
            next: 0,
            rows: Vec::with_capacity(total),
        }
    }

    fn insert(&mut self, row: ResultRow) {
        self.finished[row.index] = true;
        self.buffer.insert(row.index, row);
    }

    fn is_dropped(&self, index: usize) -> bool {
        self.dropped[index]
    }

    fn drop_unfinished(&mut self) -> usize {
        let mut count = 0;
        for (index, finished) in self.finished.iter().enumerate() {
            if !finished && !self.dropped[index] {
                self.dropped[index] = true;
                count += 1;
            }
        }
        self.flush();
        count
    }

    fn flush(&mut self) {
        while self.next < self.total {
            if self.dropped[self.next] {
                self.next += 1;
                continue;
            }
            let Some(row) = self.buffer.remove(&self.next) else { break };
            let progress = Progress {
                processed: self.rows.len() + 1,
                total: self.total,
            };
            self.reporter.row_finalized(&row, progress);
            self.rows.push(row);
            self.next += 1;
        }
    }

    fn finish(mut self, skipped: usize, probes: usize) -> RunReport {
        // rows still buffered behind a dropped record
        self.flush();
        let cancelled = self.dropped.iter().filter(|d| **d).count();
        RunReport {
            completed: self.rows.len(),
            rows: self.rows,
            total: self.total,
            cancelled,
            skipped,
            probes,
        }
    }
}
