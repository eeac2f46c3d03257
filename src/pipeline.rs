//! Worker pool that drains an expression source through the service into a [ResultSink].
//!
//! Every worker repeatedly draws a batch under the source lock, submits it as one
//! multi-simulation, fetches the metrics of each child and appends them to the sink. A worker
//! stops once a draw comes back short, which only happens when the source is exhausted.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use log::{info, warn};

use crate::http::brain::{Client, MAX_MULTI_SIMULATION};
use crate::session::Session;
use crate::settings::{RunnerConfig, SimulationSettings};
use crate::sink::{ResultRecord, ResultSink};

/// Totals of one pipeline run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PipelineReport {
    pub expressions_drawn: usize,
    pub batches_submitted: usize,
    /// Batches whose simulation ran out of attempts. Their expressions are not re-queued.
    pub batches_dropped: usize,
    pub rows_written: usize,
    /// Children whose metrics never arrived.
    pub children_lost: usize,
    /// Rows the sink refused because their columns did not match the file.
    pub rows_rejected: usize,
}

/// Lock-free counters shared by the workers.
#[derive(Debug)]
pub struct ProgressTracker {
    drawn: AtomicUsize,
    submitted: AtomicUsize,
    dropped: AtomicUsize,
    written: AtomicUsize,
    lost: AtomicUsize,
    rejected: AtomicUsize,
    start_time: Instant,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            drawn: AtomicUsize::new(0),
            submitted: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            written: AtomicUsize::new(0),
            lost: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            start_time: Instant::now(),
        }
    }

    fn drawn(&self, count: usize) {
        self.drawn.fetch_add(count, Ordering::Relaxed);
    }

    fn batch_finished(&self, dropped: bool) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        if dropped {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn children_lost(&self, count: usize) {
        self.lost.fetch_add(count, Ordering::Relaxed);
    }

    fn rows(&self, written: usize, rejected: usize) {
        self.written.fetch_add(written, Ordering::Relaxed);
        self.rejected.fetch_add(rejected, Ordering::Relaxed);
    }

    pub fn report(&self) -> PipelineReport {
        PipelineReport {
            expressions_drawn: self.drawn.load(Ordering::Relaxed),
            batches_submitted: self.submitted.load(Ordering::Relaxed),
            batches_dropped: self.dropped.load(Ordering::Relaxed),
            rows_written: self.written.load(Ordering::Relaxed),
            children_lost: self.lost.load(Ordering::Relaxed),
            rows_rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Rows written per minute since the tracker was created.
    pub fn rate(&self) -> f64 {
        let minutes = self.start_time.elapsed().as_secs_f64() / 60.0;
        if minutes > 0.0 {
            self.written.load(Ordering::Relaxed) as f64 / minutes
        } else {
            0.0
        }
    }
}

pub struct Pipeline<'a, C: Client + Sync> {
    session: &'a Session<C>,
    settings: SimulationSettings,
    workers: usize,
    batch_size: usize,
}

impl<'a, C: Client + Sync> Pipeline<'a, C> {
    /// Worker count and batch size come from `config`. The batch size is clamped to what one
    /// multi-simulation accepts.
    pub fn new(
        session: &'a Session<C>,
        settings: SimulationSettings,
        config: &RunnerConfig,
    ) -> Self {
        let batch_size = config.batch_size.clamp(1, MAX_MULTI_SIMULATION);
        if batch_size != config.batch_size {
            warn!(
                "Batch size {} out of range, using {batch_size}",
                config.batch_size
            );
        }
        Self {
            session,
            settings,
            workers: config.workers.max(1),
            batch_size,
        }
    }

    /// Runs the workers until `source` is exhausted and every worker has finished its last batch.
    pub fn run<I>(&self, source: I, sink: &ResultSink) -> PipelineReport
    where
        I: Iterator<Item = String> + Send,
    {
        let source = Mutex::new(source);
        let tracker = ProgressTracker::new();
        info!(
            "Starting {} workers with batches of {}",
            self.workers, self.batch_size
        );

        thread::scope(|scope| {
            for worker in 0..self.workers {
                let source = &source;
                let tracker = &tracker;
                scope.spawn(move || self.work(worker, source, sink, tracker));
            }
        });

        let report = tracker.report();
        info!(
            "Finished: {} rows written, {} batches dropped, {} children lost",
            report.rows_written, report.batches_dropped, report.children_lost
        );
        report
    }

    fn draw<I: Iterator<Item = String>>(&self, source: &Mutex<I>) -> Vec<String> {
        let mut source = source.lock().unwrap_or_else(PoisonError::into_inner);
        source.by_ref().take(self.batch_size).collect()
    }

    fn work<I: Iterator<Item = String>>(
        &self,
        worker: usize,
        source: &Mutex<I>,
        sink: &ResultSink,
        tracker: &ProgressTracker,
    ) {
        loop {
            let batch = self.draw(source);
            if batch.is_empty() {
                break;
            }
            tracker.drawn(batch.len());
            let exhausted = batch.len() < self.batch_size;

            self.process(worker, &batch, sink, tracker);

            if exhausted {
                break;
            }
        }
        info!("Worker {worker} found the source exhausted");
    }

    fn process(
        &self,
        worker: usize,
        batch: &[String],
        sink: &ResultSink,
        tracker: &ProgressTracker,
    ) {
        let Some(alphas) = self.session.multi_simulate(batch, &self.settings) else {
            warn!(
                "Worker {worker} dropped a batch of {} expressions",
                batch.len()
            );
            tracker.batch_finished(true);
            return;
        };
        tracker.batch_finished(false);

        let records: Vec<ResultRecord> = alphas
            .iter()
            .filter_map(|alpha| self.session.alpha_result(alpha))
            .collect();
        tracker.children_lost(alphas.len() - records.len());

        match sink.append(&records) {
            Ok(written) => tracker.rows(written, records.len() - written),
            Err(e) => {
                warn!(
                    "Worker {worker} could not write to {}: {e}",
                    sink.path().display()
                );
                tracker.rows(0, records.len());
            }
        }

        let report = tracker.report();
        info!(
            "Worker {worker}: {} simulated, {} rows written ({:.1}/min)",
            report.expressions_drawn,
            report.rows_written,
            tracker.rate()
        );
    }
}
