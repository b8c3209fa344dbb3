//! C9: a named-job queue over a rayon thread pool with progress reporting
//! (spec §4.9, §5).

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Once,
};

use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use rayon::ThreadPool;

/// The outcome of one named job: either its result or the error it failed
/// with, tagged with the job's name so failures can be attributed.
pub struct JobOutcome<T> {
    pub name: String,
    pub result: Result<T, anyhow::Error>,
}

/// Builds a rayon thread pool sized to `cores` (0 meaning "let rayon pick
/// the default", mirroring the CLI's `--cores 0 = auto` convention) and a
/// progress bar wired through `indicatif-log-bridge` so in-flight log
/// lines don't tear the bar (same pairing the teacher uses for its own
/// simulation progress bar).
pub struct Scheduler {
    pool: ThreadPool,
    quiet: bool,
}

impl Scheduler {
    /// # Errors
    /// Propagates a rayon pool-build failure.
    pub fn build(cores: usize, quiet: bool) -> anyhow::Result<Self> {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if cores > 0 {
            builder = builder.num_threads(cores);
        }
        let pool = builder.build()?;
        Ok(Self { pool, quiet })
    }

    /// Number of worker threads in the pool, used to size chunk counts for
    /// stages that don't go through `run_batch` (e.g. the locus filter's
    /// per-worker chunking in stage 7).
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Install the process-wide logger, then register a progress bar on
    /// its shared `MultiProgress` so log lines emitted from worker
    /// closures don't tear the bar. The logger itself is a one-shot global
    /// (`Logger::init` panics if called twice), so repeated driver
    /// invocations within the same process only install it once.
    pub fn install_logging(&self, verbosity: u8) -> ProgressBar {
        static LOGGER_INIT: Once = Once::new();
        LOGGER_INIT.call_once(|| logger::init_logger(verbosity));
        let bar = logger::Logger::multi().add(ProgressBar::new(0));
        if self.quiet {
            bar.set_draw_target(indicatif::ProgressDrawTarget::hidden());
        } else {
            bar.set_style(
                ProgressStyle::with_template("{spinner} [{elapsed_precise}] {pos}/{len} jobs ({msg})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
        }
        bar
    }

    /// Run `jobs` (each a `(name, closure)` pair) across the pool,
    /// collecting every outcome. Failures are recorded, not propagated
    /// immediately: the caller decides, after every in-flight job has
    /// drained, whether the batch is fatal (spec §4.9/§5's
    /// drain-before-failing rule).
    pub fn run_batch<T, F>(&self, jobs: Vec<(String, F)>, bar: &ProgressBar) -> Vec<JobOutcome<T>>
    where
        T: Send,
        F: FnOnce() -> anyhow::Result<T> + Send,
    {
        bar.set_length(jobs.len() as u64);
        let completed = Arc::new(AtomicU64::new(0));
        let results: Mutex<Vec<JobOutcome<T>>> = Mutex::new(Vec::with_capacity(jobs.len()));

        self.pool.scope(|scope| {
            for (name, job) in jobs {
                let completed = Arc::clone(&completed);
                let bar = bar.clone();
                let results = &results;
                scope.spawn(move |_| {
                    let result = job();
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    bar.set_position(done);
                    results.lock().push(JobOutcome { name, result });
                });
            }
        });

        bar.finish_and_clear();
        results.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_batch_collects_every_outcome_in_completion_order_independent_fashion() {
        let scheduler = Scheduler::build(2, true).unwrap();
        let bar = ProgressBar::hidden();
        let jobs: Vec<(String, Box<dyn FnOnce() -> anyhow::Result<u32> + Send>)> = (0..5)
            .map(|i| (format!("job-{i}"), Box::new(move || Ok(i)) as Box<dyn FnOnce() -> anyhow::Result<u32> + Send>))
            .collect();
        let outcomes = scheduler.run_batch(jobs, &bar);
        assert_eq!(outcomes.len(), 5);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
    }

    #[test]
    fn run_batch_records_individual_failures_without_aborting_others() {
        let scheduler = Scheduler::build(2, true).unwrap();
        let bar = ProgressBar::hidden();
        let jobs: Vec<(String, Box<dyn FnOnce() -> anyhow::Result<u32> + Send>)> = vec![
            ("ok".to_string(), Box::new(|| Ok(1))),
            ("bad".to_string(), Box::new(|| Err(anyhow::anyhow!("boom")))),
        ];
        let outcomes = scheduler.run_batch(jobs, &bar);
        let failed: Vec<_> = outcomes.iter().filter(|o| o.result.is_err()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].name, "bad");
    }
}
