//! Runs one generation task per unique package with bounded concurrency.

use std::collections::HashSet;
use std::sync::Arc;

use nodesrc_schema::Package;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::GenerateError;
use crate::providers::ModuleProvider;
use crate::reporter::Reporter;

pub const DEFAULT_MAX_PARALLEL: usize = 64;

/// Outcome of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationSummary {
    pub generated: usize,
    /// `(package, reason)` for packages dropped in keep-going mode, sorted.
    pub skipped: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    max_parallel: usize,
    keep_going: bool,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PARALLEL)
    }
}

impl Scheduler {
    /// At most `max_parallel` packages (minimum one) generate at a time.
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            keep_going: false,
        }
    }

    /// Skip packages whose failure is not fatal instead of aborting.
    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    /// Generate every distinct package.
    ///
    /// Without keep-going, the first failure aborts all other tasks and is
    /// returned once they have all been joined. Fatal errors abort in either
    /// mode.
    pub async fn run(
        &self,
        packages: Vec<Package>,
        provider: Arc<dyn ModuleProvider>,
        reporter: &dyn Reporter,
    ) -> Result<GenerationSummary, GenerateError> {
        let mut seen = HashSet::new();
        let packages: Vec<Package> = packages
            .into_iter()
            .filter(|package| seen.insert(package.key()))
            .collect();
        let total = packages.len();
        debug!("Generating {total} packages, {} at a time", self.max_parallel);

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks = JoinSet::new();
        for package in packages {
            let provider = provider.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => provider.generate_package(&package).await,
                    Err(_) => Err(GenerateError::Cancelled),
                };
                (package.to_string(), result)
            });
        }

        let mut summary = GenerationSummary::default();
        let mut first_error = None;
        let mut finished = 0;

        while let Some(joined) = tasks.join_next().await {
            let (package, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    let error = GenerateError::context("scheduler", format!("task failed: {e}"));
                    if first_error.is_none() {
                        tasks.abort_all();
                        first_error = Some(error);
                    }
                    continue;
                }
            };

            finished += 1;
            reporter.progress(finished, total);

            match result {
                Ok(()) => summary.generated += 1,
                Err(e) if first_error.is_some() => {
                    debug!("{package} failed after the run was aborted: {e}");
                }
                Err(e) if self.keep_going && !e.is_fatal() => {
                    warn!("Skipping {package}: {e}");
                    reporter.failed(&package, &e.to_string());
                    summary.skipped.push((package, e.to_string()));
                }
                Err(e) => {
                    tasks.abort_all();
                    first_error = Some(e);
                }
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }
        summary.skipped.sort();
        Ok(summary)
    }
}
