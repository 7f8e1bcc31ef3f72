//! Reporter trait for dependency injection
//!
//! Lets the scheduler and providers report progress without being coupled
//! to a terminal.

pub trait Reporter: Send + Sync {
    /// Indicates a new phase has started (e.g. "Reading packages from lockfiles").
    fn section(&self, title: &str);

    /// A package finished; `finished` of `total` are done.
    fn progress(&self, finished: usize, total: usize);

    /// A package was skipped because generating its sources failed.
    fn failed(&self, package: &str, reason: &str);

    /// Log an informational message.
    fn info(&self, msg: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);

    /// Display a final summary.
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn section(&self, title: &str) {
        (**self).section(title);
    }
    fn progress(&self, finished: usize, total: usize) {
        (**self).progress(finished, total);
    }
    fn failed(&self, package: &str, reason: &str) {
        (**self).failed(package, reason);
    }
    fn info(&self, msg: &str) {
        (**self).info(msg);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        (**self).summary(count, action, elapsed_secs);
    }
}

/// A no-op reporter for silent operations (e.g., testing).
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn section(&self, _: &str) {}
    fn progress(&self, _: usize, _: usize) {}
    fn failed(&self, _: &str, _: &str) {}
    fn info(&self, _: &str) {}
    fn warning(&self, _: &str) {}
    fn summary(&self, _: usize, _: &str, _: f64) {}
}
