//! Terminal reporting. Everything goes to stderr; stdout stays free for
//! callers piping the tool.

use nodesrc_core::Reporter;

/// Progress is printed every this many packages (and for the last one).
const PROGRESS_INTERVAL: usize = 10;

#[derive(Debug, Clone, Copy, Default)]
pub struct StderrReporter {
    quiet: bool,
}

impl StderrReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only warnings and failures.
    pub fn quiet() -> Self {
        Self { quiet: true }
    }
}

/// `Generating packages [n/total]`, or `None` between reporting points.
pub fn progress_line(finished: usize, total: usize) -> Option<String> {
    (finished % PROGRESS_INTERVAL == 0 || finished == total)
        .then(|| format!("Generating packages [{finished}/{total}]..."))
}

impl Reporter for StderrReporter {
    fn section(&self, title: &str) {
        if !self.quiet {
            eprintln!("{title}...");
        }
    }

    fn progress(&self, finished: usize, total: usize) {
        if self.quiet {
            return;
        }
        if let Some(line) = progress_line(finished, total) {
            eprintln!("{line}");
        }
    }

    fn failed(&self, package: &str, reason: &str) {
        eprintln!("Skipped {package}: {reason}");
    }

    fn info(&self, msg: &str) {
        if !self.quiet {
            eprintln!("{msg}");
        }
    }

    fn warning(&self, msg: &str) {
        eprintln!("WARNING: {msg}");
    }

    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        if !self.quiet {
            eprintln!("{count} packages {action} in {elapsed_secs:.1}s");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_every_ten_and_at_the_end() {
        assert_eq!(progress_line(3, 25), None);
        assert_eq!(
            progress_line(10, 25).as_deref(),
            Some("Generating packages [10/25]...")
        );
        assert!(progress_line(25, 25).is_some());
    }
}
