//! Run results and report sinks.
//!
//! Workers emit structured lifecycle events while they run; a [`ReportSink`]
//! receives them together with the final aggregated [`RunResult`]. Rendering
//! beyond the console summary is out of scope here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Summary counters for one execution scope.
///
/// Results from independent workers are combined with [`merge`](RunResult::merge),
/// which is associative and commutative, so aggregation order never affects
/// the totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// Number of tests that finished, regardless of outcome.
    pub completed: u32,
    /// Number of tests that errored (setup/infrastructure failures).
    pub errors: u32,
    /// Number of tests that failed an assertion.
    pub failures: u32,
    /// Number of tests that were skipped.
    pub skipped: u32,
    /// Whether any contributing worker hit its timeout.
    pub timed_out: bool,
}

impl RunResult {
    /// Combine two results into one.
    pub fn merge(self, other: RunResult) -> RunResult {
        RunResult {
            completed: self.completed + other.completed,
            errors: self.errors + other.errors,
            failures: self.failures + other.failures,
            skipped: self.skipped + other.skipped,
            timed_out: self.timed_out || other.timed_out,
        }
    }

    /// Check if the run finished without failures, errors, or timeouts.
    pub fn success(&self) -> bool {
        self.errors == 0 && self.failures == 0 && !self.timed_out
    }

    /// Get the process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// A structured lifecycle event decoded from a worker's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuiteEvent {
    /// A suite began executing.
    SuiteStarted { name: String },
    /// A suite finished executing.
    SuiteCompleted { name: String },
    /// An individual test began.
    TestStarted { name: String },
    /// An individual test passed.
    TestPassed { name: String },
    /// An individual test failed an assertion.
    TestFailed { name: String, message: Option<String> },
    /// An individual test errored outside its assertions.
    TestErrored { name: String, message: Option<String> },
    /// An individual test was skipped.
    TestSkipped { name: String },
    /// A raw output line that is not part of the wire protocol.
    Output { line: String },
}

/// A report sink receives events during dispatch and the final result.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Called for every decoded event, tagged with the emitting worker's slot.
    async fn on_event(&self, slot: u32, event: &SuiteEvent);

    /// Called once when the whole dispatch completes normally.
    async fn on_run_complete(&self, result: &RunResult);
}

/// A sink that discards everything (for tests or when output is not needed).
pub struct NullSink;

#[async_trait]
impl ReportSink for NullSink {
    async fn on_event(&self, _slot: u32, _event: &SuiteEvent) {}
    async fn on_run_complete(&self, _result: &RunResult) {}
}

/// Console sink that prints progress and the final summary.
pub struct ConsoleSink {
    verbose: bool,
}

impl ConsoleSink {
    /// Create a new console sink.
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

#[async_trait]
impl ReportSink for ConsoleSink {
    async fn on_event(&self, slot: u32, event: &SuiteEvent) {
        match event {
            SuiteEvent::SuiteStarted { name } => {
                if self.verbose {
                    println!("[{}] running suite: {}", slot, name);
                }
            }
            SuiteEvent::TestFailed { name, message } => {
                println!(
                    "[{}] {} {}",
                    slot,
                    console::style("FAIL").red(),
                    name
                );
                if let Some(msg) = message {
                    println!("      {}", console::style(msg).dim());
                }
            }
            SuiteEvent::TestErrored { name, message } => {
                println!(
                    "[{}] {} {}",
                    slot,
                    console::style("ERR ").red().bold(),
                    name
                );
                if let Some(msg) = message {
                    println!("      {}", console::style(msg).dim());
                }
            }
            SuiteEvent::TestPassed { name } => {
                if self.verbose {
                    println!("[{}] {} {}", slot, console::style("PASS").green(), name);
                }
            }
            SuiteEvent::TestSkipped { name } => {
                if self.verbose {
                    println!("[{}] {} {}", slot, console::style("SKIP").yellow(), name);
                }
            }
            SuiteEvent::Output { line } => {
                if self.verbose {
                    println!("[{}] {}", slot, line);
                }
            }
            SuiteEvent::SuiteCompleted { .. } | SuiteEvent::TestStarted { .. } => {}
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        println!();
        println!("Run summary:");
        println!("  Completed: {}", result.completed);
        println!("  Failures:  {}", console::style(result.failures).red());
        println!("  Errors:    {}", console::style(result.errors).red());
        println!("  Skipped:   {}", console::style(result.skipped).yellow());

        if result.timed_out {
            println!(
                "  {}",
                console::style("One or more workers timed out.").red().bold()
            );
        }

        println!();
        if result.success() {
            println!("{}", console::style("All suites passed.").green().bold());
        } else {
            println!("{}", console::style("Run had failures.").red().bold());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(completed: u32, errors: u32, failures: u32, skipped: u32, timed_out: bool) -> RunResult {
        RunResult {
            completed,
            errors,
            failures,
            skipped,
            timed_out,
        }
    }

    #[test]
    fn test_merge_sums_counters() {
        let merged = r(3, 1, 0, 2, false).merge(r(4, 0, 2, 0, true));
        assert_eq!(merged, r(7, 1, 2, 2, true));
    }

    #[test]
    fn test_merge_is_commutative() {
        let a = r(5, 0, 1, 0, false);
        let b = r(2, 3, 0, 1, true);
        assert_eq!(a.merge(b), b.merge(a));
    }

    #[test]
    fn test_merge_is_associative() {
        let a = r(1, 0, 0, 0, false);
        let b = r(0, 2, 0, 1, true);
        let c = r(4, 0, 3, 0, false);
        assert_eq!(a.merge(b).merge(c), a.merge(b.merge(c)));
    }

    #[test]
    fn test_merge_any_permutation_yields_identical_totals() {
        let set = [
            r(1, 0, 0, 0, false),
            r(2, 1, 0, 0, false),
            r(0, 0, 1, 2, true),
            r(7, 0, 0, 0, false),
        ];
        let forward = set.iter().fold(RunResult::default(), |acc, x| acc.merge(*x));
        let backward = set
            .iter()
            .rev()
            .fold(RunResult::default(), |acc, x| acc.merge(*x));
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(r(3, 0, 0, 0, false).exit_code(), 0);
        assert_eq!(r(3, 0, 1, 0, false).exit_code(), 1);
        assert_eq!(r(3, 1, 0, 0, false).exit_code(), 1);
        assert_eq!(r(3, 0, 0, 0, true).exit_code(), 1);
    }
}
