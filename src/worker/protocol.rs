//! The worker wire protocol.
//!
//! Workers talk to the dispatcher with a line-oriented text protocol that
//! is substrate-agnostic: the parser consumes an ordered sequence of lines
//! and never cares whether they arrived incrementally from a live process
//! or were split out of a captured output blob.
//!
//! # Worker → dispatcher
//!
//! ```text
//! volley:event:<kind>[TAB name[TAB detail]]   lifecycle event
//! volley:bye                                  goodbye marker
//! volley:trace:<payload>                      error trace, \n escaped as \\n
//! anything else                               passthrough output
//! ```
//!
//! # Dispatcher → worker
//!
//! ```text
//! volley:cmd:noop            liveness ping
//! volley:cmd:run TAB suite   assign the next suite
//! volley:cmd:skip            skip everything after the current test
//! volley:cmd:bye             no further suites are coming
//! volley:cmd:halt            stop immediately
//! ```

use std::sync::{Arc, Mutex};

use super::{FailureHook, LinkSignal, WorkerHandle};
use crate::report::{ReportSink, RunResult, SuiteEvent};

/// Prefix of lifecycle event lines.
pub const EVENT_PREFIX: &str = "volley:event:";

/// Goodbye marker: the worker terminated cleanly.
pub const GOODBYE_MARKER: &str = "volley:bye";

/// Prefix of error-trace lines.
pub const TRACE_PREFIX: &str = "volley:trace:";

/// Field separator within event lines.
pub const FIELD_SEPARATOR: char = '\t';

/// Encode a command for the worker's command stream.
pub fn encode_command(signal: &LinkSignal) -> String {
    match signal {
        LinkSignal::Noop => "volley:cmd:noop".to_string(),
        LinkSignal::RunSuite(suite) => format!("volley:cmd:run{}{}", FIELD_SEPARATOR, suite),
        LinkSignal::SkipRemaining => "volley:cmd:skip".to_string(),
        LinkSignal::Finish => "volley:cmd:bye".to_string(),
        LinkSignal::Halt => "volley:cmd:halt".to_string(),
    }
}

/// One decoded line of worker output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireLine {
    /// A lifecycle event.
    Event(SuiteEvent),
    /// The goodbye marker.
    Goodbye,
    /// An error trace payload, unescaped.
    Trace(String),
    /// Not part of the protocol; passes through verbatim.
    Raw,
}

/// Decode one line of worker output.
pub fn decode_line(line: &str) -> WireLine {
    if line == GOODBYE_MARKER {
        return WireLine::Goodbye;
    }
    if let Some(payload) = line.strip_prefix(TRACE_PREFIX) {
        return WireLine::Trace(unescape(payload));
    }
    if let Some(rest) = line.strip_prefix(EVENT_PREFIX) {
        return match decode_event(rest) {
            Some(event) => WireLine::Event(event),
            None => WireLine::Raw,
        };
    }
    WireLine::Raw
}

fn decode_event(rest: &str) -> Option<SuiteEvent> {
    let mut fields = rest.split(FIELD_SEPARATOR);
    let kind = fields.next()?;
    let name = fields.next().unwrap_or_default().to_string();
    let detail = fields.next().map(str::to_string);

    match kind {
        "suite-started" => Some(SuiteEvent::SuiteStarted { name }),
        "suite-completed" => Some(SuiteEvent::SuiteCompleted { name }),
        "test-started" => Some(SuiteEvent::TestStarted { name }),
        "test-passed" => Some(SuiteEvent::TestPassed { name }),
        "test-failed" => Some(SuiteEvent::TestFailed {
            name,
            message: detail,
        }),
        "test-errored" => Some(SuiteEvent::TestErrored {
            name,
            message: detail,
        }),
        "test-skipped" => Some(SuiteEvent::TestSkipped { name }),
        _ => None,
    }
}

/// Escape a trace payload onto one line.
pub fn escape(payload: &str) -> String {
    payload.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Reverse [`escape`].
pub fn unescape(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len());
    let mut chars = payload.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, Default)]
struct RunTally {
    completed: u32,
    errors: u32,
    failures: u32,
    skipped: u32,
}

/// Decodes a worker's output lines into events, counts, and handle state.
///
/// Every line touches the handle's last-activity instant for the timeout
/// monitor; decoded events are forwarded to the report sink; failures
/// invoke the injected failure hook.
pub struct OutputParser {
    handle: Arc<WorkerHandle>,
    sink: Arc<dyn ReportSink>,
    on_failure: FailureHook,
    tally: Mutex<RunTally>,
}

impl OutputParser {
    /// Create a parser bound to one worker.
    pub fn new(handle: Arc<WorkerHandle>, sink: Arc<dyn ReportSink>, on_failure: FailureHook) -> Self {
        Self {
            handle,
            sink,
            on_failure,
            tally: Mutex::new(RunTally::default()),
        }
    }

    /// Consume one line of worker output.
    pub async fn feed_line(&self, line: &str) {
        self.handle.touch();

        match decode_line(line) {
            WireLine::Goodbye => self.handle.note_goodbye(),
            WireLine::Trace(payload) => self.handle.record_crash(payload),
            WireLine::Event(event) => {
                self.apply(&event);
                self.sink.on_event(self.handle.slot(), &event).await;
            }
            WireLine::Raw => {
                let event = SuiteEvent::Output {
                    line: line.to_string(),
                };
                self.sink.on_event(self.handle.slot(), &event).await;
            }
        }
    }

    /// Consume a captured output blob exactly as if its lines had arrived
    /// live, in order.
    pub async fn feed_text(&self, text: &str) {
        for line in text.lines() {
            self.feed_line(line).await;
        }
    }

    fn apply(&self, event: &SuiteEvent) {
        let mut failure = false;
        {
            let mut tally = self.tally.lock().unwrap();
            match event {
                SuiteEvent::TestPassed { .. } => tally.completed += 1,
                SuiteEvent::TestFailed { .. } => {
                    tally.completed += 1;
                    tally.failures += 1;
                    failure = true;
                }
                SuiteEvent::TestErrored { .. } => {
                    tally.completed += 1;
                    tally.errors += 1;
                    failure = true;
                }
                SuiteEvent::TestSkipped { .. } => {
                    tally.completed += 1;
                    tally.skipped += 1;
                }
                SuiteEvent::SuiteStarted { .. }
                | SuiteEvent::SuiteCompleted { .. }
                | SuiteEvent::TestStarted { .. }
                | SuiteEvent::Output { .. } => {}
            }
        }

        if failure {
            (self.on_failure)();
        }

        if matches!(event, SuiteEvent::SuiteCompleted { .. }) {
            self.handle.suite_done().notify_one();
        }
    }

    /// The accumulated result.
    pub fn tally(&self, timed_out: bool) -> RunResult {
        let tally = self.tally.lock().unwrap();
        RunResult {
            completed: tally.completed,
            errors: tally.errors,
            failures: tally.failures,
            skipped: tally.skipped,
            timed_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::report::NullSink;
    use crate::worker::CommandLink;

    fn parser() -> (OutputParser, Arc<WorkerHandle>, Arc<AtomicUsize>) {
        let (link, _rx) = CommandLink::new();
        let handle = Arc::new(WorkerHandle::new(7, Duration::from_secs(30), link));
        let failures = Arc::new(AtomicUsize::new(0));
        let hook_failures = failures.clone();
        let parser = OutputParser::new(
            handle.clone(),
            Arc::new(NullSink),
            Arc::new(move || {
                hook_failures.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (parser, handle, failures)
    }

    #[test]
    fn test_decode_event_lines() {
        assert_eq!(
            decode_line("volley:event:test-passed\tmath::adds"),
            WireLine::Event(SuiteEvent::TestPassed {
                name: "math::adds".to_string()
            })
        );
        assert_eq!(
            decode_line("volley:event:test-failed\tmath::divides\texpected 1 got 2"),
            WireLine::Event(SuiteEvent::TestFailed {
                name: "math::divides".to_string(),
                message: Some("expected 1 got 2".to_string()),
            })
        );
    }

    #[test]
    fn test_decode_goodbye_and_trace() {
        assert_eq!(decode_line("volley:bye"), WireLine::Goodbye);
        assert_eq!(
            decode_line("volley:trace:boom\\nat main"),
            WireLine::Trace("boom\nat main".to_string())
        );
    }

    #[test]
    fn test_unknown_lines_pass_through() {
        assert_eq!(decode_line("compiling 3 crates..."), WireLine::Raw);
        // Unknown event kinds are not an error either.
        assert_eq!(decode_line("volley:event:test-exploded\tx"), WireLine::Raw);
    }

    #[test]
    fn test_escape_round_trip() {
        let payload = "line one\nline two \\ backslash";
        assert_eq!(unescape(&escape(payload)), payload);
    }

    #[test]
    fn test_encode_commands() {
        assert_eq!(encode_command(&LinkSignal::Noop), "volley:cmd:noop");
        assert_eq!(
            encode_command(&LinkSignal::RunSuite("alpha".to_string())),
            "volley:cmd:run\talpha"
        );
        assert_eq!(encode_command(&LinkSignal::Finish), "volley:cmd:bye");
    }

    #[tokio::test]
    async fn test_tally_counts_outcomes() {
        let (parser, _handle, failures) = parser();

        parser.feed_line("volley:event:test-passed\ta").await;
        parser.feed_line("volley:event:test-failed\tb\tnope").await;
        parser.feed_line("volley:event:test-errored\tc").await;
        parser.feed_line("volley:event:test-skipped\td").await;
        parser.feed_line("random build output").await;

        let result = parser.tally(false);
        assert_eq!(result.completed, 4);
        assert_eq!(result.failures, 1);
        assert_eq!(result.errors, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_goodbye_sets_handle_flag() {
        let (parser, handle, _failures) = parser();
        assert!(!handle.said_goodbye());
        parser.feed_line("volley:bye").await;
        assert!(handle.said_goodbye());
    }

    #[tokio::test]
    async fn test_trace_records_crash_payload() {
        let (parser, handle, _failures) = parser();
        parser.feed_line("volley:trace:kaboom\\nat worker").await;
        assert_eq!(handle.crash_payload().as_deref(), Some("kaboom\nat worker"));
    }

    #[tokio::test]
    async fn test_every_line_touches_activity() {
        let (parser, handle, _failures) = parser();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let before = handle.idle_duration(std::time::Instant::now());
        assert!(before >= Duration::from_millis(10));

        parser.feed_line("anything at all").await;
        let after = handle.idle_duration(std::time::Instant::now());
        assert!(after < before);
    }

    #[tokio::test]
    async fn test_batch_feed_matches_live_feed() {
        let (batch, handle, _f) = parser();
        batch
            .feed_text("volley:event:test-passed\ta\nvolley:event:test-failed\tb\nvolley:bye\n")
            .await;

        assert!(handle.said_goodbye());
        let result = batch.tally(false);
        assert_eq!(result.completed, 2);
        assert_eq!(result.failures, 1);
    }
}
