//! Worker lifecycle management.
//!
//! A worker is one execution of tests: either a locally spawned process or
//! a one-shot remote invocation of packaged code. This module provides the
//! uniform lifecycle abstraction over both substrates: the [`WorkerHandle`]
//! state machine, the [`CommandLink`] used to signal live workers, the
//! concurrently iterable [`WorkerRegistry`], and the [`WorkerClient`] that
//! drives one worker end-to-end.

pub mod local;
pub mod protocol;
pub mod remote;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::StopModeConfig;
use crate::dispatch::queue::WorkQueue;
use crate::report::{ReportSink, RunResult};

pub use protocol::OutputParser;
pub use remote::{ComputeEndpoint, InvocationRequest, InvocationResponse, ShellEndpoint};

/// Placeholder substituted with the fork-slot number in launch templates
/// and forwarded system-property values.
pub const SLOT_PLACEHOLDER: &str = "{slot}";

/// Timeout ceiling applied when no per-worker timeout is configured.
///
/// There is deliberately no "no timeout" setting; an unset timeout means
/// this ceiling.
pub const DEFAULT_TIMEOUT_SECS: u64 = 15 * 60 * 60;

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Callback invoked once per observed test failure, injected at
/// [`WorkerClient`] construction.
pub type FailureHook = Arc<dyn Fn() + Send + Sync>;

/// Errors that can occur while executing one worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to launch worker {slot}: {message}")]
    Launch { slot: u32, message: String },

    #[error("worker {slot} crashed: {reason}; command was: {command}")]
    Crash {
        slot: u32,
        reason: String,
        command: String,
        trace: Option<String>,
    },

    #[error("worker protocol violation: {0}")]
    Protocol(String),

    #[error("worker i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize worker settings: {0}")]
    Settings(#[from] serde_json::Error),
}

/// Lifecycle state of one worker.
///
/// States only ever move forward: Created → Running → one of the terminal
/// states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    Completed,
    TimedOut,
    Crashed,
}

impl WorkerState {
    fn rank(self) -> u8 {
        match self {
            WorkerState::Created => 0,
            WorkerState::Running => 1,
            WorkerState::Completed | WorkerState::TimedOut | WorkerState::Crashed => 2,
        }
    }
}

/// A command that can be signalled to a live worker.
///
/// Local workers receive these as wire lines on stdin; remote workers
/// observe the skip flag and kill token on their link instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSignal {
    Noop,
    RunSuite(String),
    SkipRemaining,
    Finish,
    Halt,
}

/// Receiving half of a worker's command channel.
pub type CommandReceiver = mpsc::UnboundedReceiver<LinkSignal>;

/// The communication channel to one live worker.
///
/// Cloneable; the registry broadcasts through it and the monitor pings it.
#[derive(Clone)]
pub struct CommandLink {
    tx: mpsc::UnboundedSender<LinkSignal>,
    skip: Arc<AtomicBool>,
    kill: CancellationToken,
}

impl CommandLink {
    /// Create a link and its receiving half.
    pub fn new() -> (Self, CommandReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                skip: Arc::new(AtomicBool::new(false)),
                kill: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Send a liveness no-op.
    pub fn noop(&self) {
        let _ = self.tx.send(LinkSignal::Noop);
    }

    /// Assign the next suite to a streaming worker.
    pub fn run_suite(&self, suite: impl Into<String>) {
        let _ = self.tx.send(LinkSignal::RunSuite(suite.into()));
    }

    /// Tell the worker to skip everything after the current test.
    pub fn skip_remaining(&self) {
        self.skip.store(true, Ordering::Release);
        let _ = self.tx.send(LinkSignal::SkipRemaining);
    }

    /// Tell the worker no further suites are coming.
    pub fn finish(&self) {
        let _ = self.tx.send(LinkSignal::Finish);
    }

    /// Tell the worker to stop immediately (cooperative).
    pub fn halt(&self) {
        let _ = self.tx.send(LinkSignal::Halt);
    }

    /// Forcibly terminate the worker.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Whether a skip-remaining signal has been issued on this link.
    pub fn skip_requested(&self) -> bool {
        self.skip.load(Ordering::Acquire)
    }

    /// Token cancelled when a kill has been requested.
    pub fn kill_token(&self) -> &CancellationToken {
        &self.kill
    }
}

/// State of one worker invocation, shared between its client, the
/// monitor, and the dispatcher.
pub struct WorkerHandle {
    slot: u32,
    timeout: Duration,
    created_at: chrono::DateTime<chrono::Utc>,
    started_at: Instant,
    state: Mutex<WorkerState>,
    last_activity: Mutex<Option<Instant>>,
    said_goodbye: AtomicBool,
    crash: Mutex<Option<String>>,
    suite_done: Notify,
    link: CommandLink,
}

impl WorkerHandle {
    /// Create a handle for the given fork slot.
    pub fn new(slot: u32, timeout: Duration, link: CommandLink) -> Self {
        Self {
            slot,
            timeout,
            created_at: chrono::Utc::now(),
            started_at: Instant::now(),
            state: Mutex::new(WorkerState::Created),
            last_activity: Mutex::new(None),
            said_goodbye: AtomicBool::new(false),
            crash: Mutex::new(None),
            suite_done: Notify::new(),
            link,
        }
    }

    /// The fork-slot number.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// The configured timeout for this worker.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wall-clock creation time, for diagnostics.
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.created_at
    }

    /// The command link to this worker.
    pub fn link(&self) -> &CommandLink {
        &self.link
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap()
    }

    /// Advance the state machine. Returns false when the transition would
    /// move backward or leave a terminal state.
    pub fn advance(&self, next: WorkerState) -> bool {
        let mut state = self.state.lock().unwrap();
        if next.rank() > state.rank() {
            *state = next;
            true
        } else {
            false
        }
    }

    /// Whether the worker is currently running.
    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Mark this worker timed out. Returns true only for the transition
    /// that actually moved the state.
    pub fn mark_timed_out(&self) -> bool {
        self.advance(WorkerState::TimedOut)
    }

    /// Whether this worker has been marked timed out.
    pub fn timed_out(&self) -> bool {
        self.state() == WorkerState::TimedOut
    }

    /// Record output activity.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Some(Instant::now());
    }

    /// Time since the last observed activity, falling back to the start
    /// instant when no output has arrived yet.
    pub fn idle_duration(&self, now: Instant) -> Duration {
        let last = self.last_activity.lock().unwrap().unwrap_or(self.started_at);
        now.saturating_duration_since(last)
    }

    /// Record the goodbye marker.
    pub fn note_goodbye(&self) {
        self.said_goodbye.store(true, Ordering::Release);
    }

    /// Forget a previously observed goodbye. Used between the invocations
    /// of a pooled remote worker, where each captured output blob must
    /// carry its own goodbye.
    pub fn clear_goodbye(&self) {
        self.said_goodbye.store(false, Ordering::Release);
    }

    /// Whether a goodbye marker has been observed.
    pub fn said_goodbye(&self) -> bool {
        self.said_goodbye.load(Ordering::Acquire)
    }

    /// Record a crash payload from an error-trace marker.
    pub fn record_crash(&self, payload: String) {
        *self.crash.lock().unwrap() = Some(payload);
    }

    /// The recorded crash payload, if any.
    pub fn crash_payload(&self) -> Option<String> {
        self.crash.lock().unwrap().clone()
    }

    /// Notifier woken every time this worker completes a suite.
    pub fn suite_done(&self) -> &Notify {
        &self.suite_done
    }
}

/// The set of currently active workers.
///
/// Concurrent append during launch, concurrent remove on completion, and
/// snapshot-safe iteration for the monitor and kill-all without holding
/// the lock while acting on the handles.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: Mutex<Vec<Arc<WorkerHandle>>>,
}

impl WorkerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a launching worker.
    pub fn add(&self, handle: Arc<WorkerHandle>) {
        self.workers.lock().unwrap().push(handle);
    }

    /// Remove a completed worker by slot number.
    pub fn remove(&self, slot: u32) {
        self.workers.lock().unwrap().retain(|h| h.slot() != slot);
    }

    /// Number of live workers.
    pub fn len(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Whether no workers are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the live handles, safe to iterate without the lock.
    pub fn snapshot(&self) -> Vec<Arc<WorkerHandle>> {
        self.workers.lock().unwrap().clone()
    }

    /// Tell every live worker to skip remaining tests.
    pub fn broadcast_skip(&self) {
        for handle in self.snapshot() {
            handle.link().skip_remaining();
        }
    }

    /// Send a liveness no-op to every live worker.
    pub fn broadcast_noop(&self) {
        for handle in self.snapshot() {
            handle.link().noop();
        }
    }

    /// Broadcast the configured stop behavior to every live worker.
    pub fn broadcast_stop(&self, mode: StopModeConfig) {
        for handle in self.snapshot() {
            match mode {
                StopModeConfig::Halt => handle.link().halt(),
                StopModeConfig::FinishCurrent => {
                    handle.link().skip_remaining();
                    handle.link().finish();
                }
            }
        }
    }

    /// Forcibly terminate every live worker.
    pub fn kill_all(&self) {
        for handle in self.snapshot() {
            handle.link().kill();
        }
    }
}

/// Which suites one worker executes.
#[derive(Clone)]
pub enum SuiteAssignment {
    /// The worker runs the whole externally defined suite set.
    All,
    /// The worker runs exactly one suite.
    Single(String),
    /// The worker pulls suites from the shared queue until it is empty.
    Pool(Arc<WorkQueue>),
}

/// Serialized suite selection embedded in [`WorkerSettings`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SuiteSelection {
    /// Run every configured suite; descriptor files ship in the bundle.
    All { suites: Vec<String> },
    /// Run one named suite.
    Single { suite: String },
    /// Read suite assignments from the command stream.
    Stream,
}

/// Everything one worker invocation needs, serialized for the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Provider properties forwarded verbatim.
    pub properties: BTreeMap<String, String>,
    /// Forwarded system properties, `{slot}` already substituted.
    pub system_properties: BTreeMap<String, String>,
    /// Which suites to execute.
    pub selection: SuiteSelection,
    /// Published bundle address (remote workers only).
    pub bundle: Option<String>,
    /// Effective timeout in seconds.
    pub timeout_secs: u64,
    /// Launch argv, `{slot}` already substituted.
    pub argv: Vec<String>,
}

impl WorkerSettings {
    /// Serialize for the settings file / remote request blob.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// The launch command line, for diagnostics.
    pub fn command_line(&self) -> String {
        shell_words::join(self.argv.iter().map(String::as_str))
    }
}

/// Which substrate executes workers.
#[derive(Clone)]
pub enum Launcher {
    /// Spawn worker processes locally.
    Local { working_dir: Option<PathBuf> },
    /// Invoke packaged code on a managed compute endpoint.
    Remote { endpoint: Arc<dyn ComputeEndpoint> },
}

/// Drives one worker invocation end-to-end: launch, output parsing,
/// liveness bookkeeping, and outcome evaluation.
pub struct WorkerClient {
    pub(crate) handle: Arc<WorkerHandle>,
    pub(crate) settings: WorkerSettings,
    pub(crate) assignment: SuiteAssignment,
    pub(crate) launcher: Launcher,
    pub(crate) parser: OutputParser,
}

impl WorkerClient {
    /// Create a client for one worker invocation.
    ///
    /// `on_failure` is invoked once per observed test failure; the
    /// dispatcher injects the skip-on-failure countdown here.
    pub fn new(
        handle: Arc<WorkerHandle>,
        settings: WorkerSettings,
        assignment: SuiteAssignment,
        launcher: Launcher,
        sink: Arc<dyn ReportSink>,
        on_failure: FailureHook,
    ) -> Self {
        let parser = OutputParser::new(handle.clone(), sink, on_failure);
        Self {
            handle,
            settings,
            assignment,
            launcher,
            parser,
        }
    }

    /// Execute the worker and evaluate its outcome.
    pub async fn run(self, rx: CommandReceiver) -> WorkerResult<RunResult> {
        info!(
            slot = self.handle.slot(),
            created_at = %self.handle.created_at(),
            "starting worker"
        );
        match self.launcher.clone() {
            Launcher::Local { working_dir } => local::execute(&self, rx, working_dir).await,
            Launcher::Remote { endpoint } => remote::execute(&self, rx, endpoint).await,
        }
    }

    /// Evaluate the outcome after the worker's output has been drained.
    ///
    /// Timeout takes the accumulated tally with the timeout flag set; a
    /// recorded crash payload is fatal even when a goodbye was seen; a
    /// missing goodbye is fatal on its own.
    pub(crate) fn conclude(&self) -> WorkerResult<RunResult> {
        let slot = self.handle.slot();

        if self.handle.timed_out() {
            return Ok(self.parser.tally(true));
        }

        if let Some(trace) = self.handle.crash_payload() {
            self.handle.advance(WorkerState::Crashed);
            return Err(WorkerError::Crash {
                slot,
                reason: "worker reported an error trace".to_string(),
                command: self.settings.command_line(),
                trace: Some(trace),
            });
        }

        if !self.handle.said_goodbye() {
            self.handle.advance(WorkerState::Crashed);
            return Err(WorkerError::Crash {
                slot,
                reason: "output ended without a goodbye marker".to_string(),
                command: self.settings.command_line(),
                trace: None,
            });
        }

        self.handle.advance(WorkerState::Completed);
        Ok(self.parser.tally(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle_with_link() -> (Arc<WorkerHandle>, CommandReceiver) {
        let (link, rx) = CommandLink::new();
        (
            Arc::new(WorkerHandle::new(1, Duration::from_secs(30), link)),
            rx,
        )
    }

    #[test]
    fn test_state_moves_forward_only() {
        let (handle, _rx) = handle_with_link();
        assert_eq!(handle.state(), WorkerState::Created);

        assert!(handle.advance(WorkerState::Running));
        assert!(handle.advance(WorkerState::Completed));

        // Terminal states never change.
        assert!(!handle.advance(WorkerState::Crashed));
        assert!(!handle.advance(WorkerState::Running));
        assert_eq!(handle.state(), WorkerState::Completed);
    }

    #[test]
    fn test_mark_timed_out_once() {
        let (handle, _rx) = handle_with_link();
        handle.advance(WorkerState::Running);

        assert!(handle.mark_timed_out());
        assert!(!handle.mark_timed_out());
        assert!(handle.timed_out());
    }

    #[test]
    fn test_idle_duration_falls_back_to_start() {
        let (handle, _rx) = handle_with_link();
        let now = Instant::now() + Duration::from_millis(50);
        assert!(handle.idle_duration(now) >= Duration::from_millis(50));

        handle.touch();
        assert!(handle.idle_duration(Instant::now()) < Duration::from_millis(50));
    }

    #[test]
    fn test_goodbye_flag_clears() {
        let (handle, _rx) = handle_with_link();
        handle.note_goodbye();
        assert!(handle.said_goodbye());
        handle.clear_goodbye();
        assert!(!handle.said_goodbye());
    }

    #[test]
    fn test_registry_snapshot_and_remove() {
        let registry = WorkerRegistry::new();
        let (a, _rx_a) = handle_with_link();
        let (link_b, _rx_b) = CommandLink::new();
        let b = Arc::new(WorkerHandle::new(2, Duration::from_secs(30), link_b));

        registry.add(a.clone());
        registry.add(b.clone());
        assert_eq!(registry.len(), 2);

        registry.remove(1);
        let remaining = registry.snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].slot(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_skip_reaches_every_link() {
        let registry = WorkerRegistry::new();
        let (handle, mut rx) = handle_with_link();
        registry.add(handle.clone());

        registry.broadcast_skip();

        assert!(handle.link().skip_requested());
        assert_eq!(rx.recv().await, Some(LinkSignal::SkipRemaining));
    }

    #[tokio::test]
    async fn test_broadcast_stop_finish_current() {
        let registry = WorkerRegistry::new();
        let (handle, mut rx) = handle_with_link();
        registry.add(handle);

        registry.broadcast_stop(StopModeConfig::FinishCurrent);

        assert_eq!(rx.recv().await, Some(LinkSignal::SkipRemaining));
        assert_eq!(rx.recv().await, Some(LinkSignal::Finish));
    }

    #[tokio::test]
    async fn test_broadcast_stop_halt() {
        let registry = WorkerRegistry::new();
        let (handle, mut rx) = handle_with_link();
        registry.add(handle);

        registry.broadcast_stop(StopModeConfig::Halt);

        assert_eq!(rx.recv().await, Some(LinkSignal::Halt));
    }

    #[test]
    fn test_settings_command_line() {
        let settings = WorkerSettings {
            properties: BTreeMap::new(),
            system_properties: BTreeMap::new(),
            selection: SuiteSelection::Stream,
            bundle: None,
            timeout_secs: 30,
            argv: vec!["worker-bin".to_string(), "--slot".to_string(), "3".to_string()],
        };
        assert_eq!(settings.command_line(), "worker-bin --slot 3");
    }
}
