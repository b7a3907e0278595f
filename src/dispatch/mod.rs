//! The dispatch engine.
//!
//! The [`Dispatcher`] selects an execution strategy for the configured
//! suite set, manages the worker pool and the shared work queue,
//! coordinates skip-on-failure broadcasting, and aggregates every worker's
//! [`RunResult`] into one summary. Any fatal condition from any single
//! worker aborts the whole run; events already forwarded to the report
//! sink are never discarded.

pub mod queue;
pub mod slots;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bundle::{BlobStore, BundleBuilder, BundleError};
use crate::config::{Config, StopModeConfig};
use crate::monitor::WorkerMonitor;
use crate::report::{ReportSink, RunResult};
use crate::shutdown::ShutdownCoordinator;
use crate::worker::{
    CommandLink, FailureHook, Launcher, SLOT_PLACEHOLDER, SuiteAssignment, SuiteSelection,
    WorkerClient, WorkerError, WorkerHandle, WorkerRegistry, WorkerSettings,
};
use queue::WorkQueue;
use slots::SlotPool;

pub use crate::worker::DEFAULT_TIMEOUT_SECS;

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors that abort a dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Building or publishing the bundle failed; nothing was dispatched.
    #[error("failed to build or publish the bundle: {0}")]
    Bundling(#[from] BundleError),

    /// A worker crashed or could not be launched.
    #[error(transparent)]
    Worker(WorkerError),

    /// A malformed remote response or a worker future with no result.
    #[error("dispatch protocol error: {0}")]
    Protocol(String),

    /// The wait for worker results was interrupted.
    #[error("interrupted while awaiting worker results")]
    Interrupted,

    /// The configuration cannot be dispatched.
    #[error("invalid dispatch configuration: {0}")]
    Config(String),
}

/// How the suite set is partitioned across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One reused worker processes everything sequentially.
    ForkOnce,
    /// A pool of reused workers pulls suites from a shared queue.
    ForkOnceMultiple,
    /// Every suite gets a fresh worker.
    ForkPerSuite,
}

/// The suite set handed to one dispatch.
#[derive(Debug, Clone, Default)]
pub struct SuitePlan {
    /// Suites the dispatcher can enumerate.
    pub names: Vec<String>,
    /// Suite descriptor files, shipped whole.
    pub files: Vec<PathBuf>,
    /// Suites are discovered only inside the worker.
    pub deferred: bool,
}

impl SuitePlan {
    /// Build the plan from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            names: config.suites.names.clone(),
            files: config.suites.resolved_files(),
            deferred: config.suites.deferred,
        }
    }

    /// Whether the suite set is externally defined as a whole, rather than
    /// enumerable by the dispatcher.
    pub fn externally_defined(&self) -> bool {
        self.deferred || !self.files.is_empty()
    }
}

/// Settings driving one dispatch.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub concurrency: usize,
    pub reuse_workers: bool,
    pub timeout: Duration,
    pub skip_after_failures: usize,
    pub stop_mode: StopModeConfig,
    /// Worker launch template; `{slot}` is substituted per worker.
    pub launch: String,
    pub properties: BTreeMap<String, String>,
    pub system_properties: BTreeMap<String, String>,
}

impl DispatchSettings {
    /// Build settings from configuration, applying the timeout ceiling.
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.dispatch.concurrency.max(1),
            reuse_workers: config.dispatch.reuse_workers,
            timeout: Duration::from_secs(
                config.dispatch.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
            skip_after_failures: config.dispatch.skip_after_failures,
            stop_mode: config.dispatch.stop_mode,
            launch: config.worker.launch.clone(),
            properties: config.worker.properties.clone(),
            system_properties: config.worker.system_properties.clone(),
        }
    }
}

/// Atomically count down towards zero.
///
/// Returns true only for the caller whose decrement moved the counter to
/// exactly zero; a counter already at zero never fires (threshold zero
/// means disabled).
pub fn count_down_to_zero(counter: &AtomicUsize) -> bool {
    loop {
        let current = counter.load(Ordering::Acquire);
        if current == 0 {
            return false;
        }
        if counter
            .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return current == 1;
        }
    }
}

/// Top-level orchestrator for one run.
pub struct Dispatcher {
    settings: DispatchSettings,
    launcher: Launcher,
    store: Option<Arc<dyn BlobStore>>,
    classpath: Vec<PathBuf>,
    sink: Arc<dyn ReportSink>,
    registry: Arc<WorkerRegistry>,
    slots: Arc<SlotPool>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Create a dispatcher for the given substrate and sink.
    pub fn new(settings: DispatchSettings, launcher: Launcher, sink: Arc<dyn ReportSink>) -> Self {
        let slots = SlotPool::new(settings.concurrency);
        Self {
            settings,
            launcher,
            store: None,
            classpath: Vec::new(),
            sink,
            registry: Arc::new(WorkerRegistry::new()),
            slots,
            shutdown: CancellationToken::new(),
        }
    }

    /// Attach the blob store bundles are published to (remote execution).
    pub fn with_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attach the resolved classpath consumed by the bundle builder.
    pub fn with_classpath(mut self, classpath: Vec<PathBuf>) -> Self {
        self.classpath = classpath;
        self
    }

    /// Token that interrupts the dispatch when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The live worker registry.
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Forcibly terminate every active worker. Usable at any time.
    pub fn kill_workers(&self) {
        warn!("killing all active workers");
        self.registry.kill_all();
    }

    /// Pick the execution strategy for the plan.
    pub fn select_strategy(&self, plan: &SuitePlan) -> Strategy {
        if self.settings.reuse_workers
            && (self.settings.concurrency == 1 || plan.externally_defined())
        {
            Strategy::ForkOnce
        } else if self.settings.reuse_workers {
            Strategy::ForkOnceMultiple
        } else {
            Strategy::ForkPerSuite
        }
    }

    /// Execute the plan and aggregate every worker's result.
    pub async fn run(&self, plan: &SuitePlan) -> DispatchResult<RunResult> {
        let run_id = uuid::Uuid::new_v4();

        let argv_template = shell_words::split(&self.settings.launch)
            .map_err(|e| DispatchError::Config(format!("invalid launch template: {}", e)))?;

        // The bundle is built once per run, before any worker starts; a
        // failure here aborts the whole dispatch.
        let bundle = match (&self.launcher, &self.store) {
            (Launcher::Remote { .. }, Some(store)) => {
                let builder = BundleBuilder::from_classpath(&self.classpath, &plan.files)?;
                Some(builder.publish(store.as_ref(), &run_id).await?)
            }
            (Launcher::Remote { .. }, None) => {
                return Err(DispatchError::Config(
                    "remote execution requires a blob store".to_string(),
                ));
            }
            (Launcher::Local { .. }, _) => None,
        };

        let strategy = self.select_strategy(plan);
        if strategy == Strategy::ForkPerSuite && plan.names.is_empty() && plan.externally_defined()
        {
            return Err(DispatchError::Config(
                "suite set is not enumerable without worker reuse".to_string(),
            ));
        }

        let coordinator = ShutdownCoordinator::arm(
            self.registry.clone(),
            self.settings.stop_mode,
            self.shutdown.clone(),
        );
        let monitor = WorkerMonitor::start(self.registry.clone());

        info!(%run_id, ?strategy, suites = plan.names.len(), "dispatching");

        let countdown = Arc::new(AtomicUsize::new(self.settings.skip_after_failures));
        let outcome = match strategy {
            Strategy::ForkOnce => {
                let selection = SuiteSelection::All {
                    suites: plan.names.clone(),
                };
                let handle =
                    self.spawn_worker(&argv_template, SuiteAssignment::All, selection, &bundle, &countdown);
                self.await_results(vec![handle]).await
            }
            Strategy::ForkOnceMultiple => {
                let work = Arc::new(WorkQueue::new(plan.names.iter().cloned()));
                let workers = self.settings.concurrency.min(work.len());
                let handles = (0..workers)
                    .map(|_| {
                        self.spawn_worker(
                            &argv_template,
                            SuiteAssignment::Pool(work.clone()),
                            SuiteSelection::Stream,
                            &bundle,
                            &countdown,
                        )
                    })
                    .collect();
                self.await_results(handles).await
            }
            Strategy::ForkPerSuite => {
                let handles = plan
                    .names
                    .iter()
                    .map(|suite| {
                        self.spawn_worker(
                            &argv_template,
                            SuiteAssignment::Single(suite.clone()),
                            SuiteSelection::Single {
                                suite: suite.clone(),
                            },
                            &bundle,
                            &countdown,
                        )
                    })
                    .collect();
                self.await_results(handles).await
            }
        };

        monitor.stop();
        coordinator.disarm();

        if let Ok(result) = &outcome {
            self.sink.on_run_complete(result).await;
        }

        outcome
    }

    fn failure_hook(&self, countdown: &Arc<AtomicUsize>) -> FailureHook {
        let countdown = countdown.clone();
        let registry = self.registry.clone();
        Arc::new(move || {
            if count_down_to_zero(&countdown) {
                info!("failure threshold reached; broadcasting skip to live workers");
                registry.broadcast_skip();
            }
        })
    }

    /// Submit one worker. The slot is drawn inside the task, so pending
    /// submissions queue without bound while active workers stay within
    /// pool capacity.
    fn spawn_worker(
        &self,
        argv_template: &[String],
        assignment: SuiteAssignment,
        selection: SuiteSelection,
        bundle: &Option<String>,
        countdown: &Arc<AtomicUsize>,
    ) -> JoinHandle<Result<RunResult, WorkerError>> {
        let settings = self.settings.clone();
        let argv_template = argv_template.to_vec();
        let bundle = bundle.clone();
        let launcher = self.launcher.clone();
        let sink = self.sink.clone();
        let registry = self.registry.clone();
        let slots = self.slots.clone();
        let hook = self.failure_hook(countdown);

        tokio::spawn(async move {
            let slot_guard = slots.checkout().await;
            let slot = slot_guard.number();

            let worker_settings =
                build_worker_settings(&settings, &argv_template, slot, selection, bundle.as_deref());

            let (link, rx) = CommandLink::new();
            let handle = Arc::new(WorkerHandle::new(slot, settings.timeout, link));
            registry.add(handle.clone());

            let client =
                WorkerClient::new(handle, worker_settings, assignment, launcher, sink, hook);
            let result = client.run(rx).await;

            registry.remove(slot);
            drop(slot_guard);
            result
        })
    }

    /// Await every worker future, merging results as they complete.
    ///
    /// A worker future with no result is a fatal protocol error; a fatal
    /// worker error aborts the remaining futures; cancellation of the
    /// shutdown token aborts everything and kills the pool.
    async fn await_results(
        &self,
        handles: Vec<JoinHandle<Result<RunResult, WorkerError>>>,
    ) -> DispatchResult<RunResult> {
        let mut handles = handles;
        let mut total = RunResult::default();

        while let Some(mut next) = handles.pop() {
            let joined = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    next.abort();
                    abort_all(&handles);
                    self.registry.kill_all();
                    return Err(DispatchError::Interrupted);
                }
                joined = &mut next => joined,
            };

            match joined {
                Ok(Ok(result)) => total = total.merge(result),
                Ok(Err(WorkerError::Protocol(message))) => {
                    abort_all(&handles);
                    return Err(DispatchError::Protocol(message));
                }
                Ok(Err(error)) => {
                    abort_all(&handles);
                    return Err(DispatchError::Worker(error));
                }
                Err(join_error) => {
                    abort_all(&handles);
                    return Err(DispatchError::Protocol(format!(
                        "worker task produced no result: {}",
                        join_error
                    )));
                }
            }
        }

        Ok(total)
    }
}

fn abort_all(handles: &[JoinHandle<Result<RunResult, WorkerError>>]) {
    for handle in handles {
        handle.abort();
    }
}

/// Materialize one worker's settings: slot substitution in the launch
/// template and the forwarded system-property values, plus the effective
/// timeout and bundle reference.
fn build_worker_settings(
    settings: &DispatchSettings,
    argv_template: &[String],
    slot: u32,
    selection: SuiteSelection,
    bundle: Option<&str>,
) -> WorkerSettings {
    let slot_text = slot.to_string();

    let argv = argv_template
        .iter()
        .map(|token| token.replace(SLOT_PLACEHOLDER, &slot_text))
        .collect();

    let system_properties = settings
        .system_properties
        .iter()
        .map(|(key, value)| (key.clone(), value.replace(SLOT_PLACEHOLDER, &slot_text)))
        .collect();

    WorkerSettings {
        properties: settings.properties.clone(),
        system_properties,
        selection,
        bundle: bundle.map(str::to_string),
        timeout_secs: settings.timeout.as_secs(),
        argv,
    }
}
