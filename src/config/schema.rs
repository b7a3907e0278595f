//! Configuration schema definitions for volley.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. The schema uses serde for serialization and a
//! tagged enum for execution-substrate selection.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── DispatchConfig       - Concurrency, reuse, timeout, fail-fast threshold
//! ├── WorkerConfig         - Launch template and forwarded properties
//! ├── SuitesConfig         - Suite names, descriptor files, deferred discovery
//! ├── ClasspathConfig      - Ordered classpath entries for bundling
//! └── ExecutionConfig      - Tagged enum selecting substrate
//!     ├── Local            - Spawned local processes
//!     └── Remote           - One-shot managed compute invocations
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for volley.
///
/// # Example
///
/// ```
/// use volley::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [dispatch]
///     concurrency = 4
///
///     [worker]
///     launch = "java -jar worker.jar --slot {slot}"
///
///     [suites]
///     names = ["com.example.FooTest"]
///
///     [execution]
///     type = "local"
/// "#).unwrap();
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Dispatch settings (concurrency, reuse, timeouts, fail-fast).
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Worker launch template and forwarded properties.
    pub worker: WorkerConfig,

    /// The suite set to execute.
    #[serde(default)]
    pub suites: SuitesConfig,

    /// Classpath entries bundled for remote workers.
    #[serde(default)]
    pub classpath: ClasspathConfig,

    /// Execution substrate selection.
    pub execution: ExecutionConfig,
}

/// Core dispatch settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `concurrency` | 1 |
/// | `reuse_workers` | true |
/// | `timeout_secs` | unset (a 54 000 s ceiling applies) |
/// | `skip_after_failures` | 0 (disabled) |
/// | `stop_mode` | `"halt"` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Maximum number of workers active at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Whether one worker may process multiple suites.
    ///
    /// When disabled, every suite gets a fresh worker.
    #[serde(default = "default_true")]
    pub reuse_workers: bool,

    /// Per-worker timeout in seconds.
    ///
    /// When unset, a large default ceiling applies; there is no way to
    /// configure "no timeout".
    pub timeout_secs: Option<u64>,

    /// Number of observed test failures after which remaining suites are
    /// skipped across all workers. Zero disables fail-fast.
    #[serde(default)]
    pub skip_after_failures: usize,

    /// How workers are told to stop on abnormal dispatcher termination.
    #[serde(default)]
    pub stop_mode: StopModeConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            reuse_workers: true,
            timeout_secs: None,
            skip_after_failures: 0,
            stop_mode: StopModeConfig::default(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// Stop behavior broadcast to workers when the dispatcher dies abnormally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopModeConfig {
    /// Tell workers to exit immediately.
    #[default]
    Halt,
    /// Tell workers to finish the current test, then exit.
    FinishCurrent,
}

/// Worker launch template and forwarded configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Command template used to start a worker process.
    ///
    /// Split with shell word rules; every token may contain the `{slot}`
    /// placeholder, replaced with the worker's fork-slot number. The
    /// serialized settings file path is appended as the final argument.
    pub launch: String,

    /// Provider properties serialized into every worker's settings.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    /// System properties forwarded to workers.
    ///
    /// Values may contain `{slot}`, replaced per worker.
    #[serde(default)]
    pub system_properties: BTreeMap<String, String>,
}

/// The suite set to execute.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SuitesConfig {
    /// Suite identifiers known up front (e.g. class names).
    #[serde(default)]
    pub names: Vec<String>,

    /// Suite descriptor files, bundled under a fixed prefix and handed to
    /// workers as a whole.
    #[serde(default)]
    pub files: Vec<String>,

    /// Suites are discovered only after the worker's classloader is built;
    /// the dispatcher cannot enumerate them.
    #[serde(default)]
    pub deferred: bool,
}

/// Ordered classpath entries consumed by the bundle builder.
///
/// Order matters: entries processed later overwrite colliding relative
/// paths from earlier entries, preserving classpath precedence.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClasspathConfig {
    /// Files and directories, in precedence order.
    #[serde(default)]
    pub entries: Vec<String>,
}

impl ClasspathConfig {
    /// Resolve entries to paths, expanding tildes.
    pub fn resolved(&self) -> Vec<PathBuf> {
        self.entries.iter().map(|e| super::expand_path(e)).collect()
    }
}

impl SuitesConfig {
    /// Resolve descriptor files to paths, expanding tildes.
    pub fn resolved_files(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| super::expand_path(f)).collect()
    }
}

/// Execution substrate selection.
///
/// # Example
///
/// ```toml
/// # Spawned local processes
/// [execution]
/// type = "local"
///
/// # One-shot invocations on a managed compute endpoint
/// [execution]
/// type = "remote"
/// endpoint_command = "invoke-worker --settings {settings} --bundle {bundle}"
/// store_dir = "/var/volley/bundles"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecutionConfig {
    /// Workers are processes spawned by the dispatcher.
    Local(LocalExecutionConfig),

    /// Workers are one-shot invocations of packaged code on a compute
    /// endpoint that returns captured output.
    Remote(RemoteExecutionConfig),
}

/// Configuration for the local process substrate.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LocalExecutionConfig {
    /// Working directory for spawned worker processes.
    pub working_dir: Option<String>,
}

/// Configuration for the remote compute substrate.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteExecutionConfig {
    /// Command template that performs one worker invocation.
    ///
    /// Placeholders: `{settings}` (path to the serialized invocation
    /// request) and `{bundle}` (the published bundle address). The command must
    /// print a JSON response `{"stdout": "..."}` as its last JSON line.
    pub endpoint_command: String,

    /// Directory backing the blob store bundles are published to.
    pub store_dir: String,

    /// Transport timeout for one endpoint invocation in seconds.
    ///
    /// Default: 3600 (1 hour)
    #[serde(default = "default_endpoint_timeout")]
    pub timeout_secs: u64,

    /// Working directory for the endpoint command.
    pub working_dir: Option<String>,
}

fn default_endpoint_timeout() -> u64 {
    3600 // 1 hour
}
