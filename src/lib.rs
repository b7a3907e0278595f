//! volley: dispatches batches of test-suite executions to a pool of workers.
//!
//! A worker is either a locally spawned process or a one-shot remote
//! invocation of packaged code on a managed compute endpoint. The crate
//! presents one uniform worker-lifecycle abstraction over both substrates.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Dispatch**: strategy selection, the worker pool, the shared work
//!   queue, skip-on-failure coordination, result aggregation
//! - **Workers**: the lifecycle state machine, the line-oriented output
//!   protocol, local and remote execution
//! - **Bundle**: deterministic packaging of classpath entries for remote
//!   workers, published through a blob store
//! - **Monitor/Shutdown**: liveness pings, timeout sweeps, and cleanup on
//!   abnormal termination
//! - **Report**: mergeable run results and event sinks
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use volley::config::load_config;
//! use volley::dispatch::{DispatchSettings, Dispatcher, SuitePlan};
//! use volley::report::ConsoleSink;
//! use volley::worker::Launcher;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("volley.toml"))?;
//!     let dispatcher = Dispatcher::new(
//!         DispatchSettings::from_config(&config),
//!         Launcher::Local { working_dir: None },
//!         Arc::new(ConsoleSink::new(false)),
//!     );
//!     let result = dispatcher.run(&SuitePlan::from_config(&config)).await?;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod bundle;
pub mod config;
pub mod dispatch;
pub mod monitor;
pub mod report;
pub mod shutdown;
pub mod worker;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use dispatch::{DispatchError, DispatchSettings, Dispatcher, Strategy, SuitePlan};
pub use report::{ReportSink, RunResult, SuiteEvent};
pub use worker::{Launcher, WorkerClient, WorkerError};
