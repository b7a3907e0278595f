//! volley CLI - dispatches test-suite executions across workers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use volley::bundle::FsBlobStore;
use volley::config::{self, ExecutionConfig};
use volley::dispatch::{DispatchSettings, Dispatcher, SuitePlan};
use volley::report::ConsoleSink;
use volley::worker::{Launcher, ShellEndpoint};

#[derive(Parser)]
#[command(name = "volley")]
#[command(about = "Dispatches test-suite executions across workers", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "volley.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch the configured suites
    Run {
        /// Override worker concurrency
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Override the per-worker timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Validate the configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Execution substrate (local, remote)
        #[arg(short, long, default_value = "local")]
        execution: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { parallel, timeout } => {
            run_dispatch(&cli.config, parallel, timeout, cli.verbose).await
        }
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { execution } => init_config(&execution),
    }
}

async fn run_dispatch(
    config_path: &Path,
    parallel_override: Option<usize>,
    timeout_override: Option<u64>,
    verbose: bool,
) -> Result<()> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // Apply overrides
    if let Some(parallel) = parallel_override {
        config.dispatch.concurrency = parallel;
    }
    if let Some(timeout) = timeout_override {
        config.dispatch.timeout_secs = Some(timeout);
    }

    let sink = Arc::new(ConsoleSink::new(verbose));
    let settings = DispatchSettings::from_config(&config);
    let plan = SuitePlan::from_config(&config);

    let dispatcher = match &config.execution {
        ExecutionConfig::Local(local) => {
            let working_dir = local.working_dir.as_deref().map(config::expand_path);
            Dispatcher::new(settings, Launcher::Local { working_dir }, sink)
        }
        ExecutionConfig::Remote(remote) => {
            let mut endpoint = ShellEndpoint::new(remote.endpoint_command.clone())
                .with_timeout(remote.timeout_secs);
            if let Some(dir) = &remote.working_dir {
                endpoint = endpoint.with_working_dir(config::expand_path(dir));
            }
            let store = FsBlobStore::new(config::expand_path(&remote.store_dir));

            Dispatcher::new(
                settings,
                Launcher::Remote {
                    endpoint: Arc::new(endpoint),
                },
                sink,
            )
            .with_store(Arc::new(store))
            .with_classpath(config.classpath.resolved())
        }
    };

    let result = dispatcher.run(&plan).await?;
    std::process::exit(result.exit_code());
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration is valid");
    info!("  Concurrency: {}", config.dispatch.concurrency);
    info!("  Reuse workers: {}", config.dispatch.reuse_workers);
    info!("  Suites: {}", config.suites.names.len());

    Ok(())
}

fn init_config(execution: &str) -> Result<()> {
    let execution_section = match execution {
        "local" => {
            r#"[execution]
type = "local"
"#
        }
        "remote" => {
            r#"[execution]
type = "remote"
endpoint_command = "invoke-worker --settings {settings} --bundle {bundle}"
store_dir = "/var/volley/bundles"
"#
        }
        other => anyhow::bail!("Unknown execution substrate: {}", other),
    };

    let content = format!(
        r#"# volley configuration

[dispatch]
concurrency = 4
reuse_workers = true
# timeout_secs = 300
# skip_after_failures = 5

[worker]
launch = "worker-bin --slot {{slot}}"

[suites]
names = []
# files = ["suiteA.xml"]
# deferred = false

[classpath]
entries = []

{}"#,
        execution_section
    );

    let path = Path::new("volley.toml");
    if path.exists() {
        anyhow::bail!("volley.toml already exists");
    }
    std::fs::write(path, content).context("Failed to write volley.toml")?;

    println!("Created volley.toml");
    Ok(())
}
