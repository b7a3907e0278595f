//! Configuration loading and schema definitions.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Load configuration from a string.
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Expand a configured path (tilde and environment references).
pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_minimal_config() {
        let config = load_config_str(
            r#"
            [dispatch]
            concurrency = 2

            [worker]
            launch = "worker-bin --slot {slot}"

            [suites]
            names = ["alpha", "beta"]

            [execution]
            type = "local"
            "#,
        )
        .unwrap();

        assert_eq!(config.dispatch.concurrency, 2);
        assert!(config.dispatch.reuse_workers);
        assert_eq!(config.suites.names, vec!["alpha", "beta"]);
        assert!(matches!(config.execution, ExecutionConfig::Local(_)));
    }

    #[test]
    fn test_load_remote_config() {
        let config = load_config_str(
            r#"
            [worker]
            launch = "worker-bin"

            [execution]
            type = "remote"
            endpoint_command = "run-worker {settings}"
            store_dir = "/tmp/volley-store"
            "#,
        )
        .unwrap();

        match config.execution {
            ExecutionConfig::Remote(remote) => {
                assert_eq!(remote.endpoint_command, "run-worker {settings}");
                assert_eq!(remote.timeout_secs, 3600);
            }
            other => panic!("expected remote execution config, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_unknown_execution_type() {
        let result = load_config_str(
            r#"
            [worker]
            launch = "worker-bin"

            [execution]
            type = "carrier-pigeon"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/bundles");
        assert!(!expanded.to_string_lossy().starts_with('~'));
    }
}
