//! Remote execution of workers on a managed compute endpoint.
//!
//! A remote worker is one synchronous invocation of packaged code: the
//! endpoint receives the serialized settings, the bundle address, the
//! argument vector, and the timeout, and returns the worker's captured
//! standard output as one blob. The blob is split into lines and fed to
//! the output protocol parser exactly as if they had arrived live, so the
//! parser never distinguishes the substrates.
//!
//! An absent response is a protocol violation, not a normal failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    CommandReceiver, SuiteAssignment, SuiteSelection, WorkerClient, WorkerError, WorkerResult,
    WorkerSettings, WorkerState,
};
use crate::report::RunResult;

/// One worker invocation request sent to the compute endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    /// Serialized provider/test configuration.
    pub settings_blob: String,
    /// Published bundle address the endpoint fetches code from.
    pub bundle: Option<String>,
    /// Argument vector, slot substitution already applied.
    pub argv: Vec<String>,
    /// Effective timeout in seconds.
    pub timeout_secs: u64,
}

/// A successful endpoint response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResponse {
    /// The worker's captured standard output.
    pub stdout: String,
}

/// A managed compute endpoint that executes one worker per call.
///
/// `Ok(None)` means the endpoint answered with nothing; the caller treats
/// that as a fatal protocol violation rather than a normal failure.
#[async_trait]
pub trait ComputeEndpoint: Send + Sync {
    /// Perform one synchronous worker invocation.
    async fn invoke(&self, request: &InvocationRequest)
    -> WorkerResult<Option<InvocationResponse>>;
}

pub(crate) async fn execute(
    client: &WorkerClient,
    rx: CommandReceiver,
    endpoint: Arc<dyn ComputeEndpoint>,
) -> WorkerResult<RunResult> {
    let handle = client.handle.clone();
    handle.advance(WorkerState::Running);

    // Remote workers have no live command stream; skip and kill are
    // observed through the link's flags instead.
    drop(rx);

    match &client.assignment {
        SuiteAssignment::All | SuiteAssignment::Single(_) => {
            invoke_and_feed(client, endpoint.as_ref(), &client.settings).await?;
        }
        SuiteAssignment::Pool(queue) => {
            let link = handle.link().clone();
            let mut invoked = false;
            while !handle.timed_out() {
                if link.skip_requested() {
                    info!(slot = handle.slot(), "skip requested; draining no further suites");
                    break;
                }
                let Some(suite) = queue.pull() else { break };

                let mut settings = client.settings.clone();
                settings.selection = SuiteSelection::Single { suite };
                invoke_and_feed(client, endpoint.as_ref(), &settings).await?;
                invoked = true;

                // Each captured blob must carry its own goodbye; a missing
                // one fails fast instead of pulling more work.
                if handle.crash_payload().is_some() || !handle.said_goodbye() {
                    break;
                }
            }

            // A pooled worker that never drew any work produced no output
            // at all; there is nothing to evaluate for a goodbye.
            if !invoked {
                handle.advance(WorkerState::Completed);
                return Ok(client.parser.tally(false));
            }
        }
    }

    client.conclude()
}

async fn invoke_and_feed(
    client: &WorkerClient,
    endpoint: &dyn ComputeEndpoint,
    settings: &WorkerSettings,
) -> WorkerResult<()> {
    let request = InvocationRequest {
        settings_blob: settings.to_json()?,
        bundle: settings.bundle.clone(),
        argv: settings.argv.clone(),
        timeout_secs: settings.timeout_secs,
    };

    let kill = client.handle.link().kill_token().clone();
    let response = tokio::select! {
        _ = kill.cancelled() => {
            return Err(WorkerError::Protocol(
                "remote invocation abandoned by kill request".to_string(),
            ));
        }
        response = endpoint.invoke(&request) => response?,
    };

    let Some(response) = response else {
        return Err(WorkerError::Protocol(
            "remote endpoint returned no response".to_string(),
        ));
    };

    client.handle.clear_goodbye();
    client.parser.feed_text(&response.stdout).await;
    Ok(())
}

/// Endpoint implementation that shells out to a configured command.
///
/// The command template may reference `{settings}` (path of the staged
/// request JSON) and `{bundle}` (the published bundle address). The
/// command must print the response JSON (`{"stdout": "..."}`) as its last
/// JSON-looking stdout line; a run that prints none is an absent response.
pub struct ShellEndpoint {
    command: String,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl ShellEndpoint {
    /// Create an endpoint around the given command template.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            timeout: Duration::from_secs(3600),
        }
    }

    /// Set the working directory for the command.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the transport timeout.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }
}

#[async_trait]
impl ComputeEndpoint for ShellEndpoint {
    async fn invoke(
        &self,
        request: &InvocationRequest,
    ) -> WorkerResult<Option<InvocationResponse>> {
        let staged = stage_request(request)?;

        let rendered = self
            .command
            .replace("{settings}", &staged.path().to_string_lossy())
            .replace("{bundle}", request.bundle.as_deref().unwrap_or(""));

        debug!(command = %rendered, "invoking compute endpoint");

        let mut command = tokio::process::Command::new("sh");
        command.arg("-c").arg(&rendered);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                WorkerError::Protocol(format!(
                    "endpoint invocation timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| WorkerError::Protocol(format!("failed to run endpoint command: {}", e)))?;

        if !output.status.success() {
            return Err(WorkerError::Protocol(format!(
                "endpoint command failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let response = stdout
            .lines()
            .rev()
            .find(|line| line.trim_start().starts_with('{'))
            .and_then(|line| serde_json::from_str::<InvocationResponse>(line).ok());

        Ok(response)
    }
}

fn stage_request(request: &InvocationRequest) -> WorkerResult<tempfile::NamedTempFile> {
    use std::io::Write;

    let json = serde_json::to_string(request)?;
    let mut file = tempfile::Builder::new()
        .prefix("volley-invocation-")
        .suffix(".json")
        .tempfile()?;
    file.write_all(json.as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> InvocationRequest {
        InvocationRequest {
            settings_blob: "{}".to_string(),
            bundle: Some("file:///tmp/bundle.tar".to_string()),
            argv: vec!["worker-bin".to_string()],
            timeout_secs: 30,
        }
    }

    #[tokio::test]
    async fn test_shell_endpoint_parses_last_json_line() {
        let endpoint = ShellEndpoint::new(
            r#"echo "some build noise"; printf '{"stdout": "volley:bye\\n"}\n'"#,
        );
        let response = endpoint.invoke(&request()).await.unwrap();
        assert_eq!(response.unwrap().stdout, "volley:bye\n");
    }

    #[tokio::test]
    async fn test_shell_endpoint_absent_response_is_none() {
        let endpoint = ShellEndpoint::new("echo no json here");
        let response = endpoint.invoke(&request()).await.unwrap();
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_shell_endpoint_failure_is_explicit() {
        let endpoint = ShellEndpoint::new("echo doomed >&2; exit 3");
        let result = endpoint.invoke(&request()).await;
        assert!(matches!(result, Err(WorkerError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_shell_endpoint_substitutes_bundle() {
        // {bundle} is substituted before the shell sees the command.
        let endpoint = ShellEndpoint::new(r#"printf '{"stdout": "bundle was {bundle}"}'"#);
        let response = endpoint.invoke(&request()).await.unwrap().unwrap();
        assert!(response.stdout.contains("file:///tmp/bundle.tar"));
    }
}
