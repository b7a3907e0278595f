//! Local process execution of workers.
//!
//! Spawns the worker as a child process, pumps command wire lines into its
//! stdin, and streams its stdout into the output protocol parser. Pooled
//! workers are fed suites one at a time: the next suite is pulled from the
//! shared queue only after the previous one completes, so heterogeneous
//! suite durations balance naturally.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, info, warn};

use super::protocol::encode_command;
use super::{
    CommandReceiver, SuiteAssignment, WorkerClient, WorkerError, WorkerHandle, WorkerResult,
    WorkerSettings, WorkerState,
};
use crate::dispatch::queue::WorkQueue;
use crate::report::RunResult;

static SETTINGS_FILE_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub(crate) async fn execute(
    client: &WorkerClient,
    rx: CommandReceiver,
    working_dir: Option<PathBuf>,
) -> WorkerResult<RunResult> {
    let handle = client.handle.clone();
    let slot = handle.slot();

    if client.settings.argv.is_empty() {
        return Err(WorkerError::Launch {
            slot,
            message: "launch template produced an empty command".to_string(),
        });
    }

    // The settings file must outlive the child; it is removed when this
    // scope ends.
    let settings_file = write_settings_file(&client.settings)?;

    let mut command = tokio::process::Command::new(&client.settings.argv[0]);
    command
        .args(&client.settings.argv[1..])
        .arg(settings_file.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    if let Some(dir) = &working_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|e| WorkerError::Launch {
        slot,
        message: e.to_string(),
    })?;

    handle.advance(WorkerState::Running);
    info!(slot, command = %client.settings.command_line(), "forked worker process");

    let stdin = child.stdin.take().ok_or_else(|| WorkerError::Launch {
        slot,
        message: "worker stdin unavailable".to_string(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| WorkerError::Launch {
        slot,
        message: "worker stdout unavailable".to_string(),
    })?;

    let pump = tokio::spawn(pump_commands(rx, stdin));
    let feeder = match &client.assignment {
        SuiteAssignment::Pool(queue) => {
            Some(tokio::spawn(feed_queue(queue.clone(), handle.clone())))
        }
        SuiteAssignment::All | SuiteAssignment::Single(_) => None,
    };

    let mut lines = LinesStream::new(BufReader::new(stdout).lines());
    let kill = handle.link().kill_token().clone();

    loop {
        tokio::select! {
            _ = kill.cancelled() => {
                warn!(slot, "kill requested; terminating worker process");
                let _ = child.kill().await;
                break;
            }
            next = lines.next() => match next {
                Some(Ok(line)) => client.parser.feed_line(&line).await,
                Some(Err(e)) => {
                    warn!(slot, error = %e, "failed reading worker output");
                    break;
                }
                None => break,
            }
        }
    }

    pump.abort();
    if let Some(feeder) = &feeder {
        feeder.abort();
    }
    let _ = child.wait().await;
    debug!(slot, "worker output drained");

    client.conclude()
}

/// Serialize the settings to a uniquely named temporary file handed to the
/// worker as its final argument.
fn write_settings_file(settings: &WorkerSettings) -> WorkerResult<tempfile::NamedTempFile> {
    let json = settings.to_json()?;
    let n = SETTINGS_FILE_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut file = tempfile::Builder::new()
        .prefix(&format!("volley-settings-{}-", n))
        .suffix(".json")
        .tempfile()?;
    file.write_all(json.as_bytes())?;
    file.flush()?;

    Ok(file)
}

/// Move command signals from the link onto the worker's stdin.
async fn pump_commands(mut rx: CommandReceiver, mut stdin: tokio::process::ChildStdin) {
    while let Some(signal) = rx.recv().await {
        let mut line = encode_command(&signal);
        line.push('\n');
        // A closed stdin just means the worker is gone.
        if stdin.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        let _ = stdin.flush().await;
    }
}

/// Demand-driven suite feeding for pooled workers: one suite in flight at
/// a time, the next pulled only after `suite-completed` arrives.
async fn feed_queue(queue: Arc<WorkQueue>, handle: Arc<WorkerHandle>) {
    let link = handle.link().clone();
    loop {
        if link.skip_requested() {
            break;
        }
        let Some(suite) = queue.pull() else { break };
        link.run_suite(suite);
        handle.suite_done().notified().await;
    }
    link.finish();
}
