//! Local execution via `bash`.
//!
//! Generated scripts use `set -xe`, which needs bash rather than sh/dash.

use super::{ExecOutput, Stream};
use crate::core::cancel::Cancellation;
use crate::core::error::{Error, Result};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Run a script fed through stdin and capture its output.
pub async fn exec_capture(shell: &str, script: &str) -> Result<ExecOutput> {
    let mut child = Command::new(shell)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(script.as_bytes()).await?;
    }

    let output = child.wait_with_output().await?;
    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Run a script file, handing every stdout/stderr line to `on_line` as it
/// arrives. Two tasks drain the pipes while this waits on the child. On
/// cancellation the child is killed and `Error::Cancelled` is returned.
pub async fn exec_streaming<F>(
    shell: &str,
    script: &Path,
    on_line: F,
    cancel: &Cancellation,
) -> Result<i32>
where
    F: Fn(Stream, &str) + Send + Sync + 'static,
{
    let mut child = Command::new(shell)
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let on_line = Arc::new(on_line);
    let mut drains = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        drains.push(drain(out, Stream::Stdout, on_line.clone()));
    }
    if let Some(err) = child.stderr.take() {
        drains.push(drain(err, Stream::Stderr, on_line.clone()));
    }

    let finished = tokio::select! {
        status = child.wait() => Some(status?),
        _ = cancel.cancelled() => None,
    };
    let Some(status) = finished else {
        if let Err(e) = child.kill().await {
            tracing::warn!(error = %e, "failed to kill child process");
        }
        for handle in drains {
            handle.abort();
        }
        return Err(Error::Cancelled);
    };

    for handle in drains {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "output drain task failed");
        }
    }
    Ok(status.code().unwrap_or(-1))
}

fn drain<R, F>(pipe: R, stream: Stream, on_line: Arc<F>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: Fn(Stream, &str) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => on_line(stream, &line),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "error reading child output");
                    break;
                }
            }
        }
    })
}
