//! Line-streamed subprocess execution
//!
//! The engine talks to children (runtime interpreter, version-control
//! binary, archive tool) only via argv, cwd, and line-buffered
//! stdout/stderr. Cancellation terminates the child.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::output::OutputSink;

/// Run a command, streaming stdout and stderr line by line to `output`
///
/// Returns `Error::CommandFailed` on a non-zero exit and `Error::Cancelled`
/// when the token fires while the child is running (the child is killed).
pub async fn run_logged(
    program: &str,
    args: &[&str],
    cwd: &Path,
    output: &OutputSink,
    cancel: &CancelToken,
) -> Result<()> {
    cancel.err_if_cancelled()?;

    debug!("Spawning: {} {:?} (cwd: {})", program, args, cwd.display());

    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let out_sink = output.clone();
    let err_sink = output.clone();
    let stdout_task = tokio::spawn(async move {
        while let Ok(Some(line)) = stdout_lines.next_line().await {
            out_sink.line(line);
        }
    });
    let stderr_task = tokio::spawn(async move {
        while let Ok(Some(line)) = stderr_lines.next_line().await {
            err_sink.line(line);
        }
    });

    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {
                if cancel.is_cancelled() {
                    warn!("Cancellation requested, killing {}", program);
                    let _ = child.kill().await;
                    let _ = stdout_task.await;
                    let _ = stderr_task.await;
                    return Err(Error::Cancelled);
                }
            }
        }
    };

    let _ = stdout_task.await;
    let _ = stderr_task.await;

    if status.success() {
        Ok(())
    } else {
        Err(Error::CommandFailed {
            command: program.to_string(),
            code: status.code().unwrap_or(-1),
        })
    }
}

/// Run a command and capture its stdout as a string, without streaming
///
/// For short queries (`git rev-parse`, `git tag --list`) where the output is
/// data, not progress.
pub async fn run_captured(program: &str, args: &[&str], cwd: &Path) -> Result<String> {
    debug!("Running: {} {:?} (cwd: {})", program, args, cwd.display());

    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::CommandFailed {
            command: program.to_string(),
            code: output.status.code().unwrap_or(-1),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_logged_streams_lines() {
        let (sink, mut rx) = OutputSink::channel();
        let cancel = CancelToken::new();

        run_logged(
            "sh",
            &["-c", "echo one; echo two"],
            Path::new("."),
            &sink,
            &cancel,
        )
        .await
        .unwrap();
        drop(sink);

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_run_logged_nonzero_exit_is_error() {
        let sink = OutputSink::discard();
        let cancel = CancelToken::new();

        let err = run_logged("sh", &["-c", "exit 3"], Path::new("."), &sink, &cancel)
            .await
            .unwrap_err();
        match err {
            Error::CommandFailed { code, .. } => assert_eq!(code, 3),
            other => panic!("Unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_logged_pre_cancelled_never_spawns() {
        let sink = OutputSink::discard();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = run_logged("sh", &["-c", "true"], Path::new("."), &sink, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_captured_returns_stdout() {
        let out = run_captured("sh", &["-c", "echo captured"], Path::new("."))
            .await
            .unwrap();
        assert_eq!(out, "captured");
    }
}
