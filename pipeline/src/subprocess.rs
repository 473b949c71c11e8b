//! Subprocess execution with a hard wall-clock timeout and whole
//! process-group teardown on expiry, plus secret-redacted output logging.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use common::error::AppError;
use common::redaction::redact_secrets;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Captured, redacted output of a finished subprocess.
#[derive(Debug, Clone)]
pub struct SubprocessOutput {
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl SubprocessOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }
}

/// Runs `program args...` with `cwd` and `env` overrides, killing the whole
/// process group with `SIGKILL` if it doesn't exit within `timeout`.
///
/// Mirrors `_run_subprocess_with_timeout` in the source pipeline: a process
/// group is created so that children the subprocess itself spawns are also
/// reaped on timeout rather than orphaned.
pub async fn run_with_timeout(
    program: &str,
    args: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
    timeout: Duration,
) -> Result<SubprocessOutput, AppError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // SAFETY: setsid() is async-signal-safe and only affects the child.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| AppError::Backend(format!("failed to spawn '{program}': {e}")))?;

    let pid = child.id();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Internal("child stdout not piped".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Internal("child stderr not piped".to_string()))?;

    let stdout_task = tokio::spawn(collect_redacted_lines(stdout, "stdout"));
    let stderr_task = tokio::spawn(collect_redacted_lines(stderr, "stderr"));

    let wait_result = tokio::time::timeout(timeout, child.wait()).await;

    match wait_result {
        Ok(status) => {
            let status =
                status.map_err(|e| AppError::Backend(format!("subprocess wait failed: {e}")))?;
            let stdout_text = stdout_task.await.unwrap_or_default();
            let stderr_text = stderr_task.await.unwrap_or_default();
            Ok(SubprocessOutput {
                status_code: status.code(),
                stdout: stdout_text,
                stderr: stderr_text,
            })
        }
        Err(_) => {
            kill_process_group(pid);
            let _ = child.kill().await;
            Err(AppError::Transient(format!(
                "'{program}' timed out after {}s",
                timeout.as_secs()
            )))
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    if let Some(pid) = pid {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

async fn collect_redacted_lines<R>(reader: R, stream: &'static str) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut collected = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        let redacted = redact_secrets(&line);
        tracing::debug!(stream, "{redacted}");
        collected.push_str(&redacted);
        collected.push('\n');
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn succeeds_within_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_with_timeout(
            "echo",
            &["hello".to_string()],
            dir.path(),
            &HashMap::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(out.success());
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn times_out_and_reports_transient_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_with_timeout(
            "sleep",
            &["5".to_string()],
            dir.path(),
            &HashMap::new(),
            Duration::from_millis(100),
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_success() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_with_timeout(
            "false",
            &[],
            dir.path(),
            &HashMap::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(!out.success());
    }
}
