//! Command execution utilities
//!
//! Provides consistent command execution with proper error handling and logging.

use anyhow::{anyhow, Context, Result};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Result of a command execution.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub code: Option<i32>,
}

impl CommandOutput {
    fn exit_description(&self) -> String {
        self.code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string())
    }
}

/// Run a command and return its output.
///
/// This is a low-level function that returns both stdout and stderr.
/// Use `run_checked` if you want to treat non-zero exit as an error.
#[instrument(skip_all, fields(cmd = %cmd))]
pub async fn run(cmd: &str, args: &[&str]) -> Result<CommandOutput> {
    debug!(args = ?args, "Running command");

    let output = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .context(format!("Failed to execute {}", cmd))?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        success: output.status.success(),
        code: output.status.code(),
    })
}

/// Run a command and return stdout if successful, error otherwise.
///
/// # Example
/// ```ignore
/// let version = run_checked("postgres", &["--version"]).await?;
/// ```
pub async fn run_checked(cmd: &str, args: &[&str]) -> Result<String> {
    let output = run(cmd, args).await?;
    if output.success {
        Ok(output.stdout)
    } else {
        Err(anyhow!(
            "{} failed (exit {}): {}",
            cmd,
            output.exit_description(),
            output.stderr
        ))
    }
}

/// Run a command feeding `input` on stdin, failing on non-zero exit.
#[instrument(skip_all, fields(cmd = %cmd))]
pub async fn run_with_stdin(cmd: &str, args: &[&str], input: &str) -> Result<String> {
    debug!(args = ?args, bytes = input.len(), "Running command with stdin");

    let mut child = Command::new(cmd)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context(format!("Failed to spawn {}", cmd))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .context(format!("Failed to write stdin of {}", cmd))?;
    }

    let output = child
        .wait_with_output()
        .await
        .context(format!("Failed to wait for {}", cmd))?;

    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        success: output.status.success(),
        code: output.status.code(),
    };

    if result.success {
        Ok(result.stdout)
    } else {
        Err(anyhow!(
            "{} failed (exit {}): {}",
            cmd,
            result.exit_description(),
            result.stderr
        ))
    }
}

/// Check whether `user` already has a crontab installed.
///
/// Spawn failures are errors; a missing crontab is `Ok(false)`.
pub async fn crontab_exists(user: &str) -> Result<bool> {
    let output = run("crontab", &["-lu", user]).await?;
    Ok(output.success)
}

/// Replace the crontab of `user` with `lines`.
pub async fn install_crontab(user: &str, lines: &[String]) -> Result<()> {
    // cron requires a trailing newline
    let mut content = lines.join("\n");
    content.push('\n');
    run_with_stdin("crontab", &["-u", user, "-"], &content).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_checked_returns_trimmed_stdout() {
        let out = run_checked("echo", &["  hello  "]).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_run_checked_reports_exit_code() {
        let err = run_checked("false", &[]).await.unwrap_err();
        assert!(err.to_string().contains("exit 1"));
    }

    #[tokio::test]
    async fn test_run_with_stdin_pipes_input() {
        let out = run_with_stdin("cat", &[], "a\nb\n").await.unwrap();
        assert_eq!(out, "a\nb");
    }
}
