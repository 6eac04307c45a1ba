//! Job executor: run one command through the host shell and capture the result.
//!
//! Never returns an error. A non-zero exit and a failed spawn are both
//! ordinary outcomes encoded in [`ExecutionResult`].

use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// Outcome of running one command.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// True only when the process spawned and exited with status 0.
    pub success: bool,
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Set when the process could not be started at all.
    pub error: Option<String>,
    /// Spawn to exit.
    pub duration: Duration,
}

impl ExecutionResult {
    /// Trimmed stdout and stderr joined by a newline, skipping empty streams.
    pub fn combined_output(&self) -> String {
        [self.stdout.trim(), self.stderr.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Best description of why the run failed.
    pub fn failure_message(&self) -> String {
        if let Some(ref error) = self.error {
            return error.clone();
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        match self.exit_code {
            Some(code) => format!("command failed with exit code {code}"),
            None => "command terminated by signal".to_string(),
        }
    }
}

/// Run `command` through the host shell, buffering both output streams.
pub async fn execute(command: &str) -> ExecutionResult {
    let start = Instant::now();
    debug!(command, "executing");

    let output = shell(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await;

    let duration = start.elapsed();

    match output {
        Ok(output) => ExecutionResult {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            error: None,
            duration,
        },
        Err(e) => ExecutionResult {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(format!("failed to spawn command: {e}")),
            duration,
        },
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
