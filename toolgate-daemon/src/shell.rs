// ABOUTME: Executor that runs a shell command per request with the payload JSON on stdin.
// ABOUTME: A non-zero exit becomes a failed result whose stderr feeds rate-limit classification.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use toolgate::prelude::{ExecutionResult, Executor};

pub struct ShellExecutor {
    command: String,
    working_dir: Option<PathBuf>,
}

impl ShellExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn dispatch(
        &self,
        payload: &serde_json::Value,
    ) -> Result<ExecutionResult, anyhow::Error> {
        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            let input = serde_json::to_vec(payload)?;
            // the command may exit without reading its input
            if let Err(e) = stdin.write_all(&input).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }
        let output = child.wait_with_output().await?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            return Ok(ExecutionResult::success(stdout));
        }

        let code = output.status.code().unwrap_or(-1);
        let raw = if stderr.trim().is_empty() {
            stdout.clone()
        } else {
            stderr.clone()
        };
        Ok(ExecutionResult {
            success: false,
            output: stdout.clone(),
            error: Some(format!(
                "Command failed with exit code {}\n\nstdout:\n{}\n\nstderr:\n{}",
                code, stdout, stderr
            )),
            raw_error_message: Some(raw),
        })
    }
}
