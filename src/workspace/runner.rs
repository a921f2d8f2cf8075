use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{AppError, Result};
use crate::results::Framework;
use crate::workflow::{RawTestOutput, TestRunner};

/// Runs a shell command in the working copy and captures its output.
pub struct CommandTestRunner {
    dir: PathBuf,
    command: String,
    timeout: Duration,
}

impl CommandTestRunner {
    pub fn new(dir: PathBuf, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            dir,
            command: command.into(),
            timeout,
        }
    }
}

/// Guess the output grammar from the command line.
fn framework_hint(command: &str) -> Option<Framework> {
    let words: Vec<&str> = command.split_whitespace().collect();
    let has = |w: &str| words.iter().any(|x| x.ends_with(w));
    if has("cargo") || has("nextest") {
        Some(Framework::Cargo)
    } else if has("pytest") {
        Some(Framework::Pytest)
    } else if has("jest") || has("vitest") {
        Some(Framework::Jest)
    } else if words.windows(2).any(|w| w[0].ends_with("go") && w[1] == "test") {
        Some(Framework::Go)
    } else {
        None
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run(&self) -> Result<RawTestOutput> {
        tracing::info!(command = %self.command, dir = %self.dir.display(), "Running tests");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::TestRunner(format!("Failed to spawn `{}`: {e}", self.command)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                AppError::TestRunner(format!(
                    "`{}` timed out after {}s",
                    self.command,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| AppError::TestRunner(format!("Failed to collect test output: {e}")))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        tracing::debug!(
            exit_code = ?output.status.code(),
            bytes = combined.len(),
            "Test command finished"
        );
        Ok(RawTestOutput {
            output: combined,
            framework_hint: framework_hint(&self.command),
            exit_code: output.status.code(),
        })
    }
}
