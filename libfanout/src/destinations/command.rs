//! Destination backed by an external program
//!
//! The program receives the submission content on stdin and the asset paths
//! as trailing arguments after the configured ones. A zero exit status is a
//! successful post and trimmed stdout is taken as the remote post id. Any
//! other status is a failure; the last line of stderr becomes the message
//! shown to the user.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::CommandConfig;
use crate::destinations::Destination;
use crate::error::DestinationError;
use crate::types::Submission;

pub struct CommandDestination {
    name: String,
    config: CommandConfig,
}

impl CommandDestination {
    pub fn new(name: String, config: CommandConfig) -> Self {
        Self { name, config }
    }
}

#[async_trait]
impl Destination for CommandDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn post(&self, submission: &Submission) -> Result<String, DestinationError> {
        let command = shellexpand::tilde(&self.config.command).to_string();
        debug!(destination = %self.name, %command, "Running destination command");

        let mut child = Command::new(&command)
            .args(&self.config.args)
            .args(&submission.assets)
            .env("FANOUT_SUBMISSION_ID", &submission.id)
            .env("FANOUT_DESTINATION", &self.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DestinationError::new(&self.name, format!("failed to start {}: {}", command, e))
                    .with_user_message(format!("Could not run the {} uploader", self.name))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program that ignores stdin may close it early; that is not a failure
            if let Err(e) = stdin.write_all(submission.content.as_bytes()).await {
                debug!(destination = %self.name, "stdin closed early: {}", e);
            }
        }

        let output = child.wait_with_output().await.map_err(|e| {
            DestinationError::new(&self.name, format!("failed waiting for {}: {}", command, e))
        })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let last_line = stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("no error output")
            .trim()
            .to_string();
        let cause = match output.status.code() {
            Some(code) => format!("{} exited with status {}: {}", command, code, last_line),
            None => format!("{} was terminated by a signal: {}", command, last_line),
        };
        Err(DestinationError::new(&self.name, cause).with_user_message(last_line))
    }
}
