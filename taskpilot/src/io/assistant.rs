//! The seam to the external assistant, plus a child-process adapter.
//!
//! The engine only needs "send a prompt, receive a response": either a stream
//! of text chunks pushed on a channel, or a handle it polls.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::core::retry::{ErrorKind, classify_message};
use crate::io::process::{LineSink, RunLimits, run_command_streaming};
use crate::plan::TaskKey;

/// Chunks buffered between the adapter and the detector.
pub const RESPONSE_BUFFER: usize = 256;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct AssistantError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AssistantError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }
}

/// One prompt handed to the assistant.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub dispatch_id: Uuid,
    pub task: TaskKey,
    /// 1-based.
    pub attempt: u32,
    pub prompt: String,
    pub timeout: Duration,
}

pub type ResponseChunk = Result<String, AssistantError>;

/// How the response to a dispatch is delivered.
#[derive(Debug)]
pub enum ResponseChannel {
    /// Chunks are pushed as they arrive; the channel closing ends the response.
    Stream(mpsc::Receiver<ResponseChunk>),
    /// No push delivery: call [`Assistant::poll`] every `interval`.
    Poll { interval: Duration },
}

/// Snapshot returned by [`Assistant::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResponse {
    /// Full response text received so far.
    pub text: String,
    /// True once the assistant will produce no more text.
    pub finished: bool,
}

#[async_trait]
pub trait Assistant: Send + Sync {
    /// Deliver a prompt. `cancel` fires when the attempt is abandoned; adapters
    /// should stop work promptly when it does.
    async fn send(
        &self,
        request: DispatchRequest,
        cancel: CancellationToken,
    ) -> Result<ResponseChannel, AssistantError>;

    async fn poll(&self, dispatch_id: Uuid) -> Result<PollResponse, AssistantError> {
        Err(AssistantError::protocol(format!(
            "assistant does not support polling (dispatch {dispatch_id})"
        )))
    }
}

/// Pipes each prompt into a command's stdin and streams its stdout back line by line.
#[derive(Debug, Clone)]
pub struct CommandAssistant {
    program: String,
    args: Vec<String>,
    workdir: PathBuf,
    output_limit_bytes: usize,
}

impl CommandAssistant {
    /// `command` is the program followed by its arguments.
    pub fn new(command: &[String], workdir: impl Into<PathBuf>) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            workdir: workdir.into(),
            output_limit_bytes: 1_000_000,
        })
    }
}

#[async_trait]
impl Assistant for CommandAssistant {
    #[instrument(skip_all, fields(task = %request.task, attempt = request.attempt))]
    async fn send(
        &self,
        request: DispatchRequest,
        cancel: CancellationToken,
    ) -> Result<ResponseChannel, AssistantError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(&self.workdir);

        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let line_tx = tx.clone();
        // The engine enforces the verdict timeout; the child gets a little longer
        // so the engine's timeout is the one reported.
        let limits = RunLimits {
            timeout: request.timeout + Duration::from_secs(5),
            output_limit_bytes: self.output_limit_bytes,
        };
        let prompt = request.prompt.into_bytes();

        tokio::task::spawn_blocking(move || {
            let sink: LineSink = Box::new(move |line: &[u8]| {
                let chunk = String::from_utf8_lossy(line).into_owned();
                if line_tx.blocking_send(Ok(chunk)).is_err() {
                    debug!("response receiver dropped");
                }
            });
            let outcome = run_command_streaming(cmd, Some(prompt), limits, &cancel, Some(sink));
            let failure = match outcome {
                Ok(output) if output.cancelled => None,
                Ok(output) if output.timed_out => {
                    Some(AssistantError::timeout("assistant command timed out"))
                }
                Ok(output) if !output.status.success() => {
                    let tail = output.stderr_tail();
                    warn!(exit_code = ?output.status.code(), stderr = %tail, "assistant command failed");
                    Some(untyped_error(format!(
                        "assistant command exited with {}: {tail}",
                        output.status
                    )))
                }
                Ok(_) => None,
                Err(err) => Some(untyped_error(format!("{err:#}"))),
            };
            if let Some(err) = failure {
                let _ = tx.blocking_send(Err(err));
            }
        });

        Ok(ResponseChannel::Stream(rx))
    }
}

/// Bucket a plain-text failure of the command. Text that names no known kind
/// is treated as a transport problem: the command itself did not deliver.
fn untyped_error(message: String) -> AssistantError {
    let kind = match classify_message(&message) {
        ErrorKind::Unknown => ErrorKind::Transport,
        kind => kind,
    };
    AssistantError::new(kind, message)
}
