// SPDX-License-Identifier: GPL-3.0-only

//! External detector process
//!
//! Runs a user-supplied detector as a long-lived child process and talks to
//! it over stdio, one frame at a time:
//!
//! ```text
//! → {"sequence":7,"width":640,"height":480,"format":"rgba8","bytes":1228800}\n
//! → <bytes of tightly packed RGBA>
//! ← {"sequence":7,"objects":[{"label":"cup","confidence":0.9,"bbox":{...}}]}\n
//! ← {"error":"model not loaded"}\n          (backend-reported failure)
//! ```
//!
//! The worker is taken out of its slot for the duration of an exchange and
//! only put back once a reply was read cleanly. A request that is timed out
//! or cancelled drops the worker mid-exchange, which kills the child
//! (`kill_on_drop`), and the next request spawns a fresh one.

use super::{InferenceBackend, InferenceRequest, InferenceResponse};
use crate::errors::InferenceError;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Frame header line sent before the pixel bytes
#[derive(Debug, Serialize)]
struct FrameHeader<'a> {
    sequence: u64,
    width: u32,
    height: u32,
    format: &'a str,
    bytes: usize,
}

struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Worker {
    fn spawn(command: &str, args: &[String]) -> Result<Self, InferenceError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                InferenceError::Transport(format!("failed to start '{}': {}", command, e))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(InferenceError::Transport(
                "detector process has no stdio pipes".to_string(),
            ));
        };

        info!(command, pid = ?child.id(), "Started detector process");
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn exchange(&mut self, request: &InferenceRequest) -> Result<String, InferenceError> {
        let image = request.frame.to_rgba_image();
        let pixels = image.as_raw();
        let header = FrameHeader {
            sequence: request.sequence,
            width: image.width(),
            height: image.height(),
            format: "rgba8",
            bytes: pixels.len(),
        };

        let mut line = serde_json::to_string(&header)
            .map_err(|e| InferenceError::Transport(format!("failed to encode header: {}", e)))?;
        line.push('\n');

        let io_error = |e: std::io::Error| InferenceError::Transport(format!("detector I/O: {}", e));
        self.stdin.write_all(line.as_bytes()).await.map_err(io_error)?;
        self.stdin.write_all(pixels).await.map_err(io_error)?;
        self.stdin.flush().await.map_err(io_error)?;

        let mut reply = String::new();
        let read = self.stdout.read_line(&mut reply).await.map_err(io_error)?;
        if read == 0 {
            let status = self.child.try_wait().ok().flatten();
            return Err(InferenceError::Transport(format!(
                "detector process exited ({})",
                status.map_or_else(|| "still running".to_string(), |s| s.to_string())
            )));
        }
        Ok(reply)
    }
}

/// Detector running as a child process
pub struct ProcessBackend {
    command: String,
    args: Vec<String>,
    worker: Arc<Mutex<Option<Worker>>>,
}

impl ProcessBackend {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            worker: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether a healthy worker is parked between requests
    pub async fn has_worker(&self) -> bool {
        self.worker.lock().await.is_some()
    }
}

impl InferenceBackend for ProcessBackend {
    fn name(&self) -> &str {
        &self.command
    }

    fn infer(
        &self,
        request: InferenceRequest,
    ) -> BoxFuture<'static, Result<InferenceResponse, InferenceError>> {
        let slot = Arc::clone(&self.worker);
        let command = self.command.clone();
        let args = self.args.clone();

        async move {
            let mut slot = slot.lock().await;
            let mut worker = match slot.take() {
                Some(worker) => worker,
                None => Worker::spawn(&command, &args)?,
            };

            let reply = worker.exchange(&request).await?;
            match InferenceResponse::from_json(&reply) {
                Ok(response) => {
                    *slot = Some(worker);
                    Ok(response)
                }
                // The detector answered in protocol, so it can stay
                Err(InferenceError::Transport(msg)) => {
                    debug!(sequence = request.sequence, error = %msg, "Detector reported error");
                    *slot = Some(worker);
                    Err(InferenceError::Transport(msg))
                }
                Err(e) => {
                    warn!(sequence = request.sequence, error = %e, "Detector out of protocol, restarting");
                    Err(e)
                }
            }
        }
        .boxed()
    }
}
