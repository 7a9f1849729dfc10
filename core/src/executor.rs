//! Host-side handle for one sandbox worker.
//!
//! An [`Executor`] owns one isolated worker process and the only duplex
//! connection to it. Calls are strictly serialized: one request
//! outstanding at a time, response (or deadline) before the next request
//! may be issued. That is why the methods take `&mut self` and no
//! background reader task exists. Any framing violation, EOF, or missed
//! deadline marks the connection dead; a dead executor refuses further
//! requests and is discarded by its owner.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use delver_protocol::HostMessage;
use delver_protocol::LineFramer;
use delver_protocol::WorkerMessage;
use delver_protocol::limits::CONTROL_DEADLINE;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::Command;
use tokio::time::Instant;
use tokio::time::timeout;
use tracing::debug;
use tracing::warn;

use crate::document::Document;
use crate::error::ExecutorError;
use crate::error::ProtocolError;
use crate::error::SubCallError;

/// Answers `sub_call_request` frames that arrive while an execute call is
/// suspended inside the worker.
#[async_trait]
pub trait SubCallHandler: Send + Sync {
    async fn handle(&self, instruction: String, content: String) -> Result<String, SubCallError>;
}

/// Handler for contexts where sub-calls are not available; every request
/// raises inside the sandbox.
pub struct NoSubCalls;

#[async_trait]
impl SubCallHandler for NoSubCalls {
    async fn handle(&self, _instruction: String, _content: String) -> Result<String, SubCallError> {
        Err(SubCallError::NoHandler)
    }
}

pub struct Executor {
    child: Option<Child>,
    reader: Box<dyn AsyncRead + Unpin + Send>,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    framer: LineFramer,
    dead: bool,
    created_at: Instant,
}

impl Executor {
    /// Spawn a worker process and connect over its stdio.
    pub async fn spawn(program: &str, args: &[String]) -> Result<Self, ExecutorError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            // Tokio makes a best effort to reap-after-exit; the explicit
            // kill in `stop` handles the orderly path.
            .kill_on_drop(true)
            .spawn()
            .map_err(ExecutorError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecutorError::Spawn(std::io::Error::other("no child stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::Spawn(std::io::Error::other("no child stdout")))?;

        let mut executor = Self::with_streams(stdout, stdin);
        executor.child = Some(child);
        debug!("spawned sandbox worker `{program}`");
        Ok(executor)
    }

    /// Build an executor over any duplex byte stream. Used by tests and by
    /// transports other than child-process stdio.
    pub fn with_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            child: None,
            reader: Box::new(reader),
            writer: Box::new(writer),
            framer: LineFramer::new(),
            dead: false,
            created_at: Instant::now(),
        }
    }

    /// Connection health without a round trip: the dead flag plus, for
    /// process-backed executors, whether the child is still running.
    pub fn is_alive(&mut self) -> bool {
        if self.dead {
            return false;
        }
        match &mut self.child {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(_)) | Err(_) => {
                    self.dead = true;
                    false
                }
            },
            None => true,
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Seed the worker's namespace with the session's documents.
    pub async fn seed_context(&mut self, documents: &[Document]) -> Result<(), ExecutorError> {
        let message = HostMessage::SetContext {
            documents: documents.iter().map(|d| d.content.clone()).collect(),
        };
        self.send(&message).await?;
        match self.recv(CONTROL_DEADLINE).await? {
            WorkerMessage::Ack => Ok(()),
            other => Err(self.fail_unexpected("ack", &other)),
        }
    }

    /// Run one chunk of generated code to completion, answering sub-call
    /// requests through `handler` as they arrive. The deadline bounds each
    /// wait for the worker; time the host spends answering sub-calls does
    /// not count against it.
    pub async fn execute(
        &mut self,
        code: &str,
        deadline: Duration,
        handler: &dyn SubCallHandler,
    ) -> Result<delver_protocol::ExecuteOutcome, ExecutorError> {
        let message = HostMessage::Execute {
            code: code.to_string(),
            timeout_ms: deadline.as_millis() as u64,
        };
        self.send(&message).await?;

        loop {
            match self.recv(deadline).await? {
                WorkerMessage::ExecuteResult(outcome) => return Ok(outcome),
                WorkerMessage::SubCallRequest {
                    instruction,
                    content,
                } => {
                    let response = match handler.handle(instruction, content).await {
                        Ok(result) => HostMessage::SubCallResponse {
                            result: Some(result),
                            error: None,
                        },
                        Err(err) => HostMessage::SubCallResponse {
                            result: None,
                            error: Some(err.to_string()),
                        },
                    };
                    self.send(&response).await?;
                }
                other => return Err(self.fail_unexpected("execute_result", &other)),
            }
        }
    }

    /// Clear all user bindings in the worker, keeping the injected
    /// primitives and the seeded documents.
    pub async fn reset(&mut self) -> Result<(), ExecutorError> {
        self.send(&HostMessage::Reset).await?;
        match self.recv(CONTROL_DEADLINE).await? {
            WorkerMessage::Ack => Ok(()),
            other => Err(self.fail_unexpected("ack", &other)),
        }
    }

    /// Round-trip liveness probe.
    pub async fn ping(&mut self) -> Result<(), ExecutorError> {
        self.send(&HostMessage::Ping).await?;
        match self.recv(CONTROL_DEADLINE).await? {
            WorkerMessage::Pong => Ok(()),
            other => Err(self.fail_unexpected("pong", &other)),
        }
    }

    /// Tear the worker down. Consumes the executor; a stopped worker is
    /// never reused.
    pub async fn stop(mut self) {
        let _ = self.writer.shutdown().await;
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill().await {
                warn!("failed to kill sandbox worker: {err}");
            }
        }
    }

    async fn send(&mut self, message: &HostMessage) -> Result<(), ExecutorError> {
        if self.dead {
            return Err(ExecutorError::Dead);
        }
        let line = serde_json::to_string(message).map_err(|e| {
            self.dead = true;
            ExecutorError::Protocol(ProtocolError::MalformedFrame(e.to_string()))
        })?;
        debug!("host -> worker: {line}");
        let write = async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
            self.writer.flush().await
        };
        write.await.map_err(|e| {
            self.dead = true;
            ExecutorError::Io(e)
        })
    }

    /// Wait for the next worker frame, bounded by `deadline`.
    async fn recv(&mut self, deadline: Duration) -> Result<WorkerMessage, ExecutorError> {
        if self.dead {
            return Err(ExecutorError::Dead);
        }
        match timeout(deadline, self.next_frame()).await {
            Ok(result) => result.inspect_err(|_| self.dead = true),
            Err(_) => {
                self.dead = true;
                Err(ExecutorError::Protocol(ProtocolError::DeadlineExceeded {
                    deadline,
                }))
            }
        }
    }

    async fn next_frame(&mut self) -> Result<WorkerMessage, ExecutorError> {
        let mut buf = [0u8; 8192];
        loop {
            if let Some(line) = self.framer.next_frame().map_err(ProtocolError::Framing)? {
                debug!("worker -> host: {line}");
                return serde_json::from_str(&line).map_err(|e| {
                    ExecutorError::Protocol(ProtocolError::MalformedFrame(e.to_string()))
                });
            }
            let n = self.reader.read(&mut buf).await?;
            if n == 0 {
                return Err(ExecutorError::Protocol(ProtocolError::ConnectionClosed));
            }
            self.framer.push(&buf[..n]).map_err(ProtocolError::Framing)?;
        }
    }

    fn fail_unexpected(&mut self, expected: &'static str, got: &WorkerMessage) -> ExecutorError {
        self.dead = true;
        let got = match got {
            WorkerMessage::ExecuteResult(_) => "execute_result",
            WorkerMessage::SubCallRequest { .. } => "sub_call_request",
            WorkerMessage::Ack => "ack",
            WorkerMessage::Pong => "pong",
        };
        ExecutorError::Protocol(ProtocolError::UnexpectedMessage { expected, got })
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // kill_on_drop already tags the child; try_wait reaps it promptly
        // if it has exited instead of waiting for the runtime to do so.
        if let Some(child) = &mut self.child {
            let _ = child.try_wait();
        }
    }
}
