//! Shared support for the engine integration tests: a scripted model
//! client and an in-process fake worker that speaks the real wire
//! protocol over a duplex pipe.
#![allow(clippy::unwrap_used, dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicIsize;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use delver_core::ChatMessage;
use delver_core::Completion;
use delver_core::Executor;
use delver_core::ExecutorFactory;
use delver_core::LlmError;
use delver_core::ModelClient;
use delver_core::error::ExecutorError;
use delver_protocol::ExecuteOutcome;
use delver_protocol::HostMessage;
use delver_protocol::WorkerMessage;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;

pub enum ScriptedTurn {
    Reply(String),
    Fail(LlmError),
}

/// Model client that replays a fixed script of completions.
pub struct ScriptedModel {
    turns: StdMutex<VecDeque<ScriptedTurn>>,
    repeat: Option<String>,
    pub calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            turns: StdMutex::new(
                replies
                    .iter()
                    .map(|r| ScriptedTurn::Reply((*r).to_string()))
                    .collect(),
            ),
            repeat: None,
            calls: AtomicUsize::new(0),
        })
    }

    /// Reply with the same content on every call, forever.
    pub fn repeating(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            turns: StdMutex::new(VecDeque::new()),
            repeat: Some(reply.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let turn = self.turns.lock().unwrap().pop_front();
        let content = match turn {
            Some(ScriptedTurn::Reply(content)) => content,
            Some(ScriptedTurn::Fail(error)) => return Err(error),
            None => match &self.repeat {
                Some(content) => content.clone(),
                None => return Err(LlmError::permanent("model script exhausted")),
            },
        };
        Ok(Completion {
            content,
            prompt_tokens: 100,
            completion_tokens: 50,
        })
    }
}

/// Builds executors wired to in-process fake workers. The fake worker
/// speaks the real protocol but interprets "code" as simple directives:
///
/// - `FINAL:x`            -> execute result with final answer `x`
/// - `FINALVAR:name=v`    -> final var `name` resolved to `v`
/// - `FINALVAR:name`      -> final var `name`, unbound
/// - `PRINT:x`            -> stdout `x`
/// - `SUBCALL:inst|body`  -> emits a sub_call_request, then reports the
///   host's result on stdout, or fails the execution if the host refused
///   (mirroring the real worker, where a refusal raises in the sandbox)
/// - `DIE`                -> drops the connection without responding
/// - `DIE_IF_BUDGET`      -> like `DIE` while the shared budget lasts,
///   afterwards prints `survived`
pub struct FakeWorkerFactory {
    pub created: AtomicUsize,
    die_budget: Arc<AtomicIsize>,
}

impl FakeWorkerFactory {
    pub fn new() -> Arc<Self> {
        Self::with_die_budget(0)
    }

    pub fn with_die_budget(budget: isize) -> Arc<Self> {
        Arc::new(Self {
            created: AtomicUsize::new(0),
            die_budget: Arc::new(AtomicIsize::new(budget)),
        })
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutorFactory for FakeWorkerFactory {
    async fn create(&self) -> Result<Executor, ExecutorError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let (host_side, worker_side) = tokio::io::duplex(256 * 1024);
        let (host_read, host_write) = tokio::io::split(host_side);
        let die_budget = Arc::clone(&self.die_budget);
        tokio::spawn(run_fake_worker(worker_side, die_budget));
        Ok(Executor::with_streams(host_read, host_write))
    }
}

async fn run_fake_worker(io: tokio::io::DuplexStream, die_budget: Arc<AtomicIsize>) {
    let (read, mut write) = tokio::io::split(io);
    let mut lines = BufReader::new(read).lines();

    async fn send(
        write: &mut (impl tokio::io::AsyncWrite + Unpin),
        msg: &WorkerMessage,
    ) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(msg).unwrap();
        line.push(b'\n');
        write.write_all(&line).await
    }

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(msg) = serde_json::from_str::<HostMessage>(&line) else {
            continue;
        };
        match msg {
            HostMessage::SetContext { .. } | HostMessage::Reset => {
                if send(&mut write, &WorkerMessage::Ack).await.is_err() {
                    return;
                }
            }
            HostMessage::Ping => {
                if send(&mut write, &WorkerMessage::Pong).await.is_err() {
                    return;
                }
            }
            HostMessage::SubCallResponse { .. } => {}
            HostMessage::Execute { code, .. } => {
                let directive = code.trim();
                let outcome = if directive == "DIE" {
                    return;
                } else if directive == "DIE_IF_BUDGET" {
                    if die_budget.fetch_sub(1, Ordering::SeqCst) > 0 {
                        return;
                    }
                    ExecuteOutcome {
                        stdout: "survived".to_string(),
                        ..ExecuteOutcome::ok()
                    }
                } else if let Some(answer) = directive.strip_prefix("FINAL:") {
                    ExecuteOutcome {
                        final_answer: Some(answer.to_string()),
                        ..ExecuteOutcome::ok()
                    }
                } else if let Some(spec) = directive.strip_prefix("FINALVAR:") {
                    match spec.split_once('=') {
                        Some((name, value)) => ExecuteOutcome {
                            final_var: Some(name.to_string()),
                            final_value: Some(value.to_string()),
                            ..ExecuteOutcome::ok()
                        },
                        None => ExecuteOutcome {
                            final_var: Some(spec.to_string()),
                            final_value: None,
                            ..ExecuteOutcome::ok()
                        },
                    }
                } else if let Some(text) = directive.strip_prefix("PRINT:") {
                    ExecuteOutcome {
                        stdout: text.to_string(),
                        ..ExecuteOutcome::ok()
                    }
                } else if let Some(spec) = directive.strip_prefix("SUBCALL:") {
                    let (instruction, content) = spec.split_once('|').unwrap_or((spec, ""));
                    let request = WorkerMessage::SubCallRequest {
                        instruction: instruction.to_string(),
                        content: content.to_string(),
                    };
                    if send(&mut write, &request).await.is_err() {
                        return;
                    }
                    let Ok(Some(reply)) = lines.next_line().await else {
                        return;
                    };
                    match serde_json::from_str::<HostMessage>(&reply) {
                        Ok(HostMessage::SubCallResponse { result, error }) => match error {
                            // A refusal raises inside the sandbox, so the
                            // execution fails rather than seeing a string.
                            Some(message) => ExecuteOutcome::error(format!("Error: {message}")),
                            None => ExecuteOutcome {
                                stdout: result.unwrap_or_default(),
                                ..ExecuteOutcome::ok()
                            },
                        },
                        _ => return,
                    }
                } else {
                    ExecuteOutcome::ok()
                };
                if send(&mut write, &WorkerMessage::ExecuteResult(outcome))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

/// Wrap a directive in the code fence the engine expects from the model.
pub fn fenced(directive: &str) -> String {
    format!("```repl\n{directive}\n```")
}
