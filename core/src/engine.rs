//! The orchestration engine: the generate -> execute -> observe loop that
//! drives one query session.
//!
//! `INIT -> LOOP{ PROMPT -> PARSE -> EXECUTE -> OBSERVE -> CHECK } ->
//! TERMINATED | EXHAUSTED | FAILED`. The engine is single-threaded per
//! query: it blocks on the worker's execute response (bounded by the
//! protocol deadline) and on model completions (bounded by provider
//! timeout plus retry backoff). Failures inside a running session
//! terminate it with a `Failed` outcome on the result, so the trace keeps
//! its exactly-one-terminal-step shape; failures before the
//! session starts surface as [`EngineError`].

use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use delver_protocol::ExecuteOutcome;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::client::ChatMessage;
use crate::client::ModelClient;
use crate::config::EngineConfig;
use crate::document::Document;
use crate::error::EngineError;
use crate::error::PoolError;
use crate::error::SubCallError;
use crate::executor::Executor;
use crate::executor::SubCallHandler;
use crate::parse::TerminalSignal;
use crate::parse::extract_code_blocks;
use crate::parse::terminal_signal;
use crate::pool::ExecutorFactory;
use crate::pool::WorkerPool;
use crate::prompts::DefaultPrompts;
use crate::prompts::PromptParams;
use crate::prompts::PromptRenderer;
use crate::prompts::wrap_repl_output;
use crate::prompts::wrap_sub_call_content;
use crate::retry::with_backoff;
use crate::trace::StepType;
use crate::trace::TokenUsage;
use crate::trace::Trace;
use crate::verification::VerificationReport;
use crate::verification::verify_answer;

/// Where the engine gets its sandbox workers.
pub enum Sandbox {
    /// Draw from (and return to) a shared warm pool.
    Pooled(WorkerPool),
    /// Spawn a dedicated worker per session and stop it afterwards.
    Dedicated(Arc<dyn ExecutorFactory>),
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    /// `FINAL(answer)` was called.
    Answered,
    /// `FINAL_VAR(name)` was called and resolved.
    AnsweredVar { var: String },
    /// The iteration ceiling was reached; the answer is best-effort.
    Exhausted,
    /// The session died: executor loss without a pool, an unbound
    /// `FINAL_VAR`, or model failure beyond the retry budget.
    Failed,
}

#[derive(Debug)]
pub struct QueryResult {
    pub answer: String,
    pub outcome: QueryOutcome,
    pub trace: Trace,
    pub token_usage: TokenUsage,
    pub execution_time: Duration,
    pub iterations_used: u32,
    /// Mechanical citation check, when enabled and the session produced a
    /// real answer.
    pub verification: Option<VerificationReport>,
}

impl QueryResult {
    pub fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            QueryOutcome::Answered | QueryOutcome::AnsweredVar { .. }
        )
    }
}

/// Invoked for every trace step as it is appended.
pub type ProgressCallback = Arc<dyn Fn(StepType, u32, &str) + Send + Sync>;

pub struct Engine {
    client: Arc<dyn ModelClient>,
    prompts: Arc<dyn PromptRenderer>,
    sandbox: Sandbox,
    config: EngineConfig,
}

impl Engine {
    pub fn new(client: Arc<dyn ModelClient>, sandbox: Sandbox, config: EngineConfig) -> Self {
        Self {
            client,
            prompts: Arc::new(DefaultPrompts),
            sandbox,
            config,
        }
    }

    pub fn with_prompts(mut self, prompts: Arc<dyn PromptRenderer>) -> Self {
        self.prompts = prompts;
        self
    }

    pub async fn query(
        &self,
        documents: Vec<Document>,
        question: &str,
    ) -> Result<QueryResult, EngineError> {
        self.query_with_progress(documents, question, None).await
    }

    pub async fn query_with_progress(
        &self,
        documents: Vec<Document>,
        question: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<QueryResult, EngineError> {
        let started = Instant::now();
        let session_id = Uuid::new_v4();
        info!(%session_id, documents = documents.len(), "starting query session");

        let mut executor = self.checkout().await?;
        if let Err(err) = executor.seed_context(&documents).await {
            executor.stop().await;
            return Err(EngineError::ContextSeed(err));
        }

        let state = Arc::new(Mutex::new(SessionState {
            trace: Trace::new(),
            usage: TokenUsage::default(),
            progress,
        }));

        let end = self
            .run_loop(&mut executor, &documents, question, &state)
            .await;
        self.check_in(executor).await;

        let (answer, outcome, iterations_used, verification) = match end {
            LoopEnd::Answered { answer, iterations } => {
                let verification = self.verify(&answer, &documents, &state, iterations).await;
                record(&state, StepType::FinalAnswer, &answer, iterations, None, None).await;
                (answer, QueryOutcome::Answered, iterations + 1, verification)
            }
            LoopEnd::AnsweredVar {
                name,
                value,
                iterations,
            } => {
                let verification = self.verify(&value, &documents, &state, iterations).await;
                record(&state, StepType::FinalAnswer, &value, iterations, None, None).await;
                (
                    value,
                    QueryOutcome::AnsweredVar { var: name },
                    iterations + 1,
                    verification,
                )
            }
            LoopEnd::Exhausted { last_output } => {
                let answer = match last_output {
                    Some(output) => format!(
                        "Reached the maximum of {} iterations without a final answer. \
                         Last output:\n{output}",
                        self.config.max_iterations
                    ),
                    None => format!(
                        "Reached the maximum of {} iterations without a final answer \
                         or any useful output.",
                        self.config.max_iterations
                    ),
                };
                record(
                    &state,
                    StepType::ExhaustedWarning,
                    &answer,
                    self.config.max_iterations,
                    None,
                    None,
                )
                .await;
                (answer, QueryOutcome::Exhausted, self.config.max_iterations, None)
            }
            LoopEnd::Fatal {
                message,
                iterations,
            } => {
                record(&state, StepType::FatalError, &message, iterations, None, None).await;
                (message, QueryOutcome::Failed, iterations, None)
            }
        };

        let mut guard = state.lock().await;
        let trace = std::mem::take(&mut guard.trace);
        let token_usage = guard.usage;
        drop(guard);

        let execution_time = started.elapsed();
        info!(
            %session_id,
            iterations = iterations_used,
            total_tokens = token_usage.total_tokens(),
            ?outcome,
            "query session finished"
        );
        Ok(QueryResult {
            answer,
            outcome,
            trace,
            token_usage,
            execution_time,
            iterations_used,
            verification,
        })
    }

    async fn run_loop(
        &self,
        executor: &mut Executor,
        documents: &[Document],
        question: &str,
        state: &Arc<Mutex<SessionState>>,
    ) -> LoopEnd {
        let sub_calls = Arc::new(EngineSubCalls {
            client: Arc::clone(&self.client),
            prompts: Arc::clone(&self.prompts),
            config: self.config.clone(),
            state: Arc::clone(state),
            iteration: AtomicU32::new(0),
        });

        let system = self.prompts.system_prompt(&PromptParams {
            documents,
            max_subcall_content_chars: self.config.max_subcall_content_chars,
        });
        let mut conversation = vec![ChatMessage::system(system), ChatMessage::user(question)];

        let mut iteration: u32 = 0;
        let mut consecutive_nudges: u32 = 0;
        let mut replaced_this_iteration = false;
        let mut last_output: Option<String> = None;

        'session: loop {
            if iteration >= self.config.max_iterations {
                break 'session LoopEnd::Exhausted { last_output };
            }
            sub_calls.iteration.store(iteration, Ordering::SeqCst);

            // PROMPT
            let completion =
                match with_backoff(&self.config.retry, || self.client.complete(&conversation))
                    .await
                {
                    Ok(completion) => completion,
                    Err(err) => {
                        break 'session LoopEnd::Fatal {
                            message: format!("model call failed: {err}"),
                            iterations: iteration,
                        };
                    }
                };
            state.lock().await.usage.add(&completion);

            // PARSE
            conversation.push(ChatMessage::assistant(completion.content.clone()));
            let blocks = extract_code_blocks(&completion.content);
            let Some(code) = blocks.into_iter().next() else {
                record(
                    state,
                    StepType::Nudge,
                    &completion.content,
                    iteration,
                    Some(completion.total_tokens()),
                    None,
                )
                .await;
                conversation.push(ChatMessage::user(self.prompts.nudge_prompt()));
                consecutive_nudges += 1;
                // A nudge does not consume an iteration, but a model that
                // keeps replying without code must not loop for free.
                if consecutive_nudges > self.config.max_consecutive_nudges {
                    warn!(iteration, "too many codeless turns, forfeiting the iteration");
                    iteration += 1;
                    consecutive_nudges = 0;
                }
                continue;
            };
            consecutive_nudges = 0;
            record(
                state,
                StepType::CodeGenerated,
                &code,
                iteration,
                Some(completion.total_tokens()),
                None,
            )
            .await;

            // EXECUTE. On a dead worker with a pool behind us, swap in a
            // fresh executor and retry the same iteration instead of
            // burning the remaining budget.
            let exec_started = Instant::now();
            let outcome = loop {
                match executor
                    .execute(&code, self.config.execute_timeout, sub_calls.as_ref())
                    .await
                {
                    Ok(outcome) => break outcome,
                    Err(err) => match &self.sandbox {
                        Sandbox::Dedicated(_) => {
                            break 'session LoopEnd::Fatal {
                                message: format!(
                                    "sandbox executor died during execution and no pool is \
                                     available to replace it: {err}"
                                ),
                                iterations: iteration,
                            };
                        }
                        Sandbox::Pooled(pool) => {
                            if replaced_this_iteration {
                                break 'session LoopEnd::Fatal {
                                    message: format!(
                                        "replacement sandbox executor also died: {err}"
                                    ),
                                    iterations: iteration,
                                };
                            }
                            replaced_this_iteration = true;
                            warn!("executor died mid-iteration, acquiring a fresh one: {err}");
                            record(
                                state,
                                StepType::Error,
                                format!("executor died ({err}); recovering with a fresh worker"),
                                iteration,
                                None,
                                None,
                            )
                            .await;
                            match self.replace_executor(executor, pool, documents).await {
                                Ok(()) => continue,
                                Err(message) => {
                                    break 'session LoopEnd::Fatal {
                                        message,
                                        iterations: iteration,
                                    };
                                }
                            }
                        }
                    },
                }
            };
            replaced_this_iteration = false;
            let duration_ms = exec_started.elapsed().as_millis() as u64;

            // OBSERVE
            let observation = render_observation(&outcome);
            record(
                state,
                StepType::CodeOutput,
                &observation,
                iteration,
                None,
                Some(duration_ms),
            )
            .await;

            // CHECK
            match terminal_signal(&outcome) {
                TerminalSignal::Answer(answer) => {
                    break 'session LoopEnd::Answered {
                        answer,
                        iterations: iteration,
                    };
                }
                TerminalSignal::VarRef {
                    name,
                    value: Some(value),
                } => {
                    break 'session LoopEnd::AnsweredVar {
                        name,
                        value,
                        iterations: iteration,
                    };
                }
                TerminalSignal::VarRef { name, value: None } => {
                    break 'session LoopEnd::Fatal {
                        message: format!(
                            "FINAL_VAR referenced the variable `{name}`, which is not bound \
                             in the execution namespace"
                        ),
                        iterations: iteration,
                    };
                }
                TerminalSignal::Continue => {
                    if observation != NO_OUTPUT {
                        last_output = Some(observation.clone());
                    }
                    conversation.push(ChatMessage::user(wrap_repl_output(
                        &observation,
                        self.config.max_output_chars,
                    )));
                }
            }
            iteration += 1;
        }
    }

    async fn checkout(&self) -> Result<Executor, EngineError> {
        match &self.sandbox {
            Sandbox::Pooled(pool) => Ok(pool.acquire().await?),
            Sandbox::Dedicated(factory) => factory
                .create()
                .await
                .map_err(|err| EngineError::WorkerSetup(PoolError::Executor(err))),
        }
    }

    async fn check_in(&self, executor: Executor) {
        match &self.sandbox {
            Sandbox::Pooled(pool) => pool.release(executor).await,
            Sandbox::Dedicated(_) => executor.stop().await,
        }
    }

    /// Swap the dead executor for a fresh, context-seeded one.
    async fn replace_executor(
        &self,
        executor: &mut Executor,
        pool: &WorkerPool,
        documents: &[Document],
    ) -> Result<(), String> {
        let fresh = match pool.acquire().await {
            Ok(fresh) => fresh,
            Err(err) => {
                return Err(format!(
                    "executor died and no replacement could be acquired: {err}"
                ));
            }
        };
        let dead = std::mem::replace(executor, fresh);
        dead.stop().await;
        executor
            .seed_context(documents)
            .await
            .map_err(|err| format!("failed to seed replacement executor: {err}"))
    }

    async fn verify(
        &self,
        answer: &str,
        documents: &[Document],
        state: &Arc<Mutex<SessionState>>,
        iteration: u32,
    ) -> Option<VerificationReport> {
        if !self.config.verify_citations {
            return None;
        }
        let report = verify_answer(answer, documents);
        record(
            state,
            StepType::Verification,
            report.summary(),
            iteration,
            None,
            None,
        )
        .await;
        Some(report)
    }
}

const NO_OUTPUT: &str = "(no output)";

fn render_observation(outcome: &ExecuteOutcome) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !outcome.stdout.is_empty() {
        parts.push(outcome.stdout.clone());
    }
    if !outcome.stderr.is_empty() {
        parts.push(format!("stderr:\n{}", outcome.stderr));
    }
    if let Some(error) = &outcome.error {
        parts.push(format!("error:\n{error}"));
    }
    if parts.is_empty() {
        NO_OUTPUT.to_string()
    } else {
        parts.join("\n")
    }
}

enum LoopEnd {
    Answered {
        answer: String,
        iterations: u32,
    },
    AnsweredVar {
        name: String,
        value: String,
        iterations: u32,
    },
    Exhausted {
        last_output: Option<String>,
    },
    Fatal {
        message: String,
        iterations: u32,
    },
}

struct SessionState {
    trace: Trace,
    usage: TokenUsage,
    progress: Option<ProgressCallback>,
}

async fn record(
    state: &Arc<Mutex<SessionState>>,
    step_type: StepType,
    content: impl Into<String>,
    iteration: u32,
    tokens_used: Option<u64>,
    duration_ms: Option<u64>,
) {
    let content = content.into();
    let mut guard = state.lock().await;
    guard
        .trace
        .push_full(step_type, content.clone(), iteration, tokens_used, duration_ms);
    if let Some(progress) = &guard.progress {
        progress(step_type, iteration, &content);
    }
}

/// The engine's side of the sub-call contract: size cap, untrusted-content
/// boundary, model call through the retry wrapper, trace accounting.
struct EngineSubCalls {
    client: Arc<dyn ModelClient>,
    prompts: Arc<dyn PromptRenderer>,
    config: EngineConfig,
    state: Arc<Mutex<SessionState>>,
    iteration: AtomicU32,
}

#[async_trait]
impl SubCallHandler for EngineSubCalls {
    async fn handle(&self, instruction: String, content: String) -> Result<String, SubCallError> {
        let iteration = self.iteration.load(Ordering::SeqCst);
        let len = content.chars().count();
        if len > self.config.max_subcall_content_chars {
            let err = SubCallError::ContentTooLarge {
                len,
                limit: self.config.max_subcall_content_chars,
            };
            record(&self.state, StepType::Error, err.to_string(), iteration, None, None).await;
            return Err(err);
        }

        record(
            &self.state,
            StepType::SubCallRequest,
            format!("{instruction} ({len} chars of content)"),
            iteration,
            None,
            None,
        )
        .await;

        let prompt = self
            .prompts
            .sub_call_prompt(&instruction, &wrap_sub_call_content(&content));
        let messages = vec![ChatMessage::user(prompt)];
        let started = Instant::now();
        match with_backoff(&self.config.retry, || self.client.complete(&messages)).await {
            Ok(completion) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                {
                    let mut guard = self.state.lock().await;
                    guard.usage.add(&completion);
                }
                record(
                    &self.state,
                    StepType::SubCallResponse,
                    &completion.content,
                    iteration,
                    Some(completion.total_tokens()),
                    Some(duration_ms),
                )
                .await;
                Ok(completion.content)
            }
            Err(err) => {
                record(
                    &self.state,
                    StepType::Error,
                    format!("sub-call model request failed: {err}"),
                    iteration,
                    None,
                    None,
                )
                .await;
                Err(SubCallError::Llm(err))
            }
        }
    }
}
