//! delver-core: the orchestration engine for recursive language-model
//! document analysis.
//!
//! A query session is a generate -> execute -> observe loop: the model
//! writes code, the code runs inside an isolated sandbox worker, and the
//! observed output feeds the next turn until the code emits a terminal
//! signal. This crate owns the engine, the warm worker pool, the
//! host-side executor speaking the wire protocol, the retrying model
//! client, and the session trace.

pub mod client;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod executor;
pub mod parse;
pub mod pool;
pub mod prompts;
pub mod retry;
pub mod trace;
pub mod verification;

pub use client::ChatMessage;
pub use client::Completion;
pub use client::HttpModelClient;
pub use client::ModelClient;
pub use config::EngineConfig;
pub use config::PoolConfig;
pub use document::Document;
pub use engine::Engine;
pub use engine::ProgressCallback;
pub use engine::QueryOutcome;
pub use engine::QueryResult;
pub use engine::Sandbox;
pub use error::EngineError;
pub use error::ExecutorError;
pub use error::LlmError;
pub use error::PoolError;
pub use error::ProtocolError;
pub use error::SubCallError;
pub use executor::Executor;
pub use executor::SubCallHandler;
pub use pool::ExecutorFactory;
pub use pool::WorkerPool;
pub use pool::WorkerSpawner;
pub use prompts::DefaultPrompts;
pub use prompts::PromptRenderer;
pub use retry::RetryConfig;
pub use trace::StepType;
pub use trace::TokenUsage;
pub use trace::Trace;
pub use verification::VerificationReport;
