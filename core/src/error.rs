use std::time::Duration;

use delver_protocol::FramingError;
use thiserror::Error;

/// Failure classification for outbound model calls.
///
/// Every provider error is sorted into exactly one of these three kinds
/// before it reaches the retry wrapper; raw provider errors never escape
/// the client.
#[derive(Debug, Error)]
pub enum LlmError {
    /// 429 from the provider. May carry a suggested delay.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    /// Network failure, timeout, or 5xx. Worth retrying.
    #[error("transient provider failure: {message}")]
    Transient { message: String },
    /// Bad credentials or a malformed request. Never retried.
    #[error("permanent provider failure: {message}")]
    Permanent { message: String },
}

impl LlmError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent { .. })
    }
}

/// A violation of the host<->worker wire contract. The connection that
/// produced one of these is compromised and must be torn down.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("no worker response within the {}ms deadline", deadline.as_millis())]
    DeadlineExceeded { deadline: Duration },
    #[error("worker closed the connection")]
    ConnectionClosed,
    #[error("malformed frame from worker: {0}")]
    MalformedFrame(String),
    #[error("unexpected {got} frame while awaiting {expected}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("worker connection is dead")]
    Dead,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("worker i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("cannot acquire from a stopped pool")]
    Stopped,
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// Why a sub-call could not be answered. Converted to an error frame on
/// the wire, which raises inside the sandbox; generated code never sees
/// these as return values.
#[derive(Debug, Error)]
pub enum SubCallError {
    #[error(
        "sub-call content is {len} chars, exceeding the {limit}-char limit; \
         chunk the content into smaller pieces and query each separately"
    )]
    ContentTooLarge { len: usize, limit: usize },
    #[error("sub-call model request failed: {0}")]
    Llm(#[from] LlmError),
    #[error("no sub-call handler is configured")]
    NoHandler,
}

/// Engine failures that prevent a session from running at all. Failures
/// *inside* a running session terminate it with a fatal outcome on the
/// result instead, so the trace stays observable.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to prepare a sandbox worker: {0}")]
    WorkerSetup(#[from] PoolError),
    #[error("failed to seed the document context: {0}")]
    ContextSeed(#[from] ExecutorError),
}
