//! Typed wire messages.
//!
//! Both directions are tagged by an `action` field so a raw line can be
//! decoded without peeking at its shape first.

use serde::Deserialize;
use serde::Serialize;

/// Message sent from the host to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HostMessage {
    /// Seed the execution namespace with the document list. Sent once per
    /// session before the first execute.
    SetContext { documents: Vec<String> },
    /// Run a chunk of generated code. `timeout_ms` is the execute budget;
    /// the host remains the authoritative enforcer of the deadline.
    Execute { code: String, timeout_ms: u64 },
    /// Reply to a [`WorkerMessage::SubCallRequest`]. Exactly one of
    /// `result` / `error` is set; an error makes the worker raise inside
    /// the execution namespace.
    SubCallResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Clear all user bindings, keeping only the injected primitives.
    Reset,
    /// Liveness probe.
    Ping,
}

/// Message sent from a worker back to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// The final result of an execute call.
    ExecuteResult(ExecuteOutcome),
    /// Executing code invoked `llm_query`; execution is suspended until
    /// the host answers with a [`HostMessage::SubCallResponse`].
    SubCallRequest { instruction: String, content: String },
    /// Acknowledgement for `set_context` and `reset`.
    Ack,
    /// Reply to `ping`.
    Pong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Ok,
    Error,
}

/// Captured outcome of one execute call inside the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteOutcome {
    pub status: ExecStatus,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Structured error text when `status` is `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Value of the last expression, when it serializes to JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    /// Set when the code called `FINAL(answer)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
    /// Set when the code called `FINAL_VAR(name)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_var: Option<String>,
    /// The resolved value of `final_var`; `None` when the name is unbound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_value: Option<String>,
}

impl ExecuteOutcome {
    pub fn ok() -> Self {
        Self {
            status: ExecStatus::Ok,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            return_value: None,
            final_answer: None,
            final_var: None,
            final_value: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ExecStatus::Error,
            error: Some(message.into()),
            ..Self::ok()
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ExecStatus::Error
    }
}
