//! The append-only record of everything that happened during a session.

use std::sync::LazyLock;

use chrono::DateTime;
use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

use crate::client::Completion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    CodeGenerated,
    CodeOutput,
    SubCallRequest,
    SubCallResponse,
    Nudge,
    Verification,
    Error,
    FinalAnswer,
    ExhaustedWarning,
    FatalError,
}

impl StepType {
    /// Terminal step classes; exactly one ends every session's trace.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::FinalAnswer | Self::ExhaustedWarning | Self::FatalError
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub content: String,
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Steps are only appended, never mutated or reordered; the vector is
/// private and the API exposes no mutable access.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trace {
    steps: Vec<TraceStep>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step_type: StepType, content: impl Into<String>, iteration: u32) {
        self.push_full(step_type, content, iteration, None, None);
    }

    pub fn push_full(
        &mut self,
        step_type: StepType,
        content: impl Into<String>,
        iteration: u32,
        tokens_used: Option<u64>,
        duration_ms: Option<u64>,
    ) {
        self.steps.push(TraceStep {
            step_type,
            content: content.into(),
            iteration,
            timestamp: Utc::now(),
            tokens_used,
            duration_ms,
        });
    }

    pub fn steps(&self) -> &[TraceStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The terminal step, when the session has finished.
    pub fn terminal_step(&self) -> Option<&TraceStep> {
        self.steps.iter().find(|step| step.step_type.is_terminal())
    }

    /// A copy with secret-looking substrings masked. Step metadata is
    /// preserved; only content changes.
    pub fn redacted(&self) -> Trace {
        self.redacted_with(&RedactionConfig::default())
    }

    pub fn redacted_with(&self, config: &RedactionConfig) -> Trace {
        let steps = self
            .steps
            .iter()
            .map(|step| TraceStep {
                content: config.apply(&step.content),
                ..step.clone()
            })
            .collect();
        Trace { steps }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, completion: &Completion) {
        self.prompt_tokens += completion.prompt_tokens;
        self.completion_tokens += completion.completion_tokens;
    }
}

static DEFAULT_SECRET_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Provider API keys (sk-..., and the project-scoped variants).
        r"\bsk-[A-Za-z0-9_-]{16,}\b",
        // Bearer tokens in headers echoed into output.
        r"(?i)bearer\s+[A-Za-z0-9._~+/=-]{16,}",
        // key=value style credentials.
        r#"(?i)\b(api[_-]?key|token|secret)\b\s*[:=]\s*['"]?[A-Za-z0-9._~+/-]{8,}"#,
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

#[derive(Debug, Clone)]
pub struct RedactionConfig {
    pub patterns: Vec<Regex>,
    pub placeholder: String,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_SECRET_PATTERNS.clone(),
            placeholder: "[REDACTED]".to_string(),
        }
    }
}

impl RedactionConfig {
    fn apply(&self, content: &str) -> String {
        let mut masked = content.to_string();
        for pattern in &self.patterns {
            masked = pattern
                .replace_all(&masked, self.placeholder.as_str())
                .into_owned();
        }
        masked
    }
}
