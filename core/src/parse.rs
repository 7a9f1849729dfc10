//! Parsing of model replies and execution outcomes.

use std::sync::LazyLock;

use delver_protocol::ExecuteOutcome;
use regex::Regex;

#[allow(clippy::expect_used)]
static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:repl|js|javascript)[ \t]*\n(.*?)```")
        .expect("code fence pattern is valid")
});

/// Extract executable code blocks from a model reply, in order.
pub fn extract_code_blocks(text: &str) -> Vec<String> {
    CODE_FENCE
        .captures_iter(text)
        .map(|captures| captures[1].trim_end().to_string())
        .filter(|block| !block.trim().is_empty())
        .collect()
}

/// The terminal signal carried by one execution, switched on explicitly by
/// the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalSignal {
    /// `FINAL(answer)` was called.
    Answer(String),
    /// `FINAL_VAR(name)` was called; `value` is `None` when the name was
    /// unbound in the execution namespace.
    VarRef {
        name: String,
        value: Option<String>,
    },
    /// No terminal call; the loop continues.
    Continue,
}

pub fn terminal_signal(outcome: &ExecuteOutcome) -> TerminalSignal {
    if let Some(answer) = &outcome.final_answer {
        return TerminalSignal::Answer(answer.clone());
    }
    if let Some(name) = &outcome.final_var {
        return TerminalSignal::VarRef {
            name: name.clone(),
            value: outcome.final_value.clone(),
        };
    }
    TerminalSignal::Continue
}
