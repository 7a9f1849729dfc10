//! Sandboxed JavaScript execution context.
//!
//! One [`Interpreter`] wraps one boa_engine `Context`. The execution
//! namespace is seeded with a fixed, enumerable set of primitives
//! (`context` with the document list, `llm_query`, `FINAL`, `FINAL_VAR`,
//! and a capturing `console`/`print` shim) registered once per build.
//! `reset` rebuilds the context, which is what guarantees that no
//! user-level binding survives while every injected primitive does.
//!
//! The interpreter is single-threaded by construction: `llm_query` blocks
//! on a host round trip installed for the duration of one execute call.

use std::cell::RefCell;
use std::time::Duration;
use std::time::Instant;

use boa_engine::Context;
use boa_engine::JsNativeError;
use boa_engine::JsResult;
use boa_engine::JsValue;
use boa_engine::NativeFunction;
use boa_engine::Source;
use boa_engine::js_string;
use boa_engine::object::FunctionObjectBuilder;
use boa_engine::property::Attribute;
use delver_protocol::ExecStatus;
use delver_protocol::ExecuteOutcome;
use serde::Deserialize;
use thiserror::Error;

/// Why a sub-call round trip did not produce a result.
#[derive(Debug)]
pub enum SubCallFailure {
    /// The host refused the call (over the content cap, no handler, model
    /// failure). Raised inside the execution namespace so generated code
    /// can never mistake the message for data.
    Rejected(String),
    /// The connection to the host broke mid round trip.
    ConnectionLost(String),
}

/// Transport callback installed for the duration of one execute call.
pub type SubCallFn = Box<dyn FnMut(&str, &str) -> Result<String, SubCallFailure>>;

#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("failed to build execution context: {0}")]
    Init(String),
}

struct ActiveSubCall {
    f: SubCallFn,
    deadline: Instant,
    budget: Duration,
}

thread_local! {
    // The blocking bridge for the execute call currently on this thread.
    // boa native functions are plain fn pointers, so the per-call state
    // rides in thread-local storage instead of closure captures.
    static ACTIVE_SUB_CALL: RefCell<Option<ActiveSubCall>> = const { RefCell::new(None) };
}

/// JS shim evaluated into every fresh context. Captures console output and
/// records terminal signals; harvested (and cleared) after each execute.
const PRELUDE: &str = r#"
var __stdout = [];
var __stderr = [];
var __final = null;
function __fmt(v) {
    if (typeof v === 'object' && v !== null) {
        try { return JSON.stringify(v); } catch (e) { return String(v); }
    }
    return String(v);
}
var console = {
    log: function () { __stdout.push(Array.prototype.map.call(arguments, __fmt).join(' ')); },
    info: function () { console.log.apply(null, arguments); },
    warn: function () { __stderr.push(Array.prototype.map.call(arguments, __fmt).join(' ')); },
    error: function () { console.warn.apply(null, arguments); }
};
function print() { console.log.apply(null, arguments); }
function FINAL(answer) { __final = { kind: 'answer', value: __fmt(answer) }; }
function FINAL_VAR(name) { __final = { kind: 'var', name: String(name) }; }
"#;

/// Reads back (and clears) everything one execute call produced.
const HARVEST: &str = r#"
(function () {
    var out = { stdout: __stdout.join('\n'), stderr: __stderr.join('\n'), final: null };
    var f = __final;
    if (f && f.kind === 'answer') {
        out.final = { kind: 'answer', value: f.value };
    } else if (f && f.kind === 'var') {
        var r = { kind: 'var', name: f.name, value: null, bound: false };
        try {
            var v = eval(f.name);
            r.value = __fmt(v);
            r.bound = true;
        } catch (e) {}
        out.final = r;
    }
    __stdout = [];
    __stderr = [];
    __final = null;
    return JSON.stringify(out);
})()
"#;

#[derive(Deserialize)]
struct Harvest {
    stdout: String,
    stderr: String,
    #[serde(rename = "final")]
    terminal: Option<FinalRecord>,
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum FinalRecord {
    Answer {
        value: String,
    },
    Var {
        name: String,
        value: Option<String>,
        bound: bool,
    },
}

pub struct Interpreter {
    context: Context,
    documents: Vec<String>,
    /// Global property names right after the primitives were injected.
    /// Everything beyond this set is a user binding.
    baseline: Vec<String>,
}

impl Interpreter {
    pub fn new(documents: Vec<String>) -> Result<Self, InterpreterError> {
        let (context, baseline) = build_context(&documents)?;
        Ok(Self {
            context,
            documents,
            baseline,
        })
    }

    /// Replace the document list and rebuild the namespace around it.
    pub fn set_documents(&mut self, documents: Vec<String>) -> Result<(), InterpreterError> {
        let (context, baseline) = build_context(&documents)?;
        self.context = context;
        self.baseline = baseline;
        self.documents = documents;
        Ok(())
    }

    /// Clear every user-level binding, preserving the injected primitives
    /// and the current document list.
    pub fn reset(&mut self) -> Result<(), InterpreterError> {
        let (context, baseline) = build_context(&self.documents)?;
        self.context = context;
        self.baseline = baseline;
        Ok(())
    }

    /// Run one chunk of generated code. Strictly serialized: the caller
    /// must not issue another execute until this returns.
    pub fn execute(&mut self, code: &str, timeout: Duration, sub_call: SubCallFn) -> ExecuteOutcome {
        ACTIVE_SUB_CALL.with(|slot| {
            *slot.borrow_mut() = Some(ActiveSubCall {
                f: sub_call,
                deadline: Instant::now() + timeout,
                budget: timeout,
            });
        });
        let evaluated = self.context.eval(Source::from_bytes(code));
        ACTIVE_SUB_CALL.with(|slot| *slot.borrow_mut() = None);

        let harvest = match self.harvest() {
            Ok(harvest) => harvest,
            Err(err) => return ExecuteOutcome::error(format!("namespace harvest failed: {err}")),
        };

        let mut outcome = ExecuteOutcome {
            stdout: harvest.stdout,
            stderr: harvest.stderr,
            ..ExecuteOutcome::ok()
        };
        match harvest.terminal {
            Some(FinalRecord::Answer { value }) => outcome.final_answer = Some(value),
            Some(FinalRecord::Var { name, value, bound }) => {
                outcome.final_var = Some(name);
                outcome.final_value = if bound { value } else { None };
            }
            None => {}
        }
        match evaluated {
            Ok(value) => outcome.return_value = scalar_return_value(&value),
            Err(err) => {
                outcome.status = ExecStatus::Error;
                outcome.error = Some(err.to_string());
            }
        }
        outcome
    }

    /// Global bindings introduced by user code since the last reset.
    pub fn user_bindings(&mut self) -> Result<Vec<String>, InterpreterError> {
        let names = global_names(&mut self.context)?;
        Ok(names
            .into_iter()
            .filter(|name| !self.baseline.contains(name))
            .collect())
    }

    /// The fixed set of injected primitive names.
    pub fn injected_globals() -> &'static [&'static str] {
        &[
            "context",
            "llm_query",
            "FINAL",
            "FINAL_VAR",
            "console",
            "print",
            "__stdout",
            "__stderr",
            "__final",
            "__fmt",
        ]
    }

    fn harvest(&mut self) -> Result<Harvest, InterpreterError> {
        let value = self
            .context
            .eval(Source::from_bytes(HARVEST))
            .map_err(|e| InterpreterError::Init(e.to_string()))?;
        let json = value
            .as_string()
            .map(|s| s.to_std_string_escaped())
            .ok_or_else(|| InterpreterError::Init("harvest returned a non-string".to_string()))?;
        serde_json::from_str(&json).map_err(|e| InterpreterError::Init(e.to_string()))
    }
}

fn build_context(documents: &[String]) -> Result<(Context, Vec<String>), InterpreterError> {
    let mut context = Context::default();
    register_llm_query(&mut context).map_err(|e| InterpreterError::Init(e.to_string()))?;

    // JSON is a valid JS expression, so the document list rides in with
    // the prelude instead of going through value-conversion APIs.
    let docs_json = serde_json::to_string(documents).map_err(|e| InterpreterError::Init(e.to_string()))?;
    let seed = format!("{PRELUDE}\nvar context = {docs_json};");
    context
        .eval(Source::from_bytes(&seed))
        .map_err(|e| InterpreterError::Init(e.to_string()))?;

    let baseline = global_names(&mut context)?;
    Ok((context, baseline))
}

fn register_llm_query(context: &mut Context) -> JsResult<()> {
    let f = FunctionObjectBuilder::new(
        context.realm(),
        NativeFunction::from_fn_ptr(llm_query_native),
    )
    .name(js_string!("llm_query"))
    .length(2)
    .build();
    context.register_global_property(js_string!("llm_query"), f, Attribute::all())?;
    Ok(())
}

fn llm_query_native(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let instruction = arg_to_string(args.first(), ctx)?;
    let content = arg_to_string(args.get(1), ctx)?;

    // Take the bridge out of the slot for the duration of the round trip
    // so a re-entrant call cannot alias it.
    let active = ACTIVE_SUB_CALL.with(|slot| slot.borrow_mut().take());
    let Some(mut active) = active else {
        return Err(JsNativeError::error()
            .with_message("llm_query is only available while code is executing")
            .into());
    };

    if Instant::now() >= active.deadline {
        let budget_ms = active.budget.as_millis();
        ACTIVE_SUB_CALL.with(|slot| *slot.borrow_mut() = Some(active));
        return Err(JsNativeError::error()
            .with_message(format!(
                "llm_query refused: execute budget of {budget_ms}ms exhausted"
            ))
            .into());
    }

    let result = (active.f)(&instruction, &content);
    ACTIVE_SUB_CALL.with(|slot| *slot.borrow_mut() = Some(active));

    match result {
        Ok(text) => Ok(JsValue::from(js_string!(text))),
        Err(SubCallFailure::Rejected(message)) => {
            Err(JsNativeError::error().with_message(message).into())
        }
        Err(SubCallFailure::ConnectionLost(message)) => Err(JsNativeError::error()
            .with_message(format!("sub-call connection lost: {message}"))
            .into()),
    }
}

fn arg_to_string(arg: Option<&JsValue>, ctx: &mut Context) -> JsResult<String> {
    match arg {
        Some(value) => Ok(value.to_string(ctx)?.to_std_string_escaped()),
        None => Ok(String::new()),
    }
}

/// Only scalar results are reported back; objects and functions are
/// observable through stdout instead.
fn scalar_return_value(value: &JsValue) -> Option<serde_json::Value> {
    if value.is_undefined() || value.is_null() {
        return None;
    }
    if let Some(b) = value.as_boolean() {
        return Some(serde_json::Value::Bool(b));
    }
    if let Some(n) = value.as_number() {
        return serde_json::Number::from_f64(n).map(serde_json::Value::Number);
    }
    value
        .as_string()
        .map(|s| serde_json::Value::String(s.to_std_string_escaped()))
}

fn global_names(context: &mut Context) -> Result<Vec<String>, InterpreterError> {
    let value = context
        .eval(Source::from_bytes(
            "JSON.stringify(Object.getOwnPropertyNames(globalThis))",
        ))
        .map_err(|e| InterpreterError::Init(e.to_string()))?;
    let json = value
        .as_string()
        .map(|s| s.to_std_string_escaped())
        .ok_or_else(|| InterpreterError::Init("global name listing was not a string".to_string()))?;
    serde_json::from_str(&json).map_err(|e| InterpreterError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;

    use super::*;

    const BUDGET: Duration = Duration::from_secs(30);

    fn no_sub_calls() -> SubCallFn {
        Box::new(|_, _| {
            Err(SubCallFailure::Rejected(
                "no sub-call handler in this test".to_string(),
            ))
        })
    }

    #[test]
    fn captures_console_output() {
        let mut interp = Interpreter::new(vec!["hello".to_string()]).unwrap();
        let outcome = interp.execute(
            "console.log('a', 1, {k: 2}); console.error('oops');",
            BUDGET,
            no_sub_calls(),
        );
        assert_eq!(outcome.status, ExecStatus::Ok);
        assert_eq!(outcome.stdout, "a 1 {\"k\":2}");
        assert_eq!(outcome.stderr, "oops");
    }

    #[test]
    fn documents_are_visible_as_context() {
        let mut interp =
            Interpreter::new(vec!["first doc".to_string(), "second doc".to_string()]).unwrap();
        let outcome = interp.execute(
            "console.log(context.length, context[1]);",
            BUDGET,
            no_sub_calls(),
        );
        assert_eq!(outcome.stdout, "2 second doc");
    }

    #[test]
    fn final_records_answer() {
        let mut interp = Interpreter::new(vec![]).unwrap();
        let outcome = interp.execute("FINAL('the answer');", BUDGET, no_sub_calls());
        assert_eq!(outcome.final_answer.as_deref(), Some("the answer"));
        assert_eq!(outcome.final_var, None);
    }

    #[test]
    fn final_var_resolves_bound_variable() {
        let mut interp = Interpreter::new(vec![]).unwrap();
        let outcome = interp.execute(
            "var total = 41 + 1; FINAL_VAR('total');",
            BUDGET,
            no_sub_calls(),
        );
        assert_eq!(outcome.final_var.as_deref(), Some("total"));
        assert_eq!(outcome.final_value.as_deref(), Some("42"));
    }

    #[test]
    fn final_var_unbound_has_no_value() {
        let mut interp = Interpreter::new(vec![]).unwrap();
        let outcome = interp.execute("FINAL_VAR('never_bound');", BUDGET, no_sub_calls());
        assert_eq!(outcome.final_var.as_deref(), Some("never_bound"));
        assert_eq!(outcome.final_value, None);
    }

    #[test]
    fn variables_persist_across_executes() {
        let mut interp = Interpreter::new(vec![]).unwrap();
        interp.execute("var counter = 10;", BUDGET, no_sub_calls());
        let outcome = interp.execute("console.log(counter + 1);", BUDGET, no_sub_calls());
        assert_eq!(outcome.stdout, "11");
    }

    #[test]
    fn reset_clears_user_bindings_and_keeps_primitives() {
        let mut interp = Interpreter::new(vec!["doc".to_string()]).unwrap();
        interp.execute("var leftover = 1; function helper() {}", BUDGET, no_sub_calls());
        let bound = interp.user_bindings().unwrap();
        assert!(bound.contains(&"leftover".to_string()));
        assert!(bound.contains(&"helper".to_string()));

        interp.reset().unwrap();
        assert_eq!(interp.user_bindings().unwrap(), Vec::<String>::new());

        let outcome = interp.execute(
            "console.log(typeof leftover, typeof FINAL, typeof llm_query, context.length);",
            BUDGET,
            no_sub_calls(),
        );
        assert_eq!(outcome.stdout, "undefined function function 1");
    }

    #[test]
    fn execution_error_keeps_captured_output() {
        let mut interp = Interpreter::new(vec![]).unwrap();
        let outcome = interp.execute(
            "console.log('before'); missing_fn();",
            BUDGET,
            no_sub_calls(),
        );
        assert_eq!(outcome.status, ExecStatus::Error);
        assert_eq!(outcome.stdout, "before");
        let error = outcome.error.unwrap();
        assert!(error.contains("missing_fn"), "unexpected error: {error}");
    }

    #[test]
    fn scalar_results_are_reported() {
        let mut interp = Interpreter::new(vec![]).unwrap();
        let outcome = interp.execute("6 * 7", BUDGET, no_sub_calls());
        assert_eq!(outcome.return_value, Some(serde_json::json!(42.0)));
    }

    #[test]
    fn llm_query_returns_host_result() {
        let mut interp = Interpreter::new(vec![]).unwrap();
        let outcome = interp.execute(
            "var reply = llm_query('summarize', 'body'); console.log(reply);",
            BUDGET,
            Box::new(|instruction, content| {
                assert_eq!(instruction, "summarize");
                assert_eq!(content, "body");
                Ok("a summary".to_string())
            }),
        );
        assert_eq!(outcome.status, ExecStatus::Ok);
        assert_eq!(outcome.stdout, "a summary");
    }

    #[test]
    fn rejected_sub_call_raises_in_sandbox() {
        let mut interp = Interpreter::new(vec![]).unwrap();
        let outcome = interp.execute(
            "var reply = llm_query('x', 'y'); FINAL(reply);",
            BUDGET,
            Box::new(|_, _| Err(SubCallFailure::Rejected("content too large".to_string()))),
        );
        assert_eq!(outcome.status, ExecStatus::Error);
        // The rejection surfaces as a raised error, never as a value the
        // code could hand to FINAL.
        assert_eq!(outcome.final_answer, None);
        assert!(outcome.error.unwrap().contains("content too large"));
    }

    #[test]
    fn sandbox_code_can_catch_sub_call_errors() {
        let mut interp = Interpreter::new(vec![]).unwrap();
        let outcome = interp.execute(
            "try { llm_query('x', 'y'); } catch (e) { console.log('caught: ' + e.message); }",
            BUDGET,
            Box::new(|_, _| Err(SubCallFailure::Rejected("nope".to_string()))),
        );
        assert_eq!(outcome.status, ExecStatus::Ok);
        assert!(outcome.stdout.contains("caught:"));
        assert!(outcome.stdout.contains("nope"));
    }

    #[test]
    fn exhausted_budget_refuses_sub_calls() {
        let mut interp = Interpreter::new(vec![]).unwrap();
        let outcome = interp.execute(
            "llm_query('x', 'y');",
            Duration::from_millis(0),
            Box::new(|_, _| Ok("never".to_string())),
        );
        assert_eq!(outcome.status, ExecStatus::Error);
        assert!(outcome.error.unwrap().contains("budget"));
    }
}
