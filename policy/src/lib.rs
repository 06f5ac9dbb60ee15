//! Policy engine for agent trace analysis.
//!
//! This crate provides parsing, compilation, and evaluation of declarative
//! security policies over agent traces: rules quantify over trace events,
//! assert dataflow between them, match tool calls against semantic
//! patterns, and consult pluggable content detectors. A [`Monitor`] wraps a
//! policy for online use, reporting each violation exactly once as the
//! trace grows.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use tracewarden_policy::{AnalyzeOptions, Policy};
//!
//! let policy = Policy::from_string(
//!     r#"
//! raise "untrusted recipient after reading the inbox" if:
//!     (call: ToolCall) -> (call2: ToolCall)
//!     call is tool:get_inbox
//!     call2 is tool:send_email({to: r"^(?!Peter$).*$"})
//! "#,
//! )
//! .unwrap();
//!
//! let trace = vec![
//!     json!({"role": "assistant", "content": null, "tool_calls": [
//!         {"id": "1", "type": "function",
//!          "function": {"name": "get_inbox", "arguments": {}}}
//!     ]}),
//!     json!({"role": "tool", "tool_call_id": "1", "content": "one new mail"}),
//!     json!({"role": "assistant", "content": null, "tool_calls": [
//!         {"id": "2", "type": "function",
//!          "function": {"name": "send_email", "arguments": {"to": "Attacker"}}}
//!     ]}),
//! ];
//!
//! let result = policy.analyze(&trace, &AnalyzeOptions::default()).unwrap();
//! assert_eq!(result.errors.len(), 1);
//! ```

mod ast;
mod compiled;
mod compiler;
mod detectors;
mod engine;
mod error;
mod eval;
mod lexer;
mod monitor;
mod parser;
mod pattern;
mod types;

#[cfg(test)]
mod tests;

// Re-export public types
pub use ast::{PolicySource, Span};
pub use compiled::{CompiledPolicy, RuleId};
pub use detectors::{
    Detector, DetectorError, DetectorHit, DetectorOptions, DetectorRegistry, DetectorVerdict,
    ModerationDetector, PiiDetector, PromptInjectionDetector, SecretsDetector,
};
pub use engine::{analyze_trace, AnalysisResult, AnalyzeOptions, Policy};
pub use error::{CompileError, PolicyErrorBag, PolicyViolation, Warning, WarningKind};
pub use monitor::{BlockingViolation, CheckError, Handler, Monitor, MonitorOptions};
pub use parser::parse_policy;

// Re-export the trace model for downstream convenience.
pub use tracewarden_trace::{
    Dataflow, EventBody, EventId, EventKind, EventNode, Range, Trace, TraceError, TraceWarning,
};
