//! Event model for agent traces.
//!
//! This crate holds the data side of the trace analyzer: the typed event
//! representation (messages, tool calls, tool outputs), tolerant trace
//! parsing with id-indexed side tables, the flows-to relation used by the
//! `->` operator, and [`Range`] values that localize findings back into the
//! original trace JSON.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use tracewarden_trace::{Dataflow, EventKind, Trace};
//!
//! let trace = Trace::parse(&[
//!     json!({"role": "user", "content": "check my inbox"}),
//!     json!({"role": "assistant", "content": null, "tool_calls": [
//!         {"id": "1", "type": "function",
//!          "function": {"name": "get_inbox", "arguments": {}}}
//!     ]}),
//!     json!({"role": "tool", "tool_call_id": "1", "content": "one new mail"}),
//! ]);
//!
//! assert_eq!(trace.select(Some(EventKind::ToolCall)), vec![2]);
//! let flow = Dataflow::from_trace(&trace);
//! assert!(flow.has_flow(2, 3)); // call flows to its output
//! ```

mod dataflow;
mod event;
mod range;
mod trace;
pub mod value;

pub use dataflow::Dataflow;
pub use event::{EventBody, EventId, EventKind, EventNode, Message, ToolCall, ToolOutput};
pub use range::{join_path, Range};
pub use trace::{Trace, TraceError, TraceWarning};
