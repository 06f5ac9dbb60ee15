//! Trace parsing, validation, and id-indexed side tables.

use std::collections::HashMap;

use log::warn;
use serde_json::Value;
use thiserror::Error;

use crate::event::{EventBody, EventId, EventKind, EventNode, Message, ToolCall, ToolOutput};
use crate::range::join_path;

/// Hard trace-input failure, surfaced only in strict mode.
#[derive(Debug, Clone, Error)]
pub enum TraceError {
    #[error("duplicate tool call id '{id}' at {json_path}")]
    DuplicateToolCallId { id: String, json_path: String },

    #[error("tool output at {json_path} references unknown tool call id '{id}'")]
    UnmatchedToolOutput { id: String, json_path: String },

    #[error("unrecognized trace event at {json_path}")]
    UnrecognizedEvent { json_path: String },
}

/// Recoverable trace-input issue, collected during tolerant parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceWarning {
    pub json_path: String,
    pub message: String,
}

/// An ordered sequence of parsed events with side tables for id resolution.
///
/// The trace owns an arena of [`EventNode`]s in traversal order: every
/// top-level message or tool output is a node, and every tool call nested in
/// an assistant message is a node of its own, sequenced between its message
/// and the next top-level entry. Events are never mutated after parsing; all
/// derived structures are external.
#[derive(Debug)]
pub struct Trace {
    nodes: Vec<EventNode>,
    raw: Vec<Value>,
    warnings: Vec<TraceWarning>,
    // First defect encountered during tolerant parsing, so `parse_strict`
    // does not re-run the parser.
    strict_error: Option<TraceError>,
}

impl Trace {
    /// Parses a list of JSON events tolerantly: malformed entries and broken
    /// id links are flagged as warnings, never a crash.
    pub fn parse(input: &[Value]) -> Trace {
        Parser::default().parse(input)
    }

    /// Parses a list of JSON events, failing on the first input defect that
    /// tolerant parsing would only have flagged.
    pub fn parse_strict(input: &[Value]) -> Result<Trace, TraceError> {
        let trace = Trace::parse(input);
        if let Some(err) = trace.strict_error.clone() {
            return Err(err);
        }
        Ok(trace)
    }

    pub fn nodes(&self) -> &[EventNode] {
        &self.nodes
    }

    pub fn node(&self, id: EventId) -> &EventNode {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Raw input values, for reconstructing event JSON in reports.
    pub fn raw(&self) -> &[Value] {
        &self.raw
    }

    pub fn warnings(&self) -> &[TraceWarning] {
        &self.warnings
    }

    /// Ids of all nodes of the given kind, in trace order. `None` selects
    /// every node.
    pub fn select(&self, kind: Option<EventKind>) -> Vec<EventId> {
        self.nodes
            .iter()
            .filter(|n| kind.map_or(true, |k| n.kind() == k))
            .map(|n| n.id)
            .collect()
    }

    /// Raw JSON of the top-level entry a node belongs to.
    pub fn raw_event(&self, id: EventId) -> &Value {
        &self.raw[self.nodes[id].top_index]
    }
}

#[derive(Default)]
struct Parser {
    nodes: Vec<EventNode>,
    warnings: Vec<TraceWarning>,
    calls_by_id: HashMap<String, EventId>,
    last_call_id: Option<String>,
    strict_error: Option<TraceError>,
}

impl Parser {
    fn parse(mut self, input: &[Value]) -> Trace {
        for (idx, event) in input.iter().enumerate() {
            let path = idx.to_string();
            let Some(obj) = event.as_object() else {
                self.flag(
                    &path,
                    "event is not an object".to_string(),
                    TraceError::UnrecognizedEvent { json_path: path.clone() },
                );
                continue;
            };

            match obj.get("role").and_then(Value::as_str) {
                Some("tool") => self.parse_tool_output(obj, idx, &path),
                Some(_) => self.parse_message(obj, idx, &path),
                None if obj.contains_key("type") => self.parse_bare_tool_call(obj, idx, &path),
                None => {
                    self.flag(
                        &path,
                        "event has neither 'role' nor 'type'".to_string(),
                        TraceError::UnrecognizedEvent { json_path: path.clone() },
                    );
                }
            }
        }

        Trace {
            nodes: self.nodes,
            raw: input.to_vec(),
            warnings: self.warnings,
            strict_error: self.strict_error,
        }
    }

    fn parse_message(&mut self, obj: &serde_json::Map<String, Value>, idx: usize, path: &str) {
        let role = obj
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let content = obj.get("content").filter(|c| !c.is_null()).cloned();

        let message_id = self.nodes.len();
        self.nodes.push(EventNode {
            id: message_id,
            body: EventBody::Message(Message {
                role,
                content,
                tool_calls: Vec::new(),
            }),
            json_path: path.to_string(),
            top_index: idx,
        });

        let calls = obj
            .get("tool_calls")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut call_ids = Vec::with_capacity(calls.len());
        for (ci, call) in calls.iter().enumerate() {
            let call_path = join_path(path, &format!("tool_calls.{ci}"));
            if let Some(id) = self.parse_tool_call(call, Some(message_id), idx, &call_path) {
                call_ids.push(id);
            }
        }
        if let EventBody::Message(m) = &mut self.nodes[message_id].body {
            m.tool_calls = call_ids;
        }
    }

    fn parse_tool_call(
        &mut self,
        call: &Value,
        message: Option<EventId>,
        top_index: usize,
        path: &str,
    ) -> Option<EventId> {
        let Some(obj) = call.as_object() else {
            self.flag(
                path,
                "tool call is not an object".to_string(),
                TraceError::UnrecognizedEvent { json_path: path.to_string() },
            );
            return None;
        };

        let call_id = obj
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let call_type = obj
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("function")
            .to_string();
        let function = obj.get("function").and_then(Value::as_object);
        let name = function
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        // String-encoded arguments (the OpenAI wire form) are decoded here,
        // once, rather than lazily at every rule dereference.
        let arguments = match function.and_then(|f| f.get("arguments")) {
            Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
                Ok(v) => v,
                Err(e) => {
                    warn!("tool call arguments at {path} are not valid JSON: {e}");
                    self.warnings.push(TraceWarning {
                        json_path: path.to_string(),
                        message: format!("arguments are not valid JSON: {e}"),
                    });
                    Value::String(s.clone())
                }
            },
            Some(v) => v.clone(),
            None => Value::Object(serde_json::Map::new()),
        };

        let id = self.nodes.len();
        if !call_id.is_empty() {
            if self.calls_by_id.contains_key(&call_id) {
                self.flag(
                    path,
                    format!("duplicate tool call id '{call_id}'"),
                    TraceError::DuplicateToolCallId {
                        id: call_id.clone(),
                        json_path: path.to_string(),
                    },
                );
            } else {
                self.calls_by_id.insert(call_id.clone(), id);
            }
            self.last_call_id = Some(call_id.clone());
        }

        self.nodes.push(EventNode {
            id,
            body: EventBody::ToolCall(ToolCall {
                call_id,
                call_type,
                name,
                arguments,
                message,
            }),
            json_path: path.to_string(),
            top_index,
        });
        Some(id)
    }

    fn parse_bare_tool_call(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        idx: usize,
        path: &str,
    ) {
        self.parse_tool_call(&Value::Object(obj.clone()), None, idx, path);
    }

    fn parse_tool_output(&mut self, obj: &serde_json::Map<String, Value>, idx: usize, path: &str) {
        // A missing tool_call_id falls back to the most recent call, the
        // same recovery the reference traces rely on.
        let tool_call_id = obj
            .get("tool_call_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.last_call_id.clone());

        let call = match &tool_call_id {
            Some(id) => {
                let resolved = self.calls_by_id.get(id).copied();
                if resolved.is_none() {
                    self.flag(
                        path,
                        format!("tool output references unknown tool call id '{id}'"),
                        TraceError::UnmatchedToolOutput {
                            id: id.clone(),
                            json_path: path.to_string(),
                        },
                    );
                }
                resolved
            }
            None => None,
        };

        let id = self.nodes.len();
        self.nodes.push(EventNode {
            id,
            body: EventBody::ToolOutput(ToolOutput {
                role: "tool".to_string(),
                content: obj.get("content").filter(|c| !c.is_null()).cloned(),
                tool_call_id,
                call,
            }),
            json_path: path.to_string(),
            top_index: idx,
        });
    }

    fn flag(&mut self, path: &str, message: String, strict: TraceError) {
        warn!("trace input: {message} at {path}");
        self.warnings.push(TraceWarning {
            json_path: path.to_string(),
            message,
        });
        if self.strict_error.is_none() {
            self.strict_error = Some(strict);
        }
    }
}
