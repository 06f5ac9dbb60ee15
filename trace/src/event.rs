//! Trace event types: messages, tool calls, and tool outputs.
//!
//! Events form a tagged union with a shared engine-assigned [`EventId`].
//! Tool calls are nested inside an assistant message on the wire, but each
//! call is an addressable node of its own so that rules can quantify over
//! them and dataflow edges can point at them directly.

use serde_json::Value;

/// Engine-assigned event identity.
///
/// Ids are indices into the owning trace's node arena, assigned in traversal
/// order (a message precedes its nested tool calls, which precede the next
/// top-level event). Equality is total and cheap.
pub type EventId = usize;

/// Kind tag of an event node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    ToolCall,
    ToolOutput,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "Message",
            EventKind::ToolCall => "ToolCall",
            EventKind::ToolOutput => "ToolOutput",
        }
    }
}

/// A chat message. Unknown roles pass through untouched.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: String,
    /// Message content; either a string or already-structured data.
    pub content: Option<Value>,
    /// Node ids of tool calls nested in this message.
    pub tool_calls: Vec<EventId>,
}

/// A tool invocation requested by the assistant.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Caller-assigned call id (`tool_call_id` links resolve against this).
    pub call_id: String,
    pub call_type: String,
    /// Function name.
    pub name: String,
    /// Function arguments; always a JSON object after trace parsing.
    pub arguments: Value,
    /// The assistant message this call is nested in, if any.
    pub message: Option<EventId>,
}

/// Output produced by a tool, linked back to its call by `tool_call_id`.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub role: String,
    pub content: Option<Value>,
    pub tool_call_id: Option<String>,
    /// Resolved node id of the matching call; `None` when unmatched.
    pub call: Option<EventId>,
}

/// Payload of an event node.
#[derive(Debug, Clone)]
pub enum EventBody {
    Message(Message),
    ToolCall(ToolCall),
    ToolOutput(ToolOutput),
}

/// One addressable node of a trace.
#[derive(Debug, Clone)]
pub struct EventNode {
    pub id: EventId,
    pub body: EventBody,
    /// Dotted path from the trace root, e.g. `"2"` or `"2.tool_calls.0"`.
    pub json_path: String,
    /// Index of the top-level trace entry this node belongs to.
    pub top_index: usize,
}

impl EventNode {
    pub fn kind(&self) -> EventKind {
        match &self.body {
            EventBody::Message(_) => EventKind::Message,
            EventBody::ToolCall(_) => EventKind::ToolCall,
            EventBody::ToolOutput(_) => EventKind::ToolOutput,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match &self.body {
            EventBody::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_tool_call(&self) -> Option<&ToolCall> {
        match &self.body {
            EventBody::ToolCall(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_tool_output(&self) -> Option<&ToolOutput> {
        match &self.body {
            EventBody::ToolOutput(o) => Some(o),
            _ => None,
        }
    }

    /// Content value of the node, when its variant carries one.
    pub fn content(&self) -> Option<&Value> {
        match &self.body {
            EventBody::Message(m) => m.content.as_ref(),
            EventBody::ToolOutput(o) => o.content.as_ref(),
            EventBody::ToolCall(_) => None,
        }
    }
}
