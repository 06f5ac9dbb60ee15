//! Localization ranges pointing into a trace.

use serde::{Deserialize, Serialize};

use crate::event::EventId;

/// A pointer to a sub-object of the trace that participated in satisfying a
/// rule.
///
/// `json_path` is a dotted path of integer indices and string keys against
/// the original trace input (e.g. `"3.content"` or
/// `"2.tool_calls.0.function.arguments.to"`). When `start`/`end` are
/// present they are character offsets into the string at that path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    /// Engine-assigned id of the event the range lives in.
    pub object_id: EventId,
    pub json_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
}

impl Range {
    /// Range covering an entire object.
    pub fn object(object_id: EventId, json_path: impl Into<String>) -> Self {
        Range {
            object_id,
            json_path: json_path.into(),
            start: None,
            end: None,
        }
    }

    /// Range covering a character span of the string at `json_path`.
    pub fn span(object_id: EventId, json_path: impl Into<String>, start: usize, end: usize) -> Self {
        Range {
            object_id,
            json_path: json_path.into(),
            start: Some(start),
            end: Some(end),
        }
    }
}

/// Extends a dotted json path by one segment.
pub fn join_path(base: &str, segment: &str) -> String {
    if base.is_empty() {
        segment.to_string()
    } else {
        format!("{base}.{segment}")
    }
}
