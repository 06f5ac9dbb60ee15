//! The flows-to relation over trace events.
//!
//! `A -> B` holds when A precedes B in trace order and could plausibly have
//! influenced it. The graph deliberately over-approximates: every earlier
//! node in the conversation window flows to every later one. Rule authors
//! constrain false positives by combining flow checks with content and
//! pattern checks. Two refinements on top of plain precedence:
//!
//! - a tool call always flows to its matching tool output (id link);
//! - sibling tool calls of one assistant message are mutually non-flowing.
//!
//! The relation is direct only; no transitive closure is taken.

use std::collections::HashSet;

use crate::event::{EventBody, EventId};
use crate::trace::Trace;

/// Precomputed flows-to edges, keyed by the downstream event.
#[derive(Debug)]
pub struct Dataflow {
    incoming: Vec<HashSet<EventId>>,
}

impl Dataflow {
    pub fn from_trace(trace: &Trace) -> Dataflow {
        let mut incoming: Vec<HashSet<EventId>> = vec![HashSet::new(); trace.len()];
        let mut so_far: HashSet<EventId> = HashSet::new();

        let mut idx = 0;
        while idx < trace.len() {
            let node = trace.node(idx);
            match &node.body {
                EventBody::Message(m) => {
                    incoming[idx] = so_far.clone();
                    so_far.insert(idx);

                    // Sibling calls see everything up to and including the
                    // message, but not each other.
                    let snapshot = so_far.clone();
                    for &call in &m.tool_calls {
                        incoming[call] = snapshot.clone();
                    }
                    for &call in &m.tool_calls {
                        so_far.insert(call);
                    }
                    idx += 1 + m.tool_calls.len();
                }
                _ => {
                    incoming[idx] = so_far.clone();
                    so_far.insert(idx);
                    idx += 1;
                }
            }
        }

        Dataflow { incoming }
    }

    /// Whether there is a direct flow from `a` to `b`.
    pub fn has_flow(&self, a: EventId, b: EventId) -> bool {
        self.incoming
            .get(b)
            .map_or(false, |sources| sources.contains(&a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trace_with_parallel_calls() -> Trace {
        Trace::parse(&[
            json!({"role": "user", "content": "go"}),
            json!({"role": "assistant", "content": null, "tool_calls": [
                {"id": "1", "type": "function", "function": {"name": "a", "arguments": {}}},
                {"id": "2", "type": "function", "function": {"name": "b", "arguments": {}}}
            ]}),
            json!({"role": "tool", "tool_call_id": "1", "content": "out"}),
        ])
    }

    #[test]
    fn test_earlier_events_flow_to_later() {
        let trace = trace_with_parallel_calls();
        let flow = Dataflow::from_trace(&trace);
        // user message -> first tool call
        assert!(flow.has_flow(0, 2));
        // tool call -> its output
        assert!(flow.has_flow(2, 4));
        // nothing flows backwards
        assert!(!flow.has_flow(4, 2));
        assert!(!flow.has_flow(2, 0));
    }

    #[test]
    fn test_parallel_tool_calls_do_not_flow_to_each_other() {
        let trace = trace_with_parallel_calls();
        let flow = Dataflow::from_trace(&trace);
        assert!(!flow.has_flow(2, 3));
        assert!(!flow.has_flow(3, 2));
        // but both see their message
        assert!(flow.has_flow(1, 2));
        assert!(flow.has_flow(1, 3));
    }

    #[test]
    fn test_calls_flow_to_later_top_level_events() {
        let trace = trace_with_parallel_calls();
        let flow = Dataflow::from_trace(&trace);
        assert!(flow.has_flow(3, 4));
    }

    #[test]
    fn test_no_reflexive_flow() {
        let trace = trace_with_parallel_calls();
        let flow = Dataflow::from_trace(&trace);
        for id in 0..trace.len() {
            assert!(!flow.has_flow(id, id));
        }
    }
}
