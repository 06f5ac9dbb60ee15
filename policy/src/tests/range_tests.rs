//! Tests for violation localization.

use serde_json::{json, Value};

use crate::engine::{AnalyzeOptions, Policy};
use crate::tests::{assistant, tool, tool_call, user};

/// Resolves a dotted json path against the raw trace; panics if any segment
/// is missing. Used to assert localization soundness.
fn resolve_path<'v>(trace: &'v [Value], path: &str) -> &'v Value {
    let mut segments = path.split('.');
    let first: usize = segments
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| panic!("path '{path}' does not start with an index"));
    let mut current = &trace[first];
    for segment in segments {
        current = match (segment.parse::<usize>(), current) {
            (Ok(idx), Value::Array(items)) => &items[idx],
            (_, Value::Object(map)) => map
                .get(segment)
                .unwrap_or_else(|| panic!("path '{path}' missing key '{segment}'")),
            _ => panic!("path '{path}' does not resolve"),
        };
    }
    current
}

#[test]
fn test_every_reported_range_resolves_in_the_trace() {
    let policy = Policy::from_string(
        r#"
raise "untrusted recipient" if:
    (a: ToolCall) -> (b: ToolCall)
    a is tool:get_inbox
    b is tool:send_email({to: r"^(?!Peter$).*$"})
"#,
    )
    .unwrap();
    let trace = vec![
        user("forward the mail"),
        assistant(None, vec![tool_call("1", "get_inbox", json!({}))]),
        tool("1", json!("mail body")),
        assistant(None, vec![tool_call("2", "send_email", json!({"to": "Eve"}))]),
    ];
    let result = policy.analyze(&trace, &AnalyzeOptions::default()).unwrap();
    assert_eq!(result.errors.len(), 1);
    assert!(!result.errors[0].ranges.is_empty());
    for range in &result.errors[0].ranges {
        resolve_path(&trace, &range.json_path);
    }
}

#[test]
fn test_substring_match_carries_character_span() {
    let policy = Policy::from_string(
        "raise \"marker\" if:\n    (m: Message)\n    \"abc\" in m.content\n",
    )
    .unwrap();
    let trace = vec![user("xx abc yy abc")];
    let result = policy.analyze(&trace, &AnalyzeOptions::default()).unwrap();
    assert_eq!(result.errors.len(), 1);

    let spans: Vec<_> = result.errors[0]
        .ranges
        .iter()
        .filter(|r| r.start.is_some())
        .collect();
    assert_eq!(spans.len(), 2, "both occurrences are marked");
    assert_eq!(spans[0].json_path, "0.content");
    assert_eq!((spans[0].start, spans[0].end), (Some(3), Some(6)));
    assert_eq!((spans[1].start, spans[1].end), (Some(10), Some(13)));

    // spans are character offsets into the content string
    let content = resolve_path(&trace, "0.content").as_str().unwrap();
    let picked: String = content.chars().skip(3).take(3).collect();
    assert_eq!(picked, "abc");
}

#[test]
fn test_find_marks_matches() {
    let policy = Policy::from_string(
        "raise \"numbers\" if:\n    (m: Message)\n    len(find(r\"[0-9]+\", m.content)) > 0\n",
    )
    .unwrap();
    let trace = vec![user("codes 42 and 7")];
    let result = policy.analyze(&trace, &AnalyzeOptions::default()).unwrap();
    assert_eq!(result.errors.len(), 1);
    let spans: Vec<_> = result.errors[0]
        .ranges
        .iter()
        .filter(|r| r.start.is_some())
        .collect();
    assert_eq!(spans.len(), 2);
}

#[test]
fn test_bound_events_are_localized() {
    let policy = Policy::from_string(
        "raise \"call seen\" if:\n    (call: ToolCall)\n    call is tool:ping\n",
    )
    .unwrap();
    let trace = vec![assistant(None, vec![tool_call("1", "ping", json!({}))])];
    let result = policy.analyze(&trace, &AnalyzeOptions::default()).unwrap();
    assert!(result.errors[0]
        .ranges
        .iter()
        .any(|r| r.json_path == "0.tool_calls.0"));
}

#[test]
fn test_matched_argument_is_localized() {
    let policy = Policy::from_string(
        "raise \"exact\" if:\n    (call: ToolCall)\n    call is tool:send({to: \"Eve\", urgent: *})\n",
    )
    .unwrap();
    let trace = vec![assistant(
        None,
        vec![tool_call("1", "send", json!({"to": "Eve", "urgent": true, "noise": 1}))],
    )];
    let result = policy.analyze(&trace, &AnalyzeOptions::default()).unwrap();
    assert_eq!(result.errors.len(), 1);
    let paths: Vec<_> = result.errors[0]
        .ranges
        .iter()
        .map(|r| r.json_path.as_str())
        .collect();
    assert!(paths.contains(&"0.tool_calls.0.function.arguments.to"));
    assert!(paths.contains(&"0.tool_calls.0.function.arguments.urgent"));
    assert!(!paths.contains(&"0.tool_calls.0.function.arguments.noise"));
}

#[test]
fn test_unicode_spans_are_character_offsets() {
    let policy = Policy::from_string(
        "raise \"marker\" if:\n    (m: Message)\n    \"abc\" in m.content\n",
    )
    .unwrap();
    // two-byte characters before the needle
    let trace = vec![user("ééé abc")];
    let result = policy.analyze(&trace, &AnalyzeOptions::default()).unwrap();
    let span = result.errors[0]
        .ranges
        .iter()
        .find(|r| r.start.is_some())
        .unwrap();
    assert_eq!((span.start, span.end), (Some(4), Some(7)));
}
