//! Tests for semantic pattern matching.

use serde_json::json;

use crate::engine::{AnalyzeOptions, Policy};
use crate::detectors::{DetectorRegistry, PiiDetector};
use crate::tests::{assistant, tool_call};

fn match_count(pattern_args: &str, arguments: serde_json::Value) -> usize {
    let source = format!("raise \"match\" if:\n    (call: ToolCall)\n    call is tool:send({pattern_args})\n");
    let policy = Policy::from_string(&source).unwrap();
    let trace = vec![assistant(None, vec![tool_call("1", "send", arguments)])];
    policy
        .analyze(&trace, &AnalyzeOptions::default())
        .unwrap()
        .errors
        .len()
}

#[test]
fn test_string_literal_matches_exactly() {
    assert_eq!(match_count("{to: \"Peter\"}", json!({"to": "Peter"})), 1);
    assert_eq!(match_count("{to: \"Peter\"}", json!({"to": "peter"})), 0);
    assert_eq!(match_count("{to: \"Peter\"}", json!({"to": "Peter Parker"})), 0);
}

#[test]
fn test_number_literal_tolerates_int_float_mix() {
    assert_eq!(match_count("{x: 2}", json!({"x": 2.0})), 1);
    assert_eq!(match_count("{x: 2.5}", json!({"x": 2.5})), 1);
    assert_eq!(match_count("{x: 2}", json!({"x": 3})), 0);
}

#[test]
fn test_regex_full_match() {
    assert_eq!(match_count("{q: r\"[0-9]+\"}", json!({"q": "12345"})), 1);
    // partial matches do not count
    assert_eq!(match_count("{q: r\"[0-9]+\"}", json!({"q": "a12345"})), 0);
}

#[test]
fn test_regex_lookahead() {
    let pattern = "{to: r\"^(?!Peter$).*$\"}";
    assert_eq!(match_count(pattern, json!({"to": "Attacker"})), 1);
    assert_eq!(match_count(pattern, json!({"to": "Peter"})), 0);
}

#[test]
fn test_wildcard_matches_anything() {
    assert_eq!(match_count("{to: *}", json!({"to": [1, 2, 3]})), 1);
    assert_eq!(match_count("{to: *}", json!({"to": null})), 1);
    // omitted key still matches a wildcard subpattern
    assert_eq!(match_count("{to: *}", json!({})), 1);
}

#[test]
fn test_missing_key_fails_non_wildcard() {
    assert_eq!(match_count("{to: \"Peter\"}", json!({"cc": "Peter"})), 0);
}

#[test]
fn test_extra_keys_never_invalidate_a_match() {
    // dict-pattern monotonicity: adding keys to the value keeps the match
    assert_eq!(match_count("{to: \"Peter\"}", json!({"to": "Peter"})), 1);
    assert_eq!(
        match_count(
            "{to: \"Peter\"}",
            json!({"to": "Peter", "cc": "Eve", "bcc": "Mallory"})
        ),
        1
    );
}

#[test]
fn test_list_prefix_match() {
    assert_eq!(match_count("{xs: [1, 2]}", json!({"xs": [1, 2]})), 1);
    // trailing elements never invalidate a match
    assert_eq!(match_count("{xs: [1, 2]}", json!({"xs": [1, 2, 3, 4]})), 1);
    assert_eq!(match_count("{xs: [1, 2]}", json!({"xs": [1]})), 0);
    assert_eq!(match_count("{xs: [1, 2]}", json!({"xs": [2, 1]})), 0);
}

#[test]
fn test_nested_object_patterns() {
    assert_eq!(
        match_count(
            "{msg: {to: \"Peter\", body: r\".*hello.*\"}}",
            json!({"msg": {"to": "Peter", "body": "why hello there", "extra": 1}})
        ),
        1
    );
}

#[test]
fn test_bare_tool_matches_any_call() {
    let policy = Policy::from_string("raise \"any\" if:\n    (call: ToolCall)\n    call is tool\n").unwrap();
    let trace = vec![assistant(
        None,
        vec![
            tool_call("1", "alpha", json!({})),
            tool_call("2", "beta", json!({})),
        ],
    )];
    let result = policy.analyze(&trace, &AnalyzeOptions::default()).unwrap();
    assert_eq!(result.errors.len(), 2);
}

#[test]
fn test_tool_name_must_match() {
    let policy =
        Policy::from_string("raise \"X\" if:\n    (call: ToolCall)\n    call is tool:alpha\n").unwrap();
    let trace = vec![assistant(None, vec![tool_call("1", "beta", json!({}))])];
    let result = policy.analyze(&trace, &AnalyzeOptions::default()).unwrap();
    assert!(result.errors.is_empty());
}

#[test]
fn test_pii_classifier_in_pattern() {
    let mut registry = DetectorRegistry::new();
    registry.register(Box::new(PiiDetector::new()));

    let policy = Policy::from_string(
        "raise \"pii leak\" if:\n    (call: ToolCall)\n    call is tool:search_web({q: <EMAIL_ADDRESS>})\n",
    )
    .unwrap();
    let trace = vec![assistant(
        None,
        vec![tool_call("1", "search_web", json!({"q": "bob@mail.com wants Paris"}))],
    )];

    let options = AnalyzeOptions {
        registry: Some(&registry),
        ..AnalyzeOptions::default()
    };
    let result = policy.analyze(&trace, &options).unwrap();
    assert_eq!(result.errors.len(), 1);

    // the range identifies the offending argument
    let ranges = &result.errors[0].ranges;
    assert!(
        ranges
            .iter()
            .any(|r| r.json_path == "0.tool_calls.0.function.arguments.q"),
        "ranges: {ranges:?}"
    );
}

#[test]
fn test_classifier_without_detector_is_unknown() {
    let policy = Policy::from_string(
        "raise \"pii leak\" if:\n    (call: ToolCall)\n    call is tool:search_web({q: <EMAIL_ADDRESS>})\n",
    )
    .unwrap();
    let trace = vec![assistant(
        None,
        vec![tool_call("1", "search_web", json!({"q": "bob@mail.com"}))],
    )];
    let result = policy.analyze(&trace, &AnalyzeOptions::default()).unwrap();
    assert!(result.errors.is_empty());
    assert!(!result.warnings.is_empty());
}

#[test]
fn test_tool_output_matches_through_to_its_call() {
    let policy = Policy::from_string(
        "raise \"X\" if:\n    (out: ToolOutput)\n    out is tool:get_inbox\n",
    )
    .unwrap();
    let trace = vec![
        assistant(None, vec![tool_call("1", "get_inbox", json!({}))]),
        crate::tests::tool("1", json!("mail")),
    ];
    let result = policy.analyze(&trace, &AnalyzeOptions::default()).unwrap();
    assert_eq!(result.errors.len(), 1);
}
