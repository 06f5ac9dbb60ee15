//! Tests for the dataflow operator in rule bodies.

use serde_json::json;

use crate::engine::{AnalyzeOptions, Policy};
use crate::tests::{assistant, assistant_says, system, tool, tool_call, user};

fn analyze(source: &str, trace: &[serde_json::Value]) -> usize {
    Policy::from_string(source)
        .unwrap()
        .analyze(trace, &AnalyzeOptions::default())
        .unwrap()
        .errors
        .len()
}

fn two_call_trace() -> Vec<serde_json::Value> {
    vec![
        system("You are a helpful assistant."),
        user("What is the result of something(2)?"),
        assistant(None, vec![tool_call("1", "something", json!({"x": 2}))]),
        tool("1", json!(2001)),
        assistant(None, vec![tool_call("2", "something_else", json!({"x": 10}))]),
        tool("2", json!(2001)),
    ]
}

#[test]
fn test_call_flows_to_later_call() {
    let count = analyze(
        r#"
raise "you must not call something_else after something" if:
    (call: ToolCall) -> (call2: ToolCall)
    call is tool:something({x: 2})
    call2 is tool:something_else({x: 10})
"#,
        &two_call_trace(),
    );
    assert_eq!(count, 1);
}

#[test]
fn test_flow_is_directed() {
    // inverted direction matches nothing
    let count = analyze(
        r#"
raise "inverted" if:
    (call: ToolCall) -> (call2: ToolCall)
    call2 is tool:something({x: 2})
    call is tool:something_else({x: 10})
"#,
        &two_call_trace(),
    );
    assert_eq!(count, 0);
}

#[test]
fn test_user_message_flows_to_tool_call() {
    let source = r#"
raise "tainted call" if:
    (message: Message) -> (call: ToolCall)
    message.role == "user"
    "abc" in message.content
    call is tool:something({x: 2})
"#;
    let mut trace = two_call_trace();
    trace[1] = user("What is the result of something(2)? abc");
    assert_eq!(analyze(source, &trace), 1);

    // without the marker there is no match
    assert_eq!(analyze(source, &two_call_trace()), 0);
}

#[test]
fn test_message_flows_to_later_message() {
    let count = analyze(
        r#"
raise "echoed" if:
    (message: Message) -> (message2: Message)
    message.role == "user"
    "abc" in message.content
    message2.role == "assistant"
    "def" in message2.content
"#,
        &[
            system("You are a helpful assistant."),
            user("What is the result of something(2)? abc"),
            assistant_says("The result is 2001. def"),
        ],
    );
    assert_eq!(count, 1);
}

#[test]
fn test_message_flows_to_its_own_tool_calls() {
    let count = analyze(
        r#"
raise "greeting with side effects" if:
    (message: Message) -> (call: ToolCall)
    "Hey" in message.content
"#,
        &[assistant(Some("Hey"), vec![tool_call("1", "something", json!({"x": 2}))])],
    );
    assert_eq!(count, 1);
}

#[test]
fn test_standalone_flow_atom() {
    let count = analyze(
        r#"
raise "reachable" if:
    (message: Message)
    (call: ToolCall)
    message -> call
    call.function.arguments["x"] == 2
"#,
        &[
            user("What is the result of something(2)?"),
            assistant(None, vec![tool_call("1", "something", json!({"x": 2}))]),
        ],
    );
    assert_eq!(count, 1);
}

#[test]
fn test_multipath_flow() {
    let count = analyze(
        r#"
raise "double user influence" if:
    (m1: Message)
    (m2: Message)
    (call: ToolCall)
    m1 -> call
    m1 -> m2
    m1.role == "user"
    m2.role == "user"
"#,
        &[
            user("Hi how are you?"),
            user("What is the result of something(2)?"),
            assistant(None, vec![tool_call("1", "something", json!({"x": 2}))]),
        ],
    );
    assert_eq!(count, 1);
}

#[test]
fn test_parallel_tool_calls_do_not_flow() {
    let count = analyze(
        r#"
raise "sibling flow" if:
    (a: ToolCall) -> (b: ToolCall)
    a is tool:first
    b is tool:second
"#,
        &[assistant(
            None,
            vec![
                tool_call("1", "first", json!({})),
                tool_call("2", "second", json!({})),
            ],
        )],
    );
    assert_eq!(count, 0);
}

#[test]
fn test_call_flows_to_its_output() {
    let count = analyze(
        r#"
raise "output seen" if:
    (call: ToolCall) -> (out: ToolOutput)
    call is tool:something
    "2001" in out.content
"#,
        &[
            assistant(None, vec![tool_call("1", "something", json!({"x": 2}))]),
            tool("1", json!("result: 2001")),
        ],
    );
    assert_eq!(count, 1);
}

#[test]
fn test_each_flow_source_yields_its_own_binding() {
    // two earlier calls flow into one later call: two separate models
    let count = analyze(
        r#"
raise "pairs" if:
    (a: ToolCall) -> (b: ToolCall)
    b is tool:sink
"#,
        &[
            assistant(None, vec![tool_call("1", "src_one", json!({}))]),
            assistant(None, vec![tool_call("2", "src_two", json!({}))]),
            assistant(None, vec![tool_call("3", "sink", json!({}))]),
        ],
    );
    assert_eq!(count, 2);
}
