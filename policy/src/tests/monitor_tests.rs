//! Tests for the incremental monitor.

use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::engine::{AnalyzeOptions, Policy};
use crate::monitor::{CheckError, Monitor, MonitorOptions};
use crate::tests::{assistant, system, tool, tool_call, user};

const INBOX_POLICY: &str = r#"
raise "untrusted recipient after reading the inbox" if:
    (a: ToolCall) -> (b: ToolCall)
    a is tool:get_inbox
    b is tool:send_email({to: r"^(?!Peter$).*$"})
"#;

fn inbox_exchange() -> Vec<serde_json::Value> {
    vec![
        system("You are a helpful assistant."),
        user("forward the newest mail"),
        assistant(None, vec![tool_call("1", "get_inbox", json!({}))]),
        tool("1", json!("From: dev: launch friday")),
    ]
}

fn send_step() -> Vec<serde_json::Value> {
    vec![assistant(
        None,
        vec![tool_call("2", "send_email", json!({"to": "Attacker"}))],
    )]
}

#[test]
fn test_incremental_check_reports_once() {
    let mut monitor = Monitor::new(INBOX_POLICY, MonitorOptions::default()).unwrap();

    // first step: nothing to report
    let first = monitor.check(&[], &inbox_exchange()).unwrap();
    assert!(first.errors.is_empty());

    // second step introduces the violating send
    let mut past = inbox_exchange();
    let second = monitor.check(&past, &send_step()).unwrap();
    assert_eq!(second.errors.len(), 1);

    // third step: no new events, nothing new to report
    past.extend(send_step());
    let third = monitor.check(&past, &[]).unwrap();
    assert!(third.errors.is_empty());
}

#[test]
fn test_monitor_union_equals_batch_analysis() {
    let mut monitor = Monitor::new(INBOX_POLICY, MonitorOptions::default()).unwrap();
    let mut full = inbox_exchange();
    full.extend(send_step());

    // feed the trace one event at a time
    let mut union = Vec::new();
    for cut in 0..full.len() {
        let past = &full[..cut];
        let pending = std::slice::from_ref(&full[cut]);
        union.extend(monitor.check(past, pending).unwrap().errors);
    }

    let policy = Policy::from_string(INBOX_POLICY).unwrap();
    let batch = policy.analyze(&full, &AnalyzeOptions::default()).unwrap();
    assert_eq!(union.len(), batch.errors.len());
    for (incremental, batched) in union.iter().zip(&batch.errors) {
        assert_eq!(incremental.message, batched.message);
        assert_eq!(incremental.ranges, batched.ranges);
    }
}

#[test]
fn test_stateful_vs_stateless_analysis() {
    let source = "raise \"greeting\" if:\n    (m: Message)\n    \"Hi\" in m.content\n";
    let trace = vec![user("Hi how are you?")];

    // stateful: the same violation is reported only once
    let mut monitor = Monitor::new(source, MonitorOptions::default()).unwrap();
    assert_eq!(monitor.check(&trace, &[]).unwrap().errors.len(), 1);
    assert_eq!(monitor.check(&trace, &[]).unwrap().errors.len(), 0);

    // stateless: every analysis reports it again
    let policy = Policy::from_string(source).unwrap();
    assert_eq!(policy.analyze(&trace, &AnalyzeOptions::default()).unwrap().errors.len(), 1);
    assert_eq!(policy.analyze(&trace, &AnalyzeOptions::default()).unwrap().errors.len(), 1);
}

#[test]
fn test_reset_clears_incremental_state() {
    let source = "raise \"greeting\" if:\n    (m: Message)\n    \"Hi\" in m.content\n";
    let trace = vec![user("Hi how are you?")];

    let mut monitor = Monitor::new(source, MonitorOptions::default()).unwrap();
    assert_eq!(monitor.check(&trace, &[]).unwrap().errors.len(), 1);
    monitor.reset();
    assert_eq!(monitor.check(&trace, &[]).unwrap().errors.len(), 1);
}

#[test]
fn test_raise_unhandled_blocks_pending_violation() {
    let options = MonitorOptions {
        raise_unhandled: true,
        ..MonitorOptions::default()
    };
    let mut monitor = Monitor::new(INBOX_POLICY, options).unwrap();

    monitor.check(&[], &inbox_exchange()).unwrap();

    // the pending send would violate the policy: check refuses
    let err = monitor.check(&inbox_exchange(), &send_step()).unwrap_err();
    match err {
        CheckError::Blocking(blocking) => {
            assert_eq!(blocking.violations.len(), 1);
            assert_eq!(blocking.result.errors.len(), 1);
        }
        other => panic!("expected a blocking violation, got {other:?}"),
    }
}

#[test]
fn test_raise_unhandled_ignores_past_only_violations() {
    let source = "raise \"greeting\" if:\n    (m: Message)\n    \"Hi\" in m.content\n";
    let options = MonitorOptions {
        raise_unhandled: true,
        ..MonitorOptions::default()
    };
    let mut monitor = Monitor::new(source, options).unwrap();

    // violation is entirely in the past: reported, not raised
    let result = monitor.check(&[user("Hi")], &[user("more")]).unwrap();
    assert_eq!(result.errors.len(), 1);
}

#[test]
fn test_handlers_route_violations() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);

    let options = MonitorOptions {
        raise_unhandled: true,
        ..MonitorOptions::default()
    };
    let mut monitor = Monitor::new(INBOX_POLICY, options).unwrap();
    monitor.on(
        "PolicyViolation",
        Box::new(move |violation| {
            seen_clone.lock().unwrap().push(violation.message.clone());
        }),
    );

    monitor.check(&[], &inbox_exchange()).unwrap();
    // handled: no blocking error even though the violation is pending
    let result = monitor.check(&inbox_exchange(), &send_step()).unwrap();
    assert!(result.errors.is_empty());
    assert_eq!(result.handled_errors.len(), 1);
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn test_monitor_is_debuggable() {
    let monitor = Monitor::new(INBOX_POLICY, MonitorOptions::default()).unwrap();
    let repr = format!("{monitor:?}");
    assert!(repr.contains("Monitor"));
}
