//! Test support: trace builders and stub detectors.

mod flow_tests;
mod monitor_tests;
mod pattern_tests;
mod range_tests;

use serde_json::{json, Value};

use crate::detectors::{
    Detector, DetectorError, DetectorOptions, DetectorRegistry, DetectorVerdict,
};

pub(crate) fn system(content: &str) -> Value {
    json!({"role": "system", "content": content})
}

pub(crate) fn user(content: &str) -> Value {
    json!({"role": "user", "content": content})
}

pub(crate) fn assistant(content: Option<&str>, tool_calls: Vec<Value>) -> Value {
    json!({"role": "assistant", "content": content, "tool_calls": tool_calls})
}

pub(crate) fn assistant_says(content: &str) -> Value {
    json!({"role": "assistant", "content": content})
}

pub(crate) fn tool_call(id: &str, name: &str, arguments: Value) -> Value {
    json!({"id": id, "type": "function", "function": {"name": name, "arguments": arguments}})
}

pub(crate) fn tool(id: &str, content: Value) -> Value {
    json!({"role": "tool", "tool_call_id": id, "content": content})
}

/// Detector flagging any string that contains a fixed keyword.
pub(crate) struct KeywordDetector {
    name: &'static str,
    keyword: &'static str,
}

impl KeywordDetector {
    pub(crate) fn new(name: &'static str, keyword: &'static str) -> Self {
        KeywordDetector { name, keyword }
    }
}

impl Detector for KeywordDetector {
    fn name(&self) -> &str {
        self.name
    }

    fn detect(
        &self,
        value: &Value,
        _options: &DetectorOptions,
    ) -> Result<DetectorVerdict, DetectorError> {
        let flagged = match value {
            Value::String(s) => s.contains(self.keyword),
            _ => false,
        };
        Ok(DetectorVerdict::Flagged(flagged))
    }
}

/// Detector that always refuses to run.
pub(crate) struct RefusingDetector(pub &'static str);

impl Detector for RefusingDetector {
    fn name(&self) -> &str {
        self.0
    }

    fn detect(
        &self,
        _value: &Value,
        _options: &DetectorOptions,
    ) -> Result<DetectorVerdict, DetectorError> {
        Err(DetectorError::Unavailable(self.0.to_string()))
    }
}

pub(crate) fn registry_with(detectors: Vec<Box<dyn Detector>>) -> DetectorRegistry {
    let mut registry = DetectorRegistry::new();
    for detector in detectors {
        registry.register(detector);
    }
    registry
}
