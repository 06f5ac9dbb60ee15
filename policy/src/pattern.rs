//! Semantic pattern matching, `call is tool:name({...})`.
//!
//! Patterns are compiled once per policy and then unified against tool-call
//! argument values. A successful match reports the ranges of every field it
//! touched, so violations can point at the exact argument that triggered
//! them. Classifier atoms (`<EMAIL_ADDRESS>`, `<MODERATED>`) consult the
//! detector registry; when the detector is missing the whole match becomes
//! *unknown* instead of silently failing.

use serde_json::Value;

use tracewarden_trace::value::values_equal;
use tracewarden_trace::{join_path, EventId, Range, Trace};

use crate::ast::{Expr, ExprKind, Span, UnaryOp};
use crate::detectors::{DetectorError, DetectorOptions, DetectorRegistry, DetectorVerdict};
use crate::error::{CompileError, Warning, WarningKind};
use crate::eval::Truth;

/// PII entities a classifier pattern may name.
const PII_CLASSES: [&str; 4] = ["EMAIL_ADDRESS", "LOCATION", "PHONE_NUMBER", "PERSON"];

/// One node of a compiled pattern.
#[derive(Debug)]
pub enum Matcher {
    /// Literal value, numeric comparison tolerant of int/float mix.
    Const(Value),
    /// `r"..."`: the value must be a string fully matched by the regex.
    Regex(fancy_regex::Regex),
    /// `*`: any value.
    Wildcard,
    /// `<EMAIL_ADDRESS>`, `<MODERATED>`, ...: value flagged by a detector.
    ValueClass(String),
    /// `{key: sub, ...}`: each given key must match; extra keys ignored.
    Dict(Vec<(String, Matcher)>),
    /// `[sub, ...]`: positional prefix match; extra elements ignored.
    List(Vec<Matcher>),
}

/// Compiled `tool:name(args)` pattern.
#[derive(Debug)]
pub struct ToolCallMatcher {
    /// `None` matches any tool.
    pub tool: Option<String>,
    /// Matcher for `function.arguments`; `None` accepts any arguments.
    pub arguments: Option<Matcher>,
}

/// Compiles the argument list of a semantic pattern.
pub fn compile_tool_call_matcher(
    tool: &Option<String>,
    args: &[Expr],
    span: Span,
) -> Result<ToolCallMatcher, CompileError> {
    let arguments = match args.len() {
        0 => None,
        1 => Some(compile_matcher(&args[0])?),
        n => {
            return Err(CompileError::Type {
                line: span.line,
                column: span.column,
                message: format!(
                    "semantic patterns take at most one argument pattern, found {n}"
                ),
            })
        }
    };
    Ok(ToolCallMatcher {
        tool: tool.clone(),
        arguments,
    })
}

fn compile_matcher(expr: &Expr) -> Result<Matcher, CompileError> {
    let type_err = |message: String| CompileError::Type {
        line: expr.span.line,
        column: expr.span.column,
        message,
    };

    match &expr.kind {
        ExprKind::Str(s) => Ok(Matcher::Const(Value::String(s.clone()))),
        ExprKind::Int(v) => Ok(Matcher::Const(Value::from(*v))),
        ExprKind::Float(v) => Ok(Matcher::Const(Value::from(*v))),
        ExprKind::Bool(v) => Ok(Matcher::Const(Value::Bool(*v))),
        ExprKind::Null => Ok(Matcher::Const(Value::Null)),
        ExprKind::Wildcard => Ok(Matcher::Wildcard),
        ExprKind::RegexLit(src) => {
            let anchored = format!(r"\A(?:{src})\z");
            let regex = fancy_regex::Regex::new(&anchored)
                .map_err(|e| type_err(format!("invalid regex pattern '{src}': {e}")))?;
            Ok(Matcher::Regex(regex))
        }
        ExprKind::ValueRef(class) => {
            if class == "MODERATED" || PII_CLASSES.contains(&class.as_str()) {
                Ok(Matcher::ValueClass(class.clone()))
            } else {
                Err(type_err(format!(
                    "unsupported value type <{class}>; available: {} MODERATED",
                    PII_CLASSES.join(" ")
                )))
            }
        }
        ExprKind::Object(entries) => {
            let mut compiled = Vec::with_capacity(entries.len());
            for (key, value) in entries {
                compiled.push((key.clone(), compile_matcher(value)?));
            }
            Ok(Matcher::Dict(compiled))
        }
        ExprKind::List(items) => {
            let compiled = items
                .iter()
                .map(compile_matcher)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Matcher::List(compiled))
        }
        ExprKind::Unary {
            op: UnaryOp::Neg,
            expr: inner,
        } => match &inner.kind {
            ExprKind::Int(v) => Ok(Matcher::Const(Value::from(-v))),
            ExprKind::Float(v) => Ok(Matcher::Const(Value::from(-v))),
            _ => Err(type_err("only numbers may be negated in a pattern".to_string())),
        },
        other => Err(type_err(format!(
            "unsupported construct in semantic pattern: {other:?}"
        ))),
    }
}

impl ToolCallMatcher {
    /// Unifies the pattern against an event.
    ///
    /// A tool output with a resolved call matches through to that call.
    /// Non-call events never match.
    pub fn match_event(
        &self,
        trace: &Trace,
        event: EventId,
        registry: &DetectorRegistry,
        ranges: &mut Vec<Range>,
        warnings: &mut Vec<Warning>,
    ) -> Truth {
        let node = trace.node(event);
        let call_id = match (node.as_tool_call(), node.as_tool_output()) {
            (Some(_), _) => event,
            (None, Some(output)) => match output.call {
                Some(call) => call,
                None => return Truth::False,
            },
            _ => return Truth::False,
        };

        let call_node = trace.node(call_id);
        let Some(call) = call_node.as_tool_call() else {
            return Truth::False;
        };

        if let Some(expected) = &self.tool {
            if &call.name != expected {
                return Truth::False;
            }
        }

        let Some(matcher) = &self.arguments else {
            ranges.push(Range::object(call_id, call_node.json_path.clone()));
            return Truth::True;
        };

        let args_path = join_path(&call_node.json_path, "function.arguments");
        let mut matched = Vec::new();
        let outcome = match_value(
            matcher,
            &call.arguments,
            call_id,
            &args_path,
            registry,
            &mut matched,
            warnings,
        );
        if outcome == Truth::True {
            ranges.push(Range::object(call_id, call_node.json_path.clone()));
            ranges.extend(matched);
        }
        outcome
    }
}

fn match_value(
    matcher: &Matcher,
    value: &Value,
    event: EventId,
    path: &str,
    registry: &DetectorRegistry,
    ranges: &mut Vec<Range>,
    warnings: &mut Vec<Warning>,
) -> Truth {
    match matcher {
        Matcher::Wildcard => {
            ranges.push(Range::object(event, path));
            Truth::True
        }
        Matcher::Const(expected) => {
            if values_equal(expected, value) {
                ranges.push(Range::object(event, path));
                Truth::True
            } else {
                Truth::False
            }
        }
        Matcher::Regex(regex) => match value.as_str() {
            Some(s) => match regex.is_match(s) {
                Ok(true) => {
                    ranges.push(Range::object(event, path));
                    Truth::True
                }
                Ok(false) => Truth::False,
                Err(e) => {
                    warnings.push(Warning::new(
                        WarningKind::Evaluation,
                        format!("regex match failed at {path}: {e}"),
                    ));
                    Truth::Unknown
                }
            },
            None => Truth::False,
        },
        Matcher::ValueClass(class) => match_value_class(class, value, event, path, registry, ranges, warnings),
        Matcher::Dict(entries) => {
            let Some(obj) = value.as_object() else {
                return Truth::False;
            };
            let mut result = Truth::True;
            for (key, sub) in entries {
                let outcome = match obj.get(key) {
                    Some(field) => match_value(
                        sub,
                        field,
                        event,
                        &join_path(path, key),
                        registry,
                        ranges,
                        warnings,
                    ),
                    // an omitted key only matches a wildcard subpattern
                    None if matches!(sub, Matcher::Wildcard) => Truth::True,
                    None => Truth::False,
                };
                match outcome {
                    Truth::False => return Truth::False,
                    Truth::Unknown => result = Truth::Unknown,
                    Truth::True => {}
                }
            }
            result
        }
        Matcher::List(elements) => {
            let Some(items) = value.as_array() else {
                return Truth::False;
            };
            if items.len() < elements.len() {
                return Truth::False;
            }
            let mut result = Truth::True;
            for (idx, (sub, item)) in elements.iter().zip(items).enumerate() {
                match match_value(
                    sub,
                    item,
                    event,
                    &join_path(path, &idx.to_string()),
                    registry,
                    ranges,
                    warnings,
                ) {
                    Truth::False => return Truth::False,
                    Truth::Unknown => result = Truth::Unknown,
                    Truth::True => {}
                }
            }
            result
        }
    }
}

fn match_value_class(
    class: &str,
    value: &Value,
    event: EventId,
    path: &str,
    registry: &DetectorRegistry,
    ranges: &mut Vec<Range>,
    warnings: &mut Vec<Warning>,
) -> Truth {
    if !value.is_string() {
        return Truth::False;
    }

    let (detector, options) = if class == "MODERATED" {
        ("moderated", DetectorOptions::new())
    } else {
        let mut options = DetectorOptions::new();
        options.insert("entity".to_string(), Value::String(class.to_string()));
        ("pii", options)
    };

    match registry.detect(detector, value, &options) {
        Ok(DetectorVerdict::Flagged(true)) => {
            ranges.push(Range::object(event, path));
            Truth::True
        }
        Ok(DetectorVerdict::Flagged(false)) => Truth::False,
        Ok(DetectorVerdict::Hits(hits)) => {
            let matching: Vec<_> = hits.into_iter().filter(|h| h.tag == class).collect();
            if matching.is_empty() {
                return Truth::False;
            }
            for hit in matching {
                ranges.push(Range::span(event, path, hit.start, hit.end));
            }
            Truth::True
        }
        Err(err) => {
            let kind = match err {
                DetectorError::Unavailable(_) => WarningKind::DetectorUnavailable,
                _ => WarningKind::DetectorFailed,
            };
            warnings.push(Warning::new(kind, err.to_string()));
            Truth::Unknown
        }
    }
}
