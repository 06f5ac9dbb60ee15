//! Rule evaluator: typed generate-and-filter over the event set.
//!
//! Each compiled rule is a sequence of generator and filter steps. The
//! evaluator walks them depth-first, binding generator variables to trace
//! events (or collection members) in trace order and pruning a branch at
//! the first failing filter. Filters are three-valued: a detector that is
//! unavailable or fails makes its atom *unknown*, which skips the binding
//! and records a warning instead of failing the analysis.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use serde_json::{Map, Value};

use tracewarden_trace::value::{
    compare_values, decode_embedded_json, num_f64, truthy, values_equal,
};
use tracewarden_trace::{join_path, Dataflow, EventBody, EventId, Range, Trace};

use crate::ast::{BinaryOp, Expr, ExprKind, UnaryOp};
use crate::compiled::{CompiledPolicy, CompiledRule, Domain, ErrorCtor, RuleId, Step};
use crate::compiler::INPUT_IDENT;
use crate::detectors::{DetectorError, DetectorOptions, DetectorRegistry, DetectorVerdict};
use crate::error::{PolicyViolation, Warning, WarningKind};
use crate::types::Type;

/// Three-valued logic of rule atoms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    pub fn from_bool(b: bool) -> Truth {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }

    pub fn negate(self) -> Truth {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Unknown => Truth::Unknown,
        }
    }
}

/// Provenance of a value extracted from the trace.
#[derive(Debug, Clone)]
pub struct Origin {
    pub event: EventId,
    /// Full dotted path from the trace root.
    pub path: String,
}

/// Runtime value of the evaluator.
#[derive(Debug, Clone)]
pub enum EvalValue {
    /// Result of an atom that could not be decided.
    Unknown,
    /// A bound trace event.
    Event(EventId),
    /// A list of trace events (e.g. `message.tool_calls`).
    Events(Vec<EventId>),
    /// Plain data, with provenance when it was read out of the trace.
    Data {
        value: Value,
        origin: Option<Origin>,
    },
}

impl EvalValue {
    fn data(value: Value) -> EvalValue {
        EvalValue::Data {
            value,
            origin: None,
        }
    }

    fn bool(b: bool) -> EvalValue {
        EvalValue::data(Value::Bool(b))
    }

    fn from_truth(truth: Truth) -> EvalValue {
        match truth {
            Truth::Unknown => EvalValue::Unknown,
            t => EvalValue::bool(t == Truth::True),
        }
    }
}

/// A violation as produced by the evaluator, before handler routing.
#[derive(Debug)]
pub struct EmittedViolation {
    pub violation: PolicyViolation,
    /// Identities of the events bound when the rule fired, sorted.
    pub bound_events: Vec<EventId>,
}

/// Raw result of evaluating a policy over a trace.
#[derive(Debug, Default)]
pub struct EvalOutcome {
    pub violations: Vec<EmittedViolation>,
    pub warnings: Vec<Warning>,
    pub cancelled: bool,
    /// Rules that ran to completion; violations of interrupted rules must
    /// not be committed to monitor state.
    pub completed_rules: Vec<RuleId>,
}

/// Evaluates every rule of a policy against a trace.
pub fn evaluate_policy(
    policy: &CompiledPolicy,
    trace: &Trace,
    dataflow: &Dataflow,
    registry: &DetectorRegistry,
    parameters: &BTreeMap<String, Value>,
    cancel: Option<&AtomicBool>,
) -> EvalOutcome {
    let mut outcome = EvalOutcome::default();

    for rule in &policy.rules {
        if cancel.map_or(false, |c| c.load(Ordering::Relaxed)) {
            outcome.cancelled = true;
            break;
        }

        let mut eval = RuleEval {
            policy,
            rule,
            trace,
            dataflow,
            registry,
            parameters,
            cancel,
            slots: vec![None; rule.vars.len()],
            locals: Vec::new(),
            ranges: Vec::new(),
            depth: 0,
            violations: Vec::new(),
            warnings: Vec::new(),
            cancelled: false,
        };
        eval.run(0);
        debug!(
            "rule {} produced {} violation(s)",
            rule.id,
            eval.violations.len()
        );

        outcome.violations.append(&mut eval.violations);
        outcome.warnings.append(&mut eval.warnings);
        if eval.cancelled {
            outcome.cancelled = true;
            break;
        }
        outcome.completed_rules.push(rule.id);
    }

    outcome
}

struct RuleEval<'a> {
    policy: &'a CompiledPolicy,
    rule: &'a CompiledRule,
    trace: &'a Trace,
    dataflow: &'a Dataflow,
    registry: &'a DetectorRegistry,
    parameters: &'a BTreeMap<String, Value>,
    cancel: Option<&'a AtomicBool>,
    slots: Vec<Option<EvalValue>>,
    /// Predicate-parameter overlay, innermost last.
    locals: Vec<(String, EvalValue)>,
    ranges: Vec<Range>,
    depth: usize,
    violations: Vec<EmittedViolation>,
    warnings: Vec<Warning>,
    cancelled: bool,
}

const MAX_EVAL_DEPTH: usize = 64;

impl<'a> RuleEval<'a> {
    fn run(&mut self, step: usize) {
        if self.cancelled {
            return;
        }
        if step == self.rule.steps.len() {
            self.emit();
            return;
        }

        match &self.rule.steps[step] {
            Step::Filter { expr, .. } => {
                let before = self.ranges.len();
                if self.truth_of(expr) == Truth::True {
                    self.run(step + 1);
                }
                self.ranges.truncate(before);
            }
            Step::Generate { var, domain } => {
                let candidates = self.domain_values(domain);
                for value in candidates {
                    if self.check_cancel() {
                        return;
                    }
                    self.slots[*var] = Some(value);
                    let before = self.ranges.len();
                    self.run(step + 1);
                    self.ranges.truncate(before);
                    self.slots[*var] = None;
                }
            }
        }
    }

    fn check_cancel(&mut self) -> bool {
        if self.cancel.map_or(false, |c| c.load(Ordering::Relaxed)) {
            self.cancelled = true;
        }
        self.cancelled
    }

    // ---- model completion ----

    fn emit(&mut self) {
        let mut bound_events: Vec<EventId> = self
            .slots
            .iter()
            .filter_map(|slot| match slot {
                Some(EvalValue::Event(id)) => Some(*id),
                _ => None,
            })
            .collect();
        bound_events.sort_unstable();
        bound_events.dedup();

        let mut ranges = self.ranges.clone();
        for &id in &bound_events {
            ranges.push(Range::object(id, self.trace.node(id).json_path.clone()));
        }
        let mut seen = HashSet::new();
        ranges.retain(|r| seen.insert(r.clone()));

        let violation = match &self.rule.ctor {
            ErrorCtor::Literal(message) => PolicyViolation {
                kind: "PolicyViolation".to_string(),
                message: message.clone(),
                fields: BTreeMap::new(),
                ranges,
                origin_rule: self.rule.id,
            },
            ErrorCtor::Call { kind, args, kwargs } => {
                let mut parts = Vec::new();
                for arg in args {
                    match self.eval(arg) {
                        Ok(value) => parts.push(self.display(&value)),
                        Err(warning) => {
                            self.warn(warning);
                            return;
                        }
                    }
                }
                let mut fields = BTreeMap::new();
                for (key, expr) in kwargs {
                    match self.eval(expr) {
                        Ok(value) => {
                            let Some(json) = self.to_json(&value) else {
                                self.warn(Warning::new(
                                    WarningKind::Evaluation,
                                    format!("error field '{key}' could not be evaluated"),
                                ));
                                return;
                            };
                            fields.insert(key.clone(), json);
                        }
                        Err(warning) => {
                            self.warn(warning);
                            return;
                        }
                    }
                }
                PolicyViolation {
                    kind: kind.clone(),
                    message: parts.join(" "),
                    fields,
                    ranges,
                    origin_rule: self.rule.id,
                }
            }
        };

        self.violations.push(EmittedViolation {
            violation,
            bound_events,
        });
    }

    fn display(&self, value: &EvalValue) -> String {
        match value {
            EvalValue::Unknown => "<unknown>".to_string(),
            EvalValue::Event(id) => {
                let node = self.trace.node(*id);
                format!("<{} at {}>", node.kind().as_str(), node.json_path)
            }
            EvalValue::Events(ids) => format!("<{} events>", ids.len()),
            EvalValue::Data { value, .. } => match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        }
    }

    fn to_json(&self, value: &EvalValue) -> Option<Value> {
        match value {
            EvalValue::Unknown => None,
            EvalValue::Event(id) => Some(self.event_json(*id)),
            EvalValue::Events(ids) => {
                Some(Value::Array(ids.iter().map(|id| self.event_json(*id)).collect()))
            }
            EvalValue::Data { value, .. } => Some(value.clone()),
        }
    }

    /// Raw JSON of an event node, resolved through its json path.
    fn event_json(&self, id: EventId) -> Value {
        let node = self.trace.node(id);
        let mut segments = node.json_path.split('.');
        let Some(first) = segments.next().and_then(|s| s.parse::<usize>().ok()) else {
            return Value::Null;
        };
        let mut current = match self.trace.raw().get(first) {
            Some(v) => v,
            None => return Value::Null,
        };
        for segment in segments {
            current = match (segment.parse::<usize>(), current) {
                (Ok(idx), Value::Array(items)) => match items.get(idx) {
                    Some(v) => v,
                    None => return Value::Null,
                },
                (_, Value::Object(map)) => match map.get(segment) {
                    Some(v) => v,
                    None => return Value::Null,
                },
                _ => return Value::Null,
            };
        }
        current.clone()
    }

    // ---- domains ----

    fn domain_values(&mut self, domain: &Domain) -> Vec<EvalValue> {
        match domain {
            Domain::Events(ty) => self
                .trace
                .select(ty.event_kind())
                .into_iter()
                .map(EvalValue::Event)
                .collect(),
            Domain::Members { expr, ty } => {
                let value = match self.eval(expr) {
                    Ok(v) => v,
                    Err(warning) => {
                        self.warn(warning);
                        return Vec::new();
                    }
                };
                match value {
                    EvalValue::Events(ids) => ids
                        .into_iter()
                        .filter(|id| match ty.event_kind() {
                            Some(kind) => self.trace.node(*id).kind() == kind,
                            None => true,
                        })
                        .map(EvalValue::Event)
                        .collect(),
                    EvalValue::Data { value, origin } => match value {
                        Value::Array(items) => items
                            .into_iter()
                            .enumerate()
                            .filter(|(_, item)| type_matches(*ty, item))
                            .map(|(idx, item)| EvalValue::Data {
                                value: item,
                                origin: origin.as_ref().map(|o| Origin {
                                    event: o.event,
                                    path: join_path(&o.path, &idx.to_string()),
                                }),
                            })
                            .collect(),
                        Value::Object(map) => map
                            .into_iter()
                            .filter(|(_, item)| type_matches(*ty, item))
                            .map(|(key, item)| EvalValue::Data {
                                value: item,
                                origin: origin.as_ref().map(|o| Origin {
                                    event: o.event,
                                    path: join_path(&o.path, &key),
                                }),
                            })
                            .collect(),
                        _ => Vec::new(),
                    },
                    _ => Vec::new(),
                }
            }
        }
    }

    // ---- expression evaluation ----

    fn truth_of(&mut self, expr: &Expr) -> Truth {
        match self.eval(expr) {
            Ok(EvalValue::Data { value, .. }) => Truth::from_bool(truthy(&value)),
            Ok(EvalValue::Event(_)) | Ok(EvalValue::Events(_)) => Truth::True,
            Ok(EvalValue::Unknown) => Truth::Unknown,
            Err(warning) => {
                self.warn(warning);
                Truth::Unknown
            }
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<EvalValue, Warning> {
        match &expr.kind {
            ExprKind::Null => Ok(EvalValue::data(Value::Null)),
            ExprKind::Bool(b) => Ok(EvalValue::data(Value::Bool(*b))),
            ExprKind::Int(v) => Ok(EvalValue::data(Value::from(*v))),
            ExprKind::Float(v) => Ok(EvalValue::data(Value::from(*v))),
            ExprKind::Str(s) | ExprKind::RegexLit(s) => {
                Ok(EvalValue::data(Value::String(s.clone())))
            }
            ExprKind::Ident(name) => self.resolve(name, expr),
            ExprKind::Member { expr: inner, name } => {
                let base = self.eval(inner)?;
                self.member(base, name)
            }
            ExprKind::Index { expr: inner, index } => {
                let base = self.eval(inner)?;
                let key = self.eval(index)?;
                self.index(base, key)
            }
            ExprKind::Unary { op, expr: inner } => match op {
                UnaryOp::Not => {
                    let truth = self.truth_of(inner);
                    Ok(EvalValue::from_truth(truth.negate()))
                }
                UnaryOp::Neg | UnaryOp::Pos => {
                    let value = self.eval(inner)?;
                    match value {
                        EvalValue::Unknown => Ok(EvalValue::Unknown),
                        EvalValue::Data {
                            value: Value::Number(n),
                            ..
                        } => {
                            if *op == UnaryOp::Pos {
                                Ok(EvalValue::data(Value::Number(n)))
                            } else if let Some(i) = n.as_i64() {
                                Ok(EvalValue::data(Value::from(-i)))
                            } else {
                                Ok(number(-num_f64(&n)))
                            }
                        }
                        _ => Err(Warning::new(
                            WarningKind::Evaluation,
                            "unary arithmetic on a non-number",
                        )),
                    }
                }
            },
            ExprKind::Binary { op, left, right } => self.binary(*op, left, right),
            ExprKind::Call { target, args, kwargs } => self.call(target, args, kwargs),
            ExprKind::Object(entries) => {
                let mut map = Map::new();
                for (key, value_expr) in entries {
                    let value = self.eval(value_expr)?;
                    match self.to_json(&value) {
                        Some(json) => {
                            map.insert(key.clone(), json);
                        }
                        None => return Ok(EvalValue::Unknown),
                    }
                }
                Ok(EvalValue::data(Value::Object(map)))
            }
            ExprKind::List(items) => {
                let mut values = Vec::new();
                for item in items {
                    let value = self.eval(item)?;
                    match self.to_json(&value) {
                        Some(json) => values.push(json),
                        None => return Ok(EvalValue::Unknown),
                    }
                }
                Ok(EvalValue::data(Value::Array(values)))
            }
            ExprKind::PatternRef(_) => Err(Warning::new(
                WarningKind::Evaluation,
                "semantic pattern used outside an 'is' comparison",
            )),
            other => Err(Warning::new(
                WarningKind::Evaluation,
                format!("expression {other:?} cannot be evaluated"),
            )),
        }
    }

    fn resolve(&mut self, name: &str, expr: &Expr) -> Result<EvalValue, Warning> {
        for (local, value) in self.locals.iter().rev() {
            if local == name {
                return Ok(value.clone());
            }
        }
        if let Some(var) = self.rule.var_id(name) {
            if let Some(value) = &self.slots[var] {
                return Ok(value.clone());
            }
            // variable declared but not bound on this path (e.g. referenced
            // from a predicate argument before its generator ran)
            return Ok(EvalValue::Unknown);
        }
        if name == INPUT_IDENT {
            let map: Map<String, Value> = self
                .parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            return Ok(EvalValue::data(Value::Object(map)));
        }
        if let Some(constant) = self.policy.constants.get(name) {
            if self.depth >= MAX_EVAL_DEPTH {
                return Err(Warning::new(
                    WarningKind::Evaluation,
                    format!("constant '{name}' expands too deeply"),
                ));
            }
            self.depth += 1;
            let result = self.eval(&constant.clone());
            self.depth -= 1;
            return result;
        }
        Err(Warning::new(
            WarningKind::Evaluation,
            format!(
                "'{name}' has no value here (line {})",
                expr.span.line
            ),
        ))
    }

    fn member(&mut self, base: EvalValue, name: &str) -> Result<EvalValue, Warning> {
        match base {
            EvalValue::Unknown => Ok(EvalValue::Unknown),
            EvalValue::Event(id) => self.event_member(id, name),
            EvalValue::Data { value, origin } => match value {
                Value::Object(map) => match map.get(name) {
                    Some(field) => Ok(EvalValue::Data {
                        value: field.clone(),
                        origin: origin.map(|o| Origin {
                            event: o.event,
                            path: join_path(&o.path, name),
                        }),
                    }),
                    None => Err(Warning::new(
                        WarningKind::Evaluation,
                        format!("could not find key '{name}'"),
                    )),
                },
                ref s @ Value::String(_) => match decode_embedded_json(s) {
                    Some(Value::Object(map)) => match map.get(name) {
                        // provenance stays at the string; offsets into a
                        // decoded copy would not localize
                        Some(field) => Ok(EvalValue::Data {
                            value: field.clone(),
                            origin,
                        }),
                        None => Err(Warning::new(
                            WarningKind::Evaluation,
                            format!("could not find key '{name}'"),
                        )),
                    },
                    _ => Err(Warning::new(
                        WarningKind::Evaluation,
                        format!("cannot access member '{name}' on a string"),
                    )),
                },
                _ => Err(Warning::new(
                    WarningKind::Evaluation,
                    format!("cannot access member '{name}' on this value"),
                )),
            },
            EvalValue::Events(_) => Err(Warning::new(
                WarningKind::Evaluation,
                format!("cannot access member '{name}' on an event list"),
            )),
        }
    }

    fn event_member(&mut self, id: EventId, name: &str) -> Result<EvalValue, Warning> {
        let node = self.trace.node(id);
        let path = &node.json_path;
        match (&node.body, name) {
            (EventBody::Message(m), "role") => {
                Ok(EvalValue::data(Value::String(m.role.clone())))
            }
            (EventBody::Message(m), "content") => Ok(EvalValue::Data {
                value: m.content.clone().unwrap_or(Value::Null),
                origin: Some(Origin {
                    event: id,
                    path: join_path(path, "content"),
                }),
            }),
            (EventBody::Message(m), "tool_calls") => Ok(EvalValue::Events(m.tool_calls.clone())),
            (EventBody::ToolCall(c), "id") => {
                Ok(EvalValue::data(Value::String(c.call_id.clone())))
            }
            (EventBody::ToolCall(c), "type") => {
                Ok(EvalValue::data(Value::String(c.call_type.clone())))
            }
            (EventBody::ToolCall(c), "function") => {
                let mut map = Map::new();
                map.insert("name".to_string(), Value::String(c.name.clone()));
                map.insert("arguments".to_string(), c.arguments.clone());
                Ok(EvalValue::Data {
                    value: Value::Object(map),
                    origin: Some(Origin {
                        event: id,
                        path: join_path(path, "function"),
                    }),
                })
            }
            (EventBody::ToolOutput(o), "role") => {
                Ok(EvalValue::data(Value::String(o.role.clone())))
            }
            (EventBody::ToolOutput(o), "content") => Ok(EvalValue::Data {
                value: o.content.clone().unwrap_or(Value::Null),
                origin: Some(Origin {
                    event: id,
                    path: join_path(path, "content"),
                }),
            }),
            (EventBody::ToolOutput(o), "tool_call_id") => Ok(EvalValue::data(
                o.tool_call_id
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            )),
            _ => Err(Warning::new(
                WarningKind::Evaluation,
                format!("{} has no member '{name}'", node.kind().as_str()),
            )),
        }
    }

    fn index(&mut self, base: EvalValue, key: EvalValue) -> Result<EvalValue, Warning> {
        let key_value = match key {
            EvalValue::Unknown => return Ok(EvalValue::Unknown),
            EvalValue::Data { value, .. } => value,
            _ => {
                return Err(Warning::new(
                    WarningKind::Evaluation,
                    "events cannot be used as an index",
                ))
            }
        };
        match base {
            EvalValue::Unknown => Ok(EvalValue::Unknown),
            EvalValue::Events(ids) => match key_value.as_u64() {
                Some(idx) => match ids.get(idx as usize) {
                    Some(id) => Ok(EvalValue::Event(*id)),
                    None => Err(Warning::new(
                        WarningKind::Evaluation,
                        format!("event index {idx} out of bounds"),
                    )),
                },
                None => Err(Warning::new(
                    WarningKind::Evaluation,
                    "event lists are indexed by integers",
                )),
            },
            EvalValue::Event(_) => Err(Warning::new(
                WarningKind::Evaluation,
                "events cannot be indexed",
            )),
            EvalValue::Data { value, origin } => {
                // embedded JSON decodes on first dereference
                let (value, origin) = match decode_embedded_json(&value) {
                    Some(decoded) => (decoded, origin),
                    None => (value, origin),
                };
                match (&value, &key_value) {
                    (Value::Object(map), Value::String(key)) => match map.get(key) {
                        Some(field) => Ok(EvalValue::Data {
                            value: field.clone(),
                            origin: origin.map(|o| Origin {
                                event: o.event,
                                path: join_path(&o.path, key),
                            }),
                        }),
                        None => Err(Warning::new(
                            WarningKind::Evaluation,
                            format!("could not find key '{key}'"),
                        )),
                    },
                    (Value::Array(items), Value::Number(n)) => {
                        let idx = n.as_u64().unwrap_or(u64::MAX) as usize;
                        match items.get(idx) {
                            Some(item) => Ok(EvalValue::Data {
                                value: item.clone(),
                                origin: origin.map(|o| Origin {
                                    event: o.event,
                                    path: join_path(&o.path, &idx.to_string()),
                                }),
                            }),
                            None => Err(Warning::new(
                                WarningKind::Evaluation,
                                format!("list index {idx} out of bounds"),
                            )),
                        }
                    }
                    _ => Err(Warning::new(
                        WarningKind::Evaluation,
                        "value does not support this index",
                    )),
                }
            }
        }
    }

    fn binary(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
    ) -> Result<EvalValue, Warning> {
        use BinaryOp::*;

        // lazy boolean connectives
        match op {
            And => {
                return Ok(EvalValue::from_truth(match self.truth_of(left) {
                    Truth::False => Truth::False,
                    Truth::True => self.truth_of(right),
                    Truth::Unknown => match self.truth_of(right) {
                        Truth::False => Truth::False,
                        _ => Truth::Unknown,
                    },
                }))
            }
            Or => {
                return Ok(EvalValue::from_truth(match self.truth_of(left) {
                    Truth::True => Truth::True,
                    Truth::False => self.truth_of(right),
                    Truth::Unknown => match self.truth_of(right) {
                        Truth::True => Truth::True,
                        _ => Truth::Unknown,
                    },
                }))
            }
            Is | IsNot => {
                let truth = self.eval_is(left, right)?;
                return Ok(EvalValue::from_truth(if op == IsNot {
                    truth.negate()
                } else {
                    truth
                }));
            }
            Flow => return self.eval_flow(left, right),
            _ => {}
        }

        let lhs = self.eval(left)?;
        let rhs = self.eval(right)?;
        if matches!(lhs, EvalValue::Unknown) || matches!(rhs, EvalValue::Unknown) {
            return Ok(EvalValue::Unknown);
        }

        match op {
            In => self.eval_in(lhs, rhs),
            Eq | Ne => {
                let equal = match (&lhs, &rhs) {
                    (EvalValue::Event(a), EvalValue::Event(b)) => a == b,
                    (EvalValue::Data { value: a, .. }, EvalValue::Data { value: b, .. }) => {
                        values_equal(a, b)
                    }
                    _ => false,
                };
                Ok(EvalValue::bool(if op == Eq { equal } else { !equal }))
            }
            Lt | Le | Gt | Ge => {
                let (EvalValue::Data { value: a, .. }, EvalValue::Data { value: b, .. }) =
                    (&lhs, &rhs)
                else {
                    return Err(Warning::new(
                        WarningKind::Evaluation,
                        format!("cannot order values with '{}'", op.symbol()),
                    ));
                };
                match compare_values(a, b) {
                    Some(ordering) => {
                        let holds = match op {
                            Lt => ordering.is_lt(),
                            Le => ordering.is_le(),
                            Gt => ordering.is_gt(),
                            _ => ordering.is_ge(),
                        };
                        Ok(EvalValue::bool(holds))
                    }
                    None => Err(Warning::new(
                        WarningKind::Evaluation,
                        format!(
                            "cannot compare {} and {} with '{}'",
                            type_name(a),
                            type_name(b),
                            op.symbol()
                        ),
                    )),
                }
            }
            Add | Sub | Mul | Div | Rem => {
                let (EvalValue::Data { value: a, .. }, EvalValue::Data { value: b, .. }) =
                    (&lhs, &rhs)
                else {
                    return Err(Warning::new(
                        WarningKind::Evaluation,
                        "arithmetic on non-data values",
                    ));
                };
                arith(op, a, b).map(EvalValue::data).map_err(|message| {
                    Warning::new(WarningKind::Evaluation, message)
                })
            }
            And | Or | Is | IsNot | Flow => unreachable!("handled above"),
        }
    }

    fn eval_is(&mut self, left: &Expr, right: &Expr) -> Result<Truth, Warning> {
        // `x is tool:name({...})`
        if let ExprKind::PatternRef(idx) = &right.kind {
            let lhs = self.eval(left)?;
            return Ok(match lhs {
                EvalValue::Unknown => Truth::Unknown,
                EvalValue::Event(id) => {
                    let matcher = &self.rule.matchers[*idx];
                    matcher.match_event(
                        self.trace,
                        id,
                        self.registry,
                        &mut self.ranges,
                        &mut self.warnings,
                    )
                }
                _ => Truth::False,
            });
        }
        // `x is None` / `x is not None`
        if let ExprKind::Null = &right.kind {
            let lhs = self.eval(left)?;
            return Ok(match lhs {
                EvalValue::Unknown => Truth::Unknown,
                EvalValue::Data {
                    value: Value::Null, ..
                } => Truth::True,
                _ => Truth::False,
            });
        }
        // identity on anything else degrades to equality
        let lhs = self.eval(left)?;
        let rhs = self.eval(right)?;
        Ok(match (&lhs, &rhs) {
            (EvalValue::Unknown, _) | (_, EvalValue::Unknown) => Truth::Unknown,
            (EvalValue::Event(a), EvalValue::Event(b)) => Truth::from_bool(a == b),
            (EvalValue::Data { value: a, .. }, EvalValue::Data { value: b, .. }) => {
                Truth::from_bool(values_equal(a, b))
            }
            _ => Truth::False,
        })
    }

    fn eval_flow(&mut self, left: &Expr, right: &Expr) -> Result<EvalValue, Warning> {
        let lhs = self.eval(left)?;
        let rhs = self.eval(right)?;
        match (lhs, rhs) {
            (EvalValue::Unknown, _) | (_, EvalValue::Unknown) => Ok(EvalValue::Unknown),
            (EvalValue::Event(a), EvalValue::Event(b)) => {
                Ok(EvalValue::bool(self.dataflow.has_flow(a, b)))
            }
            _ => Err(Warning::new(
                WarningKind::Evaluation,
                "'->' relates trace events",
            )),
        }
    }

    fn eval_in(&mut self, lhs: EvalValue, rhs: EvalValue) -> Result<EvalValue, Warning> {
        match rhs {
            EvalValue::Events(ids) => Ok(match lhs {
                EvalValue::Event(id) => EvalValue::bool(ids.contains(&id)),
                _ => EvalValue::bool(false),
            }),
            EvalValue::Event(_) => Err(Warning::new(
                WarningKind::Evaluation,
                "'in' requires a collection or string on the right",
            )),
            EvalValue::Unknown => Ok(EvalValue::Unknown),
            EvalValue::Data { value, origin } => {
                let needle = match &lhs {
                    EvalValue::Data { value, .. } => value,
                    EvalValue::Unknown => return Ok(EvalValue::Unknown),
                    _ => return Ok(EvalValue::bool(false)),
                };
                match &value {
                    // membership in null is false, not an error
                    Value::Null => Ok(EvalValue::bool(false)),
                    Value::String(haystack) => {
                        let Some(sub) = needle.as_str() else {
                            return Ok(EvalValue::bool(false));
                        };
                        let found = self.mark_occurrences(haystack, sub, origin.as_ref());
                        Ok(EvalValue::bool(found))
                    }
                    Value::Array(items) => Ok(EvalValue::bool(
                        items.iter().any(|item| values_equal(item, needle)),
                    )),
                    Value::Object(map) => Ok(EvalValue::bool(
                        needle
                            .as_str()
                            .map(|key| map.contains_key(key))
                            .unwrap_or(false),
                    )),
                    _ => Ok(EvalValue::bool(false)),
                }
            }
        }
    }

    /// Substring containment; every occurrence is marked as a character
    /// span when the haystack has trace provenance.
    fn mark_occurrences(&mut self, haystack: &str, needle: &str, origin: Option<&Origin>) -> bool {
        if needle.is_empty() {
            return true;
        }
        let mut found = false;
        for (byte_start, _) in haystack.match_indices(needle) {
            found = true;
            if let Some(origin) = origin {
                let start = haystack[..byte_start].chars().count();
                let end = start + needle.chars().count();
                self.ranges
                    .push(Range::span(origin.event, origin.path.clone(), start, end));
            }
        }
        found
    }

    // ---- calls ----

    fn call(
        &mut self,
        target: &Expr,
        args: &[Expr],
        kwargs: &[(String, Expr)],
    ) -> Result<EvalValue, Warning> {
        let ExprKind::Ident(name) = &target.kind else {
            return Err(Warning::new(
                WarningKind::Evaluation,
                "only named functions can be called",
            ));
        };

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }

        match name.as_str() {
            "match" => self.builtin_match(&values),
            "find" => self.builtin_find(&values),
            "len" => self.builtin_len(&values),
            "empty" => self.builtin_len(&values).map(|v| match v {
                EvalValue::Data { value, .. } => {
                    EvalValue::bool(value.as_u64() == Some(0))
                }
                other => other,
            }),
            _ => {
                if self.policy.predicates.contains_key(name) {
                    return self.call_predicate(name, values, kwargs);
                }
                if self.policy.imports.contains_key(name) {
                    return self.call_detector(name, values, kwargs);
                }
                Err(Warning::new(
                    WarningKind::Evaluation,
                    format!("'{name}' is not callable"),
                ))
            }
        }
    }

    fn builtin_match(&mut self, args: &[EvalValue]) -> Result<EvalValue, Warning> {
        let (Some(pattern), Some(text)) = (string_arg(args, 0), string_arg(args, 1)) else {
            if args.iter().any(|a| matches!(a, EvalValue::Unknown)) {
                return Ok(EvalValue::Unknown);
            }
            return Err(Warning::new(
                WarningKind::Evaluation,
                "match(pattern, text) expects two strings",
            ));
        };
        let regex = fancy_regex::Regex::new(&format!(r"\A(?:{pattern})"))
            .map_err(|e| Warning::new(WarningKind::Evaluation, format!("invalid regex: {e}")))?;
        match regex.is_match(&text) {
            Ok(matched) => Ok(EvalValue::bool(matched)),
            Err(e) => Err(Warning::new(
                WarningKind::Evaluation,
                format!("regex match failed: {e}"),
            )),
        }
    }

    fn builtin_find(&mut self, args: &[EvalValue]) -> Result<EvalValue, Warning> {
        let (Some(pattern), Some(text)) = (string_arg(args, 0), string_arg(args, 1)) else {
            if args.iter().any(|a| matches!(a, EvalValue::Unknown)) {
                return Ok(EvalValue::Unknown);
            }
            return Err(Warning::new(
                WarningKind::Evaluation,
                "find(pattern, text) expects two strings",
            ));
        };
        let origin = match args.get(1) {
            Some(EvalValue::Data { origin, .. }) => origin.clone(),
            _ => None,
        };
        let regex = fancy_regex::Regex::new(&pattern)
            .map_err(|e| Warning::new(WarningKind::Evaluation, format!("invalid regex: {e}")))?;
        let mut found = Vec::new();
        for result in regex.find_iter(&text) {
            let m = result.map_err(|e| {
                Warning::new(WarningKind::Evaluation, format!("regex match failed: {e}"))
            })?;
            if let Some(origin) = &origin {
                let start = text[..m.start()].chars().count();
                let end = start + m.as_str().chars().count();
                self.ranges
                    .push(Range::span(origin.event, origin.path.clone(), start, end));
            }
            found.push(Value::String(m.as_str().to_string()));
        }
        Ok(EvalValue::data(Value::Array(found)))
    }

    fn builtin_len(&mut self, args: &[EvalValue]) -> Result<EvalValue, Warning> {
        match args.first() {
            Some(EvalValue::Unknown) => Ok(EvalValue::Unknown),
            Some(EvalValue::Events(ids)) => Ok(EvalValue::data(Value::from(ids.len()))),
            Some(EvalValue::Data { value, .. }) => {
                let len = match value {
                    Value::String(s) => s.chars().count(),
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    _ => {
                        return Err(Warning::new(
                            WarningKind::Evaluation,
                            "len() of an unsized value",
                        ))
                    }
                };
                Ok(EvalValue::data(Value::from(len)))
            }
            _ => Err(Warning::new(
                WarningKind::Evaluation,
                "len() expects one sized argument",
            )),
        }
    }

    fn call_predicate(
        &mut self,
        name: &str,
        args: Vec<EvalValue>,
        kwargs: &[(String, Expr)],
    ) -> Result<EvalValue, Warning> {
        if self.depth >= MAX_EVAL_DEPTH {
            return Err(Warning::new(
                WarningKind::Evaluation,
                format!("predicate '{name}' recurses too deeply"),
            ));
        }
        let predicate = &self.policy.predicates[name];
        if args.len() > predicate.params.len() {
            return Err(Warning::new(
                WarningKind::Evaluation,
                format!(
                    "predicate '{name}' takes {} argument(s), got {}",
                    predicate.params.len(),
                    args.len()
                ),
            ));
        }

        let mut frame: Vec<(String, EvalValue)> = predicate
            .params
            .iter()
            .zip(args)
            .map(|(param, value)| (param.clone(), value))
            .collect();
        for (key, expr) in kwargs {
            if !predicate.params.contains(key) {
                return Err(Warning::new(
                    WarningKind::Evaluation,
                    format!("predicate '{name}' has no parameter '{key}'"),
                ));
            }
            let value = self.eval(expr)?;
            frame.push((key.clone(), value));
        }
        let bound: Vec<&String> = frame.iter().map(|(n, _)| n).collect();
        for param in &predicate.params {
            if !bound.contains(&param) {
                return Err(Warning::new(
                    WarningKind::Evaluation,
                    format!("predicate '{name}' is missing argument '{param}'"),
                ));
            }
        }
        drop(bound);

        let body = predicate.body.clone();
        let frame_len = frame.len();
        self.locals.append(&mut frame);
        self.depth += 1;
        let truth = self.truth_of(&body);
        self.depth -= 1;
        self.locals.truncate(self.locals.len() - frame_len);
        Ok(EvalValue::from_truth(truth))
    }

    fn call_detector(
        &mut self,
        name: &str,
        args: Vec<EvalValue>,
        kwargs: &[(String, Expr)],
    ) -> Result<EvalValue, Warning> {
        let Some(subject) = args.into_iter().next() else {
            return Err(Warning::new(
                WarningKind::Evaluation,
                format!("detector '{name}' expects an argument"),
            ));
        };

        let (value, origin) = match subject {
            EvalValue::Unknown => return Ok(EvalValue::Unknown),
            EvalValue::Event(id) => {
                let node = self.trace.node(id);
                (
                    node.content().cloned().unwrap_or(Value::Null),
                    Some(Origin {
                        event: id,
                        path: join_path(&node.json_path, "content"),
                    }),
                )
            }
            EvalValue::Events(ids) => (
                Value::Array(ids.iter().map(|id| self.event_json(*id)).collect()),
                None,
            ),
            EvalValue::Data { value, origin } => (value, origin),
        };

        let mut options = DetectorOptions::new();
        for (key, expr) in kwargs {
            let evaluated = self.eval(expr)?;
            match self.to_json(&evaluated) {
                Some(json) => {
                    options.insert(key.clone(), json);
                }
                None => return Ok(EvalValue::Unknown),
            }
        }

        let symbol = &self.policy.imports[name];
        match self.registry.detect(&symbol.name, &value, &options) {
            Ok(DetectorVerdict::Flagged(flagged)) => {
                if flagged {
                    if let Some(origin) = &origin {
                        self.ranges
                            .push(Range::object(origin.event, origin.path.clone()));
                    }
                }
                Ok(EvalValue::bool(flagged))
            }
            Ok(DetectorVerdict::Hits(hits)) => {
                let mut tags = Vec::new();
                for hit in hits {
                    if let Some(origin) = &origin {
                        self.ranges.push(Range::span(
                            origin.event,
                            origin.path.clone(),
                            hit.start,
                            hit.end,
                        ));
                    }
                    tags.push(Value::String(hit.tag));
                }
                Ok(EvalValue::data(Value::Array(tags)))
            }
            Err(err) => {
                let kind = match err {
                    DetectorError::Unavailable(_) => WarningKind::DetectorUnavailable,
                    _ => WarningKind::DetectorFailed,
                };
                self.warn(Warning::new(kind, err.to_string()));
                Ok(EvalValue::Unknown)
            }
        }
    }

    fn warn(&mut self, warning: Warning) {
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }
}

fn string_arg(args: &[EvalValue], idx: usize) -> Option<String> {
    match args.get(idx) {
        Some(EvalValue::Data {
            value: Value::String(s),
            ..
        }) => Some(s.clone()),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

fn type_matches(ty: Type, value: &Value) -> bool {
    match ty {
        Type::Unknown => true,
        Type::Dict => value.is_object(),
        Type::List => value.is_array(),
        Type::Str => value.is_string(),
        Type::Int => value.as_i64().is_some(),
        Type::Float => value.is_number(),
        Type::Bool => value.is_boolean(),
        _ => false,
    }
}

fn number(f: f64) -> EvalValue {
    match serde_json::Number::from_f64(f) {
        Some(n) => EvalValue::data(Value::Number(n)),
        None => EvalValue::Unknown,
    }
}

fn arith(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, String> {
    use BinaryOp::*;

    if op == Add {
        if let (Value::String(x), Value::String(y)) = (a, b) {
            return Ok(Value::String(format!("{x}{y}")));
        }
    }

    let (Value::Number(x), Value::Number(y)) = (a, b) else {
        return Err(format!(
            "arithmetic '{}' on {} and {}",
            op.symbol(),
            type_name(a),
            type_name(b)
        ));
    };

    if let (Some(i), Some(j)) = (x.as_i64(), y.as_i64()) {
        let result = match op {
            Add => i.checked_add(j),
            Sub => i.checked_sub(j),
            Mul => i.checked_mul(j),
            Rem if j != 0 => Some(i.rem_euclid(j)),
            Div if j != 0 && i % j == 0 => Some(i / j),
            Div | Rem if j == 0 => return Err("division by zero".to_string()),
            _ => None,
        };
        if let Some(v) = result {
            return Ok(Value::from(v));
        }
    }

    let (x, y) = (num_f64(x), num_f64(y));
    let value = match op {
        Add => x + y,
        Sub => x - y,
        Mul => x * y,
        Div => {
            if y == 0.0 {
                return Err("division by zero".to_string());
            }
            x / y
        }
        Rem => {
            if y == 0.0 {
                return Err("division by zero".to_string());
            }
            x % y
        }
        _ => return Err(format!("'{}' is not arithmetic", op.symbol())),
    };
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| "arithmetic result is not a number".to_string())
}
