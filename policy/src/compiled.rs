//! Compiled policy representation: the executable plan per rule.

use std::collections::HashMap;

use crate::ast::{Expr, Span};
use crate::pattern::ToolCallMatcher;
use crate::types::Type;

pub type RuleId = usize;
pub type VarId = usize;

/// A fully compiled policy ready for evaluation.
#[derive(Debug)]
pub struct CompiledPolicy {
    pub rules: Vec<CompiledRule>,
    pub predicates: HashMap<String, CompiledPredicate>,
    pub constants: HashMap<String, Expr>,
    /// Names imported into scope, resolved against the detector registry at
    /// evaluation time.
    pub imports: HashMap<String, ImportedSymbol>,
}

/// A symbol brought into scope by a `from ... import ...` line.
#[derive(Debug, Clone)]
pub struct ImportedSymbol {
    pub module: String,
    pub name: String,
}

/// `name(params) := body`: an auxiliary boolean predicate.
#[derive(Debug)]
pub struct CompiledPredicate {
    pub name: String,
    pub params: Vec<String>,
    pub body: Expr,
    pub span: Span,
}

/// Quantified variable of a rule.
#[derive(Debug, Clone)]
pub struct VarInfo {
    pub name: String,
    pub ty: Type,
}

/// One rule compiled into a normalized plan: generators in declaration
/// order, each filter scheduled at the earliest point where all of its
/// variables are bound.
#[derive(Debug)]
pub struct CompiledRule {
    pub id: RuleId,
    pub ctor: ErrorCtor,
    pub steps: Vec<Step>,
    pub vars: Vec<VarInfo>,
    /// Semantic patterns of this rule, referenced by `ExprKind::PatternRef`.
    pub matchers: Vec<ToolCallMatcher>,
    pub span: Span,
}

impl CompiledRule {
    pub fn var_id(&self, name: &str) -> Option<VarId> {
        self.vars.iter().position(|v| v.name == name)
    }
}

#[derive(Debug)]
pub enum Step {
    /// Bind `var` to each value of `domain` in turn.
    Generate { var: VarId, domain: Domain },
    /// Prune the current branch unless `expr` holds.
    Filter { expr: Expr, span: Span },
}

#[derive(Debug)]
pub enum Domain {
    /// All trace events assignable to the type, in trace order.
    Events(Type),
    /// Elements of an expression evaluated under the current binding,
    /// `(x: T) in expr`.
    Members { expr: Expr, ty: Type },
}

/// Compiled error constructor of a rule.
#[derive(Debug)]
pub enum ErrorCtor {
    /// `raise "message" if:`: constant message, built-in kind.
    Literal(String),
    /// `raise Kind(args..., k=v...) if:`: evaluated under each binding.
    Call {
        kind: String,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
}
