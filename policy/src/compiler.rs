//! Type checker and rule compiler.
//!
//! Compilation turns the parsed AST into an executable plan per rule:
//! typed identifiers are hoisted into *generator* steps, the remaining
//! atoms become *filters*, and every filter is scheduled at the earliest
//! point where all of its variables are bound, so evaluation can cut a
//! candidate branch as soon as possible. All defects are collected rather
//! than failing on the first.

use std::collections::HashMap;

use crate::ast::{
    free_names, ErrorCtorAst, Expr, ExprKind, PolicySource, RaiseRule, Span, Stmt, UnaryOp,
};
use crate::compiled::{
    CompiledPolicy, CompiledPredicate, CompiledRule, Domain, ErrorCtor, ImportedSymbol, Step,
    VarInfo,
};
use crate::error::CompileError;
use crate::pattern::{compile_tool_call_matcher, ToolCallMatcher};
use crate::types::Type;

/// Names that are always in scope in rule bodies.
pub const BUILTIN_FUNCTIONS: [&str; 4] = ["match", "find", "len", "empty"];

/// The policy-parameter accessor, `input.<name>`.
pub const INPUT_IDENT: &str = "input";

pub fn compile(source: &PolicySource) -> Result<CompiledPolicy, Vec<CompileError>> {
    let mut errors = Vec::new();

    // Imports, constants, and predicate signatures first, so rules can
    // reference them regardless of statement order.
    let mut imports: HashMap<String, ImportedSymbol> = HashMap::new();
    let mut constants: HashMap<String, Expr> = HashMap::new();
    let mut predicates: HashMap<String, CompiledPredicate> = HashMap::new();

    for stmt in &source.statements {
        match stmt {
            Stmt::Import(import) => {
                for name in &import.names {
                    imports.insert(
                        name.clone(),
                        ImportedSymbol {
                            module: import.module.clone(),
                            name: name.clone(),
                        },
                    );
                }
            }
            Stmt::Constant(def) => {
                if constants.contains_key(&def.name) {
                    errors.push(type_err(
                        def.span,
                        format!("constant '{}' is already defined", def.name),
                    ));
                } else {
                    constants.insert(def.name.clone(), def.value.clone());
                }
            }
            Stmt::Predicate(def) => {
                if predicates.contains_key(&def.name) {
                    errors.push(type_err(
                        def.span,
                        format!("predicate '{}' is already defined", def.name),
                    ));
                } else {
                    predicates.insert(
                        def.name.clone(),
                        CompiledPredicate {
                            name: def.name.clone(),
                            params: def.params.iter().map(|p| p.name.clone()).collect(),
                            body: def.body.clone(),
                            span: def.span,
                        },
                    );
                }
            }
            Stmt::Rule(_) => {}
        }
    }

    // Check constant and predicate bodies against the global scope. The
    // scope borrow ends before the checked predicate bodies are written
    // back.
    let mut checked_bodies: HashMap<String, Expr> = HashMap::new();
    {
        let globals = GlobalScope {
            predicates: &predicates,
            constants: &constants,
            imports: &imports,
        };

        for def in source.statements.iter().filter_map(|s| match s {
            Stmt::Constant(def) => Some(def),
            _ => None,
        }) {
            let mut scope = RuleScope::new(&globals);
            let rewritten = scope.rewrite(&def.value, Polarity::Ctor);
            scope.infer(&rewritten);
            errors.extend(scope.errors);
        }

        for def in source.statements.iter().filter_map(|s| match s {
            Stmt::Predicate(def) => Some(def),
            _ => None,
        }) {
            let mut scope = RuleScope::new(&globals);
            for param in &def.params {
                let ty = match Type::parse(&param.type_name) {
                    Some(ty) => ty,
                    None => {
                        scope.errors.push(type_err(
                            param.span,
                            format!("failed to resolve type '{}'", param.type_name),
                        ));
                        Type::Unknown
                    }
                };
                scope.vars.push(VarInfo {
                    name: param.name.clone(),
                    ty,
                });
                scope.var_generator.push(0);
            }
            let rewritten = scope.rewrite(&def.body, Polarity::Predicate);
            scope.infer(&rewritten);
            errors.extend(scope.errors);
            checked_bodies.insert(def.name.clone(), rewritten);
        }
    }
    for (name, body) in checked_bodies {
        if let Some(pred) = predicates.get_mut(&name) {
            pred.body = body;
        }
    }

    // Rules.
    let globals = GlobalScope {
        predicates: &predicates,
        constants: &constants,
        imports: &imports,
    };
    let mut rules = Vec::new();
    for stmt in &source.statements {
        if let Stmt::Rule(rule) = stmt {
            let id = rules.len();
            rules.push(compile_rule(id, rule, &globals, &mut errors));
        }
    }

    if errors.is_empty() {
        Ok(CompiledPolicy {
            rules,
            predicates,
            constants,
            imports,
        })
    } else {
        Err(errors)
    }
}

fn compile_rule(
    id: usize,
    rule: &RaiseRule,
    globals: &GlobalScope<'_>,
    errors: &mut Vec<CompileError>,
) -> CompiledRule {
    let mut scope = RuleScope::new(globals);

    // Pass 1: hoist every quantified variable in body order, so filters may
    // reference variables declared on a later line.
    for atom in &rule.body {
        scope.hoist(atom, Polarity::Positive);
    }

    // Pass 2: rewrite and type-check each atom, then build filters.
    let mut filters: Vec<(Expr, Span, Option<usize>)> = Vec::new();
    for atom in &rule.body {
        if let Some(filter) = scope.compile_atom(atom) {
            filters.push(filter);
        }
    }

    // The error constructor is evaluated under complete bindings only.
    let ctor = match &rule.ctor {
        ErrorCtorAst::Message(message, _) => ErrorCtor::Literal(message.clone()),
        ErrorCtorAst::Call {
            kind, args, kwargs, ..
        } => {
            let args = args
                .iter()
                .map(|a| {
                    let rewritten = scope.rewrite(a, Polarity::Ctor);
                    scope.infer(&rewritten);
                    rewritten
                })
                .collect();
            let kwargs = kwargs
                .iter()
                .map(|(k, v)| {
                    let rewritten = scope.rewrite(v, Polarity::Ctor);
                    scope.infer(&rewritten);
                    (k.clone(), rewritten)
                })
                .collect();
            ErrorCtor::Call {
                kind: kind.clone(),
                args,
                kwargs,
            }
        }
    };

    // Schedule: generators in declaration order, each filter placed right
    // after the generator of its last dependency.
    let mut steps = Vec::new();
    for (expr, span, _) in filters.iter().filter(|(_, _, dep)| dep.is_none()) {
        steps.push(Step::Filter {
            expr: expr.clone(),
            span: *span,
        });
    }
    let generators = std::mem::take(&mut scope.generators);
    for (gen_idx, (var, domain)) in generators.into_iter().enumerate() {
        steps.push(Step::Generate { var, domain });
        for (expr, span, last_dep) in &filters {
            if *last_dep == Some(gen_idx) {
                steps.push(Step::Filter {
                    expr: expr.clone(),
                    span: *span,
                });
            }
        }
    }

    errors.extend(scope.errors);

    CompiledRule {
        id,
        ctor,
        steps,
        vars: scope.vars,
        matchers: scope.matchers,
        span: rule.span,
    }
}

fn type_err(span: Span, message: String) -> CompileError {
    CompileError::Type {
        line: span.line,
        column: span.column,
        message,
    }
}

/// Where an expression sits with respect to quantification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Polarity {
    /// Positive conjunctive position; variable declarations are allowed.
    Positive,
    /// Under `not` or `or`; a fresh variable here is a range-restriction
    /// violation.
    Negative,
    /// Error-constructor and constant expressions.
    Ctor,
    /// Predicate bodies: quantifiers and patterns are not allowed.
    Predicate,
}

struct GlobalScope<'c> {
    predicates: &'c HashMap<String, CompiledPredicate>,
    constants: &'c HashMap<String, Expr>,
    imports: &'c HashMap<String, ImportedSymbol>,
}

struct RuleScope<'c> {
    globals: &'c GlobalScope<'c>,
    vars: Vec<VarInfo>,
    generators: Vec<(usize, Domain)>,
    /// Generator index that declared each variable.
    var_generator: Vec<usize>,
    matchers: Vec<ToolCallMatcher>,
    errors: Vec<CompileError>,
}

impl<'c> RuleScope<'c> {
    fn new(globals: &'c GlobalScope<'c>) -> Self {
        RuleScope {
            globals,
            vars: Vec::new(),
            generators: Vec::new(),
            var_generator: Vec::new(),
            matchers: Vec::new(),
            errors: Vec::new(),
        }
    }

    // ---- pass 1: quantifier hoisting ----

    fn hoist(&mut self, expr: &Expr, polarity: Polarity) {
        match &expr.kind {
            ExprKind::TypedIdent { name, type_name } => {
                self.declare(name, type_name, expr.span, polarity, None);
            }
            ExprKind::Binary { op, left, right } => {
                use crate::ast::BinaryOp::*;
                match op {
                    In => {
                        // `(x: T) in expr`: a membership generator
                        if let ExprKind::TypedIdent { name, type_name } = &left.kind {
                            self.forbid_quantifiers(right, "a membership domain");
                            self.declare(
                                name,
                                type_name,
                                left.span,
                                polarity,
                                Some((**right).clone()),
                            );
                            return;
                        }
                        self.hoist(left, polarity);
                        self.hoist(right, polarity);
                    }
                    Or => {
                        self.hoist(left, Polarity::Negative);
                        self.hoist(right, Polarity::Negative);
                    }
                    _ => {
                        self.hoist(left, polarity);
                        self.hoist(right, polarity);
                    }
                }
            }
            ExprKind::Unary { op, expr: inner } => {
                let inner_polarity = if *op == UnaryOp::Not {
                    Polarity::Negative
                } else {
                    polarity
                };
                self.hoist(inner, inner_polarity);
            }
            ExprKind::Member { expr: inner, .. } => self.hoist(inner, polarity),
            ExprKind::Index { expr: inner, index } => {
                self.hoist(inner, polarity);
                self.hoist(index, polarity);
            }
            ExprKind::Call { target, args, kwargs } => {
                self.hoist(target, polarity);
                for a in args {
                    self.hoist(a, polarity);
                }
                for (_, v) in kwargs {
                    self.hoist(v, polarity);
                }
            }
            ExprKind::Object(entries) => {
                for (_, v) in entries {
                    self.hoist(v, polarity);
                }
            }
            ExprKind::List(items) => {
                for item in items {
                    self.hoist(item, polarity);
                }
            }
            _ => {}
        }
    }

    fn forbid_quantifiers(&mut self, expr: &Expr, context: &str) {
        let mut found = Vec::new();
        collect_typed_idents(expr, &mut found);
        for (name, span) in found {
            self.errors.push(type_err(
                span,
                format!("cannot declare variable '{name}' inside {context}"),
            ));
        }
    }

    fn declare(
        &mut self,
        name: &str,
        type_name: &str,
        span: Span,
        polarity: Polarity,
        membership: Option<Expr>,
    ) {
        match polarity {
            Polarity::Positive => {}
            Polarity::Negative => {
                self.errors.push(type_err(
                    span,
                    format!(
                        "variable '{name}' is introduced under negation or disjunction; \
                         quantified variables must appear in a positive position first"
                    ),
                ));
                return;
            }
            Polarity::Ctor | Polarity::Predicate => {
                self.errors.push(type_err(
                    span,
                    format!("cannot declare variable '{name}' here"),
                ));
                return;
            }
        }

        if self.vars.iter().any(|v| v.name == name) {
            self.errors.push(type_err(
                span,
                format!("variable '{name}' is already declared"),
            ));
            return;
        }

        let ty = match Type::parse(type_name) {
            Some(ty) => ty,
            None => {
                self.errors.push(type_err(
                    span,
                    format!("failed to resolve type '{type_name}'"),
                ));
                Type::Unknown
            }
        };

        let var = self.vars.len();
        let gen_idx = self.generators.len();
        self.vars.push(VarInfo {
            name: name.to_string(),
            ty,
        });
        self.var_generator.push(gen_idx);

        let domain = match membership {
            None => {
                if !(ty.is_event() || ty == Type::Unknown) {
                    self.errors.push(type_err(
                        span,
                        format!(
                            "variable '{name}': only event types quantify over the trace; \
                             bind '{ty}' values with 'in'"
                        ),
                    ));
                }
                Domain::Events(ty)
            }
            Some(expr) => Domain::Members { expr, ty },
        };
        self.generators.push((var, domain));
    }

    // ---- pass 2: rewriting, resolution, scheduling ----

    /// Compiles one body atom into `(filter, span, last generator dep)`,
    /// or `None` if the atom was a pure declaration.
    fn compile_atom(&mut self, atom: &Expr) -> Option<(Expr, Span, Option<usize>)> {
        if let ExprKind::TypedIdent { .. } = &atom.kind {
            return None;
        }
        if let ExprKind::Binary { op, left, right } = &atom.kind {
            if *op == crate::ast::BinaryOp::In {
                if let ExprKind::TypedIdent { name, .. } = &left.kind {
                    // Membership generator: resolve its domain now that all
                    // variables are known; dependencies must be declared
                    // before the variable itself.
                    let rewritten = self.rewrite(right, Polarity::Positive);
                    self.infer(&rewritten);
                    if let Some(var) = self.var_id(name) {
                        let own_gen = self.var_generator[var];
                        if self.last_dep(&rewritten) >= Some(own_gen) {
                            self.errors.push(type_err(
                                left.span,
                                "membership domain may only reference variables declared \
                                 earlier"
                                    .to_string(),
                            ));
                        }
                        if let Some((_, Domain::Members { expr, .. })) =
                            self.generators.get_mut(own_gen)
                        {
                            *expr = rewritten;
                        }
                    }
                    return None;
                }
            }
        }

        let rewritten = self.rewrite(atom, Polarity::Positive);
        self.infer(&rewritten);
        let last_dep = self.last_dep(&rewritten);
        Some((rewritten, atom.span, last_dep))
    }

    /// Latest generator index among the variables an expression references.
    fn last_dep(&self, expr: &Expr) -> Option<usize> {
        let mut names = Vec::new();
        free_names(expr, &mut names);
        names
            .iter()
            .filter_map(|n| self.var_id(n))
            .map(|v| self.var_generator[v])
            .max()
    }

    fn var_id(&self, name: &str) -> Option<usize> {
        self.vars.iter().position(|v| v.name == name)
    }

    /// Rewrites an expression: typed identifiers collapse to plain
    /// identifiers, semantic patterns compile to matcher slots.
    fn rewrite(&mut self, expr: &Expr, polarity: Polarity) -> Expr {
        let kind = match &expr.kind {
            ExprKind::TypedIdent { name, .. } => {
                if matches!(polarity, Polarity::Ctor | Polarity::Predicate) {
                    self.errors.push(type_err(
                        expr.span,
                        format!("cannot declare variable '{name}' here"),
                    ));
                }
                ExprKind::Ident(name.clone())
            }
            ExprKind::SemanticPattern { tool, args } => {
                self.compile_pattern(tool, args, expr.span, polarity)
            }
            ExprKind::ToolRef(tool) => self.compile_pattern(tool, &[], expr.span, polarity),
            ExprKind::Wildcard => {
                self.errors.push(type_err(
                    expr.span,
                    "wildcards are only allowed inside semantic patterns".to_string(),
                ));
                ExprKind::Bool(false)
            }
            ExprKind::ValueRef(name) => {
                self.errors.push(type_err(
                    expr.span,
                    format!("value reference <{name}> is only allowed inside semantic patterns"),
                ));
                ExprKind::Bool(false)
            }
            ExprKind::Unary { op, expr: inner } => {
                let inner_polarity = if *op == UnaryOp::Not && polarity == Polarity::Positive {
                    Polarity::Negative
                } else {
                    polarity
                };
                ExprKind::Unary {
                    op: *op,
                    expr: Box::new(self.rewrite(inner, inner_polarity)),
                }
            }
            ExprKind::Binary { op, left, right } => {
                let child_polarity = match op {
                    crate::ast::BinaryOp::Or if polarity == Polarity::Positive => {
                        Polarity::Negative
                    }
                    _ => polarity,
                };
                ExprKind::Binary {
                    op: *op,
                    left: Box::new(self.rewrite(left, child_polarity)),
                    right: Box::new(self.rewrite(right, child_polarity)),
                }
            }
            ExprKind::Member { expr: inner, name } => ExprKind::Member {
                expr: Box::new(self.rewrite(inner, polarity)),
                name: name.clone(),
            },
            ExprKind::Index { expr: inner, index } => ExprKind::Index {
                expr: Box::new(self.rewrite(inner, polarity)),
                index: Box::new(self.rewrite(index, polarity)),
            },
            ExprKind::Call { target, args, kwargs } => ExprKind::Call {
                target: Box::new(self.rewrite(target, polarity)),
                args: args.iter().map(|a| self.rewrite(a, polarity)).collect(),
                kwargs: kwargs
                    .iter()
                    .map(|(k, v)| (k.clone(), self.rewrite(v, polarity)))
                    .collect(),
            },
            ExprKind::Object(entries) => ExprKind::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), self.rewrite(v, polarity)))
                    .collect(),
            ),
            ExprKind::List(items) => {
                ExprKind::List(items.iter().map(|i| self.rewrite(i, polarity)).collect())
            }
            other => other.clone(),
        };
        Expr::new(kind, expr.span)
    }

    fn compile_pattern(
        &mut self,
        tool: &Option<String>,
        args: &[Expr],
        span: Span,
        polarity: Polarity,
    ) -> ExprKind {
        if matches!(polarity, Polarity::Ctor | Polarity::Predicate) {
            self.errors.push(type_err(
                span,
                "semantic patterns are only allowed in rule bodies".to_string(),
            ));
            return ExprKind::Bool(false);
        }
        match compile_tool_call_matcher(tool, args, span) {
            Ok(matcher) => {
                self.matchers.push(matcher);
                ExprKind::PatternRef(self.matchers.len() - 1)
            }
            Err(err) => {
                self.errors.push(err);
                ExprKind::Bool(false)
            }
        }
    }

    /// Shallow type inference; reports unresolved identifiers and
    /// statically wrong member accesses.
    fn infer(&mut self, expr: &Expr) -> Type {
        match &expr.kind {
            ExprKind::Null => Type::Unknown,
            ExprKind::Bool(_) => Type::Bool,
            ExprKind::Int(_) => Type::Int,
            ExprKind::Float(_) => Type::Float,
            ExprKind::Str(_) | ExprKind::RegexLit(_) => Type::Str,
            ExprKind::PatternRef(_) => Type::Bool,
            ExprKind::Ident(name) => self.resolve(name, expr.span),
            ExprKind::Member { expr: inner, name } => {
                // `input.<param>` reads a policy parameter
                if matches!(&inner.kind, ExprKind::Ident(id) if id == INPUT_IDENT)
                    && self.var_id(INPUT_IDENT).is_none()
                {
                    return Type::Unknown;
                }
                let base = self.infer(inner);
                match base.member(name) {
                    Ok(ty) => ty,
                    Err(message) => {
                        self.errors.push(type_err(expr.span, message));
                        Type::Unknown
                    }
                }
            }
            ExprKind::Index { expr: inner, index } => {
                self.infer(inner);
                self.infer(index);
                Type::Unknown
            }
            ExprKind::Call { target, args, kwargs } => {
                self.infer(target);
                for a in args {
                    self.infer(a);
                }
                for (_, v) in kwargs {
                    self.infer(v);
                }
                Type::Unknown
            }
            ExprKind::Unary { op, expr: inner } => {
                self.infer(inner);
                match op {
                    UnaryOp::Not => Type::Bool,
                    _ => Type::Unknown,
                }
            }
            ExprKind::Binary { op, left, right } => {
                use crate::ast::BinaryOp::*;
                let lt = self.infer(left);
                let rt = self.infer(right);
                match op {
                    Flow => {
                        for (side, ty) in [(&**left, lt), (&**right, rt)] {
                            if !(ty.is_event() || ty == Type::Unknown) {
                                self.errors.push(type_err(
                                    side.span,
                                    format!("'->' relates events, found a value of type {ty}"),
                                ));
                            }
                        }
                        Type::Bool
                    }
                    And | Or | Eq | Ne | Lt | Le | Gt | Ge | In | Is | IsNot => Type::Bool,
                    Add | Sub | Mul | Div | Rem => Type::Unknown,
                }
            }
            ExprKind::Object(entries) => {
                for (_, v) in entries {
                    self.infer(v);
                }
                Type::Dict
            }
            ExprKind::List(items) => {
                for item in items {
                    self.infer(item);
                }
                Type::List
            }
            // removed during rewriting
            ExprKind::TypedIdent { .. }
            | ExprKind::SemanticPattern { .. }
            | ExprKind::ToolRef(_)
            | ExprKind::Wildcard
            | ExprKind::ValueRef(_) => Type::Unknown,
        }
    }

    fn resolve(&mut self, name: &str, span: Span) -> Type {
        if let Some(var) = self.var_id(name) {
            return self.vars[var].ty;
        }
        if name == INPUT_IDENT
            || BUILTIN_FUNCTIONS.contains(&name)
            || self.globals.constants.contains_key(name)
            || self.globals.predicates.contains_key(name)
            || self.globals.imports.contains_key(name)
        {
            return Type::Unknown;
        }
        self.errors.push(type_err(
            span,
            format!("failed to resolve identifier '{name}'"),
        ));
        Type::Unknown
    }
}

fn collect_typed_idents(expr: &Expr, out: &mut Vec<(String, Span)>) {
    match &expr.kind {
        ExprKind::TypedIdent { name, .. } => out.push((name.clone(), expr.span)),
        ExprKind::Unary { expr: inner, .. } => collect_typed_idents(inner, out),
        ExprKind::Binary { left, right, .. } => {
            collect_typed_idents(left, out);
            collect_typed_idents(right, out);
        }
        ExprKind::Member { expr: inner, .. } => collect_typed_idents(inner, out),
        ExprKind::Index { expr: inner, index } => {
            collect_typed_idents(inner, out);
            collect_typed_idents(index, out);
        }
        ExprKind::Call { target, args, kwargs } => {
            collect_typed_idents(target, out);
            for a in args {
                collect_typed_idents(a, out);
            }
            for (_, v) in kwargs {
                collect_typed_idents(v, out);
            }
        }
        ExprKind::Object(entries) => {
            for (_, v) in entries {
                collect_typed_idents(v, out);
            }
        }
        ExprKind::List(items) => {
            for item in items {
                collect_typed_idents(item, out);
            }
        }
        _ => {}
    }
}
