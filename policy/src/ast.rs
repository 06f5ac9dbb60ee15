//! Syntax tree of the policy language.
//!
//! Every node carries a [`Span`] so that compile errors and violation
//! reports can point back into the policy source.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: usize,
    pub column: usize,
}

/// A parsed policy file: imports, predicate and constant definitions, and
/// raise rules, in source order.
#[derive(Debug, Clone)]
pub struct PolicySource {
    pub statements: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Import(Import),
    Predicate(PredicateDef),
    Constant(ConstantDef),
    Rule(RaiseRule),
}

/// `from module.path import name, name`
#[derive(Debug, Clone)]
pub struct Import {
    pub module: String,
    pub names: Vec<String>,
    pub span: Span,
}

/// `name(param: Type, ...) := <boolean expression>`
#[derive(Debug, Clone)]
pub struct PredicateDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Expr,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub type_name: String,
    pub span: Span,
}

/// `NAME := expr`
#[derive(Debug, Clone)]
pub struct ConstantDef {
    pub name: String,
    pub value: Expr,
    pub span: Span,
}

/// `raise <ctor> if:` followed by an indented conjunction of atoms.
#[derive(Debug, Clone)]
pub struct RaiseRule {
    pub ctor: ErrorCtorAst,
    pub body: Vec<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ErrorCtorAst {
    /// `raise "message" if:`: the built-in PolicyViolation kind.
    Message(String, Span),
    /// `raise Kind(msg, k=expr, ...) if:`
    Call {
        kind: String,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
        span: Span,
    },
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Expr { kind, span }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// `r"..."` literal; compiled to a full-match regex in patterns and
    /// usable wherever a pattern string is expected.
    RegexLit(String),
    Ident(String),
    /// `(name: Type)`: a quantified variable declaration.
    TypedIdent { name: String, type_name: String },
    /// `*` inside a semantic pattern.
    Wildcard,
    /// `<EMAIL_ADDRESS>` and friends inside a semantic pattern.
    ValueRef(String),
    /// `tool` or `tool:name` without arguments.
    ToolRef(Option<String>),
    /// `tool:name({...})`: built from a call on a tool reference.
    SemanticPattern {
        tool: Option<String>,
        args: Vec<Expr>,
    },
    /// Compiled pattern slot, patched in by the compiler.
    PatternRef(usize),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Member {
        expr: Box<Expr>,
        name: String,
    },
    Index {
        expr: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        target: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Object(Vec<(String, Expr)>),
    List(Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    In,
    Is,
    IsNot,
    /// `->`, the direct dataflow relation.
    Flow,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::In => "in",
            BinaryOp::Is => "is",
            BinaryOp::IsNot => "is not",
            BinaryOp::Flow => "->",
        }
    }
}

/// Collects the free identifier names of an expression (typed identifiers
/// included).
pub fn free_names(expr: &Expr, out: &mut Vec<String>) {
    match &expr.kind {
        ExprKind::Ident(name) | ExprKind::TypedIdent { name, .. } => {
            if !out.contains(name) {
                out.push(name.clone());
            }
        }
        ExprKind::Unary { expr, .. } => free_names(expr, out),
        ExprKind::Binary { left, right, .. } => {
            free_names(left, out);
            free_names(right, out);
        }
        ExprKind::Member { expr, .. } => free_names(expr, out),
        ExprKind::Index { expr, index } => {
            free_names(expr, out);
            free_names(index, out);
        }
        ExprKind::Call { target, args, kwargs } => {
            free_names(target, out);
            for a in args {
                free_names(a, out);
            }
            for (_, v) in kwargs {
                free_names(v, out);
            }
        }
        ExprKind::Object(entries) => {
            for (_, v) in entries {
                free_names(v, out);
            }
        }
        ExprKind::List(items) => {
            for item in items {
                free_names(item, out);
            }
        }
        ExprKind::SemanticPattern { args, .. } => {
            for a in args {
                free_names(a, out);
            }
        }
        _ => {}
    }
}
