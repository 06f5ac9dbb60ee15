//! Recursive-descent parser for the policy language.
//!
//! The parser consumes the token stream produced by [`crate::lexer`] and
//! builds the AST. It keeps going after an error where it can, so that a
//! policy file with several defects reports all of them in one pass.

use crate::ast::*;
use crate::error::CompileError;
use crate::lexer::{tokenize, Tok, Token};

/// Parses a policy source string into an AST, collecting every parse error.
pub fn parse_policy(source: &str) -> (PolicySource, Vec<CompileError>) {
    let tokens = match tokenize(source) {
        Ok(tokens) => tokens,
        Err(err) => {
            return (PolicySource { statements: vec![] }, vec![err]);
        }
    };
    Parser::new(tokens).run()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<CompileError>,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens,
            pos: 0,
            errors: Vec::new(),
        }
    }

    fn run(mut self) -> (PolicySource, Vec<CompileError>) {
        let mut statements = Vec::new();
        while !self.at_end() {
            match self.parse_statement() {
                Ok(Some(stmt)) => statements.push(stmt),
                Ok(None) => {}
                Err(err) => {
                    self.errors.push(err);
                    self.synchronize();
                }
            }
        }
        (PolicySource { statements }, self.errors)
    }

    // ---- statements ----

    fn parse_statement(&mut self) -> Result<Option<Stmt>, CompileError> {
        // stray layout tokens between statements
        while self.eat(&Tok::Newline) || self.eat(&Tok::Dedent) {}
        if self.at_end() {
            return Ok(None);
        }

        match self.peek().clone() {
            Tok::From => self.parse_import().map(|s| Some(Stmt::Import(s))),
            Tok::Raise => self.parse_rule().map(|s| Some(Stmt::Rule(s))),
            Tok::Ident(_) => self.parse_definition().map(Some),
            other => Err(self.err_here(format!("expected a statement, found {other:?}"))),
        }
    }

    fn parse_import(&mut self) -> Result<Import, CompileError> {
        let span = self.span();
        self.expect(&Tok::From)?;

        let mut module = self.expect_ident()?;
        while self.eat(&Tok::Dot) {
            module.push('.');
            module.push_str(&self.expect_ident()?);
        }

        self.expect(&Tok::Import)?;
        let mut names = vec![self.expect_ident()?];
        while self.eat(&Tok::Comma) {
            names.push(self.expect_ident()?);
        }
        self.expect_end_of_line()?;
        Ok(Import { module, names, span })
    }

    /// Predicate definition `name(p: T) := expr` or constant `NAME := expr`.
    fn parse_definition(&mut self) -> Result<Stmt, CompileError> {
        let span = self.span();
        let name = self.expect_ident()?;

        if self.eat(&Tok::LParen) {
            let mut params = Vec::new();
            if !self.check(&Tok::RParen) {
                loop {
                    let pspan = self.span();
                    let pname = self.expect_ident()?;
                    self.expect(&Tok::Colon)?;
                    let type_name = self.expect_ident()?;
                    params.push(Param {
                        name: pname,
                        type_name,
                        span: pspan,
                    });
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
            }
            self.expect(&Tok::RParen)?;
            self.expect(&Tok::Define)?;
            let body = self.parse_expr()?;
            self.expect_end_of_line()?;
            Ok(Stmt::Predicate(PredicateDef {
                name,
                params,
                body,
                span,
            }))
        } else {
            self.expect(&Tok::Define)?;
            let value = self.parse_expr()?;
            self.expect_end_of_line()?;
            Ok(Stmt::Constant(ConstantDef { name, value, span }))
        }
    }

    fn parse_rule(&mut self) -> Result<RaiseRule, CompileError> {
        let span = self.span();
        self.expect(&Tok::Raise)?;

        let ctor = self.parse_error_ctor()?;

        self.expect(&Tok::If)?;
        self.expect(&Tok::Colon)?;
        self.expect(&Tok::Newline)?;
        self.expect(&Tok::Indent)?;

        let mut body = Vec::new();
        loop {
            if self.eat(&Tok::Dedent) {
                break;
            }
            if self.at_end() {
                return Err(self.err_here("unterminated rule body"));
            }
            let atom = self.parse_expr()?;
            body.push(atom);
            self.expect_end_of_line()?;
        }

        if body.is_empty() {
            return Err(CompileError::Parse {
                line: span.line,
                column: span.column,
                message: "rule body must contain at least one atom".to_string(),
            });
        }
        Ok(RaiseRule { ctor, body, span })
    }

    fn parse_error_ctor(&mut self) -> Result<ErrorCtorAst, CompileError> {
        let span = self.span();
        match self.peek().clone() {
            Tok::Str(message) => {
                self.advance();
                Ok(ErrorCtorAst::Message(message, span))
            }
            Tok::Ident(kind) => {
                self.advance();
                let (mut args, mut kwargs) = (Vec::new(), Vec::new());
                if self.eat(&Tok::LParen) {
                    (args, kwargs) = self.parse_call_args()?;
                }
                Ok(ErrorCtorAst::Call {
                    kind,
                    args,
                    kwargs,
                    span,
                })
            }
            other => Err(self.err_here(format!(
                "expected an error message or constructor after 'raise', found {other:?}"
            ))),
        }
    }

    // ---- expressions ----

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_and()?;
        while self.check(&Tok::Or) {
            let span = self.span();
            self.advance();
            let right = self.parse_and()?;
            left = Expr::new(
                ExprKind::Binary {
                    op: BinaryOp::Or,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_not()?;
        while self.check(&Tok::And) {
            let span = self.span();
            self.advance();
            let right = self.parse_not()?;
            left = Expr::new(
                ExprKind::Binary {
                    op: BinaryOp::And,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, CompileError> {
        if self.check(&Tok::Not) {
            let span = self.span();
            self.advance();
            let expr = self.parse_not()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    expr: Box::new(expr),
                },
                span,
            ));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let left = self.parse_arith()?;

        let op = match self.peek() {
            Tok::EqEq => BinaryOp::Eq,
            Tok::NotEq => BinaryOp::Ne,
            Tok::Lt => BinaryOp::Lt,
            Tok::Le => BinaryOp::Le,
            Tok::Gt => BinaryOp::Gt,
            Tok::Ge => BinaryOp::Ge,
            Tok::In => BinaryOp::In,
            Tok::Arrow => BinaryOp::Flow,
            Tok::Is => BinaryOp::Is,
            _ => return Ok(left),
        };
        let span = self.span();
        self.advance();

        let (op, right) = if op == BinaryOp::Is {
            let negated = self.eat(&Tok::Not);
            let right = self.parse_arith()?;
            (
                if negated { BinaryOp::IsNot } else { BinaryOp::Is },
                right,
            )
        } else {
            (op, self.parse_arith()?)
        };

        Ok(Expr::new(
            ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
        ))
    }

    fn parse_arith(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinaryOp::Add,
                Tok::Minus => BinaryOp::Sub,
                _ => break,
            };
            let span = self.span();
            self.advance();
            let right = self.parse_term()?;
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinaryOp::Mul,
                Tok::Slash => BinaryOp::Div,
                Tok::Percent => BinaryOp::Rem,
                _ => break,
            };
            // `*` standing alone in a pattern is a wildcard, not a
            // multiplication; only treat it as an operator when an operand
            // follows.
            if matches!(self.peek(), Tok::Star) && !self.operand_follows(1) {
                break;
            }
            let span = self.span();
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        let op = match self.peek() {
            Tok::Minus => Some(UnaryOp::Neg),
            Tok::Plus => Some(UnaryOp::Pos),
            _ => None,
        };
        if let Some(op) = op {
            let span = self.span();
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op,
                    expr: Box::new(expr),
                },
                span,
            ));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.check(&Tok::Dot) {
                let span = self.span();
                self.advance();
                let name = self.expect_ident()?;
                expr = Expr::new(
                    ExprKind::Member {
                        expr: Box::new(expr),
                        name,
                    },
                    span,
                );
            } else if self.check(&Tok::LBracket) {
                let span = self.span();
                self.advance();
                let index = self.parse_expr()?;
                self.expect(&Tok::RBracket)?;
                expr = Expr::new(
                    ExprKind::Index {
                        expr: Box::new(expr),
                        index: Box::new(index),
                    },
                    span,
                );
            } else if self.check(&Tok::LParen) {
                let span = self.span();
                self.advance();
                let (args, kwargs) = self.parse_call_args()?;
                expr = match expr.kind {
                    // a call on a tool reference is a semantic pattern
                    ExprKind::ToolRef(tool) => {
                        if !kwargs.is_empty() {
                            return Err(CompileError::Parse {
                                line: span.line,
                                column: span.column,
                                message: "semantic patterns take no keyword arguments"
                                    .to_string(),
                            });
                        }
                        Expr::new(ExprKind::SemanticPattern { tool, args }, expr.span)
                    }
                    _ => Expr::new(
                        ExprKind::Call {
                            target: Box::new(expr),
                            args,
                            kwargs,
                        },
                        span,
                    ),
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let span = self.span();
        match self.peek().clone() {
            Tok::Int(v) => {
                self.advance();
                Ok(Expr::new(ExprKind::Int(v), span))
            }
            Tok::Float(v) => {
                self.advance();
                Ok(Expr::new(ExprKind::Float(v), span))
            }
            Tok::Str(v) => {
                self.advance();
                Ok(Expr::new(ExprKind::Str(v), span))
            }
            Tok::Regex(v) => {
                self.advance();
                Ok(Expr::new(ExprKind::RegexLit(v), span))
            }
            Tok::None_ => {
                self.advance();
                Ok(Expr::new(ExprKind::Null, span))
            }
            Tok::True_ => {
                self.advance();
                Ok(Expr::new(ExprKind::Bool(true), span))
            }
            Tok::False_ => {
                self.advance();
                Ok(Expr::new(ExprKind::Bool(false), span))
            }
            Tok::ValueRef(name) => {
                self.advance();
                Ok(Expr::new(ExprKind::ValueRef(name), span))
            }
            Tok::Star => {
                self.advance();
                Ok(Expr::new(ExprKind::Wildcard, span))
            }
            Tok::Tool => {
                self.advance();
                let name = if self.eat(&Tok::Colon) {
                    Some(self.expect_ident()?)
                } else {
                    None
                };
                Ok(Expr::new(ExprKind::ToolRef(name), span))
            }
            Tok::Ident(name) => {
                self.advance();
                Ok(Expr::new(ExprKind::Ident(name), span))
            }
            Tok::LParen => {
                self.advance();
                // `(name: Type)`: a typed identifier
                if self.typed_ident_ahead() {
                    let name = self.expect_ident()?;
                    self.expect(&Tok::Colon)?;
                    let type_name = self.expect_ident()?;
                    self.expect(&Tok::RParen)?;
                    Ok(Expr::new(ExprKind::TypedIdent { name, type_name }, span))
                } else {
                    let inner = self.parse_expr()?;
                    self.expect(&Tok::RParen)?;
                    Ok(inner)
                }
            }
            Tok::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                if !self.check(&Tok::RBrace) {
                    loop {
                        let key = match self.peek().clone() {
                            Tok::Ident(k) => {
                                self.advance();
                                k
                            }
                            Tok::Str(k) => {
                                self.advance();
                                k
                            }
                            other => {
                                return Err(self.err_here(format!(
                                    "expected an object key, found {other:?}"
                                )))
                            }
                        };
                        self.expect(&Tok::Colon)?;
                        let value = self.parse_expr()?;
                        entries.push((key, value));
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Tok::RBrace)?;
                Ok(Expr::new(ExprKind::Object(entries), span))
            }
            Tok::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(&Tok::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Tok::RBracket)?;
                Ok(Expr::new(ExprKind::List(items), span))
            }
            other => Err(self.err_here(format!("unexpected token {other:?}"))),
        }
    }

    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), CompileError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        if !self.check(&Tok::RParen) {
            loop {
                // keyword argument: `name=expr`
                if let (Tok::Ident(name), Some(Tok::Assign)) =
                    (self.peek().clone(), self.peek_at(1).map(|t| t.clone()))
                {
                    self.advance();
                    self.advance();
                    let value = self.parse_expr()?;
                    kwargs.push((name, value));
                } else {
                    if !kwargs.is_empty() {
                        return Err(
                            self.err_here("positional argument after keyword argument")
                        );
                    }
                    args.push(self.parse_expr()?);
                }
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
        }
        self.expect(&Tok::RParen)?;
        Ok((args, kwargs))
    }

    // ---- token plumbing ----

    /// Whether the token at `offset` can begin an operand. Distinguishes a
    /// multiplication `a * b` from a wildcard `*` standing alone in a
    /// pattern argument list.
    fn operand_follows(&self, offset: usize) -> bool {
        matches!(
            self.peek_at(offset),
            Some(
                Tok::Int(_)
                    | Tok::Float(_)
                    | Tok::Str(_)
                    | Tok::Regex(_)
                    | Tok::Ident(_)
                    | Tok::LParen
                    | Tok::LBracket
                    | Tok::LBrace
                    | Tok::Minus
                    | Tok::Plus
                    | Tok::None_
                    | Tok::True_
                    | Tok::False_
                    | Tok::Tool
            )
        )
    }

    fn typed_ident_ahead(&self) -> bool {
        matches!(
            (
                self.peek_at(0),
                self.peek_at(1),
                self.peek_at(2),
                self.peek_at(3)
            ),
            (
                Some(Tok::Ident(_)),
                Some(Tok::Colon),
                Some(Tok::Ident(_)),
                Some(Tok::RParen)
            )
        )
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> &Tok {
        static NEWLINE: Tok = Tok::Newline;
        self.tokens.get(self.pos).map(|t| &t.tok).unwrap_or(&NEWLINE)
    }

    fn peek_at(&self, offset: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + offset).map(|t| &t.tok)
    }

    fn span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|t| t.span)
            .or_else(|| self.tokens.last().map(|t| t.span))
            .unwrap_or_default()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn check(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.check(tok) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok) -> Result<(), CompileError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.err_here(format!("expected {tok:?}, found {:?}", self.peek())))
        }
    }

    fn expect_ident(&mut self) -> Result<String, CompileError> {
        match self.peek().clone() {
            Tok::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.err_here(format!("expected an identifier, found {other:?}"))),
        }
    }

    fn expect_end_of_line(&mut self) -> Result<(), CompileError> {
        if self.eat(&Tok::Newline) || self.at_end() {
            Ok(())
        } else {
            Err(self.err_here(format!(
                "expected end of line, found {:?}",
                self.peek()
            )))
        }
    }

    fn err_here(&self, message: impl Into<String>) -> CompileError {
        let span = self.span();
        CompileError::Parse {
            line: span.line,
            column: span.column,
            message: message.into(),
        }
    }

    /// Skips to the start of the next plausible statement after an error.
    fn synchronize(&mut self) {
        let mut depth = 0usize;
        while !self.at_end() {
            match self.peek() {
                Tok::Indent => depth += 1,
                Tok::Dedent => depth = depth.saturating_sub(1),
                Tok::Newline if depth == 0 => {
                    self.advance();
                    return;
                }
                _ => {}
            }
            self.advance();
        }
    }
}
