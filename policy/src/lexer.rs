//! Tokenizer for the policy language.
//!
//! The language is indentation-structured: the body of a `raise ... if:`
//! rule is an indented block with one atom per line. The lexer turns layout
//! into explicit `Indent`/`Dedent`/`Newline` tokens so the parser itself
//! stays context-free. Newlines and indentation are suppressed inside
//! brackets, which lets object and list literals span lines.

use crate::ast::Span;
use crate::error::CompileError;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    /// Raw regex literal, `r"..."`.
    Regex(String),
    /// Value classifier, `<EMAIL_ADDRESS>`.
    ValueRef(String),

    Raise,
    If,
    From,
    Import,
    And,
    Or,
    Not,
    In,
    Is,
    Tool,
    None_,
    True_,
    False_,

    Newline,
    Indent,
    Dedent,

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Dot,
    Star,
    Percent,
    Slash,
    Plus,
    Minus,
    /// `:=`
    Define,
    /// `->`
    Arrow,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    /// `=` (keyword arguments)
    Assign,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub span: Span,
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, CompileError> {
    Lexer::new(source).run()
}

struct Lexer<'s> {
    lines: Vec<&'s str>,
    tokens: Vec<Token>,
    indent_stack: Vec<usize>,
    bracket_depth: usize,
}

impl<'s> Lexer<'s> {
    fn new(source: &'s str) -> Self {
        Lexer {
            lines: source.lines().collect(),
            tokens: Vec::new(),
            indent_stack: vec![0],
            bracket_depth: 0,
        }
    }

    fn run(mut self) -> Result<Vec<Token>, CompileError> {
        for line_no in 0..self.lines.len() {
            let line = self.lines[line_no];
            let line_num = line_no + 1;

            if self.bracket_depth == 0 {
                let stripped = line.trim_start();
                if stripped.is_empty() || stripped.starts_with('#') {
                    continue;
                }
                let indent = line.len() - stripped.len();
                self.handle_indent(indent, line_num)?;
            }

            let produced = self.lex_line(line, line_num)?;
            if self.bracket_depth == 0 && produced {
                self.push(Tok::Newline, line_num, line.len() + 1);
            }
        }

        let last_line = self.lines.len().max(1);
        while self.indent_stack.len() > 1 {
            self.indent_stack.pop();
            self.push(Tok::Dedent, last_line, 1);
        }
        Ok(self.tokens)
    }

    fn handle_indent(&mut self, indent: usize, line: usize) -> Result<(), CompileError> {
        let current = *self.indent_stack.last().unwrap();
        if indent > current {
            self.indent_stack.push(indent);
            self.push(Tok::Indent, line, 1);
        } else if indent < current {
            while *self.indent_stack.last().unwrap() > indent {
                self.indent_stack.pop();
                self.push(Tok::Dedent, line, 1);
            }
            if *self.indent_stack.last().unwrap() != indent {
                return Err(parse_err(line, 1, "inconsistent indentation"));
            }
        }
        Ok(())
    }

    /// Lexes one physical line; returns whether any token was produced.
    fn lex_line(&mut self, line: &str, line_num: usize) -> Result<bool, CompileError> {
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;
        let mut produced = false;

        while i < chars.len() {
            let c = chars[i];
            let col = i + 1;

            if c == ' ' || c == '\t' {
                i += 1;
                continue;
            }
            if c == '#' {
                break;
            }

            produced = true;

            // r"..." regex literal
            if c == 'r' && i + 1 < chars.len() && (chars[i + 1] == '"' || chars[i + 1] == '\'') {
                let (value, next) = self.lex_string(&chars, i + 1, line_num, true)?;
                self.push(Tok::Regex(value), line_num, col);
                i = next;
                continue;
            }
            if c == '"' || c == '\'' {
                let (value, next) = self.lex_string(&chars, i, line_num, false)?;
                self.push(Tok::Str(value), line_num, col);
                i = next;
                continue;
            }
            if c.is_ascii_digit() {
                let (tok, next) = lex_number(&chars, i, line_num)?;
                self.push(tok, line_num, col);
                i = next;
                continue;
            }
            if c.is_ascii_alphabetic() || c == '_' {
                let mut j = i;
                while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                let word: String = chars[i..j].iter().collect();
                self.push(keyword_or_ident(word), line_num, col);
                i = j;
                continue;
            }

            let next = chars.get(i + 1).copied();
            let (tok, width) = match (c, next) {
                ('(', _) => (Tok::LParen, 1),
                (')', _) => (Tok::RParen, 1),
                ('{', _) => (Tok::LBrace, 1),
                ('}', _) => (Tok::RBrace, 1),
                ('[', _) => (Tok::LBracket, 1),
                (']', _) => (Tok::RBracket, 1),
                (',', _) => (Tok::Comma, 1),
                ('.', _) => (Tok::Dot, 1),
                ('*', _) => (Tok::Star, 1),
                ('%', _) => (Tok::Percent, 1),
                ('/', _) => (Tok::Slash, 1),
                ('+', _) => (Tok::Plus, 1),
                ('-', Some('>')) => (Tok::Arrow, 2),
                ('-', _) => (Tok::Minus, 1),
                (':', Some('=')) => (Tok::Define, 2),
                (':', _) => (Tok::Colon, 1),
                ('=', Some('=')) => (Tok::EqEq, 2),
                ('=', _) => (Tok::Assign, 1),
                ('!', Some('=')) => (Tok::NotEq, 2),
                ('<', _) => {
                    if let Some((name, width)) = lex_value_ref(&chars, i) {
                        (Tok::ValueRef(name), width)
                    } else if next == Some('=') {
                        (Tok::Le, 2)
                    } else {
                        (Tok::Lt, 1)
                    }
                }
                ('>', Some('=')) => (Tok::Ge, 2),
                ('>', _) => (Tok::Gt, 1),
                _ => {
                    return Err(parse_err(
                        line_num,
                        col,
                        format!("unexpected character '{c}'"),
                    ));
                }
            };

            match tok {
                Tok::LParen | Tok::LBrace | Tok::LBracket => self.bracket_depth += 1,
                Tok::RParen | Tok::RBrace | Tok::RBracket => {
                    self.bracket_depth = self.bracket_depth.saturating_sub(1)
                }
                _ => {}
            }
            self.push(tok, line_num, col);
            i += width;
        }

        Ok(produced)
    }

    fn lex_string(
        &self,
        chars: &[char],
        start: usize,
        line: usize,
        raw: bool,
    ) -> Result<(String, usize), CompileError> {
        let quote = chars[start];
        let mut value = String::new();
        let mut i = start + 1;
        while i < chars.len() {
            let c = chars[i];
            if c == '\\' && i + 1 < chars.len() {
                let escaped = chars[i + 1];
                if raw {
                    // Raw literals keep the backslash, except before the
                    // delimiting quote, which would otherwise be unwritable.
                    if escaped == quote {
                        value.push(quote);
                    } else {
                        value.push('\\');
                        value.push(escaped);
                    }
                } else {
                    match escaped {
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        '\\' => value.push('\\'),
                        q if q == quote => value.push(q),
                        other => {
                            value.push('\\');
                            value.push(other);
                        }
                    }
                }
                i += 2;
                continue;
            }
            if c == quote {
                return Ok((value, i + 1));
            }
            value.push(c);
            i += 1;
        }
        Err(parse_err(line, start + 1, "unterminated string literal"))
    }

    fn push(&mut self, tok: Tok, line: usize, column: usize) {
        self.tokens.push(Token {
            tok,
            span: Span { line, column },
        });
    }
}

fn keyword_or_ident(word: String) -> Tok {
    match word.as_str() {
        "raise" => Tok::Raise,
        "if" => Tok::If,
        "from" => Tok::From,
        "import" => Tok::Import,
        "and" => Tok::And,
        "or" => Tok::Or,
        "not" => Tok::Not,
        "in" => Tok::In,
        "is" => Tok::Is,
        "tool" => Tok::Tool,
        "None" => Tok::None_,
        "True" => Tok::True_,
        "False" => Tok::False_,
        _ => Tok::Ident(word),
    }
}

fn lex_number(chars: &[char], start: usize, line: usize) -> Result<(Tok, usize), CompileError> {
    let mut j = start;
    while j < chars.len() && chars[j].is_ascii_digit() {
        j += 1;
    }
    let mut is_float = false;
    if j + 1 < chars.len() && chars[j] == '.' && chars[j + 1].is_ascii_digit() {
        is_float = true;
        j += 1;
        while j < chars.len() && chars[j].is_ascii_digit() {
            j += 1;
        }
    }
    let text: String = chars[start..j].iter().collect();
    let tok = if is_float {
        Tok::Float(
            text.parse()
                .map_err(|_| parse_err(line, start + 1, format!("invalid number '{text}'")))?,
        )
    } else {
        Tok::Int(
            text.parse()
                .map_err(|_| parse_err(line, start + 1, format!("invalid number '{text}'")))?,
        )
    };
    Ok((tok, j))
}

/// `<UPPER_NAME>` classifier reference; anything else starting with `<` is a
/// comparison operator.
fn lex_value_ref(chars: &[char], start: usize) -> Option<(String, usize)> {
    let first = *chars.get(start + 1)?;
    if !(first.is_ascii_uppercase() || first == '_') {
        return None;
    }
    let mut j = start + 1;
    let mut name = String::new();
    while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
        name.push(chars[j]);
        j += 1;
    }
    if chars.get(j) == Some(&'>') && !name.is_empty() {
        Some((name, j + 1 - start))
    } else {
        None
    }
}

fn parse_err(line: usize, column: usize, message: impl Into<String>) -> CompileError {
    CompileError::Parse {
        line,
        column,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_indented_block() {
        let src = "raise \"X\" if:\n    a == 1\n    b == 2\n";
        let tokens = toks(src);
        assert_eq!(
            tokens,
            vec![
                Tok::Raise,
                Tok::Str("X".into()),
                Tok::If,
                Tok::Colon,
                Tok::Newline,
                Tok::Indent,
                Tok::Ident("a".into()),
                Tok::EqEq,
                Tok::Int(1),
                Tok::Newline,
                Tok::Ident("b".into()),
                Tok::EqEq,
                Tok::Int(2),
                Tok::Newline,
                Tok::Dedent,
            ]
        );
    }

    #[test]
    fn test_comments_and_blank_lines_ignored() {
        let src = "# header\n\nraise \"X\" if:\n    # inner\n    a == 1\n";
        let tokens = toks(src);
        assert!(tokens.contains(&Tok::Indent));
        assert!(!tokens.iter().any(|t| matches!(t, Tok::Ident(s) if s == "header")));
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            toks("a -> b"),
            vec![
                Tok::Ident("a".into()),
                Tok::Arrow,
                Tok::Ident("b".into()),
                Tok::Newline
            ]
        );
        assert_eq!(
            toks("x := 1 <= 2 != 3"),
            vec![
                Tok::Ident("x".into()),
                Tok::Define,
                Tok::Int(1),
                Tok::Le,
                Tok::Int(2),
                Tok::NotEq,
                Tok::Int(3),
                Tok::Newline
            ]
        );
    }

    #[test]
    fn test_value_ref_vs_comparison() {
        assert_eq!(
            toks("q < len"),
            vec![
                Tok::Ident("q".into()),
                Tok::Lt,
                Tok::Ident("len".into()),
                Tok::Newline
            ]
        );
        assert_eq!(
            toks("<EMAIL_ADDRESS>"),
            vec![Tok::ValueRef("EMAIL_ADDRESS".into()), Tok::Newline]
        );
    }

    #[test]
    fn test_regex_literal_keeps_backslashes() {
        let tokens = toks(r#"r"^\d+$""#);
        assert_eq!(tokens[0], Tok::Regex(r"^\d+$".into()));
    }

    #[test]
    fn test_string_escapes() {
        let tokens = toks(r#""a\"b\n""#);
        assert_eq!(tokens[0], Tok::Str("a\"b\n".into()));
    }

    #[test]
    fn test_brackets_span_lines() {
        let src = "raise \"X\" if:\n    call is tool:send({\n        to: \"a\"\n    })\n";
        let tokens = toks(src);
        // no Newline/Indent between the braces
        let lbrace = tokens.iter().position(|t| *t == Tok::LBrace).unwrap();
        let rbrace = tokens.iter().position(|t| *t == Tok::RBrace).unwrap();
        assert!(!tokens[lbrace..rbrace]
            .iter()
            .any(|t| matches!(t, Tok::Newline | Tok::Indent | Tok::Dedent)));
    }

    #[test]
    fn test_floats_and_ints() {
        assert_eq!(
            toks("0.7 42"),
            vec![Tok::Float(0.7), Tok::Int(42), Tok::Newline]
        );
    }

    #[test]
    fn test_inconsistent_dedent_is_error() {
        let src = "raise \"X\" if:\n        a == 1\n    b == 2\n";
        assert!(tokenize(src).is_err());
    }
}
