//! Step conditions and the CUSTOM expression grammar.
//!
//! ```text
//! expr   := or
//! or     := and (("or" | "||") and)*
//! and    := unary (("and" | "&&") unary)*
//! unary  := ("not" | "!") unary | atom
//! atom   := "(" expr ")"
//!         | "depSucceeded" "(" id ")" | "depFailed" "(" id ")"
//!         | id ".success" | id ".failed"
//!         | "true" | "false"
//! ```
//!
//! Expressions are parsed into [`Expr`] and evaluated over the sets of
//! completed and failed step ids. Nothing is compiled or executed
//! dynamically.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// When a step may run once its dependencies are resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Run regardless of dependency outcomes.
    Always,
    /// Run only if no dependency failed.
    #[default]
    OnSuccess,
    /// Run only if at least one dependency failed.
    OnFailure,
    /// Run when the expression holds.
    Custom(String),
}

impl Condition {
    /// Parse the expression of a CUSTOM condition. Other variants yield
    /// `Ok(None)`.
    pub fn parse_custom(&self) -> Result<Option<Expr>, ConditionError> {
        match self {
            Condition::Custom(src) => Expr::parse(src).map(Some),
            _ => Ok(None),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Always => f.write_str("always"),
            Condition::OnSuccess => f.write_str("on_success"),
            Condition::OnFailure => f.write_str("on_failure"),
            Condition::Custom(expr) => write!(f, "custom({expr})"),
        }
    }
}

/// A CUSTOM condition that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} at offset {offset}")]
pub struct ConditionError {
    pub offset: usize,
    pub message: String,
}

impl ConditionError {
    fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AST
// ─────────────────────────────────────────────────────────────────────────────

/// Parsed CUSTOM condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal(bool),
    Succeeded(String),
    Failed(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Parse an expression.
    pub fn parse(src: &str) -> Result<Expr, ConditionError> {
        let tokens = tokenize(src)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(tok) = parser.tokens.get(parser.pos) {
            return Err(ConditionError::new(
                tok.offset,
                format!("unexpected {}", tok.kind),
            ));
        }
        Ok(expr)
    }

    /// Step ids the expression mentions, in first-seen order.
    pub fn referenced_steps(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_steps(&mut out);
        out
    }

    fn collect_steps<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Succeeded(id) | Expr::Failed(id) => {
                if !out.contains(&id.as_str()) {
                    out.push(id);
                }
            }
            Expr::Not(inner) => inner.collect_steps(out),
            Expr::And(a, b) | Expr::Or(a, b) => {
                a.collect_steps(out);
                b.collect_steps(out);
            }
        }
    }

    /// Evaluate with three-valued logic.
    ///
    /// A term over a step that is in neither set is unknown. Returns
    /// `Some(_)` once the outcome can no longer change and `None` while it
    /// still depends on unresolved steps.
    pub fn evaluate(&self, completed: &HashSet<String>, failed: &HashSet<String>) -> Option<bool> {
        match self {
            Expr::Literal(b) => Some(*b),
            Expr::Succeeded(id) => resolved(id, completed, failed),
            Expr::Failed(id) => resolved(id, completed, failed).map(|ok| !ok),
            Expr::Not(inner) => inner.evaluate(completed, failed).map(|b| !b),
            Expr::And(a, b) => match (a.evaluate(completed, failed), b.evaluate(completed, failed)) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
            Expr::Or(a, b) => match (a.evaluate(completed, failed), b.evaluate(completed, failed)) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
        }
    }
}

/// `Some(true)` if completed, `Some(false)` if failed, `None` otherwise.
fn resolved(id: &str, completed: &HashSet<String>, failed: &HashSet<String>) -> Option<bool> {
    if completed.contains(id) {
        Some(true)
    } else if failed.contains(id) {
        Some(false)
    } else {
        None
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(b) => write!(f, "{b}"),
            Expr::Succeeded(id) => write!(f, "depSucceeded({id})"),
            Expr::Failed(id) => write!(f, "depFailed({id})"),
            Expr::Not(inner) => write!(f, "not {inner}"),
            Expr::And(a, b) => write!(f, "({a} and {b})"),
            Expr::Or(a, b) => write!(f, "({a} or {b})"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tokenizer
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Ident(String),
    Dot,
    LParen,
    RParen,
    Not,
    And,
    Or,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(s) => write!(f, "'{s}'"),
            TokenKind::Dot => f.write_str("'.'"),
            TokenKind::LParen => f.write_str("'('"),
            TokenKind::RParen => f.write_str("')'"),
            TokenKind::Not => f.write_str("'not'"),
            TokenKind::And => f.write_str("'and'"),
            TokenKind::Or => f.write_str("'or'"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn tokenize(src: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        let kind = match c {
            c if c.is_whitespace() => continue,
            '.' => TokenKind::Dot,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '!' => TokenKind::Not,
            '&' | '|' => {
                if chars.next_if(|&(_, n)| n == c).is_none() {
                    return Err(ConditionError::new(offset, format!("expected '{c}{c}'")));
                }
                if c == '&' {
                    TokenKind::And
                } else {
                    TokenKind::Or
                }
            }
            c if is_ident_char(c) => {
                let mut end = offset + c.len_utf8();
                while let Some((pos, n)) = chars.next_if(|&(_, n)| is_ident_char(n)) {
                    end = pos + n.len_utf8();
                }
                match &src[offset..end] {
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    word => TokenKind::Ident(word.to_string()),
                }
            }
            other => {
                return Err(ConditionError::new(
                    offset,
                    format!("unexpected character '{other}'"),
                ));
            }
        };
        tokens.push(Token { kind, offset });
    }

    if tokens.is_empty() {
        return Err(ConditionError::new(0, "empty expression"));
    }
    Ok(tokens)
}

// ─────────────────────────────────────────────────────────────────────────────
// Parser
// ─────────────────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.offset)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Option<TokenKind> {
        let tok = self.tokens.get(self.pos).map(|t| t.kind.clone());
        self.pos += 1;
        tok
    }

    fn expect(&mut self, expected: TokenKind) -> Result<(), ConditionError> {
        let offset = self.offset();
        match self.advance() {
            Some(kind) if kind == expected => Ok(()),
            Some(kind) => Err(ConditionError::new(
                offset,
                format!("expected {expected}, found {kind}"),
            )),
            None => Err(ConditionError::new(
                offset,
                format!("expected {expected}, found end of input"),
            )),
        }
    }

    fn expect_ident(&mut self) -> Result<String, ConditionError> {
        let offset = self.offset();
        match self.advance() {
            Some(TokenKind::Ident(id)) => Ok(id),
            Some(kind) => Err(ConditionError::new(
                offset,
                format!("expected step id, found {kind}"),
            )),
            None => Err(ConditionError::new(offset, "expected step id")),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&TokenKind::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&TokenKind::And) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&TokenKind::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Expr, ConditionError> {
        let offset = self.offset();
        match self.advance() {
            Some(TokenKind::LParen) => {
                let inner = self.parse_or()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            Some(TokenKind::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(true)),
                "false" => Ok(Expr::Literal(false)),
                "depSucceeded" | "depFailed" => {
                    self.expect(TokenKind::LParen)?;
                    let id = self.expect_ident()?;
                    self.expect(TokenKind::RParen)?;
                    Ok(if word == "depSucceeded" {
                        Expr::Succeeded(id)
                    } else {
                        Expr::Failed(id)
                    })
                }
                _ => {
                    self.expect(TokenKind::Dot)?;
                    let field_offset = self.offset();
                    match self.expect_ident()?.as_str() {
                        "success" => Ok(Expr::Succeeded(word)),
                        "failed" => Ok(Expr::Failed(word)),
                        other => Err(ConditionError::new(
                            field_offset,
                            format!("unknown predicate '.{other}', expected '.success' or '.failed'"),
                        )),
                    }
                }
            },
            Some(kind) => Err(ConditionError::new(offset, format!("unexpected {kind}"))),
            None => Err(ConditionError::new(offset, "unexpected end of input")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_predicates() {
        assert_eq!(
            Expr::parse("depSucceeded(fetch)").unwrap(),
            Expr::Succeeded("fetch".into())
        );
        assert_eq!(
            Expr::parse("fetch.failed").unwrap(),
            Expr::Failed("fetch".into())
        );
        assert_eq!(Expr::parse(" true ").unwrap(), Expr::Literal(true));
    }

    #[test]
    fn test_precedence() {
        // and binds tighter than or; not binds tighter than and.
        let expr = Expr::parse("a.success or not b.failed and c.success").unwrap();
        assert_eq!(
            expr,
            Expr::Or(
                Box::new(Expr::Succeeded("a".into())),
                Box::new(Expr::And(
                    Box::new(Expr::Not(Box::new(Expr::Failed("b".into())))),
                    Box::new(Expr::Succeeded("c".into())),
                )),
            )
        );
        let symbolic = Expr::parse("a.success || !b.failed && c.success").unwrap();
        assert_eq!(symbolic, expr);
    }

    #[test]
    fn test_parentheses() {
        let expr = Expr::parse("(a.success or b.success) and depFailed(c)").unwrap();
        assert!(matches!(expr, Expr::And(..)));
        assert_eq!(expr.referenced_steps(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_malformed() {
        for src in [
            "",
            "a",
            "a.succeeded",
            "a.success and",
            "(a.success",
            "a.success)",
            "depSucceeded(a",
            "a.success & b.success",
            "__import__('os')",
            "a.success; b",
        ] {
            assert!(Expr::parse(src).is_err(), "{src:?} should not parse");
        }
        let err = Expr::parse("a.success + b").unwrap_err();
        assert_eq!(err.offset, 10);
    }

    #[test]
    fn test_three_valued_evaluation() {
        let expr = Expr::parse("a.success and b.success").unwrap();
        assert_eq!(expr.evaluate(&set(&["a"]), &set(&[])), None);
        assert_eq!(expr.evaluate(&set(&[]), &set(&["a"])), Some(false));
        assert_eq!(expr.evaluate(&set(&["a", "b"]), &set(&[])), Some(true));

        let expr = Expr::parse("a.failed or b.success").unwrap();
        assert_eq!(expr.evaluate(&set(&[]), &set(&["a"])), Some(true));
        assert_eq!(expr.evaluate(&set(&["a"]), &set(&[])), None);
        assert_eq!(expr.evaluate(&set(&["a"]), &set(&["b"])), Some(false));

        let expr = Expr::parse("not a.success").unwrap();
        assert_eq!(expr.evaluate(&set(&[]), &set(&[])), None);
        assert_eq!(expr.evaluate(&set(&[]), &set(&["a"])), Some(true));
    }

    #[test]
    fn test_condition_serde() {
        let c: Condition = serde_json::from_str("\"on_failure\"").unwrap();
        assert_eq!(c, Condition::OnFailure);
        let c: Condition = serde_json::from_str(r#"{"custom": "a.success"}"#).unwrap();
        assert_eq!(c, Condition::Custom("a.success".into()));
        assert_eq!(Condition::default(), Condition::OnSuccess);
        assert!(Condition::Always.parse_custom().unwrap().is_none());
    }
}
