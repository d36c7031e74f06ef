//! Boolean filter expressions over test records.
//!
//! Grammar (loosest to tightest binding):
//!
//! ```text
//! expr    := and ("or" and)*
//! and     := unary ("and" unary)*
//! unary   := "not" unary | primary
//! primary := "(" expr ")" | term
//! term    := "marker:" NAME | "keyword:" WORD | WORD
//! ```
//!
//! A bare `WORD` is a keyword or a marker term depending on the [`TermKind`]
//! the text is parsed with. Keyword terms are case-insensitive substring
//! matches against the qualified name and the file name; marker terms are exact
//! membership tests against the marker set.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::model::TestRecord;

const MARKER_PREFIX: &str = "marker:";
const KEYWORD_PREFIX: &str = "keyword:";

/// A parsed filter expression.
///
/// Plain data: safe to share across threads and evaluate concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterExpression {
    Keyword(String),
    Marker(String),
    And(Box<FilterExpression>, Box<FilterExpression>),
    Or(Box<FilterExpression>, Box<FilterExpression>),
    Not(Box<FilterExpression>),
}

/// How bare words are interpreted while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TermKind {
    #[default]
    Keyword,
    Marker,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected `{token}` at byte {position}")]
    UnexpectedToken { token: String, position: usize },
    #[error("unclosed `(` at byte {position}")]
    UnclosedParen { position: usize },
    #[error("empty term name at byte {position}")]
    EmptyTerm { position: usize },
}

impl FilterExpression {
    /// Keyword term; the needle is stored lowercased.
    #[must_use]
    pub fn keyword(needle: &str) -> Self {
        Self::Keyword(needle.to_lowercase())
    }

    #[must_use]
    pub fn marker(name: &str) -> Self {
        Self::Marker(name.to_string())
    }

    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Parse with bare words as keyword terms. Blank text yields `None`
    /// (matches every record).
    ///
    /// # Errors
    ///
    /// Returns `FilterError` on malformed syntax.
    pub fn parse(text: &str) -> Result<Option<Self>, FilterError> {
        Self::parse_as(text, TermKind::Keyword)
    }

    /// Parse with bare words as marker terms (`-m` style).
    ///
    /// # Errors
    ///
    /// Returns `FilterError` on malformed syntax.
    pub fn parse_markers(text: &str) -> Result<Option<Self>, FilterError> {
        Self::parse_as(text, TermKind::Marker)
    }

    /// Parse with an explicit interpretation for bare words.
    ///
    /// # Errors
    ///
    /// Returns `FilterError` on malformed syntax.
    pub fn parse_as(text: &str, bare: TermKind) -> Result<Option<Self>, FilterError> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Ok(None);
        }
        let mut parser = Parser {
            tokens,
            index: 0,
            bare,
        };
        let expr = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(FilterError::UnexpectedToken {
                token: token.text(),
                position: token.position,
            });
        }
        Ok(Some(expr))
    }

    /// Evaluate against a record.
    #[must_use]
    pub fn matches(&self, record: &TestRecord) -> bool {
        let subject = Subject::new(record);
        self.eval(&subject)
    }

    fn eval(&self, subject: &Subject<'_>) -> bool {
        match self {
            Self::Keyword(needle) => subject.contains_keyword(needle),
            Self::Marker(name) => subject.record.has_marker(name),
            Self::And(a, b) => a.eval(subject) && b.eval(subject),
            Self::Or(a, b) => a.eval(subject) || b.eval(subject),
            Self::Not(inner) => !inner.eval(subject),
        }
    }
}

/// Evaluate an optional expression; `None` matches every record.
#[must_use]
pub fn evaluate(record: &TestRecord, expr: Option<&FilterExpression>) -> bool {
    expr.is_none_or(|e| e.matches(record))
}

/// Lowercased views of the record computed once per evaluation.
struct Subject<'a> {
    record: &'a TestRecord,
    name: String,
    file_name: String,
}

impl<'a> Subject<'a> {
    fn new(record: &'a TestRecord) -> Self {
        Self {
            record,
            name: record.qualified_name.to_lowercase(),
            file_name: record.file_name().to_lowercase(),
        }
    }

    fn contains_keyword(&self, needle: &str) -> bool {
        let needle: Cow<'_, str> = if needle.chars().any(char::is_uppercase) {
            Cow::Owned(needle.to_lowercase())
        } else {
            Cow::Borrowed(needle)
        };
        self.name.contains(needle.as_ref()) || self.file_name.contains(needle.as_ref())
    }
}

// ─── Request filters ────────────────────────────────────────────────────────

/// Filter strings as carried by a collection request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker_expression: Option<String>,
}

impl Filters {
    #[must_use]
    pub fn keyword(expr: &str) -> Self {
        Self {
            keyword: Some(expr.to_string()),
            marker_expression: None,
        }
    }

    #[must_use]
    pub fn marker(expr: &str) -> Self {
        Self {
            keyword: None,
            marker_expression: Some(expr.to_string()),
        }
    }

    /// Compile both strings into one expression (their conjunction).
    ///
    /// # Errors
    ///
    /// Returns `FilterError` if either string is malformed.
    pub fn compile(&self) -> Result<Option<FilterExpression>, FilterError> {
        let keyword = match self.keyword.as_deref() {
            Some(text) => FilterExpression::parse_as(text, TermKind::Keyword)?,
            None => None,
        };
        let marker = match self.marker_expression.as_deref() {
            Some(text) => FilterExpression::parse_as(text, TermKind::Marker)?,
            None => None,
        };
        Ok(match (keyword, marker) {
            (Some(k), Some(m)) => Some(k.and(m)),
            (k, m) => k.or(m),
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keyword.as_deref().is_none_or(|s| s.trim().is_empty())
            && self
                .marker_expression
                .as_deref()
                .is_none_or(|s| s.trim().is_empty())
    }
}

// ─── Tokenizer ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Word(String),
    LParen,
    RParen,
    And,
    Or,
    Not,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

impl Token {
    fn text(&self) -> String {
        match &self.kind {
            TokenKind::Word(w) => w.clone(),
            TokenKind::LParen => "(".to_string(),
            TokenKind::RParen => ")".to_string(),
            TokenKind::And => "and".to_string(),
            TokenKind::Or => "or".to_string(),
            TokenKind::Not => "not".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(position, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '(' || c == ')' {
            chars.next();
            let kind = if c == '(' {
                TokenKind::LParen
            } else {
                TokenKind::RParen
            };
            tokens.push(Token { kind, position });
            continue;
        }

        let mut end = position;
        while let Some(&(i, ch)) = chars.peek() {
            if ch.is_whitespace() || ch == '(' || ch == ')' {
                break;
            }
            end = i + ch.len_utf8();
            chars.next();
        }
        let word = &input[position..end];
        let kind = match word {
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            _ => TokenKind::Word(word.to_string()),
        };
        tokens.push(Token { kind, position });
    }

    tokens
}

// ─── Parser ─────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    index: usize,
    bare: TermKind,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().is_some_and(|t| &t.kind == kind) {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<FilterExpression, FilterError> {
        let mut expr = self.parse_and()?;
        while self.eat(&TokenKind::Or) {
            expr = expr.or(self.parse_and()?);
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<FilterExpression, FilterError> {
        let mut expr = self.parse_unary()?;
        while self.eat(&TokenKind::And) {
            expr = expr.and(self.parse_unary()?);
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<FilterExpression, FilterError> {
        if self.eat(&TokenKind::Not) {
            return Ok(self.parse_unary()?.negate());
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<FilterExpression, FilterError> {
        let token = self.peek().cloned().ok_or(FilterError::UnexpectedEnd)?;
        self.index += 1;
        match token.kind {
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                if !self.eat(&TokenKind::RParen) {
                    return Err(match self.peek() {
                        Some(t) => FilterError::UnexpectedToken {
                            token: t.text(),
                            position: t.position,
                        },
                        None => FilterError::UnclosedParen {
                            position: token.position,
                        },
                    });
                }
                Ok(inner)
            }
            TokenKind::Word(word) => self.term(&word, token.position),
            _ => Err(FilterError::UnexpectedToken {
                token: token.text(),
                position: token.position,
            }),
        }
    }

    fn term(&self, word: &str, position: usize) -> Result<FilterExpression, FilterError> {
        let (kind, name) = if let Some(name) = word.strip_prefix(MARKER_PREFIX) {
            (TermKind::Marker, name)
        } else if let Some(name) = word.strip_prefix(KEYWORD_PREFIX) {
            (TermKind::Keyword, name)
        } else {
            (self.bare, word)
        };
        if name.is_empty() {
            return Err(FilterError::EmptyTerm { position });
        }
        Ok(match kind {
            TermKind::Keyword => FilterExpression::keyword(name),
            TermKind::Marker => FilterExpression::marker(name),
        })
    }
}
