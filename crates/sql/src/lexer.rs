//! Statement lexing on top of the sqlparser MySQL tokenizer.
//!
//! Statements are classified and rewritten at the token level: the builder
//! only needs clause boundaries, simple predicates and a faithful way to
//! render fragments back to SQL text.

use crate::error::PlanError;
use sqlparser::dialect::MySqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::fmt;
use tablet_common::types::encode_string;

/// Words after which an opening parenthesis is preceded by a space.
const SPACED_KEYWORDS: &[&str] = &[
    "all", "and", "any", "as", "between", "by", "distinct", "else", "exists", "from", "having",
    "in", "index", "is", "join", "key", "like", "limit", "not", "on", "or", "select", "set",
    "some", "then", "union", "using", "value", "values", "when", "where",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lexeme {
    /// Unquoted identifier or keyword
    Word(String),
    /// Backtick-quoted identifier
    Quoted(String),
    Number(String),
    /// String literal, unescaped
    Str(String),
    /// `:name` bind variable
    Bind(String),
    Symbol(String),
}

impl Lexeme {
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Lexeme::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    pub fn is_symbol(&self, symbol: &str) -> bool {
        matches!(self, Lexeme::Symbol(s) if s == symbol)
    }

    /// Identifier text for plain or quoted names.
    pub fn ident(&self) -> Option<&str> {
        match self {
            Lexeme::Word(w) | Lexeme::Quoted(w) => Some(w),
            _ => None,
        }
    }

    /// True for literals and bind variables, the only operands a
    /// primary-key predicate may compare against.
    pub fn is_value(&self) -> bool {
        matches!(
            self,
            Lexeme::Number(_) | Lexeme::Str(_) | Lexeme::Bind(_)
        )
    }

    fn is_spaced_keyword(&self) -> bool {
        match self {
            Lexeme::Word(w) => SPACED_KEYWORDS.iter().any(|k| w.eq_ignore_ascii_case(k)),
            _ => false,
        }
    }
}

impl fmt::Display for Lexeme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lexeme::Word(w) | Lexeme::Number(w) | Lexeme::Symbol(w) => f.write_str(w),
            Lexeme::Quoted(w) => write!(f, "`{}`", w.replace('`', "``")),
            Lexeme::Str(s) => {
                let mut out = String::with_capacity(s.len() + 2);
                encode_string(s, &mut out);
                f.write_str(&out)
            }
            Lexeme::Bind(name) => write!(f, ":{}", name),
        }
    }
}

/// Split a statement into lexemes, dropping whitespace and comments.
pub fn tokenize(sql: &str) -> Result<Vec<Lexeme>, PlanError> {
    let dialect = MySqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| PlanError::Syntax(e.to_string()))?;

    let mut out: Vec<Lexeme> = Vec::with_capacity(tokens.len());
    let mut iter = tokens.into_iter().peekable();
    while let Some(token) = iter.next() {
        let lexeme = match token {
            Token::Whitespace(_) | Token::EOF => continue,
            Token::SemiColon => {
                // A trailing semicolon is harmless; anything after it is a second statement.
                if iter.any(|t| !matches!(t, Token::Whitespace(_) | Token::EOF | Token::SemiColon)) {
                    return Err(PlanError::Syntax("multiple statements".to_string()));
                }
                break;
            }
            Token::Word(w) => match w.quote_style {
                Some(_) => Lexeme::Quoted(w.value),
                None => Lexeme::Word(w.value),
            },
            Token::Number(n, _) => {
                if out.last().map_or(false, |l| l.is_symbol("-")) && merges_sign(&out) {
                    out.pop();
                    Lexeme::Number(format!("-{}", n))
                } else {
                    Lexeme::Number(n)
                }
            }
            Token::SingleQuotedString(s) | Token::DoubleQuotedString(s) => Lexeme::Str(s),
            Token::Placeholder(p) if p.starts_with(':') && p.len() > 1 => {
                Lexeme::Bind(p[1..].to_string())
            }
            Token::Colon | Token::DoubleColon => match iter.peek() {
                Some(Token::Word(w)) if w.quote_style.is_none() => {
                    let name = w.value.clone();
                    iter.next();
                    Lexeme::Bind(name)
                }
                _ => Lexeme::Symbol(":".to_string()),
            },
            other => Lexeme::Symbol(other.to_string()),
        };
        out.push(lexeme);
    }

    if out.is_empty() {
        return Err(PlanError::Syntax("empty statement".to_string()));
    }
    Ok(out)
}

/// A `-` directly before a number is a sign when it cannot be a binary
/// operator, i.e. it starts the statement or follows another operator.
fn merges_sign(out: &[Lexeme]) -> bool {
    match out.len().checked_sub(2).map(|i| &out[i]) {
        None => true,
        Some(Lexeme::Symbol(s)) => s != ")",
        Some(l) => l.is_spaced_keyword(),
    }
}

/// Render lexemes back to SQL text with canonical spacing.
pub fn render(lexemes: &[Lexeme]) -> String {
    let mut out = String::new();
    let mut prev: Option<&Lexeme> = None;
    for lexeme in lexemes {
        if let Some(p) = prev {
            if needs_space(p, lexeme) {
                out.push(' ');
            }
        }
        out.push_str(&lexeme.to_string());
        prev = Some(lexeme);
    }
    out
}

fn needs_space(prev: &Lexeme, next: &Lexeme) -> bool {
    if next.is_symbol(",") || next.is_symbol(")") || next.is_symbol(".") {
        return false;
    }
    if prev.is_symbol("(") || prev.is_symbol(".") {
        return false;
    }
    if next.is_symbol("(") {
        return match prev {
            Lexeme::Word(_) => prev.is_spaced_keyword(),
            Lexeme::Quoted(_) => false,
            _ => true,
        };
    }
    true
}

/// Position of the first lexeme at parenthesis depth zero matching `pred`.
pub fn position_top_level(lexemes: &[Lexeme], pred: impl Fn(&Lexeme) -> bool) -> Option<usize> {
    let mut depth = 0usize;
    for (i, lexeme) in lexemes.iter().enumerate() {
        if depth == 0 && pred(lexeme) {
            return Some(i);
        }
        if lexeme.is_symbol("(") {
            depth += 1;
        } else if lexeme.is_symbol(")") {
            depth = depth.saturating_sub(1);
        }
    }
    None
}

/// Split on a top-level symbol such as `,`.
pub fn split_top_level<'a>(lexemes: &'a [Lexeme], separator: &str) -> Vec<&'a [Lexeme]> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, lexeme) in lexemes.iter().enumerate() {
        if lexeme.is_symbol("(") {
            depth += 1;
        } else if lexeme.is_symbol(")") {
            depth = depth.saturating_sub(1);
        } else if depth == 0 && lexeme.is_symbol(separator) {
            parts.push(&lexemes[start..i]);
            start = i + 1;
        }
    }
    parts.push(&lexemes[start..]);
    parts
}

/// True when the whole slice is one parenthesized group.
pub fn is_parenthesized(lexemes: &[Lexeme]) -> bool {
    if lexemes.len() < 2 || !lexemes[0].is_symbol("(") || !lexemes[lexemes.len() - 1].is_symbol(")") {
        return false;
    }
    position_top_level(&lexemes[1..], |l| l.is_symbol(")")) == Some(lexemes.len() - 2)
}
