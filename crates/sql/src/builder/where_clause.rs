//! Clause splitting and predicate analysis shared by the statement builders.

use crate::lexer::{is_parenthesized, position_top_level, render, split_top_level, Lexeme};
use crate::plan::{PkValue, ValueExpr};
use crate::schema::Table;
use tablet_common::Value;

/// Top-level clauses of a statement, each slice starting at its keyword.
pub(crate) struct Clauses<'a> {
    parts: Vec<(&'static str, &'a [Lexeme])>,
}

impl<'a> Clauses<'a> {
    pub(crate) fn split(lexemes: &'a [Lexeme], keywords: &[&'static str]) -> Self {
        let mut parts: Vec<(&'static str, &'a [Lexeme])> = Vec::new();
        let mut current: Option<(&'static str, usize)> = None;
        let mut depth = 0usize;
        for (i, lexeme) in lexemes.iter().enumerate() {
            if depth == 0 {
                if let Some(kw) = keywords.iter().find(|k| lexeme.is_keyword(k)) {
                    if let Some((name, start)) = current.take() {
                        parts.push((name, &lexemes[start..i]));
                    }
                    current = Some((*kw, i));
                }
            }
            if lexeme.is_symbol("(") {
                depth += 1;
            } else if lexeme.is_symbol(")") {
                depth = depth.saturating_sub(1);
            }
        }
        if let Some((name, start)) = current {
            parts.push((name, &lexemes[start..]));
        }
        Self { parts }
    }

    pub(crate) fn has(&self, keyword: &str) -> bool {
        self.parts.iter().any(|(k, _)| *k == keyword)
    }

    /// The whole clause including its keyword.
    pub(crate) fn full(&self, keyword: &str) -> Option<&'a [Lexeme]> {
        self.parts.iter().find(|(k, _)| *k == keyword).map(|(_, s)| *s)
    }

    /// Clause contents without the keyword (and without `by` for ordering clauses).
    pub(crate) fn body(&self, keyword: &str) -> Option<&'a [Lexeme]> {
        self.full(keyword).map(|s| {
            let s = &s[1..];
            match s.first() {
                Some(l) if l.is_keyword("by") => &s[1..],
                _ => s,
            }
        })
    }

    pub(crate) fn count(&self, keyword: &str) -> usize {
        self.parts.iter().filter(|(k, _)| *k == keyword).count()
    }
}

/// A WHERE-clause conjunct.
#[derive(Debug)]
pub(crate) enum Condition {
    Eq { column: String, value: ValueExpr },
    In { column: String, values: Vec<ValueExpr> },
    Other,
}

pub(crate) fn value_expr(lexeme: &Lexeme) -> Option<ValueExpr> {
    match lexeme {
        Lexeme::Number(n) => Some(ValueExpr::Literal(Value::from_number_literal(n))),
        Lexeme::Str(s) => Some(ValueExpr::Literal(Value::Text(s.clone()))),
        Lexeme::Bind(name) => Some(ValueExpr::Bind(name.clone())),
        _ => None,
    }
}

/// Column reference, optionally qualified. Returns the bare column name.
pub(crate) fn column_ref(lexemes: &[Lexeme]) -> Option<String> {
    match lexemes {
        [col] => col.ident().map(str::to_string),
        [_qualifier, dot, col] if dot.is_symbol(".") => col.ident().map(str::to_string),
        [_db, d1, _table, d2, col] if d1.is_symbol(".") && d2.is_symbol(".") => {
            col.ident().map(str::to_string)
        }
        _ => None,
    }
}

/// Split a predicate into its AND-ed conjuncts, descending into parentheses.
pub(crate) fn conjuncts(lexemes: &[Lexeme]) -> Vec<&[Lexeme]> {
    if is_parenthesized(lexemes) {
        return conjuncts(&lexemes[1..lexemes.len() - 1]);
    }
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut in_between = false;
    for (i, lexeme) in lexemes.iter().enumerate() {
        if lexeme.is_symbol("(") {
            depth += 1;
        } else if lexeme.is_symbol(")") {
            depth = depth.saturating_sub(1);
        } else if depth == 0 && lexeme.is_keyword("between") {
            in_between = true;
        } else if depth == 0 && lexeme.is_keyword("and") {
            if in_between {
                in_between = false;
            } else {
                out.extend(conjuncts(&lexemes[start..i]));
                start = i + 1;
            }
        }
    }
    if start == 0 {
        out.push(lexemes);
    } else {
        out.extend(conjuncts(&lexemes[start..]));
    }
    out
}

pub(crate) fn condition(lexemes: &[Lexeme]) -> Condition {
    let op = match position_top_level(lexemes, |l| l.is_symbol("=") || l.is_keyword("in")) {
        Some(op) => op,
        None => return Condition::Other,
    };
    let column = match column_ref(&lexemes[..op]) {
        Some(c) => c,
        None => return Condition::Other,
    };
    let rhs = &lexemes[op + 1..];
    if lexemes[op].is_symbol("=") {
        return match rhs {
            [v] => value_expr(v).map_or(Condition::Other, |value| Condition::Eq { column, value }),
            _ => Condition::Other,
        };
    }
    if !is_parenthesized(rhs) {
        return Condition::Other;
    }
    let mut values = Vec::new();
    for item in split_top_level(&rhs[1..rhs.len() - 1], ",") {
        match item {
            [v] => match value_expr(v) {
                Some(value) => values.push(value),
                None => return Condition::Other,
            },
            _ => return Condition::Other,
        }
    }
    Condition::In { column, values }
}

/// Primary key values when the predicate is an equality or IN on every key
/// column, each exactly once, and nothing else.
pub(crate) fn pk_values(where_body: &[Lexeme], table: &Table) -> Option<Vec<PkValue>> {
    let mut values: Vec<Option<PkValue>> = vec![None; table.pk_columns.len()];
    for part in conjuncts(where_body) {
        let (column, value) = match condition(part) {
            Condition::Eq { column, value } => (column, PkValue::Single(value)),
            Condition::In { column, values } => (column, PkValue::List(values)),
            Condition::Other => return None,
        };
        let idx = table.pk_index_of(&column)?;
        if values[idx].is_some() {
            return None;
        }
        values[idx] = Some(value);
    }
    values.into_iter().collect()
}

/// Parsed `LIMIT` clause body.
#[derive(Debug)]
pub(crate) struct Limit {
    pub(crate) count: Option<ValueExpr>,
    pub(crate) has_offset: bool,
}

pub(crate) fn limit(body: &[Lexeme]) -> Limit {
    match body {
        [count] => Limit {
            count: value_expr(count),
            has_offset: false,
        },
        _ => Limit {
            count: None,
            has_offset: true,
        },
    }
}

/// A single table reference with an optional alias and index hints.
#[derive(Debug)]
pub(crate) struct TableRef {
    pub(crate) name: String,
}

pub(crate) fn single_table(lexemes: &[Lexeme]) -> Option<TableRef> {
    let hint = lexemes
        .iter()
        .position(|l| l.is_keyword("use") || l.is_keyword("force") || l.is_keyword("ignore"))
        .unwrap_or(lexemes.len());
    let (name, rest) = match &lexemes[..hint] {
        [db, dot, table, rest @ ..] if dot.is_symbol(".") => {
            db.ident()?;
            (table.ident()?.to_string(), rest)
        }
        [table, rest @ ..] => (table.ident()?.to_string(), rest),
        [] => return None,
    };
    match rest {
        [] => {}
        [alias] if alias.ident().is_some() && !is_join_word(alias) => {}
        [as_kw, alias] if as_kw.is_keyword("as") && alias.ident().is_some() => {}
        _ => return None,
    }
    Some(TableRef { name })
}

fn is_join_word(lexeme: &Lexeme) -> bool {
    ["join", "inner", "left", "right", "cross", "natural", "straight_join"]
        .iter()
        .any(|k| lexeme.is_keyword(k))
}

/// Best-effort list of tables named in a FROM-like clause body.
pub(crate) fn referenced_tables(lexemes: &[Lexeme]) -> Vec<String> {
    let mut tables = Vec::new();
    let mut depth = 0usize;
    let mut expect_table = true;
    let mut i = 0;
    while i < lexemes.len() {
        let lexeme = &lexemes[i];
        if lexeme.is_symbol("(") {
            if depth == 0 {
                // derived table
                expect_table = false;
            }
            depth += 1;
        } else if lexeme.is_symbol(")") {
            depth = depth.saturating_sub(1);
        } else if depth == 0 {
            if lexeme.is_symbol(",") || lexeme.is_keyword("join") || lexeme.is_keyword("straight_join") {
                expect_table = true;
            } else if expect_table {
                if let Some(name) = lexeme.ident() {
                    // db.table keeps only the table part
                    let name = match (lexemes.get(i + 1), lexemes.get(i + 2)) {
                        (Some(dot), Some(t)) if dot.is_symbol(".") && t.ident().is_some() => {
                            i += 2;
                            t.ident().unwrap_or(name)
                        }
                        _ => name,
                    };
                    if !tables.iter().any(|t: &String| t.eq_ignore_ascii_case(name)) {
                        tables.push(name.to_string());
                    }
                }
                expect_table = false;
            }
        }
        i += 1;
    }
    tables
}

/// Render a column name, quoting it when it is not a plain identifier.
pub(crate) fn column_sql(name: &str) -> String {
    let plain = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if plain {
        name.to_string()
    } else {
        format!("`{}`", name.replace('`', "``"))
    }
}

pub(crate) fn column_list(table: &Table, positions: &[usize]) -> String {
    positions
        .iter()
        .map(|&i| column_sql(&table.columns[i].name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render clause slices in order, skipping absent ones.
pub(crate) fn render_parts(parts: &[Option<&[Lexeme]>]) -> String {
    parts
        .iter()
        .flatten()
        .map(|p| render(p))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
