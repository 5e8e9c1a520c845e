use super::where_clause::value_expr;
use crate::lexer::{render, split_top_level, Lexeme};
use crate::parsed_query::ParsedQuery;
use crate::plan::{DdlPlan, ExecPlan, PlanType, SetPlan, ValueExpr};
use tablet_common::Value;

/// Table name at `i`, skipping a database qualifier. Returns the name and
/// the index after it.
fn table_name_at(lexemes: &[Lexeme], i: usize) -> Option<(String, usize)> {
    let first = lexemes.get(i)?.ident()?;
    if lexemes.get(i + 1).map_or(false, |l| l.is_symbol(".")) {
        let table = lexemes.get(i + 2)?.ident()?;
        return Some((table.to_string(), i + 3));
    }
    Some((first.to_string(), i + 1))
}

fn position_of(lexemes: &[Lexeme], keyword: &str) -> Option<usize> {
    lexemes.iter().position(|l| l.is_keyword(keyword))
}

/// Skip `if [not] exists`.
fn skip_if_exists(lexemes: &[Lexeme], mut i: usize) -> usize {
    if lexemes.get(i).map_or(false, |l| l.is_keyword("if")) {
        i += 1;
        if lexemes.get(i).map_or(false, |l| l.is_keyword("not")) {
            i += 1;
        }
        if lexemes.get(i).map_or(false, |l| l.is_keyword("exists")) {
            i += 1;
        }
    }
    i
}

/// Table named by `... on <table>` in index statements.
fn index_target(lexemes: &[Lexeme]) -> Option<String> {
    position_of(lexemes, "on").and_then(|p| table_name_at(lexemes, p + 1).map(|(n, _)| n))
}

pub(crate) fn analyze_ddl(lexemes: &[Lexeme]) -> DdlPlan {
    let action = lexemes
        .first()
        .and_then(Lexeme::ident)
        .unwrap_or_default()
        .to_ascii_lowercase();
    let mut plan = DdlPlan {
        action: action.clone(),
        table_name: None,
        new_name: None,
    };
    match action.as_str() {
        "create" => {
            if let Some(p) = position_of(lexemes, "table") {
                plan.new_name = table_name_at(lexemes, skip_if_exists(lexemes, p + 1)).map(|(n, _)| n);
            } else if position_of(lexemes, "index").is_some() {
                let target = index_target(lexemes);
                plan.table_name = target.clone();
                plan.new_name = target;
            }
        }
        "alter" => {
            if let Some(p) = position_of(lexemes, "table") {
                if let Some((name, after)) = table_name_at(lexemes, p + 1) {
                    let renamed = position_of(&lexemes[after..], "rename").and_then(|r| {
                        let mut j = after + r + 1;
                        if lexemes.get(j).map_or(false, |l| l.is_keyword("to") || l.is_keyword("as")) {
                            j += 1;
                        }
                        table_name_at(lexemes, j).map(|(n, _)| n)
                    });
                    plan.new_name = Some(renamed.unwrap_or_else(|| name.clone()));
                    plan.table_name = Some(name);
                }
            }
        }
        "drop" => {
            if let Some(p) = position_of(lexemes, "table") {
                plan.table_name = table_name_at(lexemes, skip_if_exists(lexemes, p + 1)).map(|(n, _)| n);
            } else if position_of(lexemes, "index").is_some() {
                let target = index_target(lexemes);
                plan.table_name = target.clone();
                plan.new_name = target;
            }
        }
        "rename" => {
            let start = if lexemes.get(1).map_or(false, |l| l.is_keyword("table")) { 2 } else { 1 };
            if let Some((from, after)) = table_name_at(lexemes, start) {
                plan.table_name = Some(from);
                if lexemes.get(after).map_or(false, |l| l.is_keyword("to")) {
                    plan.new_name = table_name_at(lexemes, after + 1).map(|(n, _)| n);
                }
            }
        }
        "truncate" => {
            let start = if lexemes.get(1).map_or(false, |l| l.is_keyword("table")) { 2 } else { 1 };
            let name = table_name_at(lexemes, start).map(|(n, _)| n);
            plan.table_name = name.clone();
            plan.new_name = name;
        }
        _ => {}
    }
    plan
}

pub(crate) fn build_ddl(lexemes: &[Lexeme]) -> ExecPlan {
    let ddl = analyze_ddl(lexemes);
    let tables: Vec<String> = ddl
        .table_name
        .iter()
        .chain(ddl.new_name.iter())
        .fold(Vec::new(), |mut acc, t| {
            if !acc.contains(t) {
                acc.push(t.clone());
            }
            acc
        });
    let mut plan = ExecPlan::new(PlanType::Ddl, ParsedQuery::new(render(lexemes))).with_tables(tables);
    plan.table_name = ddl.table_name.clone().or_else(|| ddl.new_name.clone());
    plan.ddl = Some(ddl);
    plan
}

pub(crate) fn build_set(lexemes: &[Lexeme]) -> ExecPlan {
    let mut plan = ExecPlan::new(PlanType::Set, ParsedQuery::new(render(lexemes)));
    let assignments = split_top_level(&lexemes[1..], ",");
    if let [[key, eq, value]] = assignments.as_slice() {
        let parsed = match value {
            Lexeme::Word(w) if w.eq_ignore_ascii_case("on") || w.eq_ignore_ascii_case("true") => {
                Some(ValueExpr::Literal(Value::Int64(1)))
            }
            Lexeme::Word(w) if w.eq_ignore_ascii_case("off") || w.eq_ignore_ascii_case("false") => {
                Some(ValueExpr::Literal(Value::Int64(0)))
            }
            other => value_expr(other),
        };
        if let (Some(k), true, Some(v)) = (key.ident(), eq.is_symbol("="), parsed) {
            plan.set = Some(SetPlan {
                key: k.to_ascii_lowercase(),
                value: v,
            });
        }
    }
    plan
}

pub(crate) fn build_other(lexemes: &[Lexeme]) -> ExecPlan {
    let describes = lexemes
        .first()
        .map_or(false, |l| l.is_keyword("describe") || l.is_keyword("desc"));
    let tables = if describes {
        table_name_at(lexemes, 1).map(|(n, _)| vec![n]).unwrap_or_default()
    } else {
        Vec::new()
    };
    ExecPlan::new(PlanType::Other, ParsedQuery::new(render(lexemes))).with_tables(tables)
}
