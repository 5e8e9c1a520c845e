//! Statement classification.
//!
//! `build_plan` dispatches on the leading keyword and produces an
//! [`ExecPlan`] describing how the executor runs the statement. Planning is
//! purely a function of the statement text and the table metadata, never of
//! bind variable values.

mod ddl;
mod dml;
mod insert;
mod select;
mod where_clause;

use crate::error::PlanError;
use crate::lexer::{render, tokenize, Lexeme};
use crate::parsed_query::ParsedQuery;
use crate::plan::{ExecPlan, PlanType, Reason};
use crate::schema::Table;
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use std::sync::Arc;

/// Resolves a table name to its metadata.
pub type TableLookup<'a> = &'a dyn Fn(&str) -> Option<Arc<Table>>;

pub fn build_plan(sql: &str, get_table: TableLookup<'_>) -> Result<ExecPlan, PlanError> {
    let lexemes = tokenize(sql)?;
    let first = &lexemes[0];

    if first.is_symbol("(") {
        validate(&lexemes)?;
        return Ok(ExecPlan::new(PlanType::PassSelect, ParsedQuery::new(render(&lexemes)))
            .with_reason(Reason::Select));
    }

    let keyword = match first {
        Lexeme::Word(w) => w.to_ascii_lowercase(),
        other => return Err(PlanError::Syntax(format!("unexpected '{}' at start of statement", other))),
    };
    let plan = match keyword.as_str() {
        "select" => {
            validate(&lexemes)?;
            select::build_select(&lexemes, get_table)?
        }
        "insert" => {
            validate(&lexemes)?;
            insert::build_insert(&lexemes, get_table)?
        }
        "update" => {
            validate(&lexemes)?;
            dml::build_update(&lexemes, get_table)?
        }
        "delete" => {
            validate(&lexemes)?;
            dml::build_delete(&lexemes, get_table)?
        }
        "replace" => {
            let tables = lexemes
                .iter()
                .skip(1)
                .find(|l| !l.is_keyword("into") && !l.is_keyword("low_priority") && !l.is_keyword("delayed"))
                .and_then(Lexeme::ident)
                .map(|t| vec![t.to_string()])
                .unwrap_or_default();
            ExecPlan::new(PlanType::PassDml, ParsedQuery::new(render(&lexemes))).with_tables(tables)
        }
        "set" => ddl::build_set(&lexemes),
        "create" | "alter" | "drop" | "rename" | "truncate" => ddl::build_ddl(&lexemes),
        "show" | "describe" | "desc" | "explain" | "repair" | "optimize" | "analyze" => {
            ddl::build_other(&lexemes)
        }
        _ => {
            return Err(PlanError::Syntax(format!(
                "unrecognized statement: {}",
                keyword
            )))
        }
    };
    tracing::trace!(
        target: "schema",
        plan = %plan.plan_type,
        reason = %plan.reason,
        table = plan.stats_table(),
        "built plan"
    );
    Ok(plan)
}

/// Run the statement through the full MySQL grammar. `lock in share mode`
/// is dropped first since the grammar only knows `for share`.
fn validate(lexemes: &[Lexeme]) -> Result<(), PlanError> {
    let mut kept: Vec<Lexeme> = Vec::with_capacity(lexemes.len());
    let mut i = 0;
    while i < lexemes.len() {
        let lock_clause = lexemes.get(i..i + 4).map_or(false, |w| {
            w[0].is_keyword("lock") && w[1].is_keyword("in") && w[2].is_keyword("share") && w[3].is_keyword("mode")
        });
        if lock_clause {
            i += 4;
            continue;
        }
        kept.push(lexemes[i].clone());
        i += 1;
    }
    let statements = Parser::parse_sql(&MySqlDialect {}, &render(&kept))
        .map_err(|e| PlanError::Syntax(e.to_string()))?;
    if statements.len() != 1 {
        return Err(PlanError::Syntax(format!(
            "expected one statement, found {}",
            statements.len()
        )));
    }
    Ok(())
}
