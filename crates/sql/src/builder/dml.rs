use super::where_clause::{
    column_list, column_ref, pk_values, referenced_tables, render_parts, single_table, value_expr,
    Clauses,
};
use super::TableLookup;
use crate::error::PlanError;
use crate::lexer::{position_top_level, render, split_top_level, Lexeme};
use crate::parsed_query::ParsedQuery;
use crate::plan::{ExecPlan, PlanType, Reason};
use crate::schema::Table;

const UPDATE_CLAUSES: &[&str] = &["update", "set", "where", "order", "limit"];
const DELETE_CLAUSES: &[&str] = &["delete", "from", "using", "where", "order", "limit"];

fn strip_modifiers<'a>(mut lexemes: &'a [Lexeme], modifiers: &[&str]) -> &'a [Lexeme] {
    while let Some(first) = lexemes.first() {
        if !modifiers.iter().any(|m| first.is_keyword(m)) {
            break;
        }
        lexemes = &lexemes[1..];
    }
    lexemes
}

pub(crate) fn build_update(lexemes: &[Lexeme], get_table: TableLookup<'_>) -> Result<ExecPlan, PlanError> {
    let clauses = Clauses::split(lexemes, UPDATE_CLAUSES);
    let head = clauses.body("update").unwrap_or_default();
    let target = strip_modifiers(head, &["low_priority", "ignore"]);
    let mut plan = ExecPlan::new(PlanType::PassDml, ParsedQuery::new(render(lexemes)))
        .with_tables(referenced_tables(target));

    let assignments = clauses
        .body("set")
        .ok_or_else(|| PlanError::Syntax("update without set clause".to_string()))?;

    let table = match single_table(target).and_then(|t| get_table(&t.name)) {
        Some(table) => table,
        None => return Ok(plan.with_reason(Reason::Table)),
    };
    plan = plan.with_table(table.clone());
    if !table.has_pk() {
        return Ok(plan.with_reason(Reason::NoPk));
    }

    let mut secondary = vec![None; table.pk_columns.len()];
    for item in split_top_level(assignments, ",") {
        let eq = position_top_level(item, |l| l.is_symbol("="))
            .ok_or_else(|| PlanError::Syntax(format!("invalid assignment: {}", render(item))))?;
        let column = column_ref(&item[..eq])
            .ok_or_else(|| PlanError::Syntax(format!("invalid assignment: {}", render(item))))?;
        if let Some(idx) = table.pk_index_of(&column) {
            match &item[eq + 1..] {
                [v] if value_expr(v).is_some() => secondary[idx] = value_expr(v),
                _ => return Ok(plan.with_reason(Reason::PkChange)),
            }
        }
    }
    plan.secondary_pk_values = secondary;
    plan.outer_query = Some(ParsedQuery::new(format!(
        "update {} set {} where :#pk",
        render(head),
        render(assignments)
    )));
    Ok(finish_dml(plan, &clauses, &table, target))
}

pub(crate) fn build_delete(lexemes: &[Lexeme], get_table: TableLookup<'_>) -> Result<ExecPlan, PlanError> {
    let clauses = Clauses::split(lexemes, DELETE_CLAUSES);
    let from = clauses
        .body("from")
        .ok_or_else(|| PlanError::Syntax("delete without from clause".to_string()))?;
    let mut plan = ExecPlan::new(PlanType::PassDml, ParsedQuery::new(render(lexemes)))
        .with_tables(referenced_tables(from));

    // Anything between DELETE and FROM other than modifiers names target tables.
    let head = clauses.body("delete").unwrap_or_default();
    if !strip_modifiers(head, &["low_priority", "quick", "ignore"]).is_empty() || clauses.has("using") {
        return Ok(plan.with_reason(Reason::Table));
    }

    let table = match single_table(from).and_then(|t| get_table(&t.name)) {
        Some(table) => table,
        None => return Ok(plan.with_reason(Reason::Table)),
    };
    plan = plan.with_table(table.clone());
    if !table.has_pk() {
        return Ok(plan.with_reason(Reason::NoPk));
    }

    plan.outer_query = Some(ParsedQuery::new(format!(
        "{} from {} where :#pk",
        render(clauses.full("delete").unwrap_or_default()),
        render(from)
    )));
    Ok(finish_dml(plan, &clauses, &table, from))
}

/// Choose between key-scoped DML and DML driven by a locking key subquery.
fn finish_dml(mut plan: ExecPlan, clauses: &Clauses<'_>, table: &Table, target: &[Lexeme]) -> ExecPlan {
    let pk = if clauses.has("order") || clauses.has("limit") {
        None
    } else {
        clauses.body("where").and_then(|w| pk_values(w, table))
    };
    if let Some(pk) = pk {
        plan.plan_type = PlanType::DmlPk;
        plan.pk_values = pk;
        return plan;
    }

    plan.plan_type = PlanType::DmlSubquery;
    plan.reason = if !clauses.has("where") {
        Reason::Where
    } else if clauses.has("order") {
        Reason::Order
    } else if clauses.has("limit") {
        Reason::Limit
    } else {
        Reason::Default
    };
    let mut subquery = format!(
        "select {} from {}",
        column_list(table, &table.pk_columns),
        render(target)
    );
    let rest = render_parts(&[clauses.full("where"), clauses.full("order")]);
    if !rest.is_empty() {
        subquery.push(' ');
        subquery.push_str(&rest);
    }
    match clauses.full("limit") {
        Some(l) => {
            subquery.push(' ');
            subquery.push_str(&render(l));
        }
        None => subquery.push_str(" limit :#maxLimit"),
    }
    subquery.push_str(" for update");
    plan.subquery = Some(ParsedQuery::new(subquery));
    plan
}
