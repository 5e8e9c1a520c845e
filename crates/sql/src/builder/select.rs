use super::where_clause::{
    column_list, column_ref, column_sql, limit, pk_values, referenced_tables, render_parts,
    single_table, Clauses,
};
use super::TableLookup;
use crate::error::PlanError;
use crate::lexer::{position_top_level, render, split_top_level, Lexeme};
use crate::parsed_query::ParsedQuery;
use crate::plan::{ExecPlan, PkValue, PlanType, Reason};
use crate::schema::Table;

const CLAUSES: &[&str] = &[
    "select", "from", "where", "group", "having", "order", "limit", "procedure", "into", "for",
    "lock", "union",
];

/// Select modifiers that change the result shape.
const SHAPING_MODIFIERS: &[&str] = &["distinct", "distinctrow", "sql_calc_found_rows", "straight_join"];
/// Select modifiers with no effect on planning.
const NEUTRAL_MODIFIERS: &[&str] = &["all", "high_priority", "sql_cache", "sql_no_cache", "sql_small_result", "sql_big_result", "sql_buffer_result"];

pub(crate) fn build_select(lexemes: &[Lexeme], get_table: TableLookup<'_>) -> Result<ExecPlan, PlanError> {
    let clauses = Clauses::split(lexemes, CLAUSES);
    let tables = clauses.body("from").map(referenced_tables).unwrap_or_default();
    let mut plan = ExecPlan::new(PlanType::PassSelect, ParsedQuery::new(bounded_full_query(lexemes, &clauses)))
        .with_tables(tables);

    if clauses.has("union") || clauses.has("into") || clauses.has("procedure") || clauses.count("select") > 1 {
        return Ok(plan.with_reason(Reason::Select));
    }
    if clauses.has("for") || clauses.has("lock") {
        return Ok(plan.with_reason(Reason::Lock));
    }

    let mut select_list = clauses.body("select").unwrap_or_default();
    let mut shaped = false;
    while let Some(first) = select_list.first() {
        if SHAPING_MODIFIERS.iter().any(|m| first.is_keyword(m)) {
            shaped = true;
        } else if !NEUTRAL_MODIFIERS.iter().any(|m| first.is_keyword(m)) {
            break;
        }
        select_list = &select_list[1..];
    }
    if shaped || clauses.has("group") || clauses.has("having") {
        return Ok(plan.with_reason(Reason::Select));
    }

    let table = match clauses
        .body("from")
        .and_then(single_table)
        .and_then(|t| get_table(&t.name))
    {
        Some(table) => table,
        None => return Ok(plan.with_reason(Reason::Table)),
    };
    plan = plan.with_table(table.clone());
    if !table.is_cached() {
        return Ok(plan.with_reason(Reason::NoCache));
    }

    let column_numbers = match select_columns(select_list, &table) {
        Some(c) => c,
        None => return Ok(plan.with_reason(Reason::SelectList)),
    };
    let table_fields = table.fields();
    plan.fields = column_numbers
        .iter()
        .map(|&i| table_fields[i].clone())
        .collect();
    plan.column_numbers = column_numbers;

    let all_columns: Vec<usize> = (0..table.columns.len()).collect();
    plan.outer_query = Some(ParsedQuery::new(format!(
        "select {} from {} where :#pk",
        column_list(&table, &all_columns),
        column_sql(&table.name)
    )));

    let limit_clause = clauses.body("limit").map(limit);
    let pk = clauses.body("where").and_then(|w| pk_values(w, &table));
    let simple_limit = limit_clause
        .as_ref()
        .map_or(true, |l| !l.has_offset && l.count.is_some());

    match pk {
        Some(pk)
            if !clauses.has("order")
                && simple_limit
                && pk.iter().filter(|v| matches!(v, PkValue::List(_))).count() <= 1 =>
        {
            plan.plan_type = PlanType::PkIn;
            plan.pk_values = pk;
            plan.limit = limit_clause.and_then(|l| l.count);
            Ok(plan)
        }
        _ => {
            plan.plan_type = PlanType::SelectSubquery;
            plan.reason = if !clauses.has("where") {
                Reason::Where
            } else if clauses.has("order") {
                Reason::Order
            } else if !simple_limit {
                Reason::Limit
            } else {
                Reason::Default
            };
            let limit_sql = match clauses.full("limit") {
                Some(l) => render(l),
                None => "limit :#maxLimit".to_string(),
            };
            let rest = render_parts(&[clauses.full("where"), clauses.full("order")]);
            let mut subquery = format!(
                "select {} from {}",
                column_list(&table, &table.pk_columns),
                render(clauses.body("from").unwrap_or_default())
            );
            for part in [rest, limit_sql] {
                if !part.is_empty() {
                    subquery.push(' ');
                    subquery.push_str(&part);
                }
            }
            plan.subquery = Some(ParsedQuery::new(subquery));
            Ok(plan)
        }
    }
}

/// The statement as sent to the database on pass-through, with a row bound
/// inserted when it has none.
fn bounded_full_query(lexemes: &[Lexeme], clauses: &Clauses<'_>) -> String {
    if clauses.has("limit") || clauses.has("into") {
        return render(lexemes);
    }
    let lock_at = position_top_level(lexemes, |l| l.is_keyword("for") || l.is_keyword("lock"))
        .unwrap_or(lexemes.len());
    let mut sql = render(&lexemes[..lock_at]);
    sql.push_str(" limit :#maxLimit");
    if lock_at < lexemes.len() {
        sql.push(' ');
        sql.push_str(&render(&lexemes[lock_at..]));
    }
    sql
}

/// Positions of plainly selected columns; `None` for any expression or alias.
fn select_columns(list: &[Lexeme], table: &Table) -> Option<Vec<usize>> {
    if list.is_empty() {
        return None;
    }
    let mut columns = Vec::new();
    for item in split_top_level(list, ",") {
        match item {
            [star] if star.is_symbol("*") => columns.extend(0..table.columns.len()),
            [_, dot, star] if dot.is_symbol(".") && star.is_symbol("*") => {
                columns.extend(0..table.columns.len())
            }
            _ => columns.push(table.find_column(&column_ref(item)?)?),
        }
    }
    Some(columns)
}
