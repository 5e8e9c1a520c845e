use super::where_clause::value_expr;
use super::TableLookup;
use crate::error::PlanError;
use crate::lexer::{is_parenthesized, position_top_level, render, split_top_level, Lexeme};
use crate::parsed_query::ParsedQuery;
use crate::plan::{ExecPlan, PlanType, Reason, ValueExpr};
use tablet_common::Value;

const MODIFIERS: &[&str] = &["low_priority", "delayed", "high_priority", "ignore"];

pub(crate) fn build_insert(lexemes: &[Lexeme], get_table: TableLookup<'_>) -> Result<ExecPlan, PlanError> {
    let syntax = |msg: &str| PlanError::Syntax(msg.to_string());

    let mut i = 1;
    let mut ignore_at = None;
    while let Some(l) = lexemes.get(i) {
        if !MODIFIERS.iter().any(|m| l.is_keyword(m)) {
            break;
        }
        if l.is_keyword("ignore") {
            ignore_at = Some(i);
        }
        i += 1;
    }
    if lexemes.get(i).map_or(false, |l| l.is_keyword("into")) {
        i += 1;
    }

    // Table name, optionally qualified by a database.
    let name_start = i;
    let mut table_name = lexemes
        .get(i)
        .and_then(Lexeme::ident)
        .ok_or_else(|| syntax("insert without table name"))?;
    i += 1;
    if lexemes.get(i).map_or(false, |l| l.is_symbol(".")) {
        table_name = lexemes
            .get(i + 1)
            .and_then(Lexeme::ident)
            .ok_or_else(|| syntax("invalid table name"))?;
        i += 2;
    }
    let name_sql = render(&lexemes[name_start..i]);

    let mut explicit_columns: Option<Vec<String>> = None;
    if lexemes.get(i).map_or(false, |l| l.is_symbol("("))
        && !lexemes.get(i + 1).map_or(false, |l| l.is_keyword("select"))
    {
        let close = position_top_level(&lexemes[i + 1..], |l| l.is_symbol(")"))
            .map(|p| i + 1 + p)
            .ok_or_else(|| syntax("unbalanced column list"))?;
        let mut names = Vec::new();
        for item in split_top_level(&lexemes[i + 1..close], ",") {
            match item {
                [col] if col.ident().is_some() => names.push(col.ident().unwrap_or_default().to_string()),
                _ => return Err(syntax("invalid column list")),
            }
        }
        explicit_columns = Some(names);
        i = close + 1;
    }
    let rows_start = i;

    let rest = &lexemes[rows_start..];
    let on_dup = rest.windows(4).position(|w| {
        w[0].is_keyword("on")
            && w[1].is_keyword("duplicate")
            && w[2].is_keyword("key")
            && w[3].is_keyword("update")
    });
    let (rows_part, assignments) = match on_dup {
        Some(p) => (&rest[..p], Some(&rest[p + 4..])),
        None => (rest, None),
    };

    let mut plan = ExecPlan::new(PlanType::PassDml, ParsedQuery::new(render(lexemes)))
        .with_tables(vec![table_name.to_string()]);

    let table = match get_table(table_name) {
        Some(table) => table,
        None => return Ok(plan.with_reason(Reason::Table)),
    };
    plan = plan.with_table(table.clone());
    if !table.has_pk() {
        return Ok(plan.with_reason(Reason::NoPk));
    }

    let columns: Vec<usize> = match &explicit_columns {
        Some(names) => names
            .iter()
            .map(|n| {
                table.find_column(n).ok_or_else(|| PlanError::UnknownColumn {
                    table: table.name.clone(),
                    column: n.clone(),
                })
            })
            .collect::<Result<_, _>>()?,
        None => (0..table.columns.len()).collect(),
    };
    let pk_positions: Vec<Option<usize>> = table
        .pk_columns
        .iter()
        .map(|pk| columns.iter().position(|c| c == pk))
        .collect();

    let first = rows_part.first().ok_or_else(|| syntax("insert without values"))?;
    if first.is_keyword("select") || (first.is_symbol("(") && is_parenthesized(rows_part)) {
        if assignments.is_some() {
            return Ok(plan.with_reason(Reason::Upsert));
        }
        let select = if is_parenthesized(rows_part) {
            &rows_part[1..rows_part.len() - 1]
        } else {
            rows_part
        };
        let mut subquery = render(select);
        if position_top_level(select, |l| l.is_keyword("limit")).is_none() {
            subquery.push_str(" limit :#maxLimit");
        }
        plan.plan_type = PlanType::InsertSubquery;
        plan.subquery = Some(ParsedQuery::new(subquery));
        plan.outer_query = Some(ParsedQuery::new(format!(
            "{} values :#values",
            render(&lexemes[..rows_start])
        )));
        plan.insert_column_count = columns.len();
        plan.subquery_pk_positions = pk_positions;
        return Ok(plan);
    }
    if !(first.is_keyword("values") || first.is_keyword("value")) {
        return Ok(plan.with_reason(Reason::ComplexExpr));
    }

    let mut pk_rows = Vec::new();
    let mut complex = false;
    for row in split_top_level(&rows_part[1..], ",") {
        if !is_parenthesized(row) {
            return Err(syntax("invalid values list"));
        }
        let items = split_top_level(&row[1..row.len() - 1], ",");
        if explicit_columns.is_some() && items.len() != columns.len() {
            return Err(PlanError::ColumnCountMismatch);
        }
        let mut pk_row = Vec::with_capacity(pk_positions.len());
        for (k, position) in pk_positions.iter().enumerate() {
            let value = match position {
                Some(p) => match items.get(*p).ok_or(PlanError::ColumnCountMismatch)? {
                    [null] if null.is_keyword("null") => Some(ValueExpr::Literal(Value::Null)),
                    [v] => value_expr(v),
                    _ => None,
                },
                None => Some(ValueExpr::Literal(
                    table.columns[table.pk_columns[k]].default.clone(),
                )),
            };
            match value {
                Some(v) => pk_row.push(v),
                None => complex = true,
            }
        }
        pk_rows.push(pk_row);
    }
    if complex {
        return Ok(plan.with_reason(Reason::ComplexExpr));
    }
    plan.pk_rows = pk_rows;

    let assignments = match assignments {
        None => {
            plan.plan_type = PlanType::InsertPk;
            plan.outer_query = Some(plan.full_query.clone());
            return Ok(plan);
        }
        Some(a) => a,
    };
    if plan.pk_rows.len() > 1 {
        return Ok(plan.with_reason(Reason::Multirow));
    }
    if touches_key_or_values(assignments, &table) {
        return Ok(plan.with_reason(Reason::Upsert));
    }

    let insert_part: Vec<Lexeme> = lexemes[..rows_start + rows_part.len()]
        .iter()
        .enumerate()
        .filter(|(idx, _)| Some(*idx) != ignore_at)
        .map(|(_, l)| l.clone())
        .collect();
    plan.plan_type = PlanType::UpsertPk;
    plan.outer_query = Some(ParsedQuery::new(render(&insert_part)));
    plan.upsert_query = Some(ParsedQuery::new(format!(
        "update {} set {} where :#pk",
        name_sql,
        render(assignments)
    )));
    Ok(plan)
}

/// True when an ON DUPLICATE KEY UPDATE list assigns a key column or
/// refers to the inserted row through VALUES().
fn touches_key_or_values(assignments: &[Lexeme], table: &crate::schema::Table) -> bool {
    let uses_values = assignments
        .windows(2)
        .any(|w| w[0].is_keyword("values") && w[1].is_symbol("("));
    if uses_values {
        return true;
    }
    split_top_level(assignments, ",").into_iter().any(|item| {
        let eq = position_top_level(item, |l| l.is_symbol("=")).unwrap_or(item.len());
        super::where_clause::column_ref(&item[..eq])
            .map_or(true, |c| table.pk_index_of(&c).is_some())
    })
}
