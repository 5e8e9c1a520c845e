//! `explain`: plan a statement against tables read from a schema file.
//!
//! Tables marked `cache: true` are treated as row-cache eligible, as a
//! tablet running with the row cache enabled would treat them.

use anyhow::Result;
use owo_colors::OwoColorize;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tablet_error::{ErrorCode, ErrorContext, TabletError};
use tablet_runtime::schema::NOCACHE_MARKER;
use tablet_runtime::StaticSchemaSource;
use tablet_sql::{build_plan, CacheType, ExecPlan, Table};

use crate::output::{self, OutputFormat};

#[derive(Debug, Serialize)]
pub struct PlanReport {
    pub plan_type: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub tables: Vec<String>,
    pub full_query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outer_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subquery: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upsert_query: Option<String>,
}

impl From<&ExecPlan> for PlanReport {
    fn from(plan: &ExecPlan) -> Self {
        Self {
            plan_type: plan.plan_type.to_string(),
            reason: plan.reason.to_string(),
            table: plan.table_name.clone(),
            tables: plan.tables.clone(),
            full_query: plan.full_query.to_string(),
            outer_query: plan.outer_query.as_ref().map(ToString::to_string),
            subquery: plan.subquery.as_ref().map(ToString::to_string),
            upsert_query: plan.upsert_query.as_ref().map(ToString::to_string),
        }
    }
}

fn load_tables(schema: &str) -> Result<HashMap<String, Arc<Table>>> {
    let source = StaticSchemaSource::load_file(schema).map_err(|e| {
        TabletError::new(ErrorCode::InvalidConfig, e.message).with_context(ErrorContext::Config {
            file_path: Some(schema.to_string()),
            field: None,
        })
    })?;
    Ok(source
        .tables()
        .into_iter()
        .map(|mut table| {
            if table.comment.contains(NOCACHE_MARKER) {
                table.cache_type = CacheType::None;
            }
            (table.name.clone(), Arc::new(table))
        })
        .collect())
}

pub(crate) fn plan_report(schema: &str, sql: &str) -> Result<PlanReport> {
    let tables = load_tables(schema)?;
    tracing::debug!(schema, tables = tables.len(), "schema loaded");

    let lookup = |name: &str| tables.get(name).cloned();
    let plan = build_plan(sql, &lookup).map_err(|e| e.to_tablet_error())?;
    Ok(PlanReport::from(&plan))
}

pub fn explain(schema: &str, sql: &str, format: OutputFormat) -> Result<()> {
    let report = plan_report(schema, sql)?;
    if format.is_machine_readable() {
        return output::print_success(format, &report);
    }

    println!("{} {}", "Plan:".bold().cyan(), report.plan_type.green().bold());
    println!("  reason:   {}", report.reason);
    if let Some(table) = &report.table {
        println!("  table:    {}", table);
    }
    if !report.tables.is_empty() {
        println!("  tables:   {}", report.tables.join(", "));
    }
    println!("  query:    {}", report.full_query.dimmed());
    if let Some(outer) = &report.outer_query {
        println!("  outer:    {}", outer);
    }
    if let Some(subquery) = &report.subquery {
        println!("  subquery: {}", subquery);
    }
    if let Some(upsert) = &report.upsert_query {
        println!("  upsert:   {}", upsert);
    }
    Ok(())
}
