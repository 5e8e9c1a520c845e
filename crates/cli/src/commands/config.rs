use anyhow::Result;
use owo_colors::OwoColorize;
use serde::Serialize;
use std::path::Path;
use tablet_common::config::AppConfig;
use tablet_error::{ErrorCode, ErrorContext, TabletError};

use crate::output::{self, OutputFormat};

#[derive(Debug, Serialize)]
pub struct ConfigSummary {
    pub file: String,
    pub pool_size: usize,
    pub stream_pool_size: usize,
    pub transaction_cap: usize,
    pub max_result_size: usize,
    pub max_dml_rows: usize,
    pub strict_mode: bool,
    pub strict_table_acl: bool,
    pub enable_autocommit: bool,
    pub row_cache_enabled: bool,
    pub query_rules_file: Option<String>,
    pub table_acl_file: Option<String>,
    pub log_level: String,
}

fn config_error(file: &str, message: String) -> TabletError {
    TabletError::new(ErrorCode::InvalidConfig, message).with_context(ErrorContext::Config {
        file_path: Some(file.to_string()),
        field: None,
    })
}

pub(crate) fn load_summary(file: &str) -> Result<ConfigSummary> {
    // AppConfig falls back to defaults for a missing file; here that is a mistake.
    if !Path::new(file).exists() {
        return Err(config_error(file, format!("configuration file {} not found", file)).into());
    }
    let config = AppConfig::from_file(file).map_err(|e| config_error(file, format!("{:#}", e)))?;
    tracing::debug!(file, "configuration loaded");

    let tablet = config.tablet;
    Ok(ConfigSummary {
        file: file.to_string(),
        pool_size: tablet.pool_size,
        stream_pool_size: tablet.stream_pool_size,
        transaction_cap: tablet.transaction_cap,
        max_result_size: tablet.max_result_size,
        max_dml_rows: tablet.max_dml_rows,
        strict_mode: tablet.strict_mode,
        strict_table_acl: tablet.strict_table_acl,
        enable_autocommit: tablet.enable_autocommit,
        row_cache_enabled: tablet.row_cache.enabled,
        query_rules_file: tablet.query_rules_file,
        table_acl_file: tablet.table_acl_file,
        log_level: config.logging.level,
    })
}

pub fn validate_config(file: &str, format: OutputFormat) -> Result<()> {
    let summary = load_summary(file)?;
    if format.is_machine_readable() {
        return output::print_success(format, &summary);
    }

    println!("{} {}", "Configuration:".bold().cyan(), summary.file.yellow());
    println!("  pool_size:         {}", summary.pool_size);
    println!("  stream_pool_size:  {}", summary.stream_pool_size);
    println!("  transaction_cap:   {}", summary.transaction_cap);
    println!("  max_result_size:   {}", summary.max_result_size);
    println!("  max_dml_rows:      {}", summary.max_dml_rows);
    println!("  strict_mode:       {}", summary.strict_mode);
    println!("  strict_table_acl:  {}", summary.strict_table_acl);
    println!("  enable_autocommit: {}", summary.enable_autocommit);
    println!("  row_cache:         {}", summary.row_cache_enabled);
    if let Some(rules) = &summary.query_rules_file {
        println!("  query_rules_file:  {}", rules);
    }
    if let Some(acl) = &summary.table_acl_file {
        println!("  table_acl_file:    {}", acl);
    }
    println!("{}", "Configuration is valid.".green().bold());
    Ok(())
}
