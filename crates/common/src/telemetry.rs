//! Logging initialization for tablet binaries.
//!
//! Builds a `tracing` registry with an `EnvFilter`-controlled stdout layer
//! and, when enabled, daily-rolling JSON files for the `queries` and
//! `audit` targets.

use crate::config::LoggingConfig;
use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Keeps the background writers alive; drop it on shutdown to flush.
#[derive(Default)]
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

pub fn init_logging(config: &LoggingConfig) -> Result<LogGuards> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

    let stdout_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_filter(filter).boxed()
    };

    let mut guards = Vec::new();
    let mut file_layers = Vec::new();
    for (enabled, target, file_name) in [
        (config.query_log, "queries", "queries.jsonl"),
        (config.audit_log, "audit", "audit.jsonl"),
    ] {
        if !enabled {
            continue;
        }
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        file_layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(tracing_subscriber::filter::filter_fn(move |metadata| {
                    metadata.target() == target
                }))
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layers)
        .try_init()
        .ok();

    Ok(LogGuards { _guards: guards })
}
