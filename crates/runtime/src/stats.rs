//! Engine metrics.
//!
//! Each server owns its own `prometheus::Registry` so several engines can live
//! in one process (and in one test binary) without colliding.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tablet_error::{ErrorCode, TabletError};

pub const ACL_LABELS: [&str; 4] = ["table", "group", "plan", "user"];

pub struct TabletStats {
    registry: Registry,
    pub queries: IntCounterVec,
    pub query_errors: IntCounterVec,
    pub row_cache: IntCounterVec,
    pub spot_checks: IntCounter,
    pub spot_check_mismatches: IntCounter,
    pub acl_allowed: IntCounterVec,
    pub acl_denied: IntCounterVec,
    pub acl_pseudo_denied: IntCounterVec,
    pub acl_exempt: IntCounterVec,
    pub rule_actions: IntCounterVec,
    pub transactions: IntCounterVec,
    pub partial_dml: IntCounter,
    pub active_transactions: IntGauge,
    pub pool_available: IntGaugeVec,
}

impl TabletStats {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let queries = counter_vec(
            &registry,
            "tablet_queries_total",
            "Statements executed, by plan type and table",
            &["plan", "table"],
        )?;
        let query_errors = counter_vec(
            &registry,
            "tablet_query_errors_total",
            "Failed requests, by error code",
            &["code"],
        )?;
        let row_cache = counter_vec(
            &registry,
            "tablet_row_cache_total",
            "Row cache events (hit, miss, absent, invalidation), by table",
            &["table", "event"],
        )?;
        let spot_checks = counter(
            &registry,
            "tablet_row_cache_spot_checks_total",
            "Cached rows re-read from the database for verification",
        )?;
        let spot_check_mismatches = counter(
            &registry,
            "tablet_row_cache_spot_check_mismatches_total",
            "Spot checks where the cached row differed from the database",
        )?;
        let acl_allowed = counter_vec(
            &registry,
            "tablet_table_acl_allowed_total",
            "Statements admitted by the table ACL",
            &ACL_LABELS,
        )?;
        let acl_denied = counter_vec(
            &registry,
            "tablet_table_acl_denied_total",
            "Statements the table ACL denied",
            &ACL_LABELS,
        )?;
        let acl_pseudo_denied = counter_vec(
            &registry,
            "tablet_table_acl_pseudo_denied_total",
            "Statements the table ACL would have denied in dry-run mode",
            &ACL_LABELS,
        )?;
        let acl_exempt = counter_vec(
            &registry,
            "tablet_table_acl_exempt_total",
            "Statements from users exempt from the table ACL",
            &["user"],
        )?;
        let rule_actions = counter_vec(
            &registry,
            "tablet_query_rule_actions_total",
            "Statements stopped by a query rule",
            &["rule", "action"],
        )?;
        let transactions = counter_vec(
            &registry,
            "tablet_transactions_total",
            "Transaction events (begin, commit, rollback, killed)",
            &["event"],
        )?;
        let partial_dml = counter(
            &registry,
            "tablet_partial_dml_total",
            "DML statements truncated at the row limit",
        )?;

        let active_transactions = IntGauge::with_opts(Opts::new(
            "tablet_active_transactions",
            "Open transactions",
        ))?;
        registry.register(Box::new(active_transactions.clone()))?;

        let pool_available = IntGaugeVec::new(
            Opts::new(
                "tablet_pool_available",
                "Connections that can be checked out without waiting",
            ),
            &["pool"],
        )?;
        registry.register(Box::new(pool_available.clone()))?;

        Ok(Self {
            registry,
            queries,
            query_errors,
            row_cache,
            spot_checks,
            spot_check_mismatches,
            acl_allowed,
            acl_denied,
            acl_pseudo_denied,
            acl_exempt,
            rule_actions,
            transactions,
            partial_dml,
            active_transactions,
            pool_available,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every metric.
    pub fn encode_text(&self) -> Result<String, TabletError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| TabletError::new(ErrorCode::Internal, e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TabletError::new(ErrorCode::Internal, e.to_string()))
    }

    pub fn record_error(&self, err: &TabletError) {
        let code = err.code.as_str();
        self.query_errors.with_label_values(&[code.as_str()]).inc();
    }

    pub fn row_cache_event(&self, table: &str, event: &str, n: u64) {
        if n > 0 {
            self.row_cache.with_label_values(&[table, event]).inc_by(n);
        }
    }

    pub fn transaction_event(&self, event: &str) {
        self.transactions.with_label_values(&[event]).inc();
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}
