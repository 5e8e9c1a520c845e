//! Admission checks run before a statement executes: query rules first, then
//! the table ACL.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tablet_common::config::TabletConfig;
use tablet_common::QueryContext;
use tablet_error::{ErrorCode, ErrorContext, Result, TabletError};
use tablet_sql::ExecPlan;
use tracing::warn;

use crate::acl::{AclDecision, Role, TableAcl};
use crate::rules::RuleSources;
use crate::stats::TabletStats;

/// The pseudo table of `select ... from dual`.
const DUAL: &str = "dual";

pub struct Policy {
    pub rules: RuleSources,
    acl: RwLock<Option<Arc<TableAcl>>>,
    exempt: HashSet<String>,
    strict_table_acl: bool,
    dry_run: bool,
}

impl Policy {
    pub fn new(config: &TabletConfig) -> Self {
        Self {
            rules: RuleSources::new(),
            acl: RwLock::new(None),
            exempt: config.table_acl_exempt_acl.iter().cloned().collect(),
            strict_table_acl: config.strict_table_acl,
            dry_run: config.enable_table_acl_dry_run,
        }
    }

    pub fn set_table_acl(&self, acl: Option<TableAcl>) {
        *self.acl.write() = acl.map(Arc::new);
    }

    pub fn table_acl(&self) -> Option<Arc<TableAcl>> {
        self.acl.read().clone()
    }

    /// Reject the statement if a rule blocks it or the caller lacks the
    /// role its plan needs on any table it touches.
    pub fn check(
        &self,
        ctx: &QueryContext,
        sql: &str,
        plan: &ExecPlan,
        stats: &TabletStats,
    ) -> Result<()> {
        let tables = touched_tables(plan);
        let caller = ctx.caller_id.as_ref().map(|c| c.username.as_str());
        let rule_user = if ctx.username().is_empty() {
            caller.unwrap_or_default()
        } else {
            ctx.username()
        };

        if let Some(verdict) =
            self.rules
                .evaluate(ctx.remote_addr(), rule_user, sql, plan.plan_type, &tables)
        {
            stats
                .rule_actions
                .with_label_values(&[verdict.rule.as_str(), verdict.action.as_str()])
                .inc();
            warn!(
                target: "audit",
                rule = %verdict.rule,
                source = %verdict.source,
                action = %verdict.action,
                user = rule_user,
                remote_addr = ctx.remote_addr(),
                "query rule blocked statement"
            );
            return Err(verdict.to_tablet_error());
        }

        if !ctx.username().is_empty() && self.exempt.contains(ctx.username()) {
            stats.acl_exempt.with_label_values(&[ctx.username()]).inc();
            return Ok(());
        }
        let Some(user) = caller else {
            if self.strict_table_acl {
                return Err(TabletError::new(ErrorCode::MissingCallerId, "missing caller id"));
            }
            return Ok(());
        };
        if self.exempt.contains(user) {
            stats.acl_exempt.with_label_values(&[user]).inc();
            return Ok(());
        }

        let Some(acl) = self.table_acl() else {
            return Ok(());
        };
        let role = Role::required_for(plan.plan_type);
        let plan_name = plan.plan_type.as_str();
        for table in tables.iter().filter(|t| !t.eq_ignore_ascii_case(DUAL)) {
            let group = match acl.authorize(table, role, user) {
                AclDecision::Unconfigured => continue,
                AclDecision::Allowed { group } => {
                    stats
                        .acl_allowed
                        .with_label_values(&[table.as_str(), group.as_str(), plan_name, user])
                        .inc();
                    continue;
                }
                AclDecision::Denied { group } => group,
            };
            let labels = [table.as_str(), group.as_str(), plan_name, user];
            if self.dry_run {
                // One count per statement, whatever the number of denied tables.
                stats.acl_pseudo_denied.with_label_values(&labels).inc();
                return Ok(());
            }
            stats.acl_denied.with_label_values(&labels).inc();
            warn!(
                target: "audit",
                table = %table,
                group = %group,
                plan = plan_name,
                user,
                role = %role,
                "table acl denied statement"
            );
            if self.strict_table_acl {
                return Err(TabletError::new(
                    ErrorCode::TableAclDenied,
                    format!(
                        "table acl error: {:?} cannot run {} on table {:?}",
                        user, plan_name, table
                    ),
                )
                .with_context(ErrorContext::TableAcl {
                    table: table.clone(),
                    group,
                    plan: plan_name.to_string(),
                    user: user.to_string(),
                }));
            }
        }
        Ok(())
    }
}

fn touched_tables(plan: &ExecPlan) -> Vec<String> {
    if !plan.tables.is_empty() {
        return plan.tables.clone();
    }
    plan.table_name.iter().cloned().collect()
}
