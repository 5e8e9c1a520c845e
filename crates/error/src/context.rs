//! # Error Contexts
//!
//! Structured metadata attached to errors so callers and log pipelines can
//! react without parsing message text.

use serde::{Deserialize, Serialize};

/// Structured context for tablet errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorContext {
    /// Context for TABLET-4001 (TableAclDenied)
    TableAcl {
        table: String,
        group: String,
        plan: String,
        user: String,
    },

    /// Context for TABLET-4003/4004 (rule actions)
    QueryRule { rule: String, description: String },

    /// Context for pool exhaustion (TABLET-1001, 1003)
    Pool {
        pool: String,
        capacity: usize,
        timeout_ms: u64,
    },

    /// Context for transaction lookups (TABLET-2005, 2006)
    Transaction { transaction_id: i64 },

    /// Context for planning failures
    Plan {
        plan: Option<String>,
        table: Option<String>,
        reason: String,
    },

    /// Context for TABLET-3xxx (config errors)
    Config {
        file_path: Option<String>,
        field: Option<String>,
    },

    /// Context for TABLET-2003 (RowCountExceeded)
    RowLimit { limit: usize },

    /// Generic key-value context for extensibility
    Generic {
        #[serde(flatten)]
        data: std::collections::HashMap<String, serde_json::Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_acl_context_tagging() {
        let ctx = ErrorContext::TableAcl {
            table: "test_table".to_string(),
            group: "group02".to_string(),
            plan: "PASS_SELECT".to_string(),
            user: "u2".to_string(),
        };

        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["type"], "table_acl");
        assert_eq!(json["group"], "group02");

        let de: ErrorContext = serde_json::from_value(json).unwrap();
        match de {
            ErrorContext::TableAcl { user, .. } => assert_eq!(user, "u2"),
            _ => panic!("Wrong variant"),
        }
    }
}
