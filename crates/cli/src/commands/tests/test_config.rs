use super::{path, tablet_code, temp_file};
use crate::commands::config::load_summary;
use tablet_error::ErrorCode;

#[test]
fn test_summary_reflects_file() {
    let file = temp_file(
        ".yaml",
        "tablet:\n  pool_size: 4\n  strict_table_acl: true\n  query_rules_file: /etc/tablet/rules.json\n  row_cache:\n    enabled: true\nlogging:\n  level: debug\n",
    );
    let summary = load_summary(path(&file)).unwrap();
    assert_eq!(summary.pool_size, 4);
    assert!(summary.strict_table_acl);
    assert!(summary.strict_mode);
    assert!(summary.row_cache_enabled);
    assert_eq!(summary.query_rules_file.as_deref(), Some("/etc/tablet/rules.json"));
    assert_eq!(summary.table_acl_file, None);
    assert_eq!(summary.max_dml_rows, 500);
    assert_eq!(summary.log_level, "debug");
}

#[test]
fn test_missing_file_is_config_error() {
    let err = load_summary("/nonexistent/tablet.yaml").unwrap_err();
    assert_eq!(tablet_code(&err), ErrorCode::InvalidConfig);
    assert!(err.to_string().contains("not found"));
}

#[test]
fn test_invalid_values_are_rejected() {
    let file = temp_file(".yaml", "tablet:\n  transaction_cap: 0\n");
    let err = load_summary(path(&file)).unwrap_err();
    assert_eq!(tablet_code(&err), ErrorCode::InvalidConfig);
}
