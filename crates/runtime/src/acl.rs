//! Table-level access control.
//!
//! Tables are organized into groups. Each group names its readers, writers and
//! admins; a writer may also read and an admin may also write. Group members
//! may be listed as `%` to admit everyone.
//!
//! Table entries ending in `%` cover every table with that prefix. When a
//! table matches several entries, an exact name beats any prefix and a longer
//! prefix beats a shorter one.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tablet_error::{ErrorCode, ErrorContext, Result, TabletError};
use tablet_sql::PlanType;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TableAclConfig {
    #[serde(default)]
    pub table_groups: Vec<TableGroupSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TableGroupSpec {
    pub name: String,
    pub table_names_or_prefixes: Vec<String>,
    #[serde(default)]
    pub readers: Vec<String>,
    #[serde(default)]
    pub writers: Vec<String>,
    #[serde(default)]
    pub admins: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Reader,
    Writer,
    Admin,
}

impl Role {
    /// The role a plan requires on every table it touches.
    pub fn required_for(plan: PlanType) -> Role {
        match plan {
            PlanType::PassSelect | PlanType::PkIn | PlanType::SelectSubquery | PlanType::Set => {
                Role::Reader
            }
            PlanType::PassDml
            | PlanType::DmlPk
            | PlanType::DmlSubquery
            | PlanType::InsertPk
            | PlanType::InsertSubquery
            | PlanType::UpsertPk => Role::Writer,
            PlanType::Ddl | PlanType::Other => Role::Admin,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Reader => "READER",
            Role::Writer => "WRITER",
            Role::Admin => "ADMIN",
        })
    }
}

const ALL_USERS: &str = "%";

#[derive(Debug)]
struct Members {
    users: HashSet<String>,
    everyone: bool,
}

impl Members {
    fn new<'a>(lists: impl IntoIterator<Item = &'a Vec<String>>) -> Self {
        let mut users = HashSet::new();
        let mut everyone = false;
        for list in lists {
            for user in list {
                if user == ALL_USERS {
                    everyone = true;
                } else {
                    users.insert(user.clone());
                }
            }
        }
        Self { users, everyone }
    }

    fn contains(&self, user: &str) -> bool {
        self.everyone || self.users.contains(user)
    }
}

#[derive(Debug)]
pub struct TableGroup {
    pub name: String,
    readers: Members,
    writers: Members,
    admins: Members,
}

impl TableGroup {
    fn from_spec(spec: &TableGroupSpec) -> Self {
        Self {
            name: spec.name.clone(),
            readers: Members::new([&spec.readers, &spec.writers, &spec.admins]),
            writers: Members::new([&spec.writers, &spec.admins]),
            admins: Members::new([&spec.admins]),
        }
    }

    pub fn allows(&self, role: Role, user: &str) -> bool {
        match role {
            Role::Reader => self.readers.contains(user),
            Role::Writer => self.writers.contains(user),
            Role::Admin => self.admins.contains(user),
        }
    }
}

/// The ACL's answer for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclDecision {
    /// The table belongs to no group.
    Unconfigured,
    Allowed { group: String },
    Denied { group: String },
}

#[derive(Debug, Default)]
pub struct TableAcl {
    exact: HashMap<String, Arc<TableGroup>>,
    /// Longest prefix first.
    prefixes: Vec<(String, Arc<TableGroup>)>,
}

fn config_error(message: String, file_path: Option<&str>) -> TabletError {
    TabletError::new(ErrorCode::InvalidAclConfig, message).with_context(ErrorContext::Config {
        file_path: file_path.map(str::to_string),
        field: Some("table_groups".to_string()),
    })
}

impl TableAcl {
    pub fn from_config(config: &TableAclConfig) -> Result<Self> {
        let mut acl = TableAcl::default();
        let mut seen = HashSet::new();
        for spec in &config.table_groups {
            let group = Arc::new(TableGroup::from_spec(spec));
            for entry in &spec.table_names_or_prefixes {
                if !seen.insert(entry.clone()) {
                    return Err(config_error(
                        format!("table {} appears in more than one entry", entry),
                        None,
                    ));
                }
                match entry.strip_suffix('%') {
                    Some(prefix) => acl.prefixes.push((prefix.to_string(), group.clone())),
                    None => {
                        acl.exact.insert(entry.clone(), group.clone());
                    }
                }
            }
        }
        acl.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Ok(acl)
    }

    /// Load from JSON, or YAML when the extension says so.
    pub fn load_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| config_error(format!("cannot read {}: {}", path, e), Some(path)))?;
        let is_yaml = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));
        let config: TableAclConfig = if is_yaml {
            serde_yaml::from_str(&text).map_err(|e| config_error(e.to_string(), Some(path)))?
        } else {
            serde_json::from_str(&text).map_err(|e| config_error(e.to_string(), Some(path)))?
        };
        Self::from_config(&config)
    }

    /// Configured group names, sorted.
    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .exact
            .values()
            .chain(self.prefixes.iter().map(|(_, group)| group))
            .map(|group| group.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn group_for(&self, table: &str) -> Option<&Arc<TableGroup>> {
        if let Some(group) = self.exact.get(table) {
            return Some(group);
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| table.starts_with(prefix.as_str()))
            .map(|(_, group)| group)
    }

    pub fn authorize(&self, table: &str, role: Role, user: &str) -> AclDecision {
        match self.group_for(table) {
            None => AclDecision::Unconfigured,
            Some(group) if group.allows(role, user) => AclDecision::Allowed {
                group: group.name.clone(),
            },
            Some(group) => AclDecision::Denied {
                group: group.name.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl() -> TableAcl {
        let yaml = r#"
table_groups:
  - name: group01
    table_names_or_prefixes: ["test_table"]
    readers: ["u1"]
    writers: ["u2"]
    admins: ["u3"]
  - name: group02
    table_names_or_prefixes: ["test_%"]
    readers: ["u1"]
  - name: group03
    table_names_or_prefixes: ["test_long_%"]
    readers: ["%"]
"#;
        let config: TableAclConfig = serde_yaml::from_str(yaml).unwrap();
        TableAcl::from_config(&config).unwrap()
    }

    #[test]
    fn test_role_hierarchy() {
        let acl = acl();
        let allowed = |role, user| {
            matches!(acl.authorize("test_table", role, user), AclDecision::Allowed { .. })
        };
        assert!(allowed(Role::Reader, "u1"));
        assert!(!allowed(Role::Writer, "u1"));
        assert!(allowed(Role::Reader, "u2"));
        assert!(allowed(Role::Writer, "u2"));
        assert!(!allowed(Role::Admin, "u2"));
        assert!(allowed(Role::Admin, "u3"));
        assert!(allowed(Role::Reader, "u3"));
    }

    #[test]
    fn test_exact_name_beats_prefix() {
        let acl = acl();
        assert_eq!(acl.group_for("test_table").unwrap().name, "group01");
        assert_eq!(acl.group_for("test_other").unwrap().name, "group02");
        assert_eq!(acl.group_for("test_long_one").unwrap().name, "group03");
        assert!(acl.group_for("other").is_none());
        assert_eq!(
            acl.authorize("other", Role::Admin, "nobody"),
            AclDecision::Unconfigured
        );
    }

    #[test]
    fn test_everyone() {
        let acl = acl();
        assert!(matches!(
            acl.authorize("test_long_x", Role::Reader, "anyone"),
            AclDecision::Allowed { .. }
        ));
        assert_eq!(
            acl.authorize("test_long_x", Role::Writer, "anyone"),
            AclDecision::Denied {
                group: "group03".into()
            }
        );
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let config = TableAclConfig {
            table_groups: vec![
                TableGroupSpec {
                    name: "a".into(),
                    table_names_or_prefixes: vec!["t".into()],
                    readers: vec![],
                    writers: vec![],
                    admins: vec![],
                },
                TableGroupSpec {
                    name: "b".into(),
                    table_names_or_prefixes: vec!["t".into()],
                    readers: vec![],
                    writers: vec![],
                    admins: vec![],
                },
            ],
        };
        let err = TableAcl::from_config(&config).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidAclConfig);
    }

    #[test]
    fn test_required_roles() {
        assert_eq!(Role::required_for(PlanType::PkIn), Role::Reader);
        assert_eq!(Role::required_for(PlanType::Set), Role::Reader);
        assert_eq!(Role::required_for(PlanType::UpsertPk), Role::Writer);
        assert_eq!(Role::required_for(PlanType::Ddl), Role::Admin);
        assert_eq!(Role::required_for(PlanType::Other), Role::Admin);
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acl.json");
        std::fs::write(
            &path,
            r#"{"table_groups": [{"name": "g", "table_names_or_prefixes": ["%"], "readers": ["%"]}]}"#,
        )
        .unwrap();
        let acl = TableAcl::load_file(path.to_str().unwrap()).unwrap();
        assert_eq!(acl.group_for("anything").unwrap().name, "g");
    }
}
