//! Query rules: operator-defined filters that block statements.
//!
//! A rule matches on any combination of client address, user, statement text,
//! plan type and touched tables. Patterns are regular expressions anchored at
//! both ends. Rules are grouped into named sources (a file, an admin API, ...)
//! that can be swapped independently at runtime.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tablet_error::{ErrorCode, ErrorContext, Result, TabletError};
use tablet_sql::PlanType;

/// Source name used for the rules file given in the configuration.
pub const FILE_CUSTOM_RULE: &str = "FILE_CUSTOM_RULE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    #[default]
    Allow,
    Fail,
    FailRetry,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "ALLOW",
            Action::Fail => "FAIL",
            Action::FailRetry => "FAIL_RETRY",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pattern or a list of patterns.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum Patterns {
    One(String),
    Many(Vec<String>),
}

impl Patterns {
    fn into_vec(self) -> Vec<String> {
        match self {
            Patterns::One(p) if p.is_empty() => Vec::new(),
            Patterns::One(p) => vec![p],
            Patterns::Many(ps) => ps,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
struct RuleSpec {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "RequestIP", default)]
    request_ip: Option<Patterns>,
    #[serde(default)]
    user: Option<Patterns>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    plans: Vec<String>,
    #[serde(default)]
    table_names: Vec<String>,
    #[serde(default)]
    action: Action,
}

#[derive(Debug, Clone)]
pub struct QueryRule {
    pub name: String,
    pub description: String,
    request_ip: Vec<Regex>,
    user: Vec<Regex>,
    query: Option<Regex>,
    plans: Vec<PlanType>,
    table_names: Vec<String>,
    pub action: Action,
}

fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
        TabletError::new(
            ErrorCode::InvalidQueryRule,
            format!("invalid pattern {:?}: {}", pattern, e),
        )
    })
}

impl QueryRule {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            request_ip: Vec::new(),
            user: Vec::new(),
            query: None,
            plans: Vec::new(),
            table_names: Vec::new(),
            action: Action::Allow,
        }
    }

    pub fn add_request_ip_cond(&mut self, pattern: &str) -> Result<()> {
        self.request_ip.push(anchored(pattern)?);
        Ok(())
    }

    pub fn add_user_cond(&mut self, pattern: &str) -> Result<()> {
        self.user.push(anchored(pattern)?);
        Ok(())
    }

    pub fn set_query_cond(&mut self, pattern: &str) -> Result<()> {
        self.query = Some(anchored(pattern)?);
        Ok(())
    }

    pub fn add_plan_cond(&mut self, plan: PlanType) {
        self.plans.push(plan);
    }

    pub fn add_table_cond(&mut self, table: impl Into<String>) {
        self.table_names.push(table.into());
    }

    pub fn set_action(&mut self, action: Action) {
        self.action = action;
    }

    /// Every condition that is set must hold. Table names match when any of
    /// the statement's tables is listed.
    pub fn matches(
        &self,
        remote_addr: &str,
        user: &str,
        sql: &str,
        plan: PlanType,
        tables: &[String],
    ) -> bool {
        if !self.request_ip.is_empty() && !self.request_ip.iter().any(|r| r.is_match(remote_addr)) {
            return false;
        }
        if !self.user.is_empty() && !self.user.iter().any(|r| r.is_match(user)) {
            return false;
        }
        if let Some(query) = &self.query {
            if !query.is_match(sql) {
                return false;
            }
        }
        if !self.plans.is_empty() && !self.plans.contains(&plan) {
            return false;
        }
        if !self.table_names.is_empty()
            && !tables.iter().any(|t| self.table_names.iter().any(|n| n == t))
        {
            return false;
        }
        true
    }

    fn from_spec(spec: RuleSpec) -> Result<Self> {
        let mut rule = QueryRule::new(spec.name, spec.description);
        for p in spec.request_ip.map(Patterns::into_vec).unwrap_or_default() {
            rule.add_request_ip_cond(&p)?;
        }
        for p in spec.user.map(Patterns::into_vec).unwrap_or_default() {
            rule.add_user_cond(&p)?;
        }
        if let Some(q) = spec.query.filter(|q| !q.is_empty()) {
            rule.set_query_cond(&q)?;
        }
        for plan in &spec.plans {
            let plan = plan
                .parse::<PlanType>()
                .map_err(|e| TabletError::new(ErrorCode::InvalidQueryRule, e))?;
            rule.add_plan_cond(plan);
        }
        for table in spec.table_names {
            rule.add_table_cond(table);
        }
        rule.set_action(spec.action);
        Ok(rule)
    }
}

/// An ordered rule list; the first matching rule decides.
#[derive(Debug, Clone, Default)]
pub struct QueryRules {
    rules: Vec<QueryRule>,
}

impl QueryRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the JSON rule file format: an array of rule objects.
    pub fn from_json(json: &str) -> Result<Self> {
        let specs: Vec<RuleSpec> = serde_json::from_str(json).map_err(|e| {
            TabletError::new(ErrorCode::InvalidQueryRule, format!("invalid rules: {}", e))
        })?;
        let rules = specs
            .into_iter()
            .map(QueryRule::from_spec)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn load_file(path: &str) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            TabletError::new(ErrorCode::InvalidQueryRule, e.to_string()).with_context(
                ErrorContext::Config {
                    file_path: Some(path.to_string()),
                    field: None,
                },
            )
        })?;
        Self::from_json(&json)
    }

    pub fn add(&mut self, rule: QueryRule) {
        self.rules.push(rule);
    }

    pub fn find(&self, name: &str) -> Option<&QueryRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// Remove and return the named rule.
    pub fn delete(&mut self, name: &str) -> Option<QueryRule> {
        let idx = self.rules.iter().position(|r| r.name == name)?;
        Some(self.rules.remove(idx))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueryRule> {
        self.rules.iter()
    }

    pub fn first_match(
        &self,
        remote_addr: &str,
        user: &str,
        sql: &str,
        plan: PlanType,
        tables: &[String],
    ) -> Option<&QueryRule> {
        self.rules
            .iter()
            .find(|r| r.matches(remote_addr, user, sql, plan, tables))
    }
}

/// The rule that blocked a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleVerdict {
    pub source: String,
    pub rule: String,
    pub description: String,
    pub action: Action,
}

impl RuleVerdict {
    pub fn to_tablet_error(&self) -> TabletError {
        let code = match self.action {
            Action::FailRetry => ErrorCode::RuleFailRetry,
            _ => ErrorCode::RuleFail,
        };
        TabletError::new(code, format!("Query disallowed due to rule: {}", self.description))
            .with_context(ErrorContext::QueryRule {
                rule: self.rule.clone(),
                description: self.description.clone(),
            })
    }
}

/// Named rule sources, consulted in registration order.
#[derive(Default)]
pub struct RuleSources {
    sources: RwLock<Vec<(String, Arc<QueryRules>)>>,
}

impl RuleSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str) -> Result<()> {
        let mut sources = self.sources.write();
        if sources.iter().any(|(n, _)| n == name) {
            return Err(TabletError::new(
                ErrorCode::DuplicateRuleSource,
                format!("query rule source {} is already registered", name),
            ));
        }
        sources.push((name.to_string(), Arc::new(QueryRules::default())));
        Ok(())
    }

    /// Drop a source and its rules. Unknown names are ignored.
    pub fn unregister(&self, name: &str) {
        self.sources.write().retain(|(n, _)| n != name);
    }

    pub fn set_rules(&self, name: &str, rules: QueryRules) -> Result<()> {
        let mut sources = self.sources.write();
        match sources.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => {
                *slot = Arc::new(rules);
                Ok(())
            }
            None => Err(TabletError::new(
                ErrorCode::UnknownRuleSource,
                format!("query rule source {} is not registered", name),
            )),
        }
    }

    pub fn get_rules(&self, name: &str) -> Option<Arc<QueryRules>> {
        self.sources
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, rules)| rules.clone())
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.read().iter().map(|(n, _)| n.clone()).collect()
    }

    /// The first blocking verdict. Within a source only the first matching
    /// rule counts; an `Allow` match ends that source's evaluation.
    pub fn evaluate(
        &self,
        remote_addr: &str,
        user: &str,
        sql: &str,
        plan: PlanType,
        tables: &[String],
    ) -> Option<RuleVerdict> {
        let sources = self.sources.read();
        for (source, rules) in sources.iter() {
            let Some(rule) = rules.first_match(remote_addr, user, sql, plan, tables) else {
                continue;
            };
            if rule.action != Action::Allow {
                return Some(RuleVerdict {
                    source: source.clone(),
                    rule: rule.name.clone(),
                    description: rule.description.clone(),
                    action: rule.action,
                });
            }
        }
        None
    }
}
