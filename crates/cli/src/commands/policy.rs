//! `check-rules` and `check-acl`: parse the policy files a tablet loads at start.

use anyhow::Result;
use owo_colors::OwoColorize;
use serde::Serialize;
use tablet_runtime::acl::AclDecision;
use tablet_runtime::{QueryRules, Role, TableAcl};

use crate::output::{self, OutputFormat};

#[derive(Debug, Serialize)]
pub struct RuleSummary {
    pub name: String,
    pub description: String,
    pub action: String,
}

#[derive(Debug, Serialize)]
pub struct RulesReport {
    pub file: String,
    pub rules: Vec<RuleSummary>,
}

pub(crate) fn rules_report(file: &str) -> Result<RulesReport> {
    let rules = QueryRules::load_file(file)?;
    Ok(RulesReport {
        file: file.to_string(),
        rules: rules
            .iter()
            .map(|rule| RuleSummary {
                name: rule.name.clone(),
                description: rule.description.clone(),
                action: rule.action.to_string(),
            })
            .collect(),
    })
}

pub fn check_rules(file: &str, format: OutputFormat) -> Result<()> {
    let report = rules_report(file)?;
    if format.is_machine_readable() {
        return output::print_success(format, &report);
    }

    println!("{} {}", "Rules:".bold().cyan(), report.file.yellow());
    for rule in &report.rules {
        println!("  {} {} {}", rule.action.bold(), rule.name, rule.description.dimmed());
    }
    println!(
        "{}",
        format!("{} rule(s) are valid.", report.rules.len()).green().bold()
    );
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct RoleDecision {
    pub role: String,
    /// `allowed`, `denied` or `unconfigured`
    pub decision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AclReport {
    pub file: String,
    pub groups: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub decisions: Vec<RoleDecision>,
}

fn role_decision(acl: &TableAcl, table: &str, role: Role, user: &str) -> RoleDecision {
    let (decision, group) = match acl.authorize(table, role, user) {
        AclDecision::Unconfigured => ("unconfigured", None),
        AclDecision::Allowed { group } => ("allowed", Some(group)),
        AclDecision::Denied { group } => ("denied", Some(group)),
    };
    RoleDecision {
        role: role.to_string(),
        decision: decision.to_string(),
        group,
    }
}

pub(crate) fn acl_report(file: &str, table: Option<&str>, user: Option<&str>) -> Result<AclReport> {
    let acl = TableAcl::load_file(file)?;
    let decisions = match (table, user) {
        (Some(table), Some(user)) => [Role::Reader, Role::Writer, Role::Admin]
            .into_iter()
            .map(|role| role_decision(&acl, table, role, user))
            .collect(),
        _ => Vec::new(),
    };
    Ok(AclReport {
        file: file.to_string(),
        groups: acl.group_names(),
        table: table.map(|t| match acl.group_for(t) {
            Some(group) => format!("{} ({})", t, group.name),
            None => t.to_string(),
        }),
        decisions,
    })
}

pub fn check_acl(
    file: &str,
    table: Option<&str>,
    user: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let report = acl_report(file, table, user)?;
    if format.is_machine_readable() {
        return output::print_success(format, &report);
    }

    println!("{} {}", "Table ACL:".bold().cyan(), report.file.yellow());
    println!("  groups: {}", report.groups.join(", "));
    if let Some(table) = &report.table {
        println!("  table:  {}", table);
    }
    for d in &report.decisions {
        let decision = match d.decision.as_str() {
            "denied" => d.decision.red().to_string(),
            _ => d.decision.green().to_string(),
        };
        println!("  {:<7} {}", d.role, decision);
    }
    println!("{}", "ACL is valid.".green().bold());
    Ok(())
}
