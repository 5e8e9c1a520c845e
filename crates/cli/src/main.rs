//! tabletctl: offline tooling for tablet operators.
//!
//! Everything here runs without a database. The commands check the files a
//! tablet is started with, so mistakes surface before a deploy.
//!
//! # Commands
//!
//! - `validate-config`: Load a tablet configuration file with environment overrides.
//! - `explain`: Show how a statement would be planned against a schema file.
//! - `check-rules`: Parse a query rules file.
//! - `check-acl`: Parse a table ACL file, optionally checking one table and user.

use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use tablet_common::config::LoggingConfig;
use tablet_error::{ErrorCategory, TabletError};

mod commands;
mod exit_codes;
mod output;

use output::OutputFormat;

#[derive(Parser)]
#[command(name = "tabletctl")]
#[command(about = "Check tablet configuration, policy files and query plans", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (human, json, yaml)
    #[arg(long, global = true, value_enum, default_value = "human")]
    output: OutputFormat,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, global = true, env = "TABLET_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a tablet configuration file
    ValidateConfig {
        /// Path to the configuration file (YAML, TOML or JSON)
        #[arg(default_value = "tablet.yaml")]
        file: String,
    },
    /// Print the execution plan of a statement
    Explain {
        /// YAML list of table definitions
        #[arg(long)]
        schema: String,
        /// The statement to plan
        sql: String,
    },
    /// Validate a query rules file
    CheckRules {
        /// Path to the JSON rules file
        file: String,
    },
    /// Validate a table ACL file
    CheckAcl {
        /// Path to the ACL file (JSON, or YAML by extension)
        file: String,
        /// Report the decision for this table
        #[arg(long)]
        table: Option<String>,
        /// User checked against --table
        #[arg(long, requires = "table")]
        user: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let logging = LoggingConfig {
        level: cli.log_level.clone(),
        ..Default::default()
    };
    let _guards = tablet_common::telemetry::init_logging(&logging).ok();

    if let Err(e) = run_cli(&cli) {
        let exit_code = map_error_to_exit_code(&e);
        if cli.output.is_machine_readable() {
            output::print_error::<()>(cli.output, &e.to_string(), exit_code).ok();
        } else {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
        }
        std::process::exit(exit_code);
    }
}

fn map_error_to_exit_code(e: &anyhow::Error) -> i32 {
    if let Some(err) = e.downcast_ref::<TabletError>() {
        return match err.code.category() {
            ErrorCategory::Config => exit_codes::CONFIG_ERROR,
            ErrorCategory::Query => exit_codes::VALIDATION_ERROR,
            _ => exit_codes::GENERAL_ERROR,
        };
    }
    exit_codes::GENERAL_ERROR
}

fn run_cli(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::ValidateConfig { file } => commands::validate_config(file, cli.output),
        Commands::Explain { schema, sql } => commands::explain(schema, sql, cli.output),
        Commands::CheckRules { file } => commands::check_rules(file, cli.output),
        Commands::CheckAcl { file, table, user } => {
            commands::check_acl(file, table.as_deref(), user.as_deref(), cli.output)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_error::ErrorCode;

    #[test]
    fn test_exit_codes_follow_error_category() {
        let config = anyhow::Error::new(TabletError::new(ErrorCode::InvalidQueryRule, "bad"));
        assert_eq!(map_error_to_exit_code(&config), exit_codes::CONFIG_ERROR);

        let syntax = anyhow::Error::new(TabletError::new(ErrorCode::SyntaxError, "bad"));
        assert_eq!(map_error_to_exit_code(&syntax), exit_codes::VALIDATION_ERROR);

        let internal = anyhow::Error::new(TabletError::new(ErrorCode::SchemaLoadFailed, "bad"));
        assert_eq!(map_error_to_exit_code(&internal), exit_codes::GENERAL_ERROR);

        assert_eq!(
            map_error_to_exit_code(&anyhow::anyhow!("plain")),
            exit_codes::GENERAL_ERROR
        );
    }

    #[test]
    fn test_parse_check_acl_args() {
        let cli = Cli::try_parse_from([
            "tabletctl",
            "--output",
            "json",
            "check-acl",
            "acl.yaml",
            "--table",
            "t",
            "--user",
            "u",
        ])
        .unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::CheckAcl { ref table, ref user, .. }
                if table.as_deref() == Some("t") && user.as_deref() == Some("u")
        ));

        assert!(Cli::try_parse_from(["tabletctl", "check-acl", "acl.yaml", "--user", "u"]).is_err());
    }
}
