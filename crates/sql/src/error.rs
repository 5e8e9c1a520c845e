use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("unsupported statement: {0}")]
    Unsupported(String),

    #[error("column count doesn't match value count")]
    ColumnCountMismatch,

    #[error("unknown column '{column}' in table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("missing bind var {0}")]
    MissingBindVariable(String),

    #[error("unexpected value for {name}: {detail}")]
    InvalidBindValue { name: String, detail: String },
}

impl PlanError {
    pub fn to_tablet_error(self) -> tablet_error::TabletError {
        use tablet_error::{ErrorCode, ErrorContext, TabletError};

        match self {
            PlanError::Syntax(msg) => {
                TabletError::new(ErrorCode::SyntaxError, format!("syntax error: {}", msg))
                    .with_hint("Check the statement against MySQL grammar")
            }
            PlanError::Unsupported(what) => TabletError::new(
                ErrorCode::UnsupportedQuery,
                format!("unsupported statement: {}", what),
            ),
            PlanError::ColumnCountMismatch => TabletError::new(
                ErrorCode::SyntaxError,
                "column count doesn't match value count",
            ),
            PlanError::UnknownColumn { table, column } => TabletError::new(
                ErrorCode::SyntaxError,
                format!("unknown column '{}' in table '{}'", column, table),
            )
            .with_context(ErrorContext::Plan {
                plan: None,
                table: Some(table),
                reason: format!("column {} not in schema", column),
            }),
            PlanError::MissingBindVariable(name) => TabletError::new(
                ErrorCode::MissingBindVariable,
                format!("missing bind var {}", name),
            )
            .with_hint("Every :name in the statement needs a bind variable"),
            PlanError::InvalidBindValue { name, detail } => TabletError::new(
                ErrorCode::SyntaxError,
                format!("unexpected value for {}: {}", name, detail),
            ),
        }
    }
}

impl From<PlanError> for tablet_error::TabletError {
    fn from(err: PlanError) -> Self {
        err.to_tablet_error()
    }
}
