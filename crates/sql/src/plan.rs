//! Execution plans produced by the builder.

use crate::error::PlanError;
use crate::parsed_query::ParsedQuery;
use crate::schema::Table;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tablet_common::{BindVariables, Field, Value};

/// How a statement is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanType {
    PassSelect,
    SelectSubquery,
    PkIn,
    PassDml,
    DmlPk,
    DmlSubquery,
    InsertPk,
    InsertSubquery,
    UpsertPk,
    Set,
    Ddl,
    Other,
}

impl PlanType {
    pub const ALL: [PlanType; 12] = [
        PlanType::PassSelect,
        PlanType::SelectSubquery,
        PlanType::PkIn,
        PlanType::PassDml,
        PlanType::DmlPk,
        PlanType::DmlSubquery,
        PlanType::InsertPk,
        PlanType::InsertSubquery,
        PlanType::UpsertPk,
        PlanType::Set,
        PlanType::Ddl,
        PlanType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::PassSelect => "PASS_SELECT",
            PlanType::SelectSubquery => "SELECT_SUBQUERY",
            PlanType::PkIn => "PK_IN",
            PlanType::PassDml => "PASS_DML",
            PlanType::DmlPk => "DML_PK",
            PlanType::DmlSubquery => "DML_SUBQUERY",
            PlanType::InsertPk => "INSERT_PK",
            PlanType::InsertSubquery => "INSERT_SUBQUERY",
            PlanType::UpsertPk => "UPSERT_PK",
            PlanType::Set => "SET",
            PlanType::Ddl => "DDL",
            PlanType::Other => "OTHER",
        }
    }

    pub fn is_select(&self) -> bool {
        matches!(
            self,
            PlanType::PassSelect | PlanType::SelectSubquery | PlanType::PkIn
        )
    }

    /// Plans that modify rows.
    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            PlanType::PassDml
                | PlanType::DmlPk
                | PlanType::DmlSubquery
                | PlanType::InsertPk
                | PlanType::InsertSubquery
                | PlanType::UpsertPk
        )
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PlanType::ALL
            .iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("unknown plan type: {}", s))
    }
}

/// Why a statement did not get a more specific plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    #[default]
    Default,
    Select,
    Table,
    #[serde(rename = "NOCACHE")]
    NoCache,
    SelectList,
    Lock,
    Where,
    Order,
    Limit,
    PkChange,
    ComplexExpr,
    Upsert,
    #[serde(rename = "NOPK")]
    NoPk,
    Multirow,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Default => "DEFAULT",
            Reason::Select => "SELECT",
            Reason::Table => "TABLE",
            Reason::NoCache => "NOCACHE",
            Reason::SelectList => "SELECT_LIST",
            Reason::Lock => "LOCK",
            Reason::Where => "WHERE",
            Reason::Order => "ORDER",
            Reason::Limit => "LIMIT",
            Reason::PkChange => "PK_CHANGE",
            Reason::ComplexExpr => "COMPLEX_EXPR",
            Reason::Upsert => "UPSERT",
            Reason::NoPk => "NOPK",
            Reason::Multirow => "MULTIROW",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A literal from the statement text or a reference to a bind variable.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueExpr {
    Literal(Value),
    Bind(String),
}

impl ValueExpr {
    pub fn resolve(&self, bind_variables: &BindVariables) -> Result<Value, PlanError> {
        match self {
            ValueExpr::Literal(v) => Ok(v.clone()),
            ValueExpr::Bind(name) => bind_variables
                .get(name)
                .cloned()
                .ok_or_else(|| PlanError::MissingBindVariable(name.clone())),
        }
    }
}

impl fmt::Display for ValueExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueExpr::Literal(v) => f.write_str(&v.to_sql()),
            ValueExpr::Bind(name) => write!(f, ":{}", name),
        }
    }
}

/// Values a WHERE clause pins one primary key column to.
#[derive(Debug, Clone, PartialEq)]
pub enum PkValue {
    Single(ValueExpr),
    List(Vec<ValueExpr>),
}

/// Expand per-column key values into key rows. Several IN lists produce
/// their cartesian product.
pub fn resolve_pk_rows(
    pk_values: &[PkValue],
    bind_variables: &BindVariables,
) -> Result<Vec<Vec<Value>>, PlanError> {
    let mut rows: Vec<Vec<Value>> = vec![Vec::with_capacity(pk_values.len())];
    for pk_value in pk_values {
        let choices = match pk_value {
            PkValue::Single(v) => vec![v.resolve(bind_variables)?],
            PkValue::List(list) => list
                .iter()
                .map(|v| v.resolve(bind_variables))
                .collect::<Result<Vec<_>, _>>()?,
        };
        let mut next = Vec::with_capacity(rows.len() * choices.len());
        for row in &rows {
            for choice in &choices {
                let mut extended = row.clone();
                extended.push(choice.clone());
                next.push(extended);
            }
        }
        rows = next;
    }
    Ok(rows)
}

/// Resolve row-major key expressions, as collected from INSERT values.
pub fn resolve_value_rows(
    rows: &[Vec<ValueExpr>],
    bind_variables: &BindVariables,
) -> Result<Vec<Vec<Value>>, PlanError> {
    rows.iter()
        .map(|row| row.iter().map(|v| v.resolve(bind_variables)).collect())
        .collect()
}

/// Keys rows will have after an UPDATE that assigns primary key columns.
/// Returns `None` when no key column is assigned.
pub fn secondary_pk_rows(
    pk_rows: &[Vec<Value>],
    secondary: &[Option<ValueExpr>],
    bind_variables: &BindVariables,
) -> Result<Option<Vec<Vec<Value>>>, PlanError> {
    if secondary.iter().all(Option::is_none) {
        return Ok(None);
    }
    let mut resolved = Vec::with_capacity(secondary.len());
    for s in secondary {
        resolved.push(match s {
            Some(v) => Some(v.resolve(bind_variables)?),
            None => None,
        });
    }
    let rows = pk_rows
        .iter()
        .map(|row| {
            row.iter()
                .zip(&resolved)
                .map(|(old, new)| new.clone().unwrap_or_else(|| old.clone()))
                .collect()
        })
        .collect();
    Ok(Some(rows))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DdlPlan {
    pub action: String,
    pub table_name: Option<String>,
    pub new_name: Option<String>,
}

/// `set key = value` with a single assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct SetPlan {
    pub key: String,
    pub value: ValueExpr,
}

/// A classified statement, immutable once built and shared through the plan cache.
#[derive(Debug, Clone)]
pub struct ExecPlan {
    pub plan_type: PlanType,
    pub reason: Reason,
    pub table_name: Option<String>,
    /// Every table the statement touches, for rules and ACL checks
    pub tables: Vec<String>,
    pub table: Option<Arc<Table>>,

    /// The statement as received, without comments
    pub full_query: ParsedQuery,
    /// Rewritten statement restricted by `:#pk` or fed by `:#values`
    pub outer_query: Option<ParsedQuery>,
    /// Statement resolving the affected primary keys or source rows
    pub subquery: Option<ParsedQuery>,
    /// Update branch of an upsert
    pub upsert_query: Option<ParsedQuery>,

    /// Projection of full table rows for select plans
    pub column_numbers: Vec<usize>,
    pub fields: Vec<Field>,

    pub pk_values: Vec<PkValue>,
    /// Row-major key values of INSERT rows
    pub pk_rows: Vec<Vec<ValueExpr>>,
    /// New key values assigned by an UPDATE, per key column
    pub secondary_pk_values: Vec<Option<ValueExpr>>,
    pub limit: Option<ValueExpr>,

    /// Position of each key column within the columns an INSERT ... SELECT fills
    pub subquery_pk_positions: Vec<Option<usize>>,
    pub insert_column_count: usize,

    pub ddl: Option<DdlPlan>,
    pub set: Option<SetPlan>,
}

impl ExecPlan {
    pub fn new(plan_type: PlanType, full_query: ParsedQuery) -> Self {
        Self {
            plan_type,
            reason: Reason::Default,
            table_name: None,
            tables: Vec::new(),
            table: None,
            full_query,
            outer_query: None,
            subquery: None,
            upsert_query: None,
            column_numbers: Vec::new(),
            fields: Vec::new(),
            pk_values: Vec::new(),
            pk_rows: Vec::new(),
            secondary_pk_values: Vec::new(),
            limit: None,
            subquery_pk_positions: Vec::new(),
            insert_column_count: 0,
            ddl: None,
            set: None,
        }
    }

    pub(crate) fn with_reason(mut self, reason: Reason) -> Self {
        self.reason = reason;
        self
    }

    pub(crate) fn with_tables(mut self, tables: Vec<String>) -> Self {
        self.tables = tables;
        self
    }

    pub(crate) fn with_table(mut self, table: Arc<Table>) -> Self {
        self.table_name = Some(table.name.clone());
        self.table = Some(table);
        self
    }

    /// Name used for per-table stats: the target table, else the first touched one.
    pub fn stats_table(&self) -> &str {
        self.table_name
            .as_deref()
            .or_else(|| self.tables.first().map(String::as_str))
            .unwrap_or("")
    }
}
