//! Typed values and query results exchanged between the engine, the
//! database driver and callers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single typed SQL value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Int64(i64),
    Uint64(u64),
    Float64(f64),
    /// Exact numeric kept in its textual form
    Decimal(String),
    Text(String),
    Binary(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_integral(&self) -> bool {
        matches!(self, Value::Int64(_) | Value::Uint64(_))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            Value::Uint64(v) => i64::try_from(*v).ok(),
            Value::Text(s) | Value::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Parse a numeric literal as it appears in SQL text.
    pub fn from_number_literal(text: &str) -> Value {
        if let Ok(v) = text.parse::<i64>() {
            Value::Int64(v)
        } else if let Ok(v) = text.parse::<u64>() {
            Value::Uint64(v)
        } else {
            Value::Decimal(text.to_string())
        }
    }

    /// Append this value as a MySQL literal.
    pub fn encode_sql(&self, out: &mut String) {
        match self {
            Value::Null => out.push_str("null"),
            Value::Int64(v) => out.push_str(&v.to_string()),
            Value::Uint64(v) => out.push_str(&v.to_string()),
            Value::Float64(v) => out.push_str(&v.to_string()),
            Value::Decimal(s) => out.push_str(s),
            Value::Text(s) => encode_string(s, out),
            Value::Binary(b) => {
                out.push_str("X'");
                for byte in b {
                    out.push_str(&format!("{:02x}", byte));
                }
                out.push('\'');
            }
        }
    }

    pub fn to_sql(&self) -> String {
        let mut out = String::new();
        self.encode_sql(&mut out);
        out
    }

    /// Compact encoding used inside cache keys and change-capture comments:
    /// numbers verbatim, everything else base64.
    pub fn encode_compact(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Int64(v) => v.to_string(),
            Value::Uint64(v) => v.to_string(),
            Value::Float64(v) => v.to_string(),
            Value::Decimal(s) => s.clone(),
            Value::Text(s) => format!("'{}'", STANDARD.encode(s.as_bytes())),
            Value::Binary(b) => format!("'{}'", STANDARD.encode(b)),
        }
    }

    /// Approximate wire size, used to bound streamed chunks.
    pub fn byte_size(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Int64(_) | Value::Uint64(_) | Value::Float64(_) => 8,
            Value::Decimal(s) | Value::Text(s) => s.len(),
            Value::Binary(b) => b.len(),
        }
    }
}

/// MySQL string literal with backslash escapes.
pub fn encode_string(s: &str, out: &mut String) {
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            '\x1a' => out.push_str("\\Z"),
            other => out.push(other),
        }
    }
    out.push('\'');
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Uint64(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Decimal(s) | Value::Text(s) => write!(f, "{}", s),
            Value::Binary(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int64(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Binary(v)
    }
}

/// Column types as reported by the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Null,
    Int8,
    Int16,
    Int24,
    Int32,
    Int64,
    Uint64,
    Float32,
    Float64,
    Decimal,
    Date,
    Time,
    Datetime,
    Timestamp,
    Year,
    Char,
    VarChar,
    Text,
    Binary,
    VarBinary,
    Blob,
    Enum,
    Set,
    Bit,
    Json,
}

impl FieldType {
    /// Map a column type string such as `int(11) unsigned` or `varchar(64)`.
    pub fn from_mysql_type(column_type: &str) -> FieldType {
        let lower = column_type.trim().to_ascii_lowercase();
        let base = lower
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or_default();
        let unsigned = lower.contains("unsigned");
        match base {
            "tinyint" | "bool" | "boolean" => FieldType::Int8,
            "smallint" => FieldType::Int16,
            "mediumint" => FieldType::Int24,
            "int" | "integer" => FieldType::Int32,
            "bigint" if unsigned => FieldType::Uint64,
            "bigint" => FieldType::Int64,
            "float" => FieldType::Float32,
            "double" | "real" => FieldType::Float64,
            "decimal" | "numeric" => FieldType::Decimal,
            "date" => FieldType::Date,
            "time" => FieldType::Time,
            "datetime" => FieldType::Datetime,
            "timestamp" => FieldType::Timestamp,
            "year" => FieldType::Year,
            "char" => FieldType::Char,
            "varchar" => FieldType::VarChar,
            "tinytext" | "text" | "mediumtext" | "longtext" => FieldType::Text,
            "binary" => FieldType::Binary,
            "varbinary" => FieldType::VarBinary,
            "tinyblob" | "blob" | "mediumblob" | "longblob" => FieldType::Blob,
            "enum" => FieldType::Enum,
            "set" => FieldType::Set,
            "bit" => FieldType::Bit,
            "json" => FieldType::Json,
            _ => FieldType::VarBinary,
        }
    }

    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            FieldType::Int8
                | FieldType::Int16
                | FieldType::Int24
                | FieldType::Int32
                | FieldType::Int64
                | FieldType::Uint64
                | FieldType::Year
        )
    }

    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            FieldType::Binary | FieldType::VarBinary | FieldType::Blob
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

pub type Row = Vec<Value>;

/// Result of one statement.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub fields: Vec<Field>,
    pub rows: Vec<Row>,
    pub rows_affected: u64,
    pub insert_id: u64,
    /// Set when a bounded DML stopped at the row limit and more rows may match.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

impl QueryResult {
    pub fn with_rows(fields: Vec<Field>, rows: Vec<Row>) -> Self {
        Self {
            fields,
            rows,
            ..Default::default()
        }
    }

    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Default::default()
        }
    }
}

/// Bind variables by name, ordered for stable logging.
pub type BindVariables = BTreeMap<String, Value>;

/// A statement together with its bind variables.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundQuery {
    pub sql: String,
    #[serde(default)]
    pub bind_variables: BindVariables,
}

impl BoundQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            bind_variables: BindVariables::new(),
        }
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bind_variables.insert(name.into(), value.into());
        self
    }
}
