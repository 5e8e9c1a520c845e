//! Table metadata consumed by the plan builder.

use serde::{Deserialize, Serialize};
use tablet_common::{Field, FieldType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    #[default]
    None,
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableColumn {
    pub name: String,
    pub column_type: FieldType,
    pub default: Value,
    pub is_auto_increment: bool,
}

impl TableColumn {
    pub fn new(name: impl Into<String>, column_type: FieldType) -> Self {
        Self {
            name: name.into(),
            column_type,
            default: Value::Null,
            is_auto_increment: false,
        }
    }
}

/// A table as seen by the query engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<TableColumn>,
    /// Positions of the primary key columns in `columns`, in key order
    pub pk_columns: Vec<usize>,
    pub cache_type: CacheType,
    pub create_time: i64,
    pub comment: String,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            pk_columns: Vec::new(),
            cache_type: CacheType::None,
            create_time: 0,
            comment: String::new(),
        }
    }

    pub fn add_column(&mut self, column: TableColumn) {
        self.columns.push(column);
    }

    /// Case-insensitive column lookup.
    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Set the primary key by column names. Unknown names are rejected.
    pub fn set_pk(&mut self, names: &[impl AsRef<str>]) -> Result<(), String> {
        let mut positions = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            match self.find_column(name) {
                Some(idx) => positions.push(idx),
                None => return Err(format!("column {} not found in table {}", name, self.name)),
            }
        }
        self.pk_columns = positions;
        Ok(())
    }

    pub fn has_pk(&self) -> bool {
        !self.pk_columns.is_empty()
    }

    pub fn is_cached(&self) -> bool {
        self.has_pk() && self.cache_type == CacheType::ReadWrite
    }

    pub fn pk_column_names(&self) -> Vec<&str> {
        self.pk_columns
            .iter()
            .map(|&i| self.columns[i].name.as_str())
            .collect()
    }

    /// Position of `column` within the primary key.
    pub fn pk_index_of(&self, column: &str) -> Option<usize> {
        self.pk_columns
            .iter()
            .position(|&i| self.columns[i].name.eq_ignore_ascii_case(column))
    }

    pub fn fields(&self) -> Vec<Field> {
        self.columns
            .iter()
            .map(|c| Field::new(c.name.clone(), c.column_type))
            .collect()
    }

    /// Extract the primary key of a full row.
    pub fn pk_of_row(&self, row: &[Value]) -> Vec<Value> {
        self.pk_columns
            .iter()
            .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Coerce key values to the key columns' types so that a key compares and
    /// encodes the same whether it came from SQL text, a bind variable or a row.
    pub fn normalize_pk(&self, pk: Vec<Value>) -> Vec<Value> {
        pk.into_iter()
            .zip(&self.pk_columns)
            .map(|(value, &idx)| {
                if !self.columns[idx].column_type.is_integral() {
                    return value;
                }
                match &value {
                    Value::Text(s) | Value::Decimal(s) => {
                        let s = s.trim();
                        if let Ok(v) = s.parse::<i64>() {
                            Value::Int64(v)
                        } else if let Ok(v) = s.parse::<u64>() {
                            Value::Uint64(v)
                        } else {
                            value
                        }
                    }
                    Value::Uint64(v) => i64::try_from(*v).map(Value::Int64).unwrap_or(value),
                    _ => value,
                }
            })
            .collect()
    }
}

/// Serialized table definition used by static schema files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    #[serde(default)]
    pub auto_increment: bool,
}

impl TableDef {
    pub fn into_table(self) -> Result<Table, String> {
        let mut table = Table::new(self.name);
        table.comment = self.comment;
        for col in self.columns {
            let mut column = TableColumn::new(col.name, FieldType::from_mysql_type(&col.column_type));
            column.is_auto_increment = col.auto_increment;
            table.add_column(column);
        }
        table.set_pk(&self.primary_key)?;
        if self.cache && table.has_pk() {
            table.cache_type = CacheType::ReadWrite;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_def_into_table() {
        let yaml = r#"
name: test_table
columns:
  - { name: pk, type: "int(11)", auto_increment: true }
  - { name: name, type: "varchar(64)" }
  - { name: addr, type: "varchar(64)" }
primary_key: [pk]
cache: true
"#;
        let def: TableDef = serde_yaml::from_str(yaml).unwrap();
        let table = def.into_table().unwrap();
        assert_eq!(table.pk_columns, vec![0]);
        assert!(table.is_cached());
        assert!(table.columns[0].is_auto_increment);
        assert_eq!(table.find_column("NAME"), Some(1));
        assert_eq!(table.pk_index_of("PK"), Some(0));
    }

    #[test]
    fn test_normalize_pk_coerces_integral_columns() {
        let mut table = Table::new("t");
        table.add_column(TableColumn::new("id", FieldType::Int64));
        table.add_column(TableColumn::new("name", FieldType::VarChar));
        table.set_pk(&["id", "name"]).unwrap();

        let pk = table.normalize_pk(vec![Value::Text("12".into()), Value::Text("12".into())]);
        assert_eq!(pk, vec![Value::Int64(12), Value::Text("12".into())]);

        let untouched = table.normalize_pk(vec![Value::Text("abc".into()), Value::Null]);
        assert_eq!(untouched[0], Value::Text("abc".into()));
    }

    #[test]
    fn test_cache_requires_pk() {
        let def = TableDef {
            name: "t".into(),
            columns: vec![ColumnDef {
                name: "a".into(),
                column_type: "int".into(),
                auto_increment: false,
            }],
            primary_key: vec![],
            cache: true,
            comment: String::new(),
        };
        assert!(!def.into_table().unwrap().is_cached());
    }

    #[test]
    fn test_set_pk_unknown_column() {
        let mut table = Table::new("t");
        table.add_column(TableColumn::new("a", FieldType::Int32));
        assert!(table.set_pk(&["b"]).is_err());
    }
}
