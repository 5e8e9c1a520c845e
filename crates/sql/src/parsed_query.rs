//! SQL templates with bind-variable substitution.
//!
//! A template references caller bind variables as `:name` and values the
//! executor computes as `:#name`. Supported internal names are `pk`
//! (a primary key restriction), `maxLimit` and `values` (a VALUES row list).

use crate::error::PlanError;
use std::fmt;
use tablet_common::{BindVariables, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub query: String,
}

/// Primary key restriction rendered as `pk in (...)` for single-column keys
/// and as a disjunction of conjunctions otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct TupleEqualityList {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl TupleEqualityList {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn encode(&self, out: &mut String) -> Result<(), PlanError> {
        if self.rows.is_empty() {
            return Err(PlanError::InvalidBindValue {
                name: "#pk".to_string(),
                detail: "empty primary key list".to_string(),
            });
        }
        if let [column] = self.columns.as_slice() {
            out.push_str(column);
            out.push_str(" in (");
            for (i, row) in self.rows.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                single_value(row)?.encode_sql(out);
            }
            out.push(')');
            return Ok(());
        }
        for (i, row) in self.rows.iter().enumerate() {
            if row.len() != self.columns.len() {
                return Err(PlanError::InvalidBindValue {
                    name: "#pk".to_string(),
                    detail: format!("expected {} values, got {}", self.columns.len(), row.len()),
                });
            }
            if i > 0 {
                out.push_str(" or ");
            }
            out.push('(');
            for (j, (column, value)) in self.columns.iter().zip(row).enumerate() {
                if j > 0 {
                    out.push_str(" and ");
                }
                out.push_str(column);
                out.push_str(" = ");
                value.encode_sql(out);
            }
            out.push(')');
        }
        Ok(())
    }
}

fn single_value(row: &[Value]) -> Result<&Value, PlanError> {
    match row {
        [v] => Ok(v),
        _ => Err(PlanError::InvalidBindValue {
            name: "#pk".to_string(),
            detail: format!("expected 1 value, got {}", row.len()),
        }),
    }
}

/// Values computed by the executor for `:#name` references.
#[derive(Debug, Clone, Default)]
pub struct InternalBinds {
    pub pk: Option<TupleEqualityList>,
    pub max_limit: Option<u64>,
    pub values: Option<Vec<Vec<Value>>>,
}

impl InternalBinds {
    pub fn with_pk(mut self, pk: TupleEqualityList) -> Self {
        self.pk = Some(pk);
        self
    }

    pub fn with_max_limit(mut self, limit: u64) -> Self {
        self.max_limit = Some(limit);
        self
    }

    pub fn with_values(mut self, values: Vec<Vec<Value>>) -> Self {
        self.values = Some(values);
        self
    }
}

impl ParsedQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
        }
    }

    /// Substitute bind variables, producing executable SQL.
    pub fn generate(
        &self,
        bind_variables: &BindVariables,
        internal: &InternalBinds,
    ) -> Result<String, PlanError> {
        let src = self.query.as_str();
        let bytes = src.as_bytes();
        let mut out = String::with_capacity(src.len() + 16);
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                quote @ (b'\'' | b'"' | b'`') => {
                    let end = skip_quoted(bytes, i, quote);
                    out.push_str(&src[i..end]);
                    i = end;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    let end = src[i + 2..]
                        .find("*/")
                        .map_or(bytes.len(), |p| i + 2 + p + 2);
                    out.push_str(&src[i..end]);
                    i = end;
                }
                b':' if bytes.get(i + 1) == Some(&b'#') => {
                    let end = ident_end(bytes, i + 2);
                    encode_internal(&src[i + 2..end], internal, &mut out)?;
                    i = end;
                }
                b':' if bytes.get(i + 1).map_or(false, |b| is_ident_start(*b)) => {
                    let end = ident_end(bytes, i + 1);
                    let name = &src[i + 1..end];
                    bind_variables
                        .get(name)
                        .ok_or_else(|| PlanError::MissingBindVariable(name.to_string()))?
                        .encode_sql(&mut out);
                    i = end;
                }
                b':' if matches!(bytes.get(i + 1), Some(b':') | Some(b'=')) => {
                    out.push_str(&src[i..i + 2]);
                    i += 2;
                }
                _ => {
                    let ch_len = src[i..].chars().next().map_or(1, char::len_utf8);
                    out.push_str(&src[i..i + ch_len]);
                    i += ch_len;
                }
            }
        }
        Ok(out)
    }
}

fn encode_internal(name: &str, internal: &InternalBinds, out: &mut String) -> Result<(), PlanError> {
    let missing = || PlanError::MissingBindVariable(format!("#{}", name));
    match name {
        "pk" => internal.pk.as_ref().ok_or_else(missing)?.encode(out),
        "maxLimit" => {
            out.push_str(&internal.max_limit.ok_or_else(missing)?.to_string());
            Ok(())
        }
        "values" => {
            let rows = internal.values.as_ref().ok_or_else(missing)?;
            for (i, row) in rows.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push('(');
                for (j, value) in row.iter().enumerate() {
                    if j > 0 {
                        out.push_str(", ");
                    }
                    value.encode_sql(out);
                }
                out.push(')');
            }
            Ok(())
        }
        _ => Err(missing()),
    }
}

fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if quote != b'`' => i += 2,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn ident_end(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
        i += 1;
    }
    i
}

impl fmt::Display for ParsedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_binds() {
        let pq = ParsedQuery::new("select * from t where a = :a and b = ':a' limit :#maxLimit");
        let mut bv = BindVariables::new();
        bv.insert("a".into(), Value::from("x'"));
        let sql = pq
            .generate(&bv, &InternalBinds::default().with_max_limit(10001))
            .unwrap();
        assert_eq!(sql, "select * from t where a = 'x\\'' and b = ':a' limit 10001");
    }

    #[test]
    fn test_missing_bind() {
        let pq = ParsedQuery::new("select * from t where a = :a");
        let err = pq
            .generate(&BindVariables::new(), &InternalBinds::default())
            .unwrap_err();
        assert!(matches!(err, PlanError::MissingBindVariable(n) if n == "a"));

        let pq = ParsedQuery::new("update t set a = 1 where :#pk");
        assert!(pq
            .generate(&BindVariables::new(), &InternalBinds::default())
            .is_err());
    }

    #[test]
    fn test_pk_single_column() {
        let pq = ParsedQuery::new("select pk, name from t where :#pk");
        let pk = TupleEqualityList::new(
            vec!["pk".into()],
            vec![vec![Value::Int64(2)], vec![Value::Int64(3)]],
        );
        let sql = pq
            .generate(&BindVariables::new(), &InternalBinds::default().with_pk(pk))
            .unwrap();
        assert_eq!(sql, "select pk, name from t where pk in (2, 3)");
    }

    #[test]
    fn test_pk_composite() {
        let pk = TupleEqualityList::new(
            vec!["a".into(), "b".into()],
            vec![
                vec![Value::Int64(1), Value::from("x")],
                vec![Value::Int64(2), Value::from("y")],
            ],
        );
        let mut out = String::new();
        pk.encode(&mut out).unwrap();
        assert_eq!(out, "(a = 1 and b = 'x') or (a = 2 and b = 'y')");
        assert!(TupleEqualityList::new(vec!["a".into()], vec![]).encode(&mut String::new()).is_err());
    }

    #[test]
    fn test_values_and_casts() {
        let pq = ParsedQuery::new("insert into t(a, b) values :#values");
        let sql = pq
            .generate(
                &BindVariables::new(),
                &InternalBinds::default().with_values(vec![
                    vec![Value::Int64(1), Value::from("a")],
                    vec![Value::Int64(2), Value::Null],
                ]),
            )
            .unwrap();
        assert_eq!(sql, "insert into t(a, b) values (1, 'a'), (2, null)");

        let pq = ParsedQuery::new("select a::int, @x := 1 from t");
        assert_eq!(
            pq.generate(&BindVariables::new(), &InternalBinds::default()).unwrap(),
            "select a::int, @x := 1 from t"
        );
    }
}
