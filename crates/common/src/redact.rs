//! Rendering statements for logs and error messages.
//!
//! Bind variable values may carry user data. In terse mode they never leave
//! the process: logs show the SQL template only and database errors are
//! reduced to their error number.

use crate::types::BindVariables;

/// `Sql: "..", BindVars: {..}` form used by the query log.
pub fn query_as_string(sql: &str, bind_variables: &BindVariables, terse: bool) -> String {
    let mut out = format!("Sql: {:?}", sql);
    if terse || bind_variables.is_empty() {
        return out;
    }
    out.push_str(", BindVars: {");
    for (i, (name, value)) in bind_variables.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(&value.to_sql());
    }
    out.push('}');
    out
}

/// Replacement message for a database error when values must not be echoed.
pub fn terse_sql_error(errno: u16, sql: &str) -> String {
    format!("(errno {}) during query: {}", errno, sql)
}
