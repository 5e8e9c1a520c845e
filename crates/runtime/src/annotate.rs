//! Change-capture annotations.
//!
//! Every primary-key DML is tagged with a trailing comment naming the keys it
//! touches, so that a binlog consumer can tell which rows changed without
//! parsing the statement:
//!
//! ```text
//! update test_table set name = 2 where pk in (1) /* _stream test_table (pk ) (1 ); */
//! ```
//!
//! Numbers are written as-is, everything else base64 in single quotes.

use tablet_common::Value;
use tablet_sql::Table;

/// Comment listing `pk_rows`, then `secondary` (the keys rows end up with
/// after an update that rewrites the key).
pub fn stream_comment(
    table: &Table,
    pk_rows: &[Vec<Value>],
    secondary: Option<&[Vec<Value>]>,
) -> String {
    let mut out = format!(" /* _stream {} (", table.name);
    for column in table.pk_column_names() {
        out.push_str(column);
        out.push(' ');
    }
    out.push(')');
    let rows = pk_rows.iter().chain(secondary.unwrap_or_default());
    for row in rows {
        out.push_str(" (");
        for value in row {
            out.push_str(&value.encode_compact());
            out.push(' ');
        }
        out.push(')');
    }
    out.push_str("; */");
    out
}
