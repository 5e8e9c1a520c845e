//! Database dialect hooks.

use once_cell::sync::Lazy;
use regex::Regex;
use tablet_error::mysql;

/// The unique key an insert collided with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictKey {
    pub key_name: String,
    pub entry: String,
}

impl ConflictKey {
    pub fn is_primary(&self) -> bool {
        self.key_name == "PRIMARY"
    }
}

/// Extracts the conflicting key from a duplicate-key error.
pub trait ConflictKeyParser: Send + Sync {
    fn parse_conflict(&self, errno: u16, message: &str) -> Option<ConflictKey>;
}

static DUPLICATE_ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Duplicate entry '(.*)' for key '([^']+)'").expect("static regex compiles")
});

/// MySQL reports `Duplicate entry '<v>' for key '<name>'`, newer servers
/// qualifying the key name with the table.
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlConflictParser;

impl ConflictKeyParser for MySqlConflictParser {
    fn parse_conflict(&self, errno: u16, message: &str) -> Option<ConflictKey> {
        if errno != mysql::ER_DUP_ENTRY {
            return None;
        }
        let caps = DUPLICATE_ENTRY.captures(message)?;
        let qualified = caps.get(2)?.as_str();
        let key_name = qualified.rsplit('.').next().unwrap_or(qualified);
        Some(ConflictKey {
            key_name: key_name.to_string(),
            entry: caps.get(1)?.as_str().to_string(),
        })
    }
}
