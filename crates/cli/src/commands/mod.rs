//! Command implementations. Each command builds a serializable report and
//! prints it in the requested format.

mod config;
mod explain;
mod policy;

pub use config::validate_config;
pub use explain::explain;
pub use policy::{check_acl, check_rules};

#[cfg(test)]
mod tests;
