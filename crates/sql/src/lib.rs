//! SQL handling for the tablet query engine.
//!
//! This crate turns statement text into execution plans:
//! - **Lexing**: statements are tokenized with the sqlparser MySQL tokenizer (`lexer`).
//! - **Classification**: `builder::build_plan` picks a plan type and precomputes the
//!   rewritten statements the executor needs.
//! - **Templates**: `ParsedQuery` substitutes caller bind variables and executor-computed
//!   values such as primary key lists.
pub mod builder;
pub mod error;
pub mod lexer;
pub mod parsed_query;
pub mod plan;
pub mod schema;

pub use builder::{build_plan, TableLookup};
pub use error::PlanError;
pub use parsed_query::{InternalBinds, ParsedQuery, TupleEqualityList};
pub use plan::{DdlPlan, ExecPlan, PkValue, PlanType, Reason, SetPlan, ValueExpr};
pub use schema::{CacheType, Table, TableColumn, TableDef};
