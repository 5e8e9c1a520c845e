//! Tablet runtime: the per-shard query engine.
//!
//! This crate executes statements planned by `tablet-sql` against one MySQL
//! instance on behalf of a router.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │ TabletServer │  serving state, admission, query log
//! └──────┬───────┘
//!        │
//!   ┌────┴─────┐     ┌─────────────────────┐
//!   │  Policy  │     │ SchemaInfo + plans  │
//!   │ rules/ACL│     └─────────────────────┘
//!   └────┬─────┘
//!        │
//! ┌──────┴────────┐   ┌──────────┐   ┌────────────────────────┐
//! │ QueryExecutor ├──►│ RowCache │   │ conn / stream / tx pool│
//! └───────────────┘   └──────────┘   └────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tablet_common::config::TabletConfig;
//! use tablet_runtime::testing::FakeDb;
//! use tablet_runtime::{Controller, TabletServer, TabletType};
//!
//! # async fn run() -> tablet_error::Result<()> {
//! let server = TabletServer::new(TabletConfig::default(), Arc::new(FakeDb::new()))?;
//! server.start_service(TabletType::Master).await?;
//! # Ok(())
//! # }
//! ```

pub mod acl;
pub mod annotate;
pub mod controller;
pub mod db;
pub mod dialect;
pub mod engine;
pub mod executor;
pub mod policy;
pub mod pool;
pub mod rowcache;
pub mod rules;
pub mod schema;
pub mod server;
pub mod stats;
pub mod testing;
pub mod tx_pool;

pub use acl::{Role, TableAcl, TableAclConfig};
pub use controller::{BatchError, Controller, QueryService, ServingState, TabletType};
pub use db::{ConnectionFactory, DbConnection, SqlError};
pub use dialect::{ConflictKey, ConflictKeyParser, MySqlConflictParser};
pub use engine::QueryEngine;
pub use rowcache::{CacheService, MemoryCacheService};
pub use rules::{Action, QueryRule, QueryRules};
pub use schema::{SchemaSource, StaticSchemaSource};
pub use server::{TabletServer, TabletServerBuilder};
pub use stats::TabletStats;
