//! SQLite storage layer for Keel.
//!
//! Rows are read and written through an entity definition: columns come from
//! the definition, values are bound as parameters, and each column is decoded
//! back into a [`Value`](keel_types::Value) by its declared field type.
//!
//! # Architecture
//!
//! - [`Store`] owns one `rusqlite::Connection` behind a mutex and hands out
//!   either a plain connection for reads or a transaction that is committed
//!   on success and rolled back on every other exit path
//! - [`rows`] holds the statement builders, all generic over `&Connection`
//!   so they run inside or outside a transaction
//! - [`SqlFragment`] carries a parameterized predicate produced by the
//!   engine's filter compiler
//!
//! Table DDL is owned by the deployment, not generated here.

mod error;
pub mod rows;
mod sql;
mod store;

pub use error::{StoreError, StoreResult};
pub use sql::{quote_ident, to_sql_value, SqlFragment};
pub use store::Store;
