//! Database module for PostgreSQL connectivity
//!
//! Pool bootstrap plus the read-only `RelationalEngine` boundary the
//! executor talks to.

pub mod connection;
pub mod engine;

pub use connection::{init_pool, DbPool};
pub use engine::{FetchedRow, PgEngine, RelationalEngine};
