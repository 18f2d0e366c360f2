//! bindery-pg
//!
//! PostgreSQL implementation of `bindery_core::ports::JobStore` (sqlx).
//! Schema lives in `migrations/`; `PostgresJobStore::migrate` applies it.

mod rows;
mod store;

pub use self::store::PostgresJobStore;
