//! Backup and restore orchestration for a PostgreSQL database.
//!
//! Dumps are taken by shelling out to `pg_dump`, tracked as jobs in a local
//! SQLite store, pruned by a retention policy and restored with `pg_restore`.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod state;

pub use error::{BackupError, Result};
pub use state::AppState;
