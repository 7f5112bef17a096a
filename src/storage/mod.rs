//! Storage layer for definitions, run instances, step ledger entries, and
//! lock rows.

mod models;
mod sqlite;

pub use models::*;
pub use sqlite::SqliteStorage;
