#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Postgres-backed store for the `killfeed` pipeline (kill rows, roster,
//! read queries for the query surface).

/// Value types shared across the workspace.
pub mod models;

mod characters;
mod db;
mod error;
mod kills;
mod schema;

pub use db::{Store, StoreConfig};
pub use error::StoreError;
pub use kills::KillFilters;
