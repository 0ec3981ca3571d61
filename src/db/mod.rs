//! SQLite settlement store.
//!
//! This module provides:
//! - Database initialization, pragmas and the embedded schema
//! - The `Repository` through which every table is read and written

pub mod migrations;
pub mod repo;

pub use migrations::init_db;
pub use repo::{AncestorPath, CycleRun, Repository};
