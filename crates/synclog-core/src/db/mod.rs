//! Transactional session layer shared by the three stores

mod connection;
pub mod migrations;

pub use connection::{quarantine_corrupted_db_files, Database};
pub use migrations::{Migration, Schema};

