//! Identity store for vaultsync
//!
//! Handles the SQLite state database, WAL mode, and schema management.

pub mod bindings;
mod connection;
mod migrations;

pub use connection::{BindingSnapshot, IdentityStore};
pub use migrations::SCHEMA_VERSION;
