//! vaultsync - one-way Obsidian vault to Confluence sync
//!
//! Scans a Markdown vault, decides per note whether the remote page must be
//! created, updated or left alone, and keeps a durable path to page-id
//! mapping so repeated runs are idempotent. Remote edits are detected and
//! reported, never merged back.

pub mod error;
pub mod remote;
pub mod report;
pub mod storage;
pub mod sync;
pub mod types;
pub mod vault;

pub use error::{Result, SyncError};
pub use remote::{ConfluenceClient, InMemoryRemote, RemoteClient, RetryPolicy, RetryingClient};
pub use storage::IdentityStore;
pub use sync::{CancelToken, SyncEngine};
pub use types::*;
pub use vault::{scan_vault, BodyConverter, StorageFormatConverter};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
