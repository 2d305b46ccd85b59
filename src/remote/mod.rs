//! Remote wiki clients
//!
//! The sync engine only sees the [`RemoteClient`] trait. Implementations:
//! - [`ConfluenceClient`]: Confluence REST API over reqwest
//! - [`InMemoryRemote`]: in-process wiki for tests and offline experiments
//!
//! [`RetryingClient`] wraps any client with bounded timeouts and backoff.

mod confluence;
pub mod memory;
mod retry;

pub use confluence::ConfluenceClient;
pub use memory::{InMemoryRemote, RemoteOp};
pub use retry::{
    default_jitter, no_jitter, retry_call, JitterFn, RecordingSleeper, RetryPolicy, RetryingClient,
    Sleeper, TokioSleeper,
};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{RemoteBody, RemotePage};

/// Operations the sync engine needs from the remote content store.
///
/// Every operation must be safe to retry.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetch a page by id. `NotFound` if it does not exist.
    async fn get_page(&self, id: &str) -> Result<RemotePage>;

    /// Find a page by exact title under `parent_id` (`None` = top level of the space)
    async fn find_page(&self, title: &str, parent_id: Option<&str>) -> Result<Option<RemotePage>>;

    async fn create_page(
        &self,
        parent_id: Option<&str>,
        title: &str,
        body: &RemoteBody,
    ) -> Result<RemotePage>;

    /// Replace a page's content. Fails with `VersionConflict` unless the
    /// remote is still at `expected_version`.
    async fn update_page(
        &self,
        id: &str,
        expected_version: i64,
        parent_id: Option<&str>,
        title: &str,
        body: &RemoteBody,
    ) -> Result<RemotePage>;

    /// Create or replace an attachment on a page
    async fn upload_attachment(&self, page_id: &str, filename: &str, bytes: &[u8]) -> Result<()>;

    async fn add_labels(&self, page_id: &str, labels: &[String]) -> Result<()>;
}

#[async_trait]
impl<T: RemoteClient + ?Sized> RemoteClient for Arc<T> {
    async fn get_page(&self, id: &str) -> Result<RemotePage> {
        (**self).get_page(id).await
    }

    async fn find_page(&self, title: &str, parent_id: Option<&str>) -> Result<Option<RemotePage>> {
        (**self).find_page(title, parent_id).await
    }

    async fn create_page(
        &self,
        parent_id: Option<&str>,
        title: &str,
        body: &RemoteBody,
    ) -> Result<RemotePage> {
        (**self).create_page(parent_id, title, body).await
    }

    async fn update_page(
        &self,
        id: &str,
        expected_version: i64,
        parent_id: Option<&str>,
        title: &str,
        body: &RemoteBody,
    ) -> Result<RemotePage> {
        (**self)
            .update_page(id, expected_version, parent_id, title, body)
            .await
    }

    async fn upload_attachment(&self, page_id: &str, filename: &str, bytes: &[u8]) -> Result<()> {
        (**self).upload_attachment(page_id, filename, bytes).await
    }

    async fn add_labels(&self, page_id: &str, labels: &[String]) -> Result<()> {
        (**self).add_labels(page_id, labels).await
    }
}
