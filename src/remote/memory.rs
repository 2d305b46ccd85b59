//! In-process wiki implementing [`RemoteClient`]
//!
//! Mirrors the Confluence semantics the engine relies on (optimistic version
//! checks, title lookup under a parent, not-found errors) and lets callers
//! queue failures per operation and count calls.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::RemoteClient;
use crate::error::{Result, SyncError};
use crate::types::{RemoteBody, RemotePage};

/// Remote operations, for call counting and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    GetPage,
    FindPage,
    CreatePage,
    UpdatePage,
    UploadAttachment,
    AddLabels,
}

/// A page held by [`InMemoryRemote`]
#[derive(Debug, Clone)]
pub struct StoredPage {
    pub page: RemotePage,
    pub body: String,
    pub labels: BTreeSet<String>,
    /// Attachment filename -> size in bytes
    pub attachments: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct MemoryState {
    pages: BTreeMap<String, StoredPage>,
    next_id: u64,
    calls: HashMap<RemoteOp, usize>,
    failures: HashMap<RemoteOp, VecDeque<SyncError>>,
    created_titles: Vec<String>,
}

/// In-memory remote wiki
#[derive(Debug)]
pub struct InMemoryRemote {
    state: Mutex<MemoryState>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::with_next_id(1)
    }

    /// Start page ids at `next_id`
    pub fn with_next_id(next_id: u64) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next_id,
                ..Default::default()
            }),
        }
    }

    /// Insert a page directly, bypassing call counting
    pub fn seed_page(&self, parent_id: Option<&str>, title: &str, body: &str) -> RemotePage {
        let mut state = self.state.lock();
        insert_page(&mut state, parent_id, title, body)
    }

    /// Make the next call of `op` fail with `error` (queued, FIFO)
    pub fn fail_next(&self, op: RemoteOp, error: SyncError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self, op: RemoteOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of successful creates for pages titled `title`
    pub fn creates_of(&self, title: &str) -> usize {
        self.state
            .lock()
            .created_titles
            .iter()
            .filter(|t| t.as_str() == title)
            .count()
    }

    pub fn page(&self, id: &str) -> Option<StoredPage> {
        self.state.lock().pages.get(id).cloned()
    }

    pub fn page_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Simulate someone editing the page in the wiki: bumps the version
    pub fn edit_remotely(&self, id: &str, body: &str) -> Option<RemotePage> {
        let mut state = self.state.lock();
        let stored = state.pages.get_mut(id)?;
        stored.page.version += 1;
        stored.page.updated_at = Some(Utc::now());
        stored.body = body.to_string();
        Some(stored.page.clone())
    }

    /// Simulate a metadata-only touch (e.g. a permission change): the
    /// timestamp moves, the version does not
    pub fn touch_remote(&self, id: &str) -> Option<RemotePage> {
        let mut state = self.state.lock();
        let stored = state.pages.get_mut(id)?;
        stored.page.updated_at = Some(Utc::now());
        Some(stored.page.clone())
    }

    /// Simulate someone deleting the page in the wiki
    pub fn remove_page(&self, id: &str) -> Option<StoredPage> {
        self.state.lock().pages.remove(id)
    }

    /// Register a call and pop any injected failure
    fn enter(&self, op: RemoteOp) -> Result<parking_lot::MutexGuard<'_, MemoryState>> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(err) = state.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(state)
    }
}

fn insert_page(
    state: &mut MemoryState,
    parent_id: Option<&str>,
    title: &str,
    body: &str,
) -> RemotePage {
    let id = state.next_id.to_string();
    state.next_id += 1;
    let page = RemotePage {
        id: id.clone(),
        title: title.to_string(),
        parent_id: parent_id.map(str::to_string),
        version: 1,
        updated_at: Some(Utc::now()),
    };
    state.pages.insert(
        id,
        StoredPage {
            page: page.clone(),
            body: body.to_string(),
            labels: BTreeSet::new(),
            attachments: BTreeMap::new(),
        },
    );
    page
}

#[async_trait]
impl RemoteClient for InMemoryRemote {
    async fn get_page(&self, id: &str) -> Result<RemotePage> {
        let state = self.enter(RemoteOp::GetPage)?;
        state
            .pages
            .get(id)
            .map(|p| p.page.clone())
            .ok_or_else(|| SyncError::NotFound(id.to_string()))
    }

    async fn find_page(&self, title: &str, parent_id: Option<&str>) -> Result<Option<RemotePage>> {
        let state = self.enter(RemoteOp::FindPage)?;
        Ok(state
            .pages
            .values()
            .find(|p| p.page.title == title && p.page.parent_id.as_deref() == parent_id)
            .map(|p| p.page.clone()))
    }

    async fn create_page(
        &self,
        parent_id: Option<&str>,
        title: &str,
        body: &RemoteBody,
    ) -> Result<RemotePage> {
        let mut state = self.enter(RemoteOp::CreatePage)?;
        if let Some(parent) = parent_id {
            if !state.pages.contains_key(parent) {
                return Err(SyncError::NotFound(parent.to_string()));
            }
        }
        let duplicate = state
            .pages
            .values()
            .any(|p| p.page.title == title && p.page.parent_id.as_deref() == parent_id);
        if duplicate {
            return Err(SyncError::Remote {
                status: 400,
                message: format!("A page with title '{}' already exists", title),
            });
        }
        state.created_titles.push(title.to_string());
        Ok(insert_page(&mut state, parent_id, title, body.as_str()))
    }

    async fn update_page(
        &self,
        id: &str,
        expected_version: i64,
        parent_id: Option<&str>,
        title: &str,
        body: &RemoteBody,
    ) -> Result<RemotePage> {
        let mut state = self.enter(RemoteOp::UpdatePage)?;
        let stored = state
            .pages
            .get_mut(id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;

        if stored.page.version != expected_version {
            return Err(SyncError::VersionConflict {
                page_id: id.to_string(),
                expected: expected_version,
                actual: Some(stored.page.version),
            });
        }

        stored.page.version += 1;
        stored.page.updated_at = Some(Utc::now());
        stored.page.title = title.to_string();
        if parent_id.is_some() {
            stored.page.parent_id = parent_id.map(str::to_string);
        }
        stored.body = body.as_str().to_string();
        Ok(stored.page.clone())
    }

    async fn upload_attachment(&self, page_id: &str, filename: &str, bytes: &[u8]) -> Result<()> {
        let mut state = self.enter(RemoteOp::UploadAttachment)?;
        let stored = state
            .pages
            .get_mut(page_id)
            .ok_or_else(|| SyncError::NotFound(page_id.to_string()))?;
        stored
            .attachments
            .insert(filename.to_string(), bytes.len());
        Ok(())
    }

    async fn add_labels(&self, page_id: &str, labels: &[String]) -> Result<()> {
        let mut state = self.enter(RemoteOp::AddLabels)?;
        let stored = state
            .pages
            .get_mut(page_id)
            .ok_or_else(|| SyncError::NotFound(page_id.to_string()))?;
        stored.labels.extend(labels.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_checks_version() {
        let remote = InMemoryRemote::with_next_id(42);
        let body = RemoteBody("<p>v1</p>".to_string());
        let page = remote.create_page(None, "Note", &body).await.unwrap();
        assert_eq!(page.id, "42");
        assert_eq!(page.version, 1);

        let updated = remote
            .update_page("42", 1, None, "Note", &RemoteBody("<p>v2</p>".into()))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);

        let err = remote
            .update_page("42", 1, None, "Note", &body)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::VersionConflict {
                actual: Some(2),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_find_page_respects_parent() {
        let remote = InMemoryRemote::new();
        let root = remote.seed_page(None, "Root", "");
        remote.seed_page(Some(&root.id), "Guides", "");

        assert!(remote.find_page("Guides", None).await.unwrap().is_none());
        assert!(remote
            .find_page("Guides", Some(&root.id))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let remote = InMemoryRemote::new();
        remote.fail_next(RemoteOp::FindPage, SyncError::Transient("one".into()));

        assert!(remote.find_page("x", None).await.is_err());
        assert!(remote.find_page("x", None).await.is_ok());
        assert_eq!(remote.calls(RemoteOp::FindPage), 2);
    }

    #[test]
    fn test_touch_keeps_version() {
        let remote = InMemoryRemote::new();
        let page = remote.seed_page(None, "A", "");
        let touched = remote.touch_remote(&page.id).unwrap();
        assert_eq!(touched.version, page.version);

        let edited = remote.edit_remotely(&page.id, "<p>new</p>").unwrap();
        assert_eq!(edited.version, page.version + 1);
    }
}
