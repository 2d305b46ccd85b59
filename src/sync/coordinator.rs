//! Run coordinator
//!
//! Drives one sync run end to end:
//! 1. ensure the root page
//! 2. read the remote state of every bound page (bounded concurrency)
//! 3. reconcile
//! 4. check the bound folder pages the plan needs, then materialize folder
//!    pages sequentially, parents first
//! 5. fan leaf actions out through `buffer_unordered`
//!
//! A binding is only written after the remote call it describes succeeded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use uuid::Uuid;

use super::cancel::CancelToken;
use super::reconciler::{
    folder_targets, reconcile, snapshot_targets, RemoteSnapshot, RemoteState,
};
use crate::error::{Result, SyncError};
use crate::remote::RemoteClient;
use crate::storage::IdentityStore;
use crate::types::{
    Action, ActionKind, Binding, Document, DocumentReport, FolderReport, FolderSpec, Outcome,
    ParentTarget, RemoteBody, RemotePage, RunReport, SideEffect, SyncConfig, SyncMode,
    SyncSummary, ROOT_KEY,
};
use crate::vault::BodyConverter;

/// Prefix of the placeholder ids handed out for pages a simulated run
/// would have created
pub const SIMULATED_PREFIX: &str = "simulated:";

fn simulated_id(key: &str) -> String {
    format!("{}{}", SIMULATED_PREFIX, key)
}

pub fn is_simulated_id(id: &str) -> bool {
    id.starts_with(SIMULATED_PREFIX)
}

/// Whether a parent page can be used by its children
#[derive(Debug, Clone)]
enum ParentPage {
    Ready(String),
    Failed { kind: String, message: String },
    Cancelled,
}

/// Abort latch shared by every action of a run
#[derive(Default)]
struct RunState {
    aborted: AtomicBool,
    fatal: Mutex<Option<SyncError>>,
}

impl RunState {
    /// Keep the first fatal error and stop new work
    fn record(&self, err: SyncError) {
        if err.is_fatal() {
            self.aborted.store(true, Ordering::SeqCst);
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                tracing::error!(error = %err, "Fatal error, aborting run");
                *fatal = Some(err);
            }
        }
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn take_fatal(&self) -> Option<SyncError> {
        self.fatal.lock().take()
    }
}

fn folder_report(key: &str, title: &str, page_id: Option<String>, outcome: Outcome) -> FolderReport {
    FolderReport {
        key: key.to_string(),
        title: title.to_string(),
        page_id,
        outcome,
        created: false,
        reason: None,
    }
}

fn fail_report(mut report: DocumentReport, err: &SyncError) -> DocumentReport {
    report.outcome = Outcome::Failed;
    report.error_kind = Some(err.kind().to_string());
    report.reason = Some(err.to_string());
    report
}

fn side_effect(name: String, result: &Result<()>) -> SideEffect {
    match result {
        Ok(()) => SideEffect {
            name,
            outcome: Outcome::Succeeded,
            error: None,
        },
        Err(e) => SideEffect {
            name,
            outcome: Outcome::Failed,
            error: Some(e.to_string()),
        },
    }
}

/// The sync engine
pub struct SyncEngine {
    remote: Arc<dyn RemoteClient>,
    store: IdentityStore,
    converter: Arc<dyn BodyConverter>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        store: IdentityStore,
        converter: Arc<dyn BodyConverter>,
        config: SyncConfig,
    ) -> Self {
        Self {
            remote,
            store,
            converter,
            config,
        }
    }

    pub fn store(&self) -> &IdentityStore {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn concurrency(&self) -> usize {
        self.config.concurrency.max(1)
    }

    /// Get or create the root page and bind it under `/`
    pub async fn ensure_root(&self, mode: SyncMode) -> Result<FolderReport> {
        let title = self.config.root_page_title.clone();

        if let Some(binding) = self.store.get(ROOT_KEY) {
            match self.remote.get_page(&binding.remote_page_id).await {
                Ok(page) => {
                    let mut report = folder_report(ROOT_KEY, &title, Some(page.id), Outcome::Skipped);
                    report.reason = Some("root page already bound".to_string());
                    return Ok(report);
                }
                Err(SyncError::NotFound(_)) => {
                    tracing::warn!(
                        page_id = %binding.remote_page_id,
                        "Bound root page no longer exists, resolving again"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let body = self.config.root_placeholder_body.clone();
        self.adopt_or_create(ROOT_KEY, &title, None, &body, mode)
            .await
    }

    /// Adopt a page with this title under `parent_id`, or create a
    /// placeholder. Either way the page is bound under `key`.
    async fn adopt_or_create(
        &self,
        key: &str,
        title: &str,
        parent_id: Option<&str>,
        placeholder: &str,
        mode: SyncMode,
    ) -> Result<FolderReport> {
        let simulate = mode == SyncMode::Simulate;
        // Nothing can exist under a page that was never created
        let parent_is_simulated = parent_id.map(is_simulated_id).unwrap_or(false);

        if !parent_is_simulated {
            if let Some(page) = self.remote.find_page(title, parent_id).await? {
                let outcome = if simulate {
                    Outcome::Planned
                } else {
                    self.bind_page(key, &page)?;
                    Outcome::Succeeded
                };
                tracing::info!(key = %key, page_id = %page.id, "Adopted existing page");
                let mut report = folder_report(key, title, Some(page.id), outcome);
                report.reason = Some("adopted existing page".to_string());
                return Ok(report);
            }
        }

        if simulate {
            let mut report = folder_report(key, title, Some(simulated_id(key)), Outcome::Planned);
            report.created = true;
            report.reason = Some("would create placeholder page".to_string());
            return Ok(report);
        }

        let page = self
            .remote
            .create_page(parent_id, title, &RemoteBody(placeholder.to_string()))
            .await?;
        self.bind_page(key, &page)?;
        tracing::info!(key = %key, page_id = %page.id, "Created placeholder page");

        let mut report = folder_report(key, title, Some(page.id), Outcome::Succeeded);
        report.created = true;
        report.reason = Some("created placeholder page".to_string());
        Ok(report)
    }

    fn bind_page(&self, key: &str, page: &RemotePage) -> Result<()> {
        self.store.upsert(&Binding {
            path: key.to_string(),
            remote_page_id: page.id.clone(),
            remote_version: page.version,
            content_hash: String::new(),
            last_synced_at: Utc::now(),
        })
    }

    /// A page titled `title` under `parent_id` that no other path is bound
    /// to. Such a page is left over from a lost state database or from a
    /// create whose response never arrived.
    async fn find_unbound_page(&self, title: &str, parent_id: &str) -> Result<Option<RemotePage>> {
        if is_simulated_id(parent_id) {
            return Ok(None);
        }
        let Some(page) = self.remote.find_page(title, Some(parent_id)).await? else {
            return Ok(None);
        };
        match self.store.get_by_remote_id(&page.id) {
            Some(owner) => {
                tracing::debug!(
                    page_id = %page.id,
                    owner = %owner.path,
                    "Page with the same title is bound elsewhere"
                );
                Ok(None)
            }
            None => Ok(Some(page)),
        }
    }

    /// Read `ids` with bounded concurrency. Only fatal errors fail the
    /// whole read; anything else is recorded per page.
    async fn fetch_pages(&self, ids: Vec<String>) -> Result<RemoteSnapshot> {
        tracing::debug!(pages = ids.len(), "Fetching remote snapshot");

        let results: Vec<(String, Result<RemotePage>)> = stream::iter(ids)
            .map(|id| async move {
                let result = self.remote.get_page(&id).await;
                (id, result)
            })
            .buffer_unordered(self.concurrency())
            .collect()
            .await;

        let mut snapshot = RemoteSnapshot::new();
        for (id, result) in results {
            let state = match result {
                Ok(page) => RemoteState::Present(page),
                Err(SyncError::NotFound(_)) => RemoteState::Missing,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(page_id = %id, error = %e, "Failed to read remote page");
                    RemoteState::Failed {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    }
                }
            };
            snapshot.insert(id, state);
        }
        Ok(snapshot)
    }

    /// Materialize folder pages one at a time, parents first
    async fn materialize_folders(
        &self,
        folders: &[FolderSpec],
        pages: &RemoteSnapshot,
        root_id: &str,
        mode: SyncMode,
        cancel: &CancelToken,
        state: &RunState,
    ) -> (Vec<FolderReport>, HashMap<String, ParentPage>) {
        let mut reports = Vec::with_capacity(folders.len());
        let mut resolved: HashMap<String, ParentPage> = HashMap::new();

        for spec in folders {
            if cancel.is_cancelled() || state.is_aborted() {
                reports.push(folder_report(&spec.key, &spec.title, None, Outcome::Cancelled));
                resolved.insert(spec.key.clone(), ParentPage::Cancelled);
                continue;
            }

            let parent_id = match parent_page(&spec.parent, root_id, &resolved) {
                ParentPage::Ready(id) => id,
                other => {
                    let mut report = folder_report(&spec.key, &spec.title, None, Outcome::Failed);
                    if let ParentPage::Cancelled = other {
                        report.outcome = Outcome::Cancelled;
                    }
                    report.reason = Some("parent folder unavailable".to_string());
                    reports.push(report);
                    resolved.insert(spec.key.clone(), other);
                    continue;
                }
            };

            if let Some(binding) = self.store.get(&spec.key) {
                match pages.get(&binding.remote_page_id) {
                    Some(RemoteState::Missing) => {
                        // Deleted remotely: adopt or create again and rebind
                        tracing::warn!(
                            key = %spec.key,
                            page_id = %binding.remote_page_id,
                            "Bound folder page no longer exists, resolving again"
                        );
                    }
                    Some(RemoteState::Failed { kind, message }) => {
                        let mut report = folder_report(
                            &spec.key,
                            &spec.title,
                            Some(binding.remote_page_id.clone()),
                            Outcome::Failed,
                        );
                        report.reason = Some(message.clone());
                        reports.push(report);
                        resolved.insert(
                            spec.key.clone(),
                            ParentPage::Failed {
                                kind: kind.clone(),
                                message: format!(
                                    "parent folder '{}' unavailable: {}",
                                    spec.key, message
                                ),
                            },
                        );
                        continue;
                    }
                    Some(RemoteState::Present(_)) | None => {
                        let mut report = folder_report(
                            &spec.key,
                            &spec.title,
                            Some(binding.remote_page_id.clone()),
                            Outcome::Skipped,
                        );
                        report.reason = Some("already bound".to_string());
                        reports.push(report);
                        resolved
                            .insert(spec.key.clone(), ParentPage::Ready(binding.remote_page_id));
                        continue;
                    }
                }
            }

            match self
                .adopt_or_create(
                    &spec.key,
                    &spec.title,
                    Some(&parent_id),
                    &self.config.folder_placeholder_body,
                    mode,
                )
                .await
            {
                Ok(report) => {
                    let page = match &report.page_id {
                        Some(id) => ParentPage::Ready(id.clone()),
                        None => ParentPage::Failed {
                            kind: "internal".to_string(),
                            message: "folder page has no id".to_string(),
                        },
                    };
                    resolved.insert(spec.key.clone(), page);
                    reports.push(report);
                }
                Err(e) => {
                    tracing::warn!(key = %spec.key, error = %e, "Failed to materialize folder");
                    let mut report = folder_report(&spec.key, &spec.title, None, Outcome::Failed);
                    report.reason = Some(e.to_string());
                    reports.push(report);
                    resolved.insert(
                        spec.key.clone(),
                        ParentPage::Failed {
                            kind: e.kind().to_string(),
                            message: format!("parent folder '{}' unavailable: {}", spec.key, e),
                        },
                    );
                    state.record(e);
                }
            }
        }

        (reports, resolved)
    }

    /// Execute one Create/Update action
    async fn execute(
        &self,
        action: &Action,
        doc: &Document,
        parent: ParentPage,
        mode: SyncMode,
        cancel: &CancelToken,
        state: &RunState,
    ) -> DocumentReport {
        let mut report = DocumentReport {
            path: action.path.clone(),
            title: action.title.clone(),
            action: action.kind,
            outcome: Outcome::Planned,
            page_id: action.target_page_id.clone(),
            parent_page_id: None,
            reason: Some(action.reason.clone()),
            error_kind: None,
            labels: doc.frontmatter.labels.clone(),
            side_effects: Vec::new(),
        };

        if cancel.is_cancelled() || state.is_aborted() {
            report.outcome = Outcome::Cancelled;
            report.reason = Some("run stopped before this action started".to_string());
            return report;
        }

        let parent_id = match parent {
            ParentPage::Ready(id) => id,
            ParentPage::Failed { kind, message } => {
                report.outcome = Outcome::Failed;
                report.error_kind = Some(kind);
                report.reason = Some(message);
                return report;
            }
            ParentPage::Cancelled => {
                report.outcome = Outcome::Cancelled;
                report.reason = Some("parent folder was not materialized".to_string());
                return report;
            }
        };
        report.parent_page_id = Some(parent_id.clone());

        let existing = if action.kind == ActionKind::Create {
            match self.find_unbound_page(&action.title, &parent_id).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(path = %doc.path, error = %e, "Page lookup failed");
                    let report = fail_report(report, &e);
                    state.record(e);
                    return report;
                }
            }
        } else {
            None
        };
        if let Some(page) = &existing {
            report.page_id = Some(page.id.clone());
            report.reason = Some(format!(
                "adopting existing page {} with the same title",
                page.id
            ));
        }

        if mode == SyncMode::Simulate {
            if !doc.frontmatter.labels.is_empty() {
                report.side_effects.push(SideEffect {
                    name: "labels".to_string(),
                    outcome: Outcome::Planned,
                    error: None,
                });
            }
            for attachment in &doc.attachments {
                report.side_effects.push(SideEffect {
                    name: format!("attachment:{}", attachment.filename),
                    outcome: Outcome::Planned,
                    error: None,
                });
            }
            return report;
        }

        let body = match self.converter.convert(doc) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(path = %doc.path, error = %e, "Conversion failed");
                return fail_report(report, &e);
            }
        };

        let written = match (action.kind, &action.target_page_id, action.expected_remote_version) {
            (ActionKind::Create, _, _) => match &existing {
                Some(page) => {
                    self.remote
                        .update_page(&page.id, page.version, Some(&parent_id), &action.title, &body)
                        .await
                }
                None => {
                    self.remote
                        .create_page(Some(&parent_id), &action.title, &body)
                        .await
                }
            },
            (ActionKind::Update, Some(id), Some(expected)) => {
                self.remote
                    .update_page(id, expected, Some(&parent_id), &action.title, &body)
                    .await
            }
            (kind, _, _) => Err(SyncError::Internal(format!(
                "action {} for {} cannot be executed",
                kind, action.path
            ))),
        };

        let page = match written {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(
                    path = %doc.path,
                    action = %action.kind,
                    error_kind = e.kind(),
                    error = %e,
                    "Remote write failed"
                );
                let report = fail_report(report, &e);
                state.record(e);
                return report;
            }
        };

        let binding = Binding {
            path: doc.path.clone(),
            remote_page_id: page.id.clone(),
            remote_version: page.version,
            content_hash: doc.content_hash.clone(),
            last_synced_at: Utc::now(),
        };
        report.page_id = Some(page.id.clone());
        if let Err(e) = self.store.upsert(&binding) {
            let report = fail_report(report, &e);
            state.record(e);
            return report;
        }

        report.outcome = Outcome::Succeeded;
        tracing::info!(
            path = %doc.path,
            action = %action.kind,
            page_id = %page.id,
            version = page.version,
            "Page written"
        );

        if !doc.frontmatter.labels.is_empty() {
            let result = self.remote.add_labels(&page.id, &doc.frontmatter.labels).await;
            report.side_effects.push(side_effect("labels".to_string(), &result));
            if let Err(e) = result {
                tracing::warn!(path = %doc.path, error = %e, "Adding labels failed");
                state.record(e);
            }
        }

        for attachment in &doc.attachments {
            let name = format!("attachment:{}", attachment.filename);
            if state.is_aborted() {
                report.side_effects.push(SideEffect {
                    name,
                    outcome: Outcome::Cancelled,
                    error: None,
                });
                continue;
            }
            let result = match tokio::fs::read(&attachment.source).await {
                Ok(bytes) => {
                    self.remote
                        .upload_attachment(&page.id, &attachment.filename, &bytes)
                        .await
                }
                Err(e) => Err(SyncError::Io(e)),
            };
            report.side_effects.push(side_effect(name, &result));
            if let Err(e) = result {
                tracing::warn!(
                    path = %doc.path,
                    filename = %attachment.filename,
                    error = %e,
                    "Attachment upload failed"
                );
                state.record(e);
            }
        }

        report
    }

    /// Run one sync cycle over `documents`.
    ///
    /// Per-document failures end up in the report. `Auth` and identity
    /// store failures abort the run and are returned as errors once
    /// in-flight calls have drained.
    pub async fn run(
        &self,
        documents: &[Document],
        mode: SyncMode,
        cancel: &CancelToken,
    ) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let simulated = mode == SyncMode::Simulate;
        tracing::info!(
            run_id = %run_id,
            documents = documents.len(),
            simulated,
            "Starting sync run"
        );

        let root = self.ensure_root(mode).await?;
        let root_id = root
            .page_id
            .clone()
            .ok_or_else(|| SyncError::Internal("root page has no id".to_string()))?;

        let bindings = self.store.snapshot();
        let remote = self
            .fetch_pages(snapshot_targets(documents, &bindings))
            .await?;
        let plan = reconcile(documents, &bindings, &remote, &self.config);
        tracing::info!(
            run_id = %run_id,
            creates = plan.count(ActionKind::Create),
            updates = plan.count(ActionKind::Update),
            conflicts = plan.conflicts.len(),
            folders = plan.folders.len(),
            failures = plan.failures.len(),
            "Plan computed"
        );

        let folder_pages = self
            .fetch_pages(folder_targets(&plan.folders, &bindings))
            .await?;

        let state = RunState::default();
        let (folder_reports, resolved) = self
            .materialize_folders(&plan.folders, &folder_pages, &root_id, mode, cancel, &state)
            .await;
        if let Some(err) = state.take_fatal() {
            return Err(err);
        }

        let mut documents_out: Vec<DocumentReport> = plan
            .failures
            .iter()
            .map(|failure| DocumentReport {
                path: failure.action.path.clone(),
                title: failure.action.title.clone(),
                action: failure.action.kind,
                outcome: Outcome::Failed,
                page_id: failure.action.target_page_id.clone(),
                parent_page_id: None,
                reason: Some(failure.message.clone()),
                error_kind: Some(failure.error_kind.clone()),
                labels: Vec::new(),
                side_effects: Vec::new(),
            })
            .collect();

        let by_path: HashMap<&str, &Document> =
            documents.iter().map(|d| (d.path.as_str(), d)).collect();
        let mut writes = Vec::new();
        for action in &plan.actions {
            let Some(doc) = by_path.get(action.path.as_str()).copied() else {
                continue;
            };
            if action.kind.is_write() {
                let parent = parent_page(&action.target_parent, &root_id, &resolved);
                writes.push((action, doc, parent));
            } else {
                documents_out.push(DocumentReport {
                    path: action.path.clone(),
                    title: action.title.clone(),
                    action: action.kind,
                    outcome: Outcome::Skipped,
                    page_id: action.target_page_id.clone(),
                    parent_page_id: None,
                    reason: Some(action.reason.clone()),
                    error_kind: None,
                    labels: doc.frontmatter.labels.clone(),
                    side_effects: Vec::new(),
                });
            }
        }

        let executed: Vec<DocumentReport> = stream::iter(writes)
            .map(|(action, doc, parent)| self.execute(action, doc, parent, mode, cancel, &state))
            .buffer_unordered(self.concurrency())
            .collect()
            .await;
        documents_out.extend(executed);

        if let Some(err) = state.take_fatal() {
            return Err(err);
        }

        documents_out.sort_by(|a, b| a.path.cmp(&b.path));
        let mut summary = SyncSummary::default();
        for report in &documents_out {
            summary.register(report);
        }

        let mut folders = Vec::with_capacity(folder_reports.len() + 1);
        folders.push(root);
        folders.extend(folder_reports);

        let report = RunReport {
            run_id,
            simulated,
            started_at,
            finished_at: Utc::now(),
            root_page_id: Some(root_id),
            folders,
            documents: documents_out,
            conflicts: plan.conflicts,
            summary,
        };

        tracing::info!(
            run_id = %run_id,
            created = report.summary.created,
            updated = report.summary.updated,
            unchanged = report.summary.unchanged,
            conflicts = report.summary.conflicts,
            failed = report.summary.failed,
            cancelled = report.summary.cancelled,
            "Sync run finished"
        );
        Ok(report)
    }
}

fn parent_page(
    target: &ParentTarget,
    root_id: &str,
    resolved: &HashMap<String, ParentPage>,
) -> ParentPage {
    match target {
        ParentTarget::Root => ParentPage::Ready(root_id.to_string()),
        ParentTarget::Folder(key) => resolved.get(key).cloned().unwrap_or_else(|| ParentPage::Failed {
            kind: "internal".to_string(),
            message: format!("folder '{}' was not planned", key),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_ids() {
        assert_eq!(simulated_id("Guides/"), "simulated:Guides/");
        assert!(is_simulated_id("simulated:/"));
        assert!(!is_simulated_id("12345"));
    }

    #[test]
    fn test_run_state_keeps_first_fatal_error() {
        let state = RunState::default();
        state.record(SyncError::Transient("blip".into()));
        assert!(!state.is_aborted());

        state.record(SyncError::Auth("first".into()));
        state.record(SyncError::Store("second".into()));
        assert!(state.is_aborted());
        assert!(matches!(state.take_fatal(), Some(SyncError::Auth(_))));
    }

    #[test]
    fn test_parent_page_resolution() {
        let mut resolved = HashMap::new();
        resolved.insert("a/".to_string(), ParentPage::Ready("7".to_string()));

        assert!(matches!(
            parent_page(&ParentTarget::Root, "1", &resolved),
            ParentPage::Ready(id) if id == "1"
        ));
        assert!(matches!(
            parent_page(&ParentTarget::Folder("a/".into()), "1", &resolved),
            ParentPage::Ready(id) if id == "7"
        ));
        assert!(matches!(
            parent_page(&ParentTarget::Folder("b/".into()), "1", &resolved),
            ParentPage::Failed { .. }
        ));
    }
}
