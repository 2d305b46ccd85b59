//! Per-document sync decisions
//!
//! [`reconcile`] is a pure function of the scanned documents, the binding
//! snapshot and the remote snapshot taken at the start of the run. It never
//! talks to the remote or the store.

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::tree::{parent_target, FolderPlan};
use crate::storage::BindingSnapshot;
use crate::types::{
    Action, ActionKind, Binding, ChangeSignal, ConflictRecord, Document, FolderSpec, RemotePage,
    SyncConfig,
};

/// What the remote looked like for one page id when the run started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteState {
    Present(RemotePage),
    Missing,
    /// The read failed with a non-fatal error
    Failed { kind: String, message: String },
}

/// Remote page states keyed by page id, fetched once per run
#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    pages: HashMap<String, RemoteState>,
}

impl RemoteSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, state: RemoteState) {
        self.pages.insert(id.into(), state);
    }

    pub fn record_page(&mut self, page: RemotePage) {
        self.pages.insert(page.id.clone(), RemoteState::Present(page));
    }

    pub fn get(&self, id: &str) -> Option<&RemoteState> {
        self.pages.get(id)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// A document that could not be planned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFailure {
    /// The action that would have run
    pub action: Action,
    pub error_kind: String,
    pub message: String,
}

/// Reconciler output
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// One action per planned document, in input order
    pub actions: Vec<Action>,
    /// Folder pages needed by Create/Update actions, parents first
    pub folders: Vec<FolderSpec>,
    /// Conflicts behind the SkipConflict actions
    pub conflicts: Vec<ConflictRecord>,
    pub failures: Vec<PlanFailure>,
}

impl Plan {
    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind == kind).count()
    }
}

/// Remote page ids worth reading before reconciling: every explicit
/// `page_id` and every bound page of a non-excluded document
pub fn snapshot_targets(documents: &[Document], bindings: &BindingSnapshot) -> Vec<String> {
    let mut ids = BTreeSet::new();
    for doc in documents.iter().filter(|d| !d.frontmatter.exclude) {
        if let Some(id) = &doc.frontmatter.page_id {
            ids.insert(id.clone());
        } else if let Some(binding) = bindings.get(&doc.path) {
            ids.insert(binding.remote_page_id.clone());
        }
    }
    ids.into_iter().collect()
}

/// Bound page ids of the folders a plan needs, so a folder page deleted
/// remotely can be materialized again
pub fn folder_targets(folders: &[FolderSpec], bindings: &BindingSnapshot) -> Vec<String> {
    folders
        .iter()
        .filter_map(|spec| bindings.get(&spec.key))
        .map(|binding| binding.remote_page_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// The binding whose recorded state is compared against this document
fn baseline<'a>(doc: &Document, bindings: &'a BindingSnapshot) -> Option<&'a Binding> {
    match doc.frontmatter.page_id.as_deref() {
        Some(id) => bindings
            .get(&doc.path)
            .filter(|b| b.remote_page_id == id)
            .or_else(|| bindings.get_by_remote_id(id)),
        None => bindings.get(&doc.path),
    }
}

/// Whether the remote moved since the binding was written
pub fn remote_changed(binding: &Binding, page: &RemotePage, signal: ChangeSignal) -> bool {
    if page.version != binding.remote_version {
        return true;
    }
    match signal {
        ChangeSignal::VersionOnly => false,
        ChangeSignal::VersionAndTimestamp => page
            .updated_at
            .map(|at| at > binding.last_synced_at)
            .unwrap_or(false),
    }
}

enum Decision {
    Act(Action),
    Conflict(Action, ConflictRecord),
    Fail(PlanFailure),
}

fn decide(
    doc: &Document,
    bindings: &BindingSnapshot,
    remote: &RemoteSnapshot,
    config: &SyncConfig,
) -> Decision {
    let mut action = Action {
        path: doc.path.clone(),
        title: doc.display_title().to_string(),
        kind: ActionKind::Create,
        target_parent: parent_target(&doc.parent_chain()),
        target_page_id: None,
        expected_remote_version: None,
        observed_remote_version: None,
        reason: String::new(),
    };

    if doc.frontmatter.exclude {
        action.kind = ActionKind::SkipExcluded;
        action.reason = "excluded by frontmatter".to_string();
        return Decision::Act(action);
    }

    let baseline = baseline(doc, bindings);
    let page_id = doc
        .frontmatter
        .page_id
        .clone()
        .or_else(|| baseline.map(|b| b.remote_page_id.clone()));

    let Some(page_id) = page_id else {
        action.reason = "no binding for this path".to_string();
        return Decision::Act(action);
    };

    action.kind = ActionKind::Update;
    action.target_page_id = Some(page_id.clone());
    action.expected_remote_version = baseline.map(|b| b.remote_version);

    let page = match remote.get(&page_id) {
        Some(RemoteState::Present(page)) => page,
        Some(RemoteState::Failed { kind, message }) => {
            return Decision::Fail(PlanFailure {
                action,
                error_kind: kind.clone(),
                message: format!("could not read remote page {}: {}", page_id, message),
            });
        }
        Some(RemoteState::Missing) | None => {
            return Decision::Fail(PlanFailure {
                action,
                error_kind: "not_found".to_string(),
                message: format!("remote page {} not found; binding kept", page_id),
            });
        }
    };
    action.observed_remote_version = Some(page.version);

    let Some(binding) = baseline else {
        action.expected_remote_version = Some(page.version);
        action.reason = format!("adopting page {} from frontmatter page_id", page_id);
        return Decision::Act(action);
    };

    let local_changed = binding.content_hash != doc.content_hash;
    let remote_changed = remote_changed(binding, page, config.change_signal);

    match (local_changed, remote_changed) {
        (false, false) => {
            action.kind = ActionKind::SkipUnchanged;
            action.expected_remote_version = None;
            action.reason = "unchanged since last sync".to_string();
            Decision::Act(action)
        }
        (true, false) => {
            action.reason = format!("local content changed (remote at v{})", page.version);
            Decision::Act(action)
        }
        (false, true) => {
            action.kind = ActionKind::SkipUnchanged;
            action.expected_remote_version = None;
            action.reason = format!(
                "local unchanged; remote moved from v{} to v{} and is left alone",
                binding.remote_version, page.version
            );
            Decision::Act(action)
        }
        (true, true) => {
            action.kind = ActionKind::SkipConflict;
            action.expected_remote_version = None;
            action.reason = format!(
                "both sides changed since last sync (recorded v{}, remote v{})",
                binding.remote_version, page.version
            );
            let conflict = ConflictRecord {
                path: doc.path.clone(),
                page_id,
                local_hash: doc.content_hash.clone(),
                recorded_hash: binding.content_hash.clone(),
                recorded_version: binding.remote_version,
                observed_version: page.version,
                reason: action.reason.clone(),
                detected_at: Utc::now(),
            };
            Decision::Conflict(action, conflict)
        }
    }
}

/// Decide an action for every document and plan the folder pages the
/// writes need
pub fn reconcile(
    documents: &[Document],
    bindings: &BindingSnapshot,
    remote: &RemoteSnapshot,
    config: &SyncConfig,
) -> Plan {
    let mut plan = Plan::default();
    let mut folders = FolderPlan::new();

    for doc in documents {
        match decide(doc, bindings, remote, config) {
            Decision::Act(action) => {
                if action.kind.is_write() {
                    folders.require(&doc.parent_chain());
                }
                plan.actions.push(action);
            }
            Decision::Conflict(action, conflict) => {
                plan.actions.push(action);
                plan.conflicts.push(conflict);
            }
            Decision::Fail(failure) => plan.failures.push(failure),
        }
    }

    plan.folders = folders.into_ordered();
    plan
}
