//! Core types for vaultsync

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity-store key of the configured root page
pub const ROOT_KEY: &str = "/";

/// Build the identity-store key for a folder chain (`["a", "b"]` -> `"a/b/"`).
///
/// Folder keys always end in `/`, document paths never do, so the two can
/// share one bindings table without colliding.
pub fn folder_key(segments: &[String]) -> String {
    let mut key = segments.join("/");
    key.push('/');
    key
}

/// Whether an identity-store key names a synthetic (root or folder) entity
pub fn is_synthetic_key(key: &str) -> bool {
    key.ends_with('/')
}

// =============================================================================
// Local documents
// =============================================================================

/// Parsed frontmatter of a vault note
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frontmatter {
    /// Title override
    pub title: Option<String>,
    /// Labels applied to the remote page
    #[serde(default)]
    pub labels: Vec<String>,
    /// Explicit parent page title (resolved directly under the root)
    pub parent: Option<String>,
    /// Never sync this note
    #[serde(default)]
    pub exclude: bool,
    /// Explicitly bound remote page id
    pub page_id: Option<String>,
}

/// A local file referenced from a note body that is uploaded as an attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Name the attachment gets on the remote page
    pub filename: String,
    /// Absolute path of the file on disk
    pub source: PathBuf,
}

/// One local note after scanning. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Vault-relative path, `/`-separated
    pub path: String,
    pub title: String,
    /// Markdown body with frontmatter stripped
    pub body: String,
    pub frontmatter: Frontmatter,
    /// SHA-256 (hex) of the raw file
    pub content_hash: String,
    /// Ancestor folder names, outermost first
    pub folder_path: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Document {
    /// Title used for the remote page
    pub fn display_title(&self) -> &str {
        self.frontmatter.title.as_deref().unwrap_or(&self.title)
    }

    /// Folder chain the remote page hangs under. An explicit `parent`
    /// replaces the folder structure with a single segment under the root.
    pub fn parent_chain(&self) -> Vec<String> {
        match &self.frontmatter.parent {
            Some(parent) => vec![parent.clone()],
            None => self.folder_path.clone(),
        }
    }
}

// =============================================================================
// Identity store
// =============================================================================

/// Persisted mapping from a local path to the remote page it was last synced to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub path: String,
    pub remote_page_id: String,
    /// Remote version recorded at the last successful write
    pub remote_version: i64,
    /// Local content hash recorded at the last successful write
    pub content_hash: String,
    pub last_synced_at: DateTime<Utc>,
}

// =============================================================================
// Remote pages
// =============================================================================

/// Remote page metadata as observed now
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePage {
    pub id: String,
    pub title: String,
    pub parent_id: Option<String>,
    pub version: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Converted page body in the remote storage representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBody(pub String);

impl RemoteBody {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Plan
// =============================================================================

/// Decision taken for one document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    SkipConflict,
    SkipUnchanged,
    SkipExcluded,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::SkipConflict => "skip_conflict",
            ActionKind::SkipUnchanged => "skip_unchanged",
            ActionKind::SkipExcluded => "skip_excluded",
        }
    }

    /// Whether executing this action writes to the remote
    pub fn is_write(&self) -> bool {
        matches!(self, ActionKind::Create | ActionKind::Update)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a page is placed in the remote tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "key")]
pub enum ParentTarget {
    /// Directly under the configured root page
    Root,
    /// Under the folder page with this identity-store key
    Folder(String),
}

/// Reconciler output for a single document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub path: String,
    pub title: String,
    pub kind: ActionKind,
    pub target_parent: ParentTarget,
    /// Remote page the action applies to, when one is already known
    pub target_page_id: Option<String>,
    /// Optimistic-concurrency precondition (Update only)
    pub expected_remote_version: Option<i64>,
    /// Version seen in this run's remote snapshot
    pub observed_remote_version: Option<i64>,
    pub reason: String,
}

/// A folder (or explicit parent) page that must exist before its children
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSpec {
    /// Identity-store key, e.g. `Guides/Setup/`
    pub key: String,
    pub title: String,
    pub parent: ParentTarget,
}

// =============================================================================
// Run report
// =============================================================================

/// Outcome of executing (or planning) one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Succeeded,
    Failed,
    Skipped,
    Planned,
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
            Outcome::Planned => "planned",
            Outcome::Cancelled => "cancelled",
        }
    }
}

/// Outcome of a secondary call (label or attachment) tied to a page write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffect {
    pub name: String,
    pub outcome: Outcome,
    pub error: Option<String>,
}

/// Report line for one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentReport {
    pub path: String,
    pub title: String,
    pub action: ActionKind,
    pub outcome: Outcome,
    pub page_id: Option<String>,
    pub parent_page_id: Option<String>,
    pub reason: Option<String>,
    /// `SyncError::kind` of the failure, if any
    pub error_kind: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub side_effects: Vec<SideEffect>,
}

/// Report line for one materialized folder page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderReport {
    pub key: String,
    pub title: String,
    pub page_id: Option<String>,
    pub outcome: Outcome,
    /// Whether a remote create was (or would be) issued for this folder
    pub created: bool,
    pub reason: Option<String>,
}

/// A detected divergence where both sides changed since the last sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub path: String,
    pub page_id: String,
    pub local_hash: String,
    pub recorded_hash: String,
    pub recorded_version: i64,
    pub observed_version: i64,
    pub reason: String,
    pub detected_at: DateTime<Utc>,
}

/// Aggregated counts for a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub excluded: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub planned: usize,
    pub cancelled: usize,
}

impl SyncSummary {
    pub fn register(&mut self, report: &DocumentReport) {
        match report.outcome {
            Outcome::Failed => self.failed += 1,
            Outcome::Planned => self.planned += 1,
            Outcome::Cancelled => self.cancelled += 1,
            Outcome::Succeeded | Outcome::Skipped => match report.action {
                ActionKind::Create => self.created += 1,
                ActionKind::Update => self.updated += 1,
                ActionKind::SkipUnchanged => self.unchanged += 1,
                ActionKind::SkipExcluded => self.excluded += 1,
                ActionKind::SkipConflict => self.conflicts += 1,
            },
        }
    }
}

/// Everything a run produced. Rendering it is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub simulated: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub root_page_id: Option<String>,
    pub folders: Vec<FolderReport>,
    pub documents: Vec<DocumentReport>,
    pub conflicts: Vec<ConflictRecord>,
    pub summary: SyncSummary,
}

impl RunReport {
    pub fn document(&self, path: &str) -> Option<&DocumentReport> {
        self.documents.iter().find(|d| d.path == path)
    }

    /// Whether any document or folder failed
    pub fn has_failures(&self) -> bool {
        self.summary.failed > 0 || self.folders.iter().any(|f| f.outcome == Outcome::Failed)
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Whether the run writes to the remote or only plans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Live,
    Simulate,
}

/// Signal used to decide that the remote changed since the last sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSignal {
    /// Only a version number different from the recorded one counts
    #[default]
    VersionOnly,
    /// A version change, or an `updated_at` newer than `last_synced_at`
    VersionAndTimestamp,
}

/// Sync engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Title of the remote page every synced page lives under
    #[serde(default = "default_root_title")]
    pub root_page_title: String,
    /// Maximum leaf actions in flight
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub change_signal: ChangeSignal,
    /// Body written into freshly created folder pages
    #[serde(default = "default_folder_body")]
    pub folder_placeholder_body: String,
    /// Body written into a freshly created root page
    #[serde(default = "default_root_body")]
    pub root_placeholder_body: String,
}

fn default_root_title() -> String {
    "Knowledge Base".to_string()
}

fn default_concurrency() -> usize {
    4
}

fn default_folder_body() -> String {
    "<p>Folder placeholder</p>".to_string()
}

fn default_root_body() -> String {
    "<p>Root page</p>".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root_page_title: default_root_title(),
            concurrency: default_concurrency(),
            change_signal: ChangeSignal::default(),
            folder_placeholder_body: default_folder_body(),
            root_placeholder_body: default_root_body(),
        }
    }
}

/// Identity store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite state database
    pub db_path: String,
    /// Storage mode (local or cloud-safe)
    #[serde(default)]
    pub storage_mode: StorageMode,
}

/// Journal mode for the state database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    /// WAL journal, the fast default for local disks
    #[default]
    Local,
    /// Single-file DELETE journal for folders synced by Dropbox, iCloud and friends
    CloudSafe,
}

/// Confluence connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Site base URL, e.g. `https://example.atlassian.net/wiki`
    pub base_url: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub api_token: String,
    pub space_key: String,
}

impl RemoteConfig {
    /// Validate and normalize the base URL
    pub fn validated(mut self) -> crate::Result<Self> {
        let trimmed = self.base_url.trim().trim_end_matches('/').to_string();
        if !(trimmed.starts_with("https://") || trimmed.starts_with("http://")) {
            return Err(crate::SyncError::Config(format!(
                "base URL must start with http:// or https://, got '{}'",
                self.base_url
            )));
        }
        if self.space_key.trim().is_empty() {
            return Err(crate::SyncError::Config("space key is empty".to_string()));
        }
        if self.api_token.is_empty() {
            return Err(crate::SyncError::Config("API token is empty".to_string()));
        }
        self.base_url = trimmed;
        Ok(self)
    }
}
