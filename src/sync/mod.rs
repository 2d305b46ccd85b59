//! One-way sync of vault documents to the remote wiki
//!
//! - [`reconcile`]: pure per-document decisions plus the folder plan
//! - [`SyncEngine`]: executes a plan against a [`RemoteClient`] and the
//!   identity store, returning a [`RunReport`]
//!
//! [`RemoteClient`]: crate::remote::RemoteClient
//! [`RunReport`]: crate::types::RunReport

mod cancel;
mod coordinator;
pub mod reconciler;
pub mod tree;

pub use cancel::CancelToken;
pub use coordinator::{is_simulated_id, SyncEngine, SIMULATED_PREFIX};
pub use reconciler::{
    folder_targets, reconcile, remote_changed, snapshot_targets, Plan, PlanFailure,
    RemoteSnapshot, RemoteState,
};
pub use tree::{folder_specs, parent_target, FolderPlan};
