//! Remote page-tree planning
//!
//! Every prefix of a document's parent chain becomes a folder page. Folder
//! specs are collected once per run, deduplicated by key and handed out
//! parents-first so a folder is always materialized after its parent.

use std::collections::HashSet;

use crate::types::{folder_key, FolderSpec, ParentTarget};

/// Where a page with this parent chain hangs
pub fn parent_target(chain: &[String]) -> ParentTarget {
    if chain.is_empty() {
        ParentTarget::Root
    } else {
        ParentTarget::Folder(folder_key(chain))
    }
}

/// Folder specs for every prefix of `chain`, outermost first
pub fn folder_specs(chain: &[String]) -> Vec<FolderSpec> {
    (1..=chain.len())
        .map(|depth| FolderSpec {
            key: folder_key(&chain[..depth]),
            title: chain[depth - 1].clone(),
            parent: parent_target(&chain[..depth - 1]),
        })
        .collect()
}

/// Number of segments in a folder key (`"a/b/"` -> 2)
pub fn folder_depth(key: &str) -> usize {
    key.matches('/').count()
}

/// Deduplicating collector of folder specs
#[derive(Debug, Default)]
pub struct FolderPlan {
    seen: HashSet<String>,
    folders: Vec<FolderSpec>,
}

impl FolderPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every folder needed for `chain`
    pub fn require(&mut self, chain: &[String]) {
        for spec in folder_specs(chain) {
            if self.seen.insert(spec.key.clone()) {
                self.folders.push(spec);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.folders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }

    /// Folder specs ordered parents-first (by depth, then key)
    pub fn into_ordered(mut self) -> Vec<FolderSpec> {
        self.folders
            .sort_by(|a, b| folder_depth(&a.key).cmp(&folder_depth(&b.key)).then_with(|| a.key.cmp(&b.key)));
        self.folders
    }
}
