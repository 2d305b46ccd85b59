//! Property-based tests for vaultsync
//!
//! These tests verify invariants that must hold for all inputs:
//! - The reconciler never writes over a remote change
//! - Folder plans are deduplicated and parents-first
//! - Parsers and the body converter never panic
//!
//! Run with: cargo test --test property_tests

use chrono::{Duration, Utc};
use proptest::prelude::*;

use vaultsync::storage::BindingSnapshot;
use vaultsync::sync::{reconcile, snapshot_targets, RemoteSnapshot};
use vaultsync::types::*;

fn document(path: &str, folders: Vec<String>, hash: &str) -> Document {
    Document {
        path: path.to_string(),
        title: "Note".to_string(),
        body: String::new(),
        frontmatter: Frontmatter::default(),
        content_hash: hash.to_string(),
        folder_path: folders,
        attachments: vec![],
    }
}

fn binding(path: &str, id: &str, version: i64, hash: &str) -> Binding {
    Binding {
        path: path.to_string(),
        remote_page_id: id.to_string(),
        remote_version: version,
        content_hash: hash.to_string(),
        last_synced_at: Utc::now() - Duration::minutes(5),
    }
}

fn page(id: &str, version: i64) -> RemotePage {
    RemotePage {
        id: id.to_string(),
        title: "Note".to_string(),
        parent_id: None,
        version,
        updated_at: Some(Utc::now() - Duration::minutes(10)),
    }
}

fn folder_chain() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[A-Za-z]{1,6}", 0..4)
}

// ============================================================================
// RECONCILER TESTS
// ============================================================================

mod reconciler_tests {
    use super::*;

    proptest! {
        /// Invariant: an excluded document is always skipped, bound or not
        #[test]
        fn excluded_is_always_skipped(bound in any::<bool>(), hash in "[a-f0-9]{8}") {
            let mut doc = document("a.md", vec![], &hash);
            doc.frontmatter.exclude = true;
            let bindings = if bound {
                BindingSnapshot::from_bindings(vec![binding("a.md", "7", 1, "old")])
            } else {
                BindingSnapshot::default()
            };
            let plan = reconcile(&[doc], &bindings, &RemoteSnapshot::new(), &SyncConfig::default());
            prop_assert_eq!(plan.actions.len(), 1);
            prop_assert_eq!(plan.actions[0].kind, ActionKind::SkipExcluded);
            prop_assert!(plan.folders.is_empty());
        }

        /// Invariant: a document with no binding and no page_id is created
        #[test]
        fn unbound_document_is_created(folders in folder_chain(), hash in "[a-f0-9]{8}") {
            let depth = folders.len();
            let doc = document("x/note.md", folders, &hash);
            let plan = reconcile(
                &[doc],
                &BindingSnapshot::default(),
                &RemoteSnapshot::new(),
                &SyncConfig::default(),
            );
            prop_assert_eq!(plan.actions[0].kind, ActionKind::Create);
            prop_assert_eq!(plan.folders.len(), depth);
        }

        /// Invariant: an untouched remote never yields a conflict
        #[test]
        fn unchanged_remote_never_conflicts(
            version in 1i64..1000,
            recorded in "[a-f0-9]{8}",
            local in "[a-f0-9]{8}",
        ) {
            let bindings = BindingSnapshot::from_bindings(vec![binding("a.md", "7", version, &recorded)]);
            let mut remote = RemoteSnapshot::new();
            remote.record_page(page("7", version));

            let doc = document("a.md", vec![], &local);
            let plan = reconcile(&[doc], &bindings, &remote, &SyncConfig::default());
            prop_assert!(plan.conflicts.is_empty());

            let expected = if recorded == local { ActionKind::SkipUnchanged } else { ActionKind::Update };
            prop_assert_eq!(plan.actions[0].kind, expected);
            if expected == ActionKind::Update {
                prop_assert_eq!(plan.actions[0].expected_remote_version, Some(version));
            }
        }

        /// Invariant: a conflict is reported exactly when both sides changed,
        /// and nothing is ever written over a remote change
        #[test]
        fn conflict_iff_both_sides_changed(
            recorded_version in 1i64..100,
            bump in 0i64..3,
            local_changed in any::<bool>(),
        ) {
            let bindings = BindingSnapshot::from_bindings(vec![binding("a.md", "7", recorded_version, "H1")]);
            let mut remote = RemoteSnapshot::new();
            remote.record_page(page("7", recorded_version + bump));

            let hash = if local_changed { "H2" } else { "H1" };
            let plan = reconcile(&[document("a.md", vec![], hash)], &bindings, &remote, &SyncConfig::default());
            let remote_changed = bump > 0;

            prop_assert_eq!(plan.conflicts.len(), usize::from(local_changed && remote_changed));
            if remote_changed {
                prop_assert!(!plan.actions[0].kind.is_write());
            }
        }

        /// Invariant: folders come out deduplicated and parents-first
        #[test]
        fn folders_are_parents_first(chains in prop::collection::vec(folder_chain(), 1..8)) {
            let docs: Vec<Document> = chains
                .into_iter()
                .enumerate()
                .map(|(i, chain)| document(&format!("n{}.md", i), chain, "h"))
                .collect();
            let plan = reconcile(
                &docs,
                &BindingSnapshot::default(),
                &RemoteSnapshot::new(),
                &SyncConfig::default(),
            );

            let keys: Vec<&str> = plan.folders.iter().map(|f| f.key.as_str()).collect();
            let mut unique = keys.clone();
            unique.sort();
            unique.dedup();
            prop_assert_eq!(unique.len(), keys.len());

            for (i, folder) in plan.folders.iter().enumerate() {
                if let ParentTarget::Folder(parent) = &folder.parent {
                    let position = keys.iter().position(|k| k == parent);
                    prop_assert!(matches!(position, Some(p) if p < i));
                }
            }
        }

        /// Invariant: snapshot targets are unique and skip excluded documents
        #[test]
        fn snapshot_targets_are_unique(ids in prop::collection::vec("[1-9]{1,3}", 0..10)) {
            let docs: Vec<Document> = ids
                .iter()
                .enumerate()
                .map(|(i, id)| {
                    let mut doc = document(&format!("n{}.md", i), vec![], "h");
                    doc.frontmatter.page_id = Some(id.clone());
                    doc.frontmatter.exclude = i % 3 == 2;
                    doc
                })
                .collect();
            let targets = snapshot_targets(&docs, &BindingSnapshot::default());

            let mut sorted = targets.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(sorted.len(), targets.len());
            for (i, id) in ids.iter().enumerate() {
                if i % 3 != 2 {
                    prop_assert!(targets.contains(id));
                }
            }
        }
    }
}

// ============================================================================
// VAULT PARSING TESTS
// ============================================================================

mod vault_tests {
    use super::*;
    use vaultsync::vault::{parse_frontmatter, split_frontmatter, StorageFormatConverter};

    proptest! {
        /// Invariant: frontmatter splitting never panics and never grows the input
        #[test]
        fn split_never_panics(s in ".*") {
            let (frontmatter, body) = split_frontmatter(&s);
            prop_assert!(body.len() <= s.len());
            if let Some(yaml) = frontmatter {
                prop_assert!(yaml.len() <= s.len());
            }
        }

        /// Invariant: frontmatter parsing returns instead of panicking
        #[test]
        fn parse_never_panics(s in ".*") {
            let _ = parse_frontmatter(&s);
        }

        /// Invariant: labels survive a frontmatter round trip through YAML
        #[test]
        fn labels_are_read(labels in prop::collection::vec("lbl-[a-z]{1,6}", 0..5)) {
            let yaml = format!("labels: [{}]", labels.join(", "));
            let parsed = parse_frontmatter(&yaml).unwrap();
            prop_assert_eq!(parsed.labels, labels);
        }

        /// Invariant: rendered bodies never contain unescaped markup from plain text
        #[test]
        fn render_escapes_text(text in "[a-z][a-z <>&]{0,40}") {
            let converter = StorageFormatConverter::new();
            let rendered = converter.render(&text);
            prop_assert!(!rendered.contains("<>"));
            prop_assert!(!rendered.contains("& "));
        }
    }
}
