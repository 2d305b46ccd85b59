//! Markdown rendering of run reports
//!
//! The engine only returns a [`RunReport`]; these helpers turn it into the
//! plan and conflict files the CLI drops next to the vault.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::types::{Outcome, RunReport};

/// Files written for a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunArtifacts {
    pub plan: Option<PathBuf>,
    pub conflicts: Option<PathBuf>,
}

fn timestamp(report: &RunReport) -> String {
    report.started_at.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Render the per-document plan (or outcome) list
pub fn render_plan_markdown(report: &RunReport) -> String {
    let mut out = String::new();
    let heading = if report.simulated {
        "# Dry-run Plan"
    } else {
        "# Sync Report"
    };
    let _ = writeln!(out, "{}\n", heading);
    let _ = writeln!(out, "Run `{}` started at {}\n", report.run_id, report.started_at.to_rfc3339());

    let s = &report.summary;
    let _ = writeln!(
        out,
        "Created: {}, updated: {}, unchanged: {}, excluded: {}, conflicts: {}, failed: {}, planned: {}, cancelled: {}\n",
        s.created, s.updated, s.unchanged, s.excluded, s.conflicts, s.failed, s.planned, s.cancelled
    );

    let folders: Vec<_> = report.folders.iter().filter(|f| f.created).collect();
    if !folders.is_empty() {
        let _ = writeln!(out, "## Folder pages\n");
        for folder in folders {
            let _ = writeln!(
                out,
                "- `{}` ({}) -> {}",
                folder.key,
                folder.title,
                folder.outcome.as_str()
            );
        }
        out.push('\n');
    }

    let _ = writeln!(out, "## Documents\n");
    for doc in &report.documents {
        let _ = writeln!(out, "- `{}` -> {}", doc.path, doc.action);
        let _ = writeln!(out, "  - Title: {}", doc.title);
        let _ = writeln!(
            out,
            "  - Target page: {}",
            doc.page_id.as_deref().unwrap_or("new")
        );
        if doc.outcome != Outcome::Planned {
            let _ = writeln!(out, "  - Outcome: {}", doc.outcome.as_str());
        }
        if let Some(reason) = &doc.reason {
            let _ = writeln!(out, "  - Reason: {}", reason);
        }
        if !doc.labels.is_empty() {
            let _ = writeln!(out, "  - Labels: {}", doc.labels.join(", "));
        }
        for effect in &doc.side_effects {
            match &effect.error {
                Some(error) => {
                    let _ = writeln!(out, "  - {}: {} ({})", effect.name, effect.outcome.as_str(), error);
                }
                None => {
                    let _ = writeln!(out, "  - {}: {}", effect.name, effect.outcome.as_str());
                }
            }
        }
        out.push('\n');
    }
    out
}

/// Render the conflict list, or `None` when the run had no conflicts
pub fn render_conflicts_markdown(report: &RunReport) -> Option<String> {
    if report.conflicts.is_empty() {
        return None;
    }
    let mut out = String::new();
    let _ = writeln!(out, "# Sync Conflicts\n");
    let _ = writeln!(out, "Detected conflicts: {}\n", report.conflicts.len());
    for conflict in &report.conflicts {
        let _ = writeln!(out, "- File: `{}`", conflict.path);
        let _ = writeln!(out, "  - Page ID: {}", conflict.page_id);
        let _ = writeln!(
            out,
            "  - Remote version: {} (last synced at {})",
            conflict.observed_version, conflict.recorded_version
        );
        let _ = writeln!(out, "  - Local hash: {}", conflict.local_hash);
        let _ = writeln!(out, "  - Reason: {}", conflict.reason);
        let _ = writeln!(out, "  - Detected at: {}\n", conflict.detected_at.to_rfc3339());
    }
    Some(out)
}

/// Write `plan_<ts>.md` for simulated runs and `conflicts_<ts>.md` when
/// conflicts were found
pub fn write_run_artifacts(
    report: &RunReport,
    reports_dir: &Path,
    conflicts_dir: &Path,
) -> Result<RunArtifacts> {
    let ts = timestamp(report);
    let mut artifacts = RunArtifacts::default();

    if report.simulated {
        std::fs::create_dir_all(reports_dir)?;
        let path = reports_dir.join(format!("plan_{}.md", ts));
        std::fs::write(&path, render_plan_markdown(report))?;
        tracing::info!(report_path = %path.display(), "Dry-run plan written");
        artifacts.plan = Some(path);
    }

    if let Some(markdown) = render_conflicts_markdown(report) {
        std::fs::create_dir_all(conflicts_dir)?;
        let path = conflicts_dir.join(format!("conflicts_{}.md", ts));
        std::fs::write(&path, markdown)?;
        tracing::warn!(
            report_path = %path.display(),
            conflicts = report.conflicts.len(),
            "Conflicts detected; see report"
        );
        artifacts.conflicts = Some(path);
    }

    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ActionKind, ConflictRecord, DocumentReport, FolderReport, SyncSummary,
    };
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn report(simulated: bool, with_conflict: bool) -> RunReport {
        let started_at = Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 30).unwrap();
        let conflicts = if with_conflict {
            vec![ConflictRecord {
                path: "notes/a.md".to_string(),
                page_id: "42".to_string(),
                local_hash: "H3".to_string(),
                recorded_hash: "H2".to_string(),
                recorded_version: 2,
                observed_version: 3,
                reason: "both sides changed".to_string(),
                detected_at: started_at,
            }]
        } else {
            vec![]
        };
        RunReport {
            run_id: Uuid::new_v4(),
            simulated,
            started_at,
            finished_at: started_at,
            root_page_id: Some("1".to_string()),
            folders: vec![FolderReport {
                key: "notes/".to_string(),
                title: "notes".to_string(),
                page_id: Some("simulated:notes/".to_string()),
                outcome: Outcome::Planned,
                created: true,
                reason: None,
            }],
            documents: vec![DocumentReport {
                path: "notes/b.md".to_string(),
                title: "B".to_string(),
                action: ActionKind::Create,
                outcome: Outcome::Planned,
                page_id: None,
                parent_page_id: Some("simulated:notes/".to_string()),
                reason: Some("no binding for this path".to_string()),
                error_kind: None,
                labels: vec!["docs".to_string()],
                side_effects: vec![],
            }],
            conflicts,
            summary: SyncSummary {
                planned: 1,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_plan_markdown_lists_actions() {
        let md = render_plan_markdown(&report(true, false));
        assert!(md.starts_with("# Dry-run Plan"));
        assert!(md.contains("- `notes/b.md` -> create"));
        assert!(md.contains("  - Target page: new"));
        assert!(md.contains("  - Labels: docs"));
        assert!(md.contains("`notes/` (notes) -> planned"));
    }

    #[test]
    fn test_no_conflicts_renders_nothing() {
        assert!(render_conflicts_markdown(&report(false, false)).is_none());
        let md = render_conflicts_markdown(&report(false, true)).unwrap();
        assert!(md.contains("Detected conflicts: 1"));
        assert!(md.contains("- File: `notes/a.md`"));
    }

    #[test]
    fn test_write_run_artifacts() {
        let dir = TempDir::new().unwrap();
        let reports = dir.path().join("reports");
        let conflicts = dir.path().join("conflicts");

        let artifacts = write_run_artifacts(&report(true, true), &reports, &conflicts).unwrap();
        let plan = artifacts.plan.unwrap();
        assert!(plan.ends_with("plan_20240301T101530Z.md"));
        assert!(plan.exists());
        assert!(artifacts
            .conflicts
            .unwrap()
            .ends_with("conflicts_20240301T101530Z.md"));

        let artifacts = write_run_artifacts(&report(false, false), &reports, &conflicts).unwrap();
        assert_eq!(artifacts, RunArtifacts::default());
    }
}
