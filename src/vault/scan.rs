//! Vault scanner
//!
//! Walks the vault for `*.md` notes, skipping anything under a dot-prefixed
//! path component (`.obsidian/`, `.trash/`, ...). Results are sorted by path.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::Value;
use sha2::{Digest, Sha256};
use walkdir::{DirEntry, WalkDir};

use super::{attachment_filename, is_external, IMAGE_PATTERN};
use crate::error::{Result, SyncError};
use crate::types::{Attachment, Document, Frontmatter};

static HEADING_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#\s+(?P<title>.+)$").expect("valid regex"));

/// Scan a vault and return its notes, sorted by vault-relative path.
///
/// A note whose frontmatter cannot be parsed is skipped with a warning so
/// one broken file does not block the whole vault.
pub fn scan_vault(vault: &Path) -> Result<Vec<Document>> {
    let root = vault.canonicalize().map_err(|e| {
        SyncError::Config(format!("vault path '{}' is not readable: {}", vault.display(), e))
    })?;

    let mut files = collect_markdown(&root)?;
    files.sort();

    let mut documents = Vec::with_capacity(files.len());
    for file in files {
        match load_note(&root, &file) {
            Ok(doc) => documents.push(doc),
            Err(SyncError::Yaml(e)) => {
                tracing::warn!(path = %file.display(), error = %e, "Skipping note with invalid frontmatter");
            }
            Err(e) => return Err(e),
        }
    }
    documents.sort_by(|a, b| a.path.cmp(&b.path));

    tracing::debug!(vault = %root.display(), notes = documents.len(), "Vault scanned");
    Ok(documents)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

fn collect_markdown(root: &Path) -> Result<Vec<PathBuf>> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| SyncError::Io(e.into()))?;
        if entry.file_type().is_file()
            && entry.path().extension().and_then(|e| e.to_str()) == Some("md")
        {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Load one note. `root` must be the canonical vault root.
pub fn load_note(root: &Path, file: &Path) -> Result<Document> {
    let raw = std::fs::read_to_string(file)?;
    let content_hash = hex::encode(Sha256::digest(raw.as_bytes()));

    let (yaml, body) = split_frontmatter(&raw);
    let frontmatter = match yaml {
        Some(yaml) => parse_frontmatter(yaml)?,
        None => Frontmatter::default(),
    };

    let relative = file
        .strip_prefix(root)
        .map_err(|_| SyncError::Internal(format!("{} is outside the vault", file.display())))?;
    let segments: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let path = segments.join("/");
    let folder_path = segments[..segments.len().saturating_sub(1)].to_vec();

    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.clone());
    let title = frontmatter
        .title
        .clone()
        .or_else(|| first_heading(body))
        .unwrap_or(stem);

    let note_dir = file.parent().unwrap_or(root);
    let attachments = find_attachments(root, note_dir, body);

    Ok(Document {
        path,
        title,
        body: body.to_string(),
        frontmatter,
        content_hash,
        folder_path,
        attachments,
    })
}

/// Split `---` fenced YAML frontmatter from the body.
///
/// Returns `(None, raw)` when the note has no (closed) frontmatter block.
pub fn split_frontmatter(raw: &str) -> (Option<&str>, &str) {
    let rest = match raw
        .strip_prefix("---\r\n")
        .or_else(|| raw.strip_prefix("---\n"))
    {
        Some(rest) => rest,
        None => return (None, raw),
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(&['\r', '\n'][..]);
        if trimmed == "---" || trimmed == "..." {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(yaml), body);
        }
        offset += line.len();
    }
    (None, raw)
}

fn scalar_string(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parse frontmatter YAML leniently: labels may be a list or a scalar,
/// `exclude` may be a bool or a truthy string, `page_id` may be numeric.
pub fn parse_frontmatter(yaml: &str) -> Result<Frontmatter> {
    let value: Value = serde_yaml::from_str(yaml)?;
    let Value::Mapping(map) = value else {
        return Ok(Frontmatter::default());
    };
    let field = |name: &str| map.get(name);

    let labels = match field("labels") {
        Some(Value::Sequence(items)) => items.iter().filter_map(scalar_string).collect(),
        Some(other) => scalar_string(other).into_iter().collect(),
        None => Vec::new(),
    };

    let exclude = match field("exclude") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    };

    Ok(Frontmatter {
        title: field("title").and_then(scalar_string),
        labels,
        parent: field("parent").and_then(scalar_string),
        exclude,
        page_id: field("page_id").and_then(scalar_string),
    })
}

fn first_heading(body: &str) -> Option<String> {
    body.lines()
        .filter_map(|line| HEADING_PATTERN.captures(line.trim()))
        .map(|caps| caps["title"].trim().to_string())
        .find(|title| !title.is_empty())
}

/// Lexically resolve `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn find_attachments(root: &Path, note_dir: &Path, body: &str) -> Vec<Attachment> {
    let mut seen = HashSet::new();
    let mut attachments = Vec::new();

    for caps in IMAGE_PATTERN.captures_iter(body) {
        let target = caps["target"].trim();
        if is_external(target) {
            continue;
        }
        let decoded = target.replace("%20", " ");
        let source = normalize(&note_dir.join(&decoded));
        if !source.starts_with(root) {
            tracing::debug!(target = %target, "Ignoring image outside the vault");
            continue;
        }
        let Some(filename) = attachment_filename(target) else {
            continue;
        };
        if seen.insert(filename.clone()) {
            attachments.push(Attachment { filename, source });
        }
    }
    attachments
}
