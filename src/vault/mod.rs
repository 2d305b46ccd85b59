//! Local vault handling
//!
//! - [`scan_vault`]: walk an Obsidian vault and produce [`Document`]s
//! - [`StorageFormatConverter`]: render note bodies as Confluence storage XHTML
//!
//! [`Document`]: crate::types::Document

mod convert;
mod scan;

pub use convert::{BodyConverter, StorageFormatConverter};
pub use scan::{load_note, parse_frontmatter, scan_vault, split_frontmatter};

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

/// Markdown image reference: `![alt](target "optional title")`
pub(crate) static IMAGE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"!\[(?P<alt>[^\]]*)\]\((?P<target>[^)\s]+)(?:\s+"[^"]*")?\)"#)
        .expect("valid regex")
});

/// Whether an image target points at something outside the vault's files
pub(crate) fn is_external(target: &str) -> bool {
    target.contains("://") || target.starts_with("data:")
}

/// Attachment name for a local image target (`img/My%20Diagram.png` -> `My Diagram.png`)
pub(crate) fn attachment_filename(target: &str) -> Option<String> {
    let decoded = target.trim().replace("%20", " ");
    Path::new(&decoded)
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_pattern_with_title() {
        let caps = IMAGE_PATTERN
            .captures(r#"![Flow](img/flow.png "The flow")"#)
            .unwrap();
        assert_eq!(&caps["alt"], "Flow");
        assert_eq!(&caps["target"], "img/flow.png");
    }

    #[test]
    fn test_attachment_filename() {
        assert_eq!(
            attachment_filename("img/My%20Diagram.png").as_deref(),
            Some("My Diagram.png")
        );
        assert_eq!(attachment_filename("a.png").as_deref(), Some("a.png"));
        assert!(attachment_filename("..").is_none());
    }

    #[test]
    fn test_is_external() {
        assert!(is_external("https://example.com/a.png"));
        assert!(is_external("data:image/png;base64,AAAA"));
        assert!(!is_external("assets/a.png"));
    }
}
