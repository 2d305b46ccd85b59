//! Markdown to Confluence storage format
//!
//! Renders with pulldown-cmark (tables, strikethrough, task lists) and emits
//! the XHTML subset Confluence stores:
//! - local images become `<ac:image>` attachment references
//! - `[[Title]]` / `[[Title|Alias]]` become `<ac:link>` page links
//! - fenced code becomes the `code` structured macro

use std::collections::HashMap;

use once_cell::sync::Lazy;
use pulldown_cmark::{CodeBlockKind, Event, HeadingLevel, Options, Parser, Tag, TagEnd};
use regex::Regex;

use super::{attachment_filename, is_external};
use crate::error::Result;
use crate::types::{Document, RemoteBody};

static WIKILINK_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!?\[\[([^\]\n]+)\]\]").expect("valid regex"));

const WIKILINK_SCHEME: &str = "wikilink://";

/// Turns a document into the remote body representation.
///
/// Called right before every Create/Update; errors surface as `Conversion`.
pub trait BodyConverter: Send + Sync {
    fn convert(&self, doc: &Document) -> Result<RemoteBody>;
}

/// Collapse whitespace and lowercase for title lookups
fn normalize_title(title: &str) -> String {
    title.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Converter to Confluence storage XHTML
#[derive(Debug, Clone, Default)]
pub struct StorageFormatConverter {
    /// Normalized title -> canonical title. `None` links every wiki link.
    titles: Option<HashMap<String, String>>,
}

impl StorageFormatConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only link wiki links whose target is one of `titles`; the rest
    /// render as their display text
    pub fn with_titles<I, S>(titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let titles = titles
            .into_iter()
            .map(|t| (normalize_title(t.as_ref()), t.as_ref().to_string()))
            .collect();
        Self {
            titles: Some(titles),
        }
    }

    /// Convert a Markdown string
    pub fn render(&self, markdown: &str) -> String {
        let prepared = self.rewrite_wikilinks(markdown);
        let mut options = Options::empty();
        options.insert(Options::ENABLE_TABLES);
        options.insert(Options::ENABLE_STRIKETHROUGH);
        options.insert(Options::ENABLE_TASKLISTS);

        let mut writer = StorageWriter::default();
        for event in Parser::new_ext(&prepared, options) {
            writer.event(event);
        }
        writer.out
    }

    fn resolve(&self, target: &str) -> Option<String> {
        match &self.titles {
            None => Some(target.to_string()),
            Some(titles) => titles.get(&normalize_title(target)).cloned(),
        }
    }

    /// Replace wiki links with Markdown links on a private scheme so the
    /// renderer can tell them apart from regular links
    fn rewrite_wikilinks(&self, markdown: &str) -> String {
        WIKILINK_PATTERN
            .replace_all(markdown, |caps: &regex::Captures| {
                let inner = caps[1].trim();
                let (target, display) = match inner.split_once('|') {
                    Some((target, alias)) => (target.trim(), alias.trim()),
                    None => (inner, inner),
                };
                // `[[Note#Section]]` links to the note
                let target = target.split('#').next().unwrap_or(target).trim();
                match self.resolve(target) {
                    Some(title) => format!(
                        "[{}](<{}{}>)",
                        display.replace(']', "\\]"),
                        WIKILINK_SCHEME,
                        title.replace('>', "%3E")
                    ),
                    None => display.to_string(),
                }
            })
            .into_owned()
    }
}

impl BodyConverter for StorageFormatConverter {
    fn convert(&self, doc: &Document) -> Result<RemoteBody> {
        Ok(RemoteBody(self.render(&doc.body)))
    }
}

pub(crate) fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn cdata(text: &str) -> String {
    format!("<![CDATA[{}]]>", text.replace("]]>", "]]]]><![CDATA[>"))
}

fn heading_tag(level: HeadingLevel) -> &'static str {
    match level {
        HeadingLevel::H1 => "h1",
        HeadingLevel::H2 => "h2",
        HeadingLevel::H3 => "h3",
        HeadingLevel::H4 => "h4",
        HeadingLevel::H5 => "h5",
        HeadingLevel::H6 => "h6",
    }
}

/// Element whose text is collected instead of written through
enum Capture {
    Code { language: Option<String>, text: String },
    PageLink { title: String, text: String },
    Image { target: String, alt: String },
}

#[derive(Default)]
struct StorageWriter {
    out: String,
    capture: Option<Capture>,
    in_table_head: bool,
}

impl StorageWriter {
    fn text(&mut self, text: &str) {
        match &mut self.capture {
            Some(Capture::Code { text: buf, .. }) => buf.push_str(text),
            Some(Capture::PageLink { text: buf, .. }) => buf.push_str(text),
            Some(Capture::Image { alt, .. }) => alt.push_str(text),
            None => self.out.push_str(&escape_xml(text)),
        }
    }

    fn event(&mut self, event: Event<'_>) {
        match event {
            Event::Start(tag) => self.start(tag),
            Event::End(tag) => self.end(tag),
            Event::Text(text) => self.text(&text),
            Event::Code(code) => {
                if self.capture.is_some() {
                    self.text(&code);
                } else {
                    self.out.push_str("<code>");
                    self.out.push_str(&escape_xml(&code));
                    self.out.push_str("</code>");
                }
            }
            // Raw HTML is not valid storage format; keep it visible as text
            Event::Html(html) | Event::InlineHtml(html) => self.text(&html),
            Event::SoftBreak => self.text("\n"),
            Event::HardBreak => {
                if self.capture.is_some() {
                    self.text("\n");
                } else {
                    self.out.push_str("<br />");
                }
            }
            Event::Rule => self.out.push_str("<hr />"),
            Event::TaskListMarker(checked) => self.text(if checked { "[x] " } else { "[ ] " }),
            Event::FootnoteReference(name) => self.text(&format!("[^{}]", name)),
        }
    }

    fn start(&mut self, tag: Tag<'_>) {
        match tag {
            Tag::Paragraph => self.out.push_str("<p>"),
            Tag::Heading { level, .. } => {
                self.out.push('<');
                self.out.push_str(heading_tag(level));
                self.out.push('>');
            }
            Tag::BlockQuote => self.out.push_str("<blockquote>"),
            Tag::CodeBlock(kind) => {
                let language = match kind {
                    CodeBlockKind::Fenced(info) => info
                        .split_whitespace()
                        .next()
                        .filter(|l| !l.is_empty())
                        .map(str::to_string),
                    CodeBlockKind::Indented => None,
                };
                self.capture = Some(Capture::Code {
                    language,
                    text: String::new(),
                });
            }
            Tag::List(Some(_)) => self.out.push_str("<ol>"),
            Tag::List(None) => self.out.push_str("<ul>"),
            Tag::Item => self.out.push_str("<li>"),
            Tag::Table(_) => self.out.push_str("<table><tbody>"),
            Tag::TableHead => {
                self.in_table_head = true;
                self.out.push_str("<tr>");
            }
            Tag::TableRow => self.out.push_str("<tr>"),
            Tag::TableCell => self
                .out
                .push_str(if self.in_table_head { "<th>" } else { "<td>" }),
            Tag::Emphasis => self.out.push_str("<em>"),
            Tag::Strong => self.out.push_str("<strong>"),
            Tag::Strikethrough => self.out.push_str("<del>"),
            Tag::Link { dest_url, .. } => {
                if let Some(title) = dest_url.strip_prefix(WIKILINK_SCHEME) {
                    self.capture = Some(Capture::PageLink {
                        title: title.replace("%3E", ">"),
                        text: String::new(),
                    });
                } else {
                    self.out
                        .push_str(&format!("<a href=\"{}\">", escape_xml(&dest_url)));
                }
            }
            Tag::Image { dest_url, .. } => {
                self.capture = Some(Capture::Image {
                    target: dest_url.to_string(),
                    alt: String::new(),
                });
            }
            _ => {}
        }
    }

    fn end(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::Paragraph => self.out.push_str("</p>"),
            TagEnd::Heading(level) => {
                self.out.push_str("</");
                self.out.push_str(heading_tag(level));
                self.out.push('>');
            }
            TagEnd::BlockQuote => self.out.push_str("</blockquote>"),
            TagEnd::CodeBlock => {
                if let Some(Capture::Code { language, text }) = self.capture.take() {
                    self.out.push_str("<ac:structured-macro ac:name=\"code\">");
                    if let Some(language) = language {
                        self.out.push_str(&format!(
                            "<ac:parameter ac:name=\"language\">{}</ac:parameter>",
                            escape_xml(&language)
                        ));
                    }
                    self.out.push_str("<ac:plain-text-body>");
                    self.out.push_str(&cdata(&text));
                    self.out.push_str("</ac:plain-text-body></ac:structured-macro>");
                }
            }
            TagEnd::List(true) => self.out.push_str("</ol>"),
            TagEnd::List(false) => self.out.push_str("</ul>"),
            TagEnd::Item => self.out.push_str("</li>"),
            TagEnd::Table => self.out.push_str("</tbody></table>"),
            TagEnd::TableHead => {
                self.in_table_head = false;
                self.out.push_str("</tr>");
            }
            TagEnd::TableRow => self.out.push_str("</tr>"),
            TagEnd::TableCell => self
                .out
                .push_str(if self.in_table_head { "</th>" } else { "</td>" }),
            TagEnd::Emphasis => self.out.push_str("</em>"),
            TagEnd::Strong => self.out.push_str("</strong>"),
            TagEnd::Strikethrough => self.out.push_str("</del>"),
            TagEnd::Link => match self.capture.take() {
                Some(Capture::PageLink { title, text }) => {
                    let body = if text.trim().is_empty() {
                        title.clone()
                    } else {
                        text.trim().to_string()
                    };
                    self.out.push_str(&format!(
                        "<ac:link><ri:page ri:content-title=\"{}\" /><ac:plain-text-link-body>{}</ac:plain-text-link-body></ac:link>",
                        escape_xml(&title),
                        cdata(&body)
                    ));
                }
                other => {
                    self.capture = other;
                    self.out.push_str("</a>");
                }
            },
            TagEnd::Image => {
                if let Some(Capture::Image { target, alt }) = self.capture.take() {
                    self.out.push_str(&render_image(&target, &alt));
                }
            }
            _ => {}
        }
    }
}

fn render_image(target: &str, alt: &str) -> String {
    let resource = match attachment_filename(target) {
        Some(filename) if !is_external(target) => {
            format!("<ri:attachment ri:filename=\"{}\" />", escape_xml(&filename))
        }
        _ => format!("<ri:url ri:value=\"{}\" />", escape_xml(target)),
    };
    let alt = alt.trim();
    let alt_param = if alt.is_empty() {
        String::new()
    } else {
        format!(
            "<ac:parameter ac:name=\"alt-text\">{}</ac:parameter>",
            escape_xml(alt)
        )
    };
    format!("<ac:image>{}{}</ac:image>", resource, alt_param)
}
