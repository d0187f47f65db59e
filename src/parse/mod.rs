//! The link parser facade.
//!
//! `parse(body, content_type, base_url)` runs the extractor selected by
//! content type and returns the discovered links, each classified as
//! *embedded* (fetched automatically to render the parent page) or
//! *navigational* (followed only when a pattern or the user asks).
//!
//! Extractors are pure: no I/O, no blocking, a finite list out. Relative
//! URLs are trimmed and resolved against the parent's URL here, in one
//! place, so extractors deal only in raw attribute values.

pub mod css;
pub mod feed;
pub mod html;
pub mod json;

use std::collections::HashMap;

use tracing::{debug, instrument};
use url::Url;

use crate::project::HtmlParserType;
use crate::urls;

/// How a link participates in rendering its parent page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Fetched automatically to render the parent (images, CSS, scripts).
    Embedded,
    /// Followed on navigation only.
    Navigational,
}

/// One discovered link, already resolved to an absolute URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Absolute URL of the target.
    pub url: String,
    /// Embedded or navigational.
    pub kind: LinkKind,
}

/// A link candidate as found in a document: possibly relative, untrimmed.
#[derive(Debug, Clone)]
pub(crate) struct RawLink {
    pub(crate) target: String,
    pub(crate) kind: LinkKind,
}

/// Document family an extractor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    /// HTML and XHTML.
    Html,
    /// CSS stylesheets.
    Css,
    /// JSON payloads.
    Json,
    /// RSS and Atom feeds.
    Feed,
    /// Known-binary or unrecognized; never parsed.
    Opaque,
}

/// Extractor selection by content type, with a small override table.
#[derive(Debug)]
pub struct ParserRegistry {
    overrides: HashMap<String, DocumentKind>,
    html_flavor: HtmlParserType,
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ParserRegistry {
    /// Creates a registry with the default content-type mapping.
    #[must_use]
    pub fn new() -> Self {
        Self {
            overrides: HashMap::new(),
            html_flavor: HtmlParserType::default(),
        }
    }

    /// Selects the HTML parser flavor (the `html_parser_type` project
    /// property).
    #[must_use]
    pub fn with_html_flavor(mut self, flavor: HtmlParserType) -> Self {
        self.html_flavor = flavor;
        self
    }

    /// Forces a content type to a document kind, overriding the default
    /// mapping.
    #[must_use]
    pub fn with_override(mut self, content_type: &str, kind: DocumentKind) -> Self {
        self.overrides
            .insert(content_type.to_ascii_lowercase(), kind);
        self
    }

    /// Resolves the document kind for a content type.
    #[must_use]
    pub fn kind_for(&self, content_type: Option<&str>) -> DocumentKind {
        let Some(content_type) = content_type else {
            return DocumentKind::Opaque;
        };
        let content_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if let Some(&kind) = self.overrides.get(&content_type) {
            return kind;
        }
        match content_type.as_str() {
            "text/html" | "application/xhtml+xml" => DocumentKind::Html,
            "text/css" => DocumentKind::Css,
            "application/json" | "text/json" => DocumentKind::Json,
            "application/rss+xml" | "application/atom+xml" | "application/xml" | "text/xml" => {
                DocumentKind::Feed
            }
            other if other.ends_with("+json") => DocumentKind::Json,
            other if other.ends_with("+xml") => DocumentKind::Feed,
            _ => DocumentKind::Opaque,
        }
    }

    /// Parses a document body and returns its links.
    ///
    /// Parsing never fails: a malformed document simply yields no links.
    /// The result is deduplicated by URL; an embedded classification wins
    /// over a navigational one for the same URL.
    #[must_use]
    #[instrument(skip(self, body), fields(content_type, base_url = %base_url, bytes = body.len()))]
    pub fn parse(&self, body: &[u8], content_type: Option<&str>, base_url: &str) -> Vec<Link> {
        let kind = self.kind_for(content_type);
        let raw = match kind {
            DocumentKind::Html => {
                let text = String::from_utf8_lossy(body);
                html::extract(&text, self.html_flavor)
            }
            DocumentKind::Css => {
                let text = String::from_utf8_lossy(body);
                css::extract(&text)
            }
            DocumentKind::Json => json::extract(body),
            DocumentKind::Feed => {
                let text = String::from_utf8_lossy(body);
                feed::extract(&text)
            }
            DocumentKind::Opaque => Vec::new(),
        };
        let links = resolve_links(raw, base_url);
        debug!(count = links.len(), "extracted links");
        links
    }
}

/// Trims, filters and resolves raw candidates against the base URL,
/// deduplicating by URL.
fn resolve_links(raw: Vec<RawLink>, base_url: &str) -> Vec<Link> {
    let base = Url::parse(base_url).ok();
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut links: Vec<Link> = Vec::new();

    for candidate in raw {
        let target = candidate.target.trim();
        if target.is_empty() || urls::is_unrewritable_url(target) {
            continue;
        }
        let absolute = match Url::parse(target) {
            Ok(url) => url.to_string(),
            Err(_) => match &base {
                Some(base) => match base.join(target) {
                    Ok(url) => url.to_string(),
                    Err(_) => continue,
                },
                None => continue,
            },
        };

        match seen.get(&absolute) {
            Some(&index) => {
                // Embedded beats navigational for the same URL
                if candidate.kind == LinkKind::Embedded {
                    links[index].kind = LinkKind::Embedded;
                }
            }
            None => {
                seen.insert(absolute.clone(), links.len());
                links.push(Link {
                    url: absolute,
                    kind: candidate.kind,
                });
            }
        }
    }
    links
}
