//! RSS and Atom feed link extraction.
//!
//! Entry links are navigational (pages worth crawling); enclosures are
//! embedded (the media the entry carries). Feeds in the wild are often
//! not quite well-formed XML, so extraction scans tags rather than
//! building a document tree.

use std::sync::OnceLock;

use regex::Regex;

use super::{LinkKind, RawLink};

fn atom_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // static pattern, exercised by tests
        Regex::new(r#"<(?:\w+:)?link\b[^>]*?href\s*=\s*["']([^"']+)["']"#).unwrap()
    })
}

fn rss_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // static pattern, exercised by tests
        Regex::new(r"<link>\s*([^<\s][^<]*?)\s*</link>").unwrap()
    })
}

fn enclosure_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // static pattern, exercised by tests
        Regex::new(r#"<enclosure\b[^>]*?url\s*=\s*["']([^"']+)["']"#).unwrap()
    })
}

/// Extracts raw link candidates from an RSS or Atom document.
#[must_use]
pub(crate) fn extract(text: &str) -> Vec<RawLink> {
    let mut links = Vec::new();

    // Atom: <link href="..."/> (channel and entry alike)
    for capture in atom_link_re().captures_iter(text) {
        links.push(RawLink {
            target: capture[1].to_string(),
            kind: LinkKind::Navigational,
        });
    }

    // RSS: <link>...</link>
    for capture in rss_link_re().captures_iter(text) {
        links.push(RawLink {
            target: capture[1].to_string(),
            kind: LinkKind::Navigational,
        });
    }

    // RSS: <enclosure url="..."/> - the entry's media payload
    for capture in enclosure_re().captures_iter(text) {
        links.push(RawLink {
            target: capture[1].to_string(),
            kind: LinkKind::Embedded,
        });
    }

    links
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rss_entries_and_enclosures() {
        let feed = r#"<?xml version="1.0"?>
            <rss version="2.0"><channel>
                <link>https://blog.example/</link>
                <item>
                    <link>https://blog.example/post-1</link>
                    <enclosure url="https://cdn.example/ep1.mp3" type="audio/mpeg"/>
                </item>
            </channel></rss>"#;
        let links = extract(feed);
        let navigational: Vec<&str> = links
            .iter()
            .filter(|l| l.kind == LinkKind::Navigational)
            .map(|l| l.target.as_str())
            .collect();
        let embedded: Vec<&str> = links
            .iter()
            .filter(|l| l.kind == LinkKind::Embedded)
            .map(|l| l.target.as_str())
            .collect();
        assert_eq!(
            navigational,
            ["https://blog.example/", "https://blog.example/post-1"]
        );
        assert_eq!(embedded, ["https://cdn.example/ep1.mp3"]);
    }

    #[test]
    fn test_atom_entry_links() {
        let feed = r#"<feed xmlns="http://www.w3.org/2005/Atom">
            <link href="https://blog.example/feed" rel="self"/>
            <entry><link href="https://blog.example/post-2"/></entry>
        </feed>"#;
        let links = extract(feed);
        let targets: Vec<&str> = links.iter().map(|l| l.target.as_str()).collect();
        assert_eq!(
            targets,
            ["https://blog.example/feed", "https://blog.example/post-2"]
        );
    }

    #[test]
    fn test_not_a_feed_yields_nothing() {
        assert!(extract("plain text, no markup").is_empty());
    }
}
