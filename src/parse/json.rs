//! JSON link extraction: every string value that is a valid absolute
//! http(s) URL counts as an embedded reference.
//!
//! Sites increasingly ship page data as JSON fetched by scripts; archiving
//! the URLs it mentions keeps those pages renderable offline.

use serde_json::Value;
use url::Url;

use super::{LinkKind, RawLink};

/// Extracts raw link candidates from a JSON document.
///
/// Malformed JSON yields no links.
#[must_use]
pub(crate) fn extract(body: &[u8]) -> Vec<RawLink> {
    let Ok(root) = serde_json::from_slice::<Value>(body) else {
        return Vec::new();
    };
    let mut links = Vec::new();
    walk(&root, &mut links);
    links
}

fn walk(value: &Value, links: &mut Vec<RawLink>) {
    match value {
        Value::String(text) => {
            if is_absolute_http_url(text) {
                links.push(RawLink {
                    target: text.clone(),
                    kind: LinkKind::Embedded,
                });
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, links);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                walk(item, links);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

fn is_absolute_http_url(text: &str) -> bool {
    matches!(
        Url::parse(text),
        Ok(url) if matches!(url.scheme(), "http" | "https")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(body: &[u8]) -> Vec<String> {
        extract(body).into_iter().map(|l| l.target).collect()
    }

    #[test]
    fn test_extracts_nested_urls() {
        let body = br#"{
            "image": "https://example.com/a.png",
            "items": [
                {"href": "https://example.com/b"},
                "not a url",
                42
            ],
            "count": 3
        }"#;
        assert_eq!(
            targets(body),
            ["https://example.com/a.png", "https://example.com/b"]
        );
    }

    #[test]
    fn test_ignores_relative_and_other_schemes() {
        let body = br#"["/relative", "ftp://example.com/x", "mailto:a@b"]"#;
        assert!(targets(body).is_empty());
    }

    #[test]
    fn test_malformed_json_yields_nothing() {
        assert!(targets(b"{not json").is_empty());
    }

    #[test]
    fn test_all_links_are_embedded() {
        let links = extract(br#""https://example.com/only""#);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].kind, LinkKind::Embedded);
    }
}
