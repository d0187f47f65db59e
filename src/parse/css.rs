//! CSS link extraction: `url(...)` references and `@import` rules.
//!
//! Everything a stylesheet references is embedded by definition.

use std::sync::OnceLock;

use regex::Regex;

use super::{LinkKind, RawLink};

fn url_function_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // static pattern, exercised by tests
        Regex::new(r#"url\(\s*['"]?([^'")]+?)['"]?\s*\)"#).unwrap()
    })
}

fn import_string_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // static pattern, exercised by tests
        Regex::new(r#"@import\s+['"]([^'"]+)['"]"#).unwrap()
    })
}

/// Extracts raw link candidates from a stylesheet.
#[must_use]
pub(crate) fn extract(text: &str) -> Vec<RawLink> {
    let mut links = Vec::new();
    for capture in url_function_re().captures_iter(text) {
        links.push(RawLink {
            target: capture[1].to_string(),
            kind: LinkKind::Embedded,
        });
    }
    // @import "x.css" has no url() wrapper; @import url(...) was already
    // captured above
    for capture in import_string_re().captures_iter(text) {
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

    fn targets(text: &str) -> Vec<String> {
        extract(text).into_iter().map(|l| l.target).collect()
    }

    #[test]
    fn test_url_function_quoting_variants() {
        let css = r#"
            .a { background: url(/plain.png); }
            .b { background: url('/single.png'); }
            .c { background: url( "/double.png" ); }
        "#;
        assert_eq!(targets(css), ["/plain.png", "/single.png", "/double.png"]);
    }

    #[test]
    fn test_import_forms() {
        let css = r#"
            @import "base.css";
            @import url("theme.css");
            @import 'print.css';
        "#;
        let found = targets(css);
        assert!(found.contains(&"base.css".to_string()));
        assert!(found.contains(&"theme.css".to_string()));
        assert!(found.contains(&"print.css".to_string()));
    }

    #[test]
    fn test_font_face_src() {
        let css = r#"@font-face { src: url(/fonts/a.woff2) format("woff2"); }"#;
        assert_eq!(targets(css), ["/fonts/a.woff2"]);
    }

    #[test]
    fn test_no_links() {
        assert!(targets(".a { color: red }").is_empty());
    }
}
