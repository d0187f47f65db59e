//! HTML link extraction.
//!
//! Recognitions: `<a href>`, `<link href>` (embedded for stylesheet, icon
//! and preload relations), `<img src|srcset>`, `<source src|srcset>`,
//! `<script src>`, `<frame|iframe src>`, `<form action>`, any element's
//! `background` attribute, `url(...)` inside inline `style` attributes,
//! and `location = '...'` assignments inside `onclick` handlers.

use std::sync::OnceLock;

use regex::Regex;
use scraper::{Html, Selector};

use super::{LinkKind, RawLink};
use crate::project::HtmlParserType;

fn style_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // static pattern, exercised by tests
        Regex::new(r#"url\(\s*['"]?([^'")]+?)['"]?\s*\)"#).unwrap()
    })
}

fn onclick_location_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // static pattern, exercised by tests
        Regex::new(r#"(?:window\.|document\.|top\.|self\.)?location(?:\.href)?\s*=\s*['"]([^'"]+)['"]"#)
            .unwrap()
    })
}

fn selector(css: &str) -> Selector {
    #[allow(clippy::unwrap_used)] // static selectors, exercised by tests
    Selector::parse(css).unwrap()
}

/// Extracts raw link candidates from an HTML document.
///
/// Both parser flavors currently share one implementation; the flavor is
/// accepted so the `html_parser_type` project property stays meaningful to
/// callers.
#[must_use]
pub(crate) fn extract(text: &str, _flavor: HtmlParserType) -> Vec<RawLink> {
    let document = Html::parse_document(text);
    let mut links = Vec::new();

    // <a href> - navigational
    for element in document.select(&selector("a[href]")) {
        if let Some(href) = element.value().attr("href") {
            links.push(RawLink {
                target: href.to_string(),
                kind: LinkKind::Navigational,
            });
        }
    }

    // <link href> - embedded for rendering-relevant relations
    for element in document.select(&selector("link[href]")) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let rel = element.value().attr("rel").unwrap_or_default();
        let embedded = rel
            .split_ascii_whitespace()
            .any(|token| matches!(token.to_ascii_lowercase().as_str(), "stylesheet" | "icon" | "preload" | "shortcut" | "apple-touch-icon"));
        links.push(RawLink {
            target: href.to_string(),
            kind: if embedded {
                LinkKind::Embedded
            } else {
                LinkKind::Navigational
            },
        });
    }

    // <img src|srcset>, <source src|srcset> - embedded
    for element in document.select(&selector("img, source")) {
        if let Some(src) = element.value().attr("src") {
            links.push(RawLink {
                target: src.to_string(),
                kind: LinkKind::Embedded,
            });
        }
        if let Some(srcset) = element.value().attr("srcset") {
            for target in parse_srcset(srcset) {
                links.push(RawLink {
                    target,
                    kind: LinkKind::Embedded,
                });
            }
        }
    }

    // <script src>, <frame src>, <iframe src> - embedded
    for element in document.select(&selector("script[src], frame[src], iframe[src]")) {
        if let Some(src) = element.value().attr("src") {
            links.push(RawLink {
                target: src.to_string(),
                kind: LinkKind::Embedded,
            });
        }
    }

    // <form action> - navigational
    for element in document.select(&selector("form[action]")) {
        if let Some(action) = element.value().attr("action") {
            links.push(RawLink {
                target: action.to_string(),
                kind: LinkKind::Navigational,
            });
        }
    }

    // Legacy background images - embedded
    for element in document.select(&selector("[background]")) {
        if let Some(background) = element.value().attr("background") {
            links.push(RawLink {
                target: background.to_string(),
                kind: LinkKind::Embedded,
            });
        }
    }

    // url(...) inside inline styles - embedded
    for element in document.select(&selector("[style]")) {
        if let Some(style) = element.value().attr("style") {
            for capture in style_url_re().captures_iter(style) {
                links.push(RawLink {
                    target: capture[1].to_string(),
                    kind: LinkKind::Embedded,
                });
            }
        }
    }

    // onclick="location = '...'" - navigational
    for element in document.select(&selector("[onclick]")) {
        if let Some(onclick) = element.value().attr("onclick") {
            for capture in onclick_location_re().captures_iter(onclick) {
                links.push(RawLink {
                    target: capture[1].to_string(),
                    kind: LinkKind::Navigational,
                });
            }
        }
    }

    links
}

/// Splits a `srcset` attribute into its URL components, dropping width and
/// density descriptors.
fn parse_srcset(srcset: &str) -> Vec<String> {
    srcset
        .split(',')
        .filter_map(|entry| {
            entry
                .trim()
                .split_ascii_whitespace()
                .next()
                .map(str::to_string)
        })
        .filter(|url| !url.is_empty())
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn extract_default(text: &str) -> Vec<RawLink> {
        extract(text, HtmlParserType::Soup)
    }

    fn targets_of(links: &[RawLink], kind: LinkKind) -> Vec<&str> {
        links
            .iter()
            .filter(|l| l.kind == kind)
            .map(|l| l.target.as_str())
            .collect()
    }

    #[test]
    fn test_anchor_and_form_are_navigational() {
        let links = extract_default(
            r#"<a href="/page">x</a><form action="/search"><input></form>"#,
        );
        assert_eq!(
            targets_of(&links, LinkKind::Navigational),
            ["/page", "/search"]
        );
    }

    #[test]
    fn test_link_rel_classification() {
        let links = extract_default(
            r#"<link rel="stylesheet" href="/main.css">
               <link rel="icon" href="/favicon.ico">
               <link rel="preload" href="/font.woff2">
               <link rel="canonical" href="/canonical">"#,
        );
        assert_eq!(
            targets_of(&links, LinkKind::Embedded),
            ["/main.css", "/favicon.ico", "/font.woff2"]
        );
        assert_eq!(targets_of(&links, LinkKind::Navigational), ["/canonical"]);
    }

    #[test]
    fn test_img_src_and_srcset() {
        let links = extract_default(
            r#"<img src="/a.png" srcset="/a-1x.png 1x, /a-2x.png 2x">
               <picture><source srcset="/b.webp 800w"></picture>"#,
        );
        assert_eq!(
            targets_of(&links, LinkKind::Embedded),
            ["/a.png", "/a-1x.png", "/a-2x.png", "/b.webp"]
        );
    }

    #[test]
    fn test_script_and_frames_embedded() {
        let links = extract_default(
            r#"<script src="/app.js"></script>
               <iframe src="/embed"></iframe>"#,
        );
        assert_eq!(
            targets_of(&links, LinkKind::Embedded),
            ["/app.js", "/embed"]
        );
    }

    #[test]
    fn test_background_attribute_and_inline_style() {
        let links = extract_default(
            r#"<body background="/bg.gif">
               <div style="background-image: url('/hero.jpg'); color: red"></div>"#,
        );
        assert_eq!(
            targets_of(&links, LinkKind::Embedded),
            ["/bg.gif", "/hero.jpg"]
        );
    }

    #[test]
    fn test_onclick_location_assignment() {
        let links = extract_default(
            r#"<button onclick="window.location = '/next'">Next</button>
               <td onclick="location.href='/cell'">cell</td>"#,
        );
        assert_eq!(
            targets_of(&links, LinkKind::Navigational),
            ["/next", "/cell"]
        );
    }

    #[test]
    fn test_malformed_html_still_yields_links() {
        let links = extract_default(r#"<a href="/ok"><p><img src="/img.png"#);
        assert!(!links.is_empty());
    }

    #[test]
    fn test_parse_srcset_descriptors_dropped() {
        assert_eq!(
            parse_srcset("/a.png 1x, /b.png 2x , /c.png"),
            ["/a.png", "/b.png", "/c.png"]
        );
        assert!(parse_srcset("").is_empty());
    }
}
