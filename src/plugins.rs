//! Site-specific URL normalizer plug-ins.
//!
//! Some sites decorate URLs with per-visitor state (session ids, cache
//! busters) that would otherwise split one logical page across many
//! Resources. A [`UrlNormalizerPlugin`] collapses such variants to a single
//! canonical form during URL normalization. Plug-ins may also declare hosts
//! whose URL fragments are significant and must survive normalization.
//!
//! The built-in registry ships normalizers for phpBB forums and WordPress
//! blogs. Embedders can register their own.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;
use url::Url;

/// Rewrites URLs for one family of sites.
pub trait UrlNormalizerPlugin: Send + Sync {
    /// A short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Returns the rewritten URL, or `None` if this plug-in does not apply.
    fn normalize(&self, url: &str) -> Option<String>;

    /// Hosts whose URL fragments are meaningful and must not be stripped.
    fn fragment_significant_hosts(&self) -> &[&str] {
        &[]
    }
}

/// An ordered collection of URL normalizer plug-ins.
///
/// Plug-ins are applied in registration order; each sees the output of the
/// previous one.
pub struct PluginRegistry {
    plugins: Vec<Box<dyn UrlNormalizerPlugin>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field(
                "plugins",
                &self.plugins.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PluginRegistry {
    /// Creates a registry with no plug-ins.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    /// Creates a registry with the built-in plug-ins (phpBB, WordPress).
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            plugins: vec![Box::new(PhpBbNormalizer), Box::new(WordPressNormalizer)],
        }
    }

    /// Registers an additional plug-in at the end of the chain.
    pub fn register(&mut self, plugin: Box<dyn UrlNormalizerPlugin>) {
        self.plugins.push(plugin);
    }

    /// Applies every plug-in in order, yielding each intermediate rewrite.
    ///
    /// A plug-in whose rewrite equals its input contributes nothing.
    #[must_use]
    pub fn normalize_steps(&self, url: &str) -> Vec<String> {
        let mut steps = Vec::new();
        let mut current = url.to_string();
        for plugin in &self.plugins {
            if let Some(rewritten) = plugin.normalize(&current) {
                if rewritten != current {
                    debug!(plugin = plugin.name(), "plug-in rewrote URL");
                    steps.push(rewritten.clone());
                    current = rewritten;
                }
            }
        }
        steps
    }

    /// Returns whether any plug-in declares the host fragment-significant.
    #[must_use]
    pub fn is_fragment_significant(&self, host: &str) -> bool {
        self.plugins
            .iter()
            .any(|plugin| plugin.fragment_significant_hosts().contains(&host))
    }
}

// ------------------------------------------------------------------------------
// phpBB

/// Items per forum index page in stock phpBB.
const FORUM_PAGE_ITEM_COUNT: u64 = 25;

/// Items per topic page in stock phpBB.
const TOPIC_PAGE_ITEM_COUNT: u64 = 20;

/// Normalizer for phpBB forums.
///
/// Strips the per-visitor `sid` session parameter and canonicalizes
/// `viewforum.php` / `viewtopic.php` pagination: a `start` offset that is not
/// a multiple of the page size is rounded down, and incidental parameters
/// are dropped.
pub struct PhpBbNormalizer;

fn phpbb_sid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // static pattern, exercised by tests
        Regex::new(r"^[0-9a-f]{32}$").unwrap()
    })
}

impl UrlNormalizerPlugin for PhpBbNormalizer {
    fn name(&self) -> &'static str {
        "phpbb"
    }

    fn normalize(&self, url: &str) -> Option<String> {
        let parsed = Url::parse(url).ok()?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }

        match parsed.path() {
            "/viewforum.php" => {
                let f = query_int(&parsed, "f")?;
                let start = rounded_start(&parsed, FORUM_PAGE_ITEM_COUNT);
                let mut rebuilt = parsed.clone();
                set_query_pairs(&mut rebuilt, &[("f", Some(f)), ("start", start)]);
                Some(rebuilt.to_string())
            }
            "/viewtopic.php" => {
                let t = query_int(&parsed, "t");
                let p = query_int(&parsed, "p");
                let keyed = match (t, p) {
                    (Some(t), _) => ("t", Some(t)),
                    (None, Some(p)) => ("p", Some(p)),
                    (None, None) => return None,
                };
                let start = rounded_start(&parsed, TOPIC_PAGE_ITEM_COUNT);
                let mut rebuilt = parsed.clone();
                set_query_pairs(&mut rebuilt, &[keyed, ("start", start)]);
                Some(rebuilt.to_string())
            }
            path if path.ends_with(".php") => {
                // __SCRIPT__.php?...&sid=<32 hex digits>: chop off the
                // session id, keep everything else
                let has_sid = parsed
                    .query_pairs()
                    .any(|(k, v)| k == "sid" && phpbb_sid_re().is_match(&v));
                if !has_sid {
                    return None;
                }
                let kept: Vec<(String, String)> = parsed
                    .query_pairs()
                    .filter(|(k, v)| !(k == "sid" && phpbb_sid_re().is_match(v)))
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                let mut rebuilt = parsed.clone();
                if kept.is_empty() {
                    rebuilt.set_query(None);
                } else {
                    rebuilt
                        .query_pairs_mut()
                        .clear()
                        .extend_pairs(kept.iter().map(|(k, v)| (k.as_str(), v.as_str())));
                }
                Some(rebuilt.to_string())
            }
            _ => None,
        }
    }
}

fn query_int(url: &Url, key: &str) -> Option<u64> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.parse().ok())
}

/// Reads `start`, rounds it down to a page boundary, and drops zero.
fn rounded_start(url: &Url, page_size: u64) -> Option<u64> {
    let start = query_int(url, "start")?;
    let rounded = start - (start % page_size);
    if rounded == 0 {
        None
    } else {
        Some(rounded)
    }
}

fn set_query_pairs(url: &mut Url, pairs: &[(&str, Option<u64>)]) {
    let mut serializer = url.query_pairs_mut();
    serializer.clear();
    for (key, value) in pairs {
        if let Some(value) = value {
            serializer.append_pair(key, &value.to_string());
        }
    }
    drop(serializer);
    if url.query() == Some("") {
        url.set_query(None);
    }
}

// ------------------------------------------------------------------------------
// WordPress

/// Normalizer for WordPress blogs.
///
/// Strips `?replytocom=N` (a comment-form deep link that JavaScript would
/// consume anyway) and un-escapes `%2F` runs after `?post_type=` (NextGEN
/// Gallery emits both spellings for the same page).
pub struct WordPressNormalizer;

fn wordpress_replytocom_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // static pattern, exercised by tests
        Regex::new(r"^(https?://[^?]+)\?replytocom=[0-9]+/?$").unwrap()
    })
}

fn wordpress_posttype_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // static pattern, exercised by tests
        Regex::new(r"^(https?://[^?]+\?post_type=[a-zA-Z_]*)((?:/|%2F)*)$").unwrap()
    })
}

impl UrlNormalizerPlugin for WordPressNormalizer {
    fn name(&self) -> &'static str {
        "wordpress"
    }

    fn normalize(&self, url: &str) -> Option<String> {
        if let Some(captures) = wordpress_replytocom_re().captures(url) {
            return Some(captures[1].to_string());
        }

        if let Some(captures) = wordpress_posttype_re().captures(url) {
            return Some(format!("{}{}", &captures[1], captures[2].replace("%2F", "/")));
        }

        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_phpbb_strips_session_id() {
        let plugin = PhpBbNormalizer;
        let rewritten = plugin
            .normalize("https://forum.example/index.php?sid=0123456789abcdef0123456789abcdef")
            .unwrap();
        assert_eq!(rewritten, "https://forum.example/index.php");
    }

    #[test]
    fn test_phpbb_keeps_other_params_when_stripping_sid() {
        let plugin = PhpBbNormalizer;
        let rewritten = plugin
            .normalize(
                "https://forum.example/search.php?q=rust&sid=0123456789abcdef0123456789abcdef",
            )
            .unwrap();
        assert_eq!(rewritten, "https://forum.example/search.php?q=rust");
    }

    #[test]
    fn test_phpbb_ignores_short_sid() {
        let plugin = PhpBbNormalizer;
        assert_eq!(
            plugin.normalize("https://forum.example/index.php?sid=abc"),
            None
        );
    }

    #[test]
    fn test_phpbb_viewforum_rounds_start_down() {
        let plugin = PhpBbNormalizer;
        let rewritten = plugin
            .normalize("https://forum.example/viewforum.php?f=3&start=27&junk=1")
            .unwrap();
        assert_eq!(rewritten, "https://forum.example/viewforum.php?f=3&start=25");
    }

    #[test]
    fn test_phpbb_viewforum_drops_zero_start() {
        let plugin = PhpBbNormalizer;
        let rewritten = plugin
            .normalize("https://forum.example/viewforum.php?f=3&start=0")
            .unwrap();
        assert_eq!(rewritten, "https://forum.example/viewforum.php?f=3");
    }

    #[test]
    fn test_phpbb_viewtopic_prefers_topic_over_post() {
        let plugin = PhpBbNormalizer;
        let rewritten = plugin
            .normalize("https://forum.example/viewtopic.php?t=9&p=55&start=40")
            .unwrap();
        assert_eq!(rewritten, "https://forum.example/viewtopic.php?t=9&start=40");
    }

    #[test]
    fn test_wordpress_strips_replytocom() {
        let plugin = WordPressNormalizer;
        let rewritten = plugin
            .normalize("https://blog.example/post/?replytocom=42")
            .unwrap();
        assert_eq!(rewritten, "https://blog.example/post/");
    }

    #[test]
    fn test_wordpress_unescapes_post_type_slashes() {
        let plugin = WordPressNormalizer;
        let rewritten = plugin
            .normalize("https://blog.example/?post_type=gallery%2F%2F")
            .unwrap();
        assert_eq!(rewritten, "https://blog.example/?post_type=gallery//");
    }

    #[test]
    fn test_registry_applies_plugins_in_order() {
        let registry = PluginRegistry::builtin();
        let steps = registry
            .normalize_steps("https://forum.example/index.php?sid=0123456789abcdef0123456789abcdef");
        assert_eq!(steps, vec!["https://forum.example/index.php".to_string()]);
    }

    #[test]
    fn test_registry_empty_is_inert() {
        let registry = PluginRegistry::empty();
        assert!(registry
            .normalize_steps("https://forum.example/index.php?sid=0123456789abcdef0123456789abcdef")
            .is_empty());
        assert!(!registry.is_fragment_significant("example.com"));
    }

    #[test]
    fn test_fragment_significant_hosts() {
        struct FragmentKeeper;
        impl UrlNormalizerPlugin for FragmentKeeper {
            fn name(&self) -> &'static str {
                "fragment-keeper"
            }
            fn normalize(&self, _url: &str) -> Option<String> {
                None
            }
            fn fragment_significant_hosts(&self) -> &[&str] {
                &["app.example"]
            }
        }

        let mut registry = PluginRegistry::empty();
        registry.register(Box::new(FragmentKeeper));
        assert!(registry.is_fragment_significant("app.example"));
        assert!(!registry.is_fragment_significant("other.example"));
    }
}
