//! URL patterns for resource groups.
//!
//! A pattern is a URL with metacharacters:
//!
//! | Token | Matches |
//! |-------|---------|
//! | `*`   | any run of characters without `/`, `?`, `=` or `&` |
//! | `**`  | any suffix |
//! | `#`   | a run of digits |
//! | `@`   | a run of letters |
//!
//! Everything else matches literally. Patterns are anchored at both ends,
//! so `https://xkcd.com/#/` matches `https://xkcd.com/353/` but not
//! `https://xkcd.com/353/info.0.json`.

use regex::Regex;
use thiserror::Error;

/// Errors constructing a [`UrlPattern`].
#[derive(Debug, Error)]
pub enum PatternError {
    /// The pattern string is empty.
    #[error("URL pattern must not be empty")]
    Empty,

    /// The pattern did not compile to a valid matcher.
    #[error("invalid URL pattern {pattern:?}: {source}")]
    Invalid {
        /// The offending pattern.
        pattern: String,
        /// The underlying regex error.
        #[source]
        source: regex::Error,
    },
}

/// A compiled group URL pattern.
///
/// Compilation happens once per group; matching is then a single anchored
/// regex test per URL.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    pattern: String,
    regex: Regex,
    literal_prefix: String,
}

impl UrlPattern {
    /// Compiles a pattern string.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError::Empty`] for an empty pattern and
    /// [`PatternError::Invalid`] if the compiled matcher is rejected.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let mut regex_str = String::with_capacity(pattern.len() + 16);
        regex_str.push('^');
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' if chars.peek() == Some(&'*') => {
                    chars.next();
                    regex_str.push_str("(.*)");
                }
                '*' => regex_str.push_str("([^/?=&]*)"),
                '#' => regex_str.push_str("([0-9]+)"),
                '@' => regex_str.push_str("([a-zA-Z]+)"),
                c => regex_str.push_str(&regex::escape(&c.to_string())),
            }
        }
        regex_str.push('$');

        let regex = Regex::new(&regex_str).map_err(|source| PatternError::Invalid {
            pattern: pattern.to_string(),
            source,
        })?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            literal_prefix: literal_prefix_of(pattern).to_string(),
        })
    }

    /// The original pattern string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Returns whether the URL matches this pattern.
    #[must_use]
    pub fn matches(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }

    /// The longest prefix of the pattern consisting only of literal
    /// characters, possibly empty.
    ///
    /// Every matching URL starts with this prefix, which makes it usable as
    /// a range bound for index scans.
    #[must_use]
    pub fn literal_prefix(&self) -> &str {
        &self.literal_prefix
    }
}

/// Returns the longest metacharacter-free prefix of a pattern string.
fn literal_prefix_of(pattern: &str) -> &str {
    let first_meta = pattern
        .char_indices()
        .find(|(_, c)| matches!(c, '*' | '#' | '@'))
        .map(|(index, _)| index);
    match first_meta {
        Some(index) => &pattern[..index],
        None => pattern,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_pattern_matches_exactly() {
        let pattern = UrlPattern::compile("https://example.com/about").unwrap();
        assert!(pattern.matches("https://example.com/about"));
        assert!(!pattern.matches("https://example.com/about/team"));
        assert!(!pattern.matches("https://example.com/abou"));
    }

    #[test]
    fn test_hash_matches_integers_only() {
        let pattern = UrlPattern::compile("https://xkcd.com/#/").unwrap();
        assert!(pattern.matches("https://xkcd.com/1/"));
        assert!(pattern.matches("https://xkcd.com/1234/"));
        assert!(!pattern.matches("https://xkcd.com/about/"));
        assert!(!pattern.matches("https://xkcd.com//"));
        assert!(!pattern.matches("https://xkcd.com/1/info"));
    }

    #[test]
    fn test_star_stops_at_segment_and_query_chars() {
        let pattern = UrlPattern::compile("https://example.com/post/*").unwrap();
        assert!(pattern.matches("https://example.com/post/hello-world"));
        assert!(pattern.matches("https://example.com/post/"));
        assert!(!pattern.matches("https://example.com/post/a/b"));
        assert!(!pattern.matches("https://example.com/post/a?x=1"));
    }

    #[test]
    fn test_double_star_matches_any_suffix() {
        let pattern = UrlPattern::compile("https://example.com/**").unwrap();
        assert!(pattern.matches("https://example.com/"));
        assert!(pattern.matches("https://example.com/a/b/c?d=e#f"));
        assert!(!pattern.matches("https://other.example.com/"));
    }

    #[test]
    fn test_at_matches_letters_only() {
        let pattern = UrlPattern::compile("https://example.com/tag/@/").unwrap();
        assert!(pattern.matches("https://example.com/tag/rust/"));
        assert!(!pattern.matches("https://example.com/tag/rust2/"));
        assert!(!pattern.matches("https://example.com/tag//"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let pattern = UrlPattern::compile("https://example.com/a.b?c=d").unwrap();
        assert!(pattern.matches("https://example.com/a.b?c=d"));
        assert!(!pattern.matches("https://example.com/aXb?c=d"));
    }

    #[test]
    fn test_literal_prefix() {
        let pattern = UrlPattern::compile("https://xkcd.com/#/").unwrap();
        assert_eq!(pattern.literal_prefix(), "https://xkcd.com/");

        let pattern = UrlPattern::compile("https://example.com/about").unwrap();
        assert_eq!(pattern.literal_prefix(), "https://example.com/about");

        let pattern = UrlPattern::compile("**").unwrap();
        assert_eq!(pattern.literal_prefix(), "");
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert!(matches!(
            UrlPattern::compile(""),
            Err(PatternError::Empty)
        ));
    }
}
