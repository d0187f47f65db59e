//! URL normalization.
//!
//! Every URL that enters the system - typed by the user, discovered by a
//! parser, or probed during a Resource lookup - passes through
//! [`normalize`] so that URL identity is consistent everywhere. The
//! normal form is what gets persisted in the `resource` table.
//!
//! Normalization is cumulative: [`resource_url_alternatives`] returns the
//! progressively-more-normalized forms of a URL, oldest storage convention
//! first. Lookups probe the alternatives in order and reuse the first one
//! that already exists in the project, so archives written by earlier
//! versions keep resolving to the same Resources.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::debug;
use url::Url;

use crate::model::Alias;
use crate::plugins::PluginRegistry;

/// Scheme prefix marking a URL as deliberately external to the archive.
///
/// External URLs are produced by aliases with `target_is_external` set.
/// They never enter the database; the serving layer renders them as
/// redirects to the live web.
pub const EXTERNAL_URL_PREFIX: &str = "crystal://external/";

/// Characters beyond alphanumerics that stay unencoded when re-quoting,
/// '%' included (the input's existing escapes are valid).
const QUOTE_SAFE_WITH_PERCENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'%')
    .remove(b'&')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'+')
    .remove(b',')
    .remove(b'/')
    .remove(b':')
    .remove(b';')
    .remove(b'=')
    .remove(b'?')
    .remove(b'@')
    .remove(b'[')
    .remove(b']')
    .remove(b'~')
    .remove(b'-')
    .remove(b'.')
    .remove(b'_');

/// Same as [`QUOTE_SAFE_WITH_PERCENT`] but '%' is encoded, for inputs whose
/// existing escapes could not be trusted.
const QUOTE_SAFE_WITHOUT_PERCENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'+')
    .remove(b',')
    .remove(b'/')
    .remove(b':')
    .remove(b';')
    .remove(b'=')
    .remove(b'?')
    .remove(b'@')
    .remove(b'[')
    .remove(b']')
    .remove(b'~')
    .remove(b'-')
    .remove(b'.')
    .remove(b'_');

/// The fully-normalized form of a URL, plus whether an alias marked it
/// external.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedUrl {
    /// The canonical URL string. For external URLs this is the
    /// `crystal://external/...` wrapper form.
    pub url: String,
    /// Whether the URL was routed out of the archive by an external alias.
    pub is_external: bool,
}

/// Wraps a live-web URL in the internal external-URL representation.
#[must_use]
pub fn format_external_url(external_url: &str) -> String {
    format!("{EXTERNAL_URL_PREFIX}{external_url}")
}

/// Extracts the live-web URL from an external-URL wrapper, if it is one.
#[must_use]
pub fn parse_external_url(archive_url: &str) -> Option<&str> {
    archive_url.strip_prefix(EXTERNAL_URL_PREFIX)
}

/// Returns whether a (possibly relative) URL can never be rewritten to point
/// into the archive.
#[must_use]
pub fn is_unrewritable_url(relative_url: &str) -> bool {
    ["mailto:", "javascript:", "data:", "tel:"]
        .iter()
        .any(|prefix| relative_url.starts_with(prefix))
}

/// Normalizes a raw URL to its canonical form.
///
/// Applies, in order: whitespace trimming; scheme/host lowercasing and
/// missing-path repair (via a parse cycle); percent-encoding re-quote;
/// fragment stripping (unless the host is fragment-significant per a
/// plug-in); plug-in normalization; and the first matching alias. A URL that
/// cannot be parsed is returned trimmed but otherwise untouched.
#[must_use]
pub fn normalize(raw_url: &str, aliases: &[Alias], plugins: &PluginRegistry) -> NormalizedUrl {
    let alternatives = resource_url_alternatives(raw_url, aliases, plugins);
    // resource_url_alternatives always returns at least the input
    let url = alternatives
        .into_iter()
        .next_back()
        .unwrap_or_else(|| raw_url.trim().to_string());
    let is_external = url.starts_with(EXTERNAL_URL_PREFIX);
    NormalizedUrl { url, is_external }
}

/// Given an original URL, returns a list of alternative URLs that become
/// progressively more normalized, ending with the fully normal form.
///
/// Each alternative corresponds to a way a URL may have been stored by a
/// previous version of the project format. Lookups should prefer the
/// less-normalized versions whenever those already exist in a project;
/// new Resources are saved under the most normalized form.
#[must_use]
pub fn resource_url_alternatives(
    raw_url: &str,
    aliases: &[Alias],
    plugins: &PluginRegistry,
) -> Vec<String> {
    let mut alternatives = Vec::new();

    // Always yield the original URL first
    let original = raw_url.trim().to_string();
    alternatives.push(original.clone());

    // External URLs are already fully normalized
    if original.starts_with(EXTERNAL_URL_PREFIX) {
        return alternatives;
    }

    let Ok(mut parsed) = Url::parse(&original) else {
        return alternatives;
    };

    let mut current = original;

    // Strip the fragment, unless a plug-in declares the host
    // fragment-significant
    if parsed.fragment().is_some() {
        let significant = parsed
            .host_str()
            .is_some_and(|host| plugins.is_fragment_significant(host));
        if !significant {
            parsed.set_fragment(None);
            push_if_changed(&mut alternatives, &mut current, parsed.to_string());
        }
    }

    if matches!(parsed.scheme(), "http" | "https") {
        // The parse cycle lowercases the scheme and host and repairs a
        // missing path to '/'
        push_if_changed(&mut alternatives, &mut current, parsed.to_string());

        // Percent-encode the URL (as per RFC 3986) if it wasn't already
        let requoted = requote_uri(&current);
        push_if_changed(&mut alternatives, &mut current, requoted);
    }

    // Allow plug-ins to normalize URLs further
    for rewritten in plugins.normalize_steps(&current) {
        push_if_changed(&mut alternatives, &mut current, rewritten);
    }

    // Apply user-defined alias-based normalization, after all other
    // normalizations. Only the first matching alias applies.
    for alias in aliases {
        let Some(suffix) = current.strip_prefix(alias.source_url_prefix.as_str()) else {
            continue;
        };
        let mut rewritten = format!("{}{}", alias.target_url_prefix, suffix);
        if alias.target_is_external {
            rewritten = format_external_url(&rewritten);
        }
        if rewritten != current {
            debug!(alias = %alias.source_url_prefix, "applied alias rewrite");
        }
        push_if_changed(&mut alternatives, &mut current, rewritten);
        break;
    }

    alternatives
}

fn push_if_changed(alternatives: &mut Vec<String>, current: &mut String, candidate: String) {
    if candidate != *current {
        alternatives.push(candidate.clone());
        *current = candidate;
    }
}

/// Re-quotes a URI: passes it through an unquote/quote cycle so that it is
/// fully and consistently percent-encoded.
#[must_use]
pub fn requote_uri(uri: &str) -> String {
    match unquote_unreserved(uri) {
        // Unquote only the unreserved characters, then quote only illegal
        // characters (not reserved, unreserved, or '%')
        Ok(unquoted) => utf8_percent_encode(&unquoted, QUOTE_SAFE_WITH_PERCENT).to_string(),
        // The URI has unquotable '%'s; quote them too so they don't cause
        // trouble elsewhere
        Err(InvalidEscape) => utf8_percent_encode(uri, QUOTE_SAFE_WITHOUT_PERCENT).to_string(),
    }
}

struct InvalidEscape;

/// Un-escapes percent-escape sequences that encode unreserved characters
/// (RFC 3986), leaving all reserved, illegal and non-ASCII escapes intact.
fn unquote_unreserved(uri: &str) -> Result<String, InvalidEscape> {
    fn is_unreserved(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
    }

    let mut parts = uri.split('%');
    let mut out = String::with_capacity(uri.len());
    if let Some(first) = parts.next() {
        out.push_str(first);
    }
    for part in parts {
        let hex: String = part.chars().take(2).collect();
        if hex.len() == 2 && hex.chars().all(char::is_alphanumeric) {
            let value = u32::from_str_radix(&hex, 16).map_err(|_| InvalidEscape)?;
            let c = char::from_u32(value).ok_or(InvalidEscape)?;
            if is_unreserved(c) {
                out.push(c);
                out.push_str(&part[hex.len()..]);
            } else {
                out.push('%');
                out.push_str(part);
            }
        } else {
            out.push('%');
            out.push_str(part);
        }
    }
    Ok(out)
}
