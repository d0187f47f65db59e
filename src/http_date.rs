//! HTTP-date formatting and parsing (RFC 7231 §7.1.1.1).
//!
//! Revision metadata stores response headers verbatim; when an origin server
//! omits the `Date` header the download pipeline appends one in the IMF-fixdate
//! format produced here.

use chrono::{DateTime, Utc};

/// Formats a datetime as an IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
#[must_use]
pub fn format(datetime: DateTime<Utc>) -> String {
    datetime.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parses an HTTP-date header value.
///
/// Accepts the preferred IMF-fixdate form as well as the obsolete RFC 850
/// and asctime forms that RFC 7231 requires recipients to accept.
/// Returns `None` if the value is not a recognizable date.
#[must_use]
pub fn parse(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    // IMF-fixdate and RFC 850 are both close enough to RFC 2822 for chrono,
    // modulo the "GMT" suffix it already understands.
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    // asctime: "Sun Nov  6 08:49:37 1994"
    if let Ok(parsed) =
        chrono::NaiveDateTime::parse_from_str(value, "%a %b %e %H:%M:%S %Y")
    {
        return Some(parsed.and_utc());
    }

    None
}
