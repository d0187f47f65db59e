//! The HTTP fetch half of the download pipeline.
//!
//! A [`Fetcher`] issues one GET per call and stages the response body into
//! a file under the project staging directory, fsynced and ready for the
//! revision write protocol. Fetches never touch the database; the
//! scheduler commits their results.
//!
//! Failures are captured as [`RevisionErrorRecord`]s, not surfaced as
//! `Err`: a failed fetch still produces a revision (an error revision),
//! and errors are stored rather than retried automatically.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};

use crate::http_date;
use crate::model::{RevisionErrorRecord, RevisionMetadata};

/// Time allowed between issuing a request and receiving response headers.
pub const DEFAULT_FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(10);

/// Once a transfer has started there is no overall deadline, but it is
/// aborted if no bytes arrive for this long.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffer size for streaming bodies to disk.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Coarse classification of a download failure, persisted per revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadErrorKind {
    /// The request or transfer timed out or stalled.
    Timeout,
    /// The host name did not resolve.
    Dns,
    /// TLS negotiation or certificate validation failed.
    Tls,
    /// The TCP connection could not be established or broke.
    Connection,
    /// The HTTP exchange itself was malformed.
    Http,
    /// A local I/O failure while staging the body.
    Io,
}

impl DownloadErrorKind {
    /// The wire string stored in revision error records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Dns => "dns",
            Self::Tls => "tls",
            Self::Connection => "connection",
            Self::Http => "http",
            Self::Io => "io",
        }
    }
}

impl std::fmt::Display for DownloadErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies a transport error into the persisted taxonomy.
#[must_use]
pub fn classify_error(error: &reqwest::Error) -> DownloadErrorKind {
    if error.is_timeout() {
        return DownloadErrorKind::Timeout;
    }
    let chain = error_chain_text(error);
    if chain.contains("dns") || chain.contains("resolve") || chain.contains("name or service") {
        return DownloadErrorKind::Dns;
    }
    if chain.contains("certificate")
        || chain.contains("tls")
        || chain.contains("ssl")
        || chain.contains("handshake")
    {
        return DownloadErrorKind::Tls;
    }
    if error.is_connect() {
        return DownloadErrorKind::Connection;
    }
    DownloadErrorKind::Http
}

fn error_chain_text(error: &reqwest::Error) -> String {
    let mut text = error.to_string().to_lowercase();
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(error);
    while let Some(current) = source {
        text.push(' ');
        text.push_str(&current.to_string().to_lowercase());
        source = current.source();
    }
    text
}

/// Configuration for a [`Fetcher`].
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// The User-Agent header sent with every request.
    pub user_agent: String,
    /// Time allowed until response headers arrive.
    pub first_byte_timeout: Duration,
    /// Maximum quiet time on the body stream before aborting.
    pub stall_timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            first_byte_timeout: DEFAULT_FIRST_BYTE_TIMEOUT,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }
}

/// The User-Agent identifying this crate, versioned from the build.
#[must_use]
pub fn default_user_agent() -> String {
    format!(
        "Crystal/{} (website archiver; +https://github.com/crystal-archiver)",
        env!("CARGO_PKG_VERSION")
    )
}

/// Result of one fetch attempt.
///
/// Exactly one of `metadata`/`error` is usually set; both are set when the
/// server responded but the body transfer then failed mid-stream, in which
/// case the error wins and the staged partial body is discarded.
#[derive(Debug)]
pub struct DownloadOutcome {
    /// Response metadata, when headers were received and the body landed.
    pub metadata: Option<RevisionMetadata>,
    /// Failure record, when the fetch did not complete.
    pub error: Option<RevisionErrorRecord>,
    /// Whether a staged body file awaits the revision write protocol.
    pub body_staged: bool,
}

/// HTTP client wrapper that stages response bodies for archival.
///
/// Create once and share; the underlying connection pool is reused across
/// fetches.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    config: FetcherConfig,
}

impl Fetcher {
    /// Builds a fetcher.
    ///
    /// Redirects are not followed: a redirect response is archived as-is,
    /// like any other response, and the serving layer replays it.
    pub fn new(config: FetcherConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .gzip(true)
            .deflate(true)
            .connect_timeout(config.first_byte_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    /// Fetches `url` and streams the body into `staging_path`.
    ///
    /// The staging file is written and fsynced on success and removed on
    /// failure. HTTP error statuses (4xx/5xx) are not failures: the error
    /// page is captured like any other response.
    #[instrument(skip(self, staging_path, request_cookie), fields(url = %url))]
    pub async fn fetch(
        &self,
        url: &str,
        request_cookie: Option<&str>,
        staging_path: &Path,
    ) -> DownloadOutcome {
        debug!("starting fetch");

        let mut request = self.client.get(url);
        if let Some(cookie) = request_cookie {
            request = request.header(reqwest::header::COOKIE, cookie);
        }

        // First-byte timeout covers connect + request + response headers
        let response =
            match tokio::time::timeout(self.config.first_byte_timeout, request.send()).await {
                Ok(Ok(response)) => response,
                Ok(Err(error)) => {
                    return DownloadOutcome {
                        metadata: None,
                        error: Some(RevisionErrorRecord {
                            kind: classify_error(&error),
                            message: error_summary(&error),
                        }),
                        body_staged: false,
                    };
                }
                Err(_) => {
                    return DownloadOutcome {
                        metadata: None,
                        error: Some(RevisionErrorRecord {
                            kind: DownloadErrorKind::Timeout,
                            message: format!(
                                "no response within {:?}",
                                self.config.first_byte_timeout
                            ),
                        }),
                        body_staged: false,
                    };
                }
            };

        let metadata = capture_metadata(&response);

        // Stream the body to the staging file, aborting on stall
        match self.stage_body(response, staging_path).await {
            Ok(bytes) => {
                debug!(bytes, "fetch complete");
                DownloadOutcome {
                    metadata: Some(metadata),
                    error: None,
                    body_staged: true,
                }
            }
            Err(record) => {
                let _ = tokio::fs::remove_file(staging_path).await;
                warn!(error = %record.message, "body transfer failed");
                DownloadOutcome {
                    metadata: None,
                    error: Some(record),
                    body_staged: false,
                }
            }
        }
    }

    async fn stage_body(
        &self,
        response: reqwest::Response,
        staging_path: &Path,
    ) -> Result<u64, RevisionErrorRecord> {
        let file = tokio::fs::File::create(staging_path)
            .await
            .map_err(|e| io_record(staging_path, &e))?;
        let mut writer = BufWriter::with_capacity(COPY_BUFFER_SIZE, file);
        let mut stream = response.bytes_stream();
        let mut bytes_written: u64 = 0;

        loop {
            let chunk = match tokio::time::timeout(self.config.stall_timeout, stream.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(error))) => {
                    return Err(RevisionErrorRecord {
                        kind: classify_error(&error),
                        message: error_summary(&error),
                    });
                }
                Ok(None) => break,
                Err(_) => {
                    return Err(RevisionErrorRecord {
                        kind: DownloadErrorKind::Timeout,
                        message: format!(
                            "transfer stalled for {:?}",
                            self.config.stall_timeout
                        ),
                    });
                }
            };
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| io_record(staging_path, &e))?;
            bytes_written += chunk.len() as u64;
        }

        // Flush and fsync: the staging file must be durable before the
        // revision row commits
        writer
            .flush()
            .await
            .map_err(|e| io_record(staging_path, &e))?;
        writer
            .into_inner()
            .sync_all()
            .await
            .map_err(|e| io_record(staging_path, &e))?;
        Ok(bytes_written)
    }
}

fn io_record(path: &Path, error: &std::io::Error) -> RevisionErrorRecord {
    RevisionErrorRecord {
        kind: DownloadErrorKind::Io,
        message: format!("{}: {error}", path.display()),
    }
}

fn error_summary(error: &reqwest::Error) -> String {
    // The innermost source carries the useful detail ("connection refused",
    // "dns error"); the outer layers just restate the URL
    let mut message = error.to_string();
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(error);
    while let Some(current) = source {
        message = current.to_string();
        source = current.source();
    }
    message
}

fn capture_metadata(response: &reqwest::Response) -> RevisionMetadata {
    let version = response.version();
    let http_version = if version == reqwest::Version::HTTP_09 {
        9
    } else if version == reqwest::Version::HTTP_10 {
        10
    } else if version == reqwest::Version::HTTP_2 {
        20
    } else if version == reqwest::Version::HTTP_3 {
        30
    } else {
        11
    };
    let mut headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    // If the origin omitted Date, record the receipt time (RFC 7231
    // §7.1.1.2)
    if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("date")) {
        headers.push(("Date".to_string(), http_date::format(Utc::now())));
    }

    RevisionMetadata {
        http_version,
        status_code: response.status().as_u16(),
        reason_phrase: response
            .status()
            .canonical_reason()
            .unwrap_or_default()
            .to_string(),
        headers,
    }
}
