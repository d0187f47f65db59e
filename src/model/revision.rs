//! Revisions: concrete fetches of a Resource.
//!
//! A Revision row holds the response metadata and error record as JSON
//! text; the body bytes live outside the database, in the revisions tree,
//! keyed by the revision id (see [`crate::project::layout`]). A revision
//! with an error, or with an empty body, has no body file at all.
//!
//! # Durability
//!
//! The write protocol publishes a revision in this order:
//!
//! 1. the body is streamed into a staging file under `tmp/` and fsynced,
//! 2. the row is inserted and committed,
//! 3. the staging file is renamed to its final path and the parent
//!    directory fsynced.
//!
//! A failure after the commit triggers a rollback DELETE of the row. If
//! even the rollback fails (disk yanked mid-write), the next writable open
//! repairs the orphaned row - see the project open sequence.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::download::DownloadErrorKind;
use crate::model::ResourceId;
use crate::project::{layout, Project, ProjectError};

/// Identifier of a [`Revision`]. Gapless autoincrement across the project.
pub type RevisionId = i64;

/// Response metadata captured from a fetch.
///
/// Serialized to the `metadata` column as
/// `{"http_version":11,"status_code":200,"reason_phrase":"OK","headers":[["k","v"],...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionMetadata {
    /// HTTP version as reported by the transport: 10 or 11.
    pub http_version: u32,
    /// Response status code.
    pub status_code: u16,
    /// Response reason phrase; empty when the transport elides it.
    pub reason_phrase: String,
    /// Response headers in wire order, name case preserved.
    pub headers: Vec<(String, String)>,
}

impl RevisionMetadata {
    /// The first value of the named header, case-insensitively.
    #[must_use]
    pub fn first_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A download error persisted with a revision.
///
/// Serialized to the `error` column; the literal string `null` means the
/// fetch succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionErrorRecord {
    /// Coarse failure classification.
    pub kind: DownloadErrorKind,
    /// Human-readable detail.
    pub message: String,
}

/// One concrete fetch of a Resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    /// Stable identifier, monotonically increasing across the project.
    pub id: RevisionId,
    /// The owning Resource.
    pub resource_id: ResourceId,
    /// Cookie header sent with the request, if any.
    pub request_cookie: Option<String>,
    /// Error captured during the fetch; `None` means success.
    pub error: Option<RevisionErrorRecord>,
    /// Response metadata; `None` for non-HTTP fetch failures.
    pub metadata: Option<RevisionMetadata>,
}

impl Revision {
    /// Whether a body is expected for this revision (it may still be empty,
    /// in which case no body file exists).
    #[must_use]
    pub fn has_body(&self) -> bool {
        self.error.is_none()
    }

    /// The HTTP status code, if metadata was captured.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        self.metadata.as_ref().map(|m| m.status_code)
    }

    /// Whether the response was an HTTP error page (4xx/5xx).
    #[must_use]
    pub fn is_http_error_page(&self) -> bool {
        self.status_code().is_some_and(|code| code >= 400)
    }

    /// The declared content type without parameters, e.g. `text/html`.
    #[must_use]
    pub fn content_type(&self) -> Option<String> {
        self.metadata.as_ref().and_then(|m| {
            m.first_header("content-type")
                .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase())
        })
    }

    /// The declared charset, e.g. `utf-8`.
    #[must_use]
    pub fn declared_charset(&self) -> Option<String> {
        self.metadata.as_ref().and_then(|m| {
            m.first_header("content-type").and_then(|v| {
                v.split(';').skip(1).find_map(|param| {
                    let (key, value) = param.split_once('=')?;
                    if key.trim().eq_ignore_ascii_case("charset") {
                        Some(value.trim().trim_matches('"').to_ascii_lowercase())
                    } else {
                        None
                    }
                })
            })
        })
    }

    /// The response `Date` header, parsed.
    #[must_use]
    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .as_ref()
            .and_then(|m| m.first_header("date"))
            .and_then(crate::http_date::parse)
    }
}

/// Errors reading or writing revisions.
#[derive(Debug, Error)]
pub enum RevisionError {
    /// The revision recorded an error; no body was ever expected.
    #[error("revision {revision_id} has no body (fetch failed)")]
    NoBody {
        /// The revision in question.
        revision_id: RevisionId,
    },

    /// A body was expected but its file is absent.
    ///
    /// Callers may translate this into a re-download.
    #[error("revision {revision_id} body file is missing")]
    BodyMissing {
        /// The revision in question.
        revision_id: RevisionId,
    },

    /// No revision with the given id exists.
    #[error("revision {revision_id} not found")]
    NotFound {
        /// The requested id.
        revision_id: RevisionId,
    },

    /// The revision id space of the body layout is exhausted.
    #[error("project cannot hold more revisions")]
    TooManyRevisions,

    /// An underlying project/store failure.
    #[error(transparent)]
    Project(#[from] ProjectError),
}

impl From<sqlx::Error> for RevisionError {
    fn from(error: sqlx::Error) -> Self {
        Self::Project(error.into())
    }
}

pub(crate) fn encode_error(error: Option<&RevisionErrorRecord>) -> String {
    serde_json::to_string(&error).unwrap_or_else(|_| "null".to_string())
}

pub(crate) fn encode_metadata(metadata: Option<&RevisionMetadata>) -> String {
    serde_json::to_string(&metadata).unwrap_or_else(|_| "null".to_string())
}

fn decode_row(
    id: i64,
    resource_id: i64,
    request_cookie: Option<String>,
    error: &str,
    metadata: &str,
) -> Result<Revision, ProjectError> {
    Ok(Revision {
        id,
        resource_id: ResourceId(resource_id),
        request_cookie,
        error: serde_json::from_str(error)?,
        metadata: serde_json::from_str(metadata)?,
    })
}

impl Project {
    /// Persists a revision using the durable write protocol.
    ///
    /// `staged_body` must be a file under the project staging directory
    /// whose contents are already flushed to stable storage. It is consumed:
    /// renamed into the revisions tree on success, deleted otherwise. An
    /// empty staging file publishes no body file.
    ///
    /// The scheduler serializes calls per project; this method assumes it
    /// is not racing another writer.
    #[instrument(skip(self, error, metadata, staged_body), fields(resource_id = %resource_id))]
    pub async fn commit_revision(
        &self,
        resource_id: ResourceId,
        request_cookie: Option<&str>,
        error: Option<&RevisionErrorRecord>,
        metadata: Option<&RevisionMetadata>,
        staged_body: Option<&Path>,
    ) -> Result<Revision, RevisionError> {
        self.ensure_writable().map_err(RevisionError::Project)?;
        if resource_id.is_unsaved() {
            return Err(RevisionError::Project(ProjectError::EntityNotFound {
                what: format!("persisted resource {resource_id}"),
            }));
        }

        // Insert the row (metadata and error) and commit
        let id = sqlx::query(
            "INSERT INTO resource_revision (resource_id, request_cookie, error, metadata) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(resource_id.0)
        .bind(request_cookie)
        .bind(encode_error(error))
        .bind(encode_metadata(metadata))
        .execute(self.db().pool())
        .await?
        .last_insert_rowid();

        if self.major_version() >= 2 && id > layout::MAX_V2_REVISION_ID {
            self.rollback_revision_row(id).await;
            if let Some(staged) = staged_body {
                let _ = tokio::fs::remove_file(staged).await;
            }
            return Err(RevisionError::TooManyRevisions);
        }

        // Publish the body: rename staging file to its final path and flush
        // the rename
        if let Some(staged) = staged_body {
            let publish_result = self.publish_staged_body(staged, id).await;
            if let Err(error) = publish_result {
                // Rename failed after the commit: roll the row back
                self.rollback_revision_row(id).await;
                let _ = tokio::fs::remove_file(staged).await;
                return Err(RevisionError::Project(error));
            }
        }

        debug!(revision_id = id, "committed revision");
        Ok(Revision {
            id,
            resource_id,
            request_cookie: request_cookie.map(str::to_string),
            error: error.cloned(),
            metadata: metadata.cloned(),
        })
    }

    async fn publish_staged_body(
        &self,
        staged: &Path,
        revision_id: RevisionId,
    ) -> Result<(), ProjectError> {
        let size = tokio::fs::metadata(staged)
            .await
            .map_err(|e| ProjectError::io(staged, e))?
            .len();
        if size == 0 {
            // Empty bodies publish no file
            tokio::fs::remove_file(staged)
                .await
                .map_err(|e| ProjectError::io(staged, e))?;
            return Ok(());
        }

        let final_path = self.revision_body_path(revision_id);
        match tokio::fs::rename(staged, &final_path).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                // Missing parent directory; create it and retry
                let parent = final_path.parent().ok_or_else(|| {
                    ProjectError::io(
                        &final_path,
                        std::io::Error::new(std::io::ErrorKind::NotFound, "no parent directory"),
                    )
                })?;
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ProjectError::io(parent, e))?;
                tokio::fs::rename(staged, &final_path)
                    .await
                    .map_err(|e| ProjectError::io(&final_path, e))?;
            }
            Err(error) => return Err(ProjectError::io(&final_path, error)),
        }

        if let Some(parent) = final_path.parent() {
            layout::fsync_dir(parent).map_err(|e| ProjectError::io(parent, e))?;
        }
        Ok(())
    }

    /// Best-effort rollback of a committed revision row.
    async fn rollback_revision_row(&self, revision_id: RevisionId) {
        let result = sqlx::query("DELETE FROM resource_revision WHERE id = ?")
            .bind(revision_id)
            .execute(self.db().pool())
            .await;
        if let Err(error) = result {
            // The next writable open repairs this orphan
            warn!(revision_id, %error, "revision rollback failed");
        }
    }

    /// Convenience: stages `body` into the staging directory and commits a
    /// successful revision.
    pub async fn create_revision_from_bytes(
        &self,
        resource_id: ResourceId,
        metadata: &RevisionMetadata,
        body: &[u8],
        request_cookie: Option<&str>,
    ) -> Result<Revision, RevisionError> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

        self.ensure_writable().map_err(RevisionError::Project)?;
        let sequence = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
        let staged = self
            .temporary_dir()
            .join(format!("rev-{resource_id}-{sequence}.body"));
        tokio::fs::write(&staged, body)
            .await
            .map_err(|e| RevisionError::Project(ProjectError::io(&staged, e)))?;
        let file = tokio::fs::File::open(&staged)
            .await
            .map_err(|e| RevisionError::Project(ProjectError::io(&staged, e)))?;
        file.sync_all()
            .await
            .map_err(|e| RevisionError::Project(ProjectError::io(&staged, e)))?;
        self.commit_revision(resource_id, request_cookie, None, Some(metadata), Some(&staged))
            .await
    }

    /// Commits an error-only revision (no body).
    pub async fn create_error_revision(
        &self,
        resource_id: ResourceId,
        error: &RevisionErrorRecord,
        metadata: Option<&RevisionMetadata>,
        request_cookie: Option<&str>,
    ) -> Result<Revision, RevisionError> {
        self.commit_revision(resource_id, request_cookie, Some(error), metadata, None)
            .await
    }

    /// Loads a revision by id.
    pub async fn get_revision(
        &self,
        revision_id: RevisionId,
    ) -> Result<Option<Revision>, ProjectError> {
        let row: Option<(i64, i64, Option<String>, String, String)> = sqlx::query_as(
            "SELECT id, resource_id, request_cookie, error, metadata \
             FROM resource_revision WHERE id = ?",
        )
        .bind(revision_id)
        .fetch_optional(self.db().pool())
        .await?;
        row.map(|(id, resource_id, cookie, error, metadata)| {
            decode_row(id, resource_id, cookie, &error, &metadata)
        })
        .transpose()
    }

    /// All revisions of a Resource, oldest first.
    pub async fn revisions_of(
        &self,
        resource_id: ResourceId,
    ) -> Result<Vec<Revision>, ProjectError> {
        let rows: Vec<(i64, i64, Option<String>, String, String)> = sqlx::query_as(
            "SELECT id, resource_id, request_cookie, error, metadata \
             FROM resource_revision WHERE resource_id = ? ORDER BY id ASC",
        )
        .bind(resource_id.0)
        .fetch_all(self.db().pool())
        .await?;
        rows.into_iter()
            .map(|(id, rid, cookie, error, metadata)| {
                decode_row(id, rid, cookie, &error, &metadata)
            })
            .collect()
    }

    /// The Default Revision of a Resource: the most recent non-error
    /// revision, ties broken by largest id.
    pub async fn default_revision(
        &self,
        resource_id: ResourceId,
    ) -> Result<Option<Revision>, ProjectError> {
        let row: Option<(i64, i64, Option<String>, String, String)> = sqlx::query_as(
            "SELECT id, resource_id, request_cookie, error, metadata \
             FROM resource_revision \
             WHERE resource_id = ? AND error = 'null' \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(resource_id.0)
        .fetch_optional(self.db().pool())
        .await?;
        row.map(|(id, rid, cookie, error, metadata)| {
            decode_row(id, rid, cookie, &error, &metadata)
        })
        .transpose()
    }

    /// Opens a revision's body for reading.
    ///
    /// Returns [`RevisionError::NoBody`] for error revisions and
    /// [`RevisionError::BodyMissing`] when the body file is absent (empty
    /// body, or orphaned by a crash).
    pub async fn open_revision_body(
        &self,
        revision: &Revision,
    ) -> Result<tokio::fs::File, RevisionError> {
        if !revision.has_body() {
            return Err(RevisionError::NoBody {
                revision_id: revision.id,
            });
        }
        let path = self.revision_body_path(revision.id);
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(RevisionError::BodyMissing {
                    revision_id: revision.id,
                })
            }
            Err(error) => Err(RevisionError::Project(ProjectError::io(&path, error))),
        }
    }

    /// Reads a revision's entire body into memory.
    ///
    /// An empty body (which has no file) reads as an empty buffer.
    pub async fn read_revision_body(&self, revision: &Revision) -> Result<Vec<u8>, RevisionError> {
        use tokio::io::AsyncReadExt;
        match self.open_revision_body(revision).await {
            Ok(mut file) => {
                let mut buffer = Vec::new();
                file.read_to_end(&mut buffer)
                    .await
                    .map_err(|e| {
                        RevisionError::Project(ProjectError::io(
                            self.revision_body_path(revision.id),
                            e,
                        ))
                    })?;
                Ok(buffer)
            }
            Err(RevisionError::BodyMissing { .. })
                if revision
                    .metadata
                    .as_ref()
                    .and_then(|m| m.first_header("content-length"))
                    .and_then(|v| v.parse::<u64>().ok())
                    == Some(0) =>
            {
                // Declared-empty body legitimately has no file
                Ok(Vec::new())
            }
            Err(error) => Err(error),
        }
    }

    /// Deletes a revision row and its body file.
    pub async fn delete_revision(&self, revision_id: RevisionId) -> Result<(), ProjectError> {
        self.ensure_writable()?;
        sqlx::query("DELETE FROM resource_revision WHERE id = ?")
            .bind(revision_id)
            .execute(self.db().pool())
            .await?;
        let body = self.revision_body_path(revision_id);
        match tokio::fs::remove_file(&body).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(ProjectError::io(&body, error)),
        }
    }

    /// The number of persisted revisions.
    pub async fn revision_count(&self) -> Result<i64, ProjectError> {
        Ok(sqlx::query_scalar("SELECT count(1) FROM resource_revision")
            .fetch_one(self.db().pool())
            .await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::project::OpenOptions;
    use tempfile::TempDir;

    fn ok_metadata() -> RevisionMetadata {
        RevisionMetadata {
            http_version: 11,
            status_code: 200,
            reason_phrase: "OK".to_string(),
            headers: vec![
                ("Content-Type".to_string(), "text/html; charset=UTF-8".to_string()),
                ("Date".to_string(), "Sun, 06 Nov 1994 08:49:37 GMT".to_string()),
            ],
        }
    }

    async fn project_with_resource(temp: &TempDir) -> (Project, ResourceId) {
        let project =
            Project::create(temp.path().join("test.crystalproj"), OpenOptions::default())
                .await
                .unwrap();
        let resource = project
            .get_or_create_resource("https://example.com/")
            .await
            .unwrap();
        (project, resource.id)
    }

    #[test]
    fn test_error_and_metadata_encoding() {
        assert_eq!(encode_error(None), "null");
        assert_eq!(encode_metadata(None), "null");

        let error = RevisionErrorRecord {
            kind: DownloadErrorKind::Timeout,
            message: "timed out".to_string(),
        };
        let encoded = encode_error(Some(&error));
        assert_eq!(encoded, r#"{"kind":"timeout","message":"timed out"}"#);
        let decoded: Option<RevisionErrorRecord> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, Some(error));

        let metadata = ok_metadata();
        let encoded = encode_metadata(Some(&metadata));
        assert!(encoded.contains(r#""status_code":200"#));
        assert!(encoded.contains(r#"["Content-Type","text/html; charset=UTF-8"]"#));
        let decoded: Option<RevisionMetadata> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, Some(metadata));
    }

    #[test]
    fn test_revision_header_helpers() {
        let revision = Revision {
            id: 1,
            resource_id: ResourceId(1),
            request_cookie: None,
            error: None,
            metadata: Some(ok_metadata()),
        };
        assert_eq!(revision.status_code(), Some(200));
        assert!(!revision.is_http_error_page());
        assert_eq!(revision.content_type().as_deref(), Some("text/html"));
        assert_eq!(revision.declared_charset().as_deref(), Some("utf-8"));
        assert!(revision.date().is_some());
    }

    #[tokio::test]
    async fn test_commit_and_read_round_trip() {
        let temp = TempDir::new().unwrap();
        let (project, resource_id) = project_with_resource(&temp).await;

        let revision = project
            .create_revision_from_bytes(resource_id, &ok_metadata(), b"<html>hi</html>", None)
            .await
            .unwrap();
        assert!(revision.id >= 1);
        assert!(revision.has_body());

        let body_path = project.revision_body_path(revision.id);
        assert!(body_path.is_file(), "body not published at {body_path:?}");

        let body = project.read_revision_body(&revision).await.unwrap();
        assert_eq!(body, b"<html>hi</html>");

        // Staging area left clean
        let staged: Vec<_> = std::fs::read_dir(project.temporary_dir())
            .unwrap()
            .collect();
        assert!(staged.is_empty(), "staging not cleaned: {staged:?}");
        project.close().await;
    }

    #[tokio::test]
    async fn test_empty_body_publishes_no_file() {
        let temp = TempDir::new().unwrap();
        let (project, resource_id) = project_with_resource(&temp).await;

        let mut metadata = ok_metadata();
        metadata
            .headers
            .push(("Content-Length".to_string(), "0".to_string()));
        let revision = project
            .create_revision_from_bytes(resource_id, &metadata, b"", None)
            .await
            .unwrap();

        assert!(!project.revision_body_path(revision.id).exists());
        let body = project.read_revision_body(&revision).await.unwrap();
        assert!(body.is_empty());
        project.close().await;
    }

    #[tokio::test]
    async fn test_error_revision_has_no_body() {
        let temp = TempDir::new().unwrap();
        let (project, resource_id) = project_with_resource(&temp).await;

        let error = RevisionErrorRecord {
            kind: DownloadErrorKind::Dns,
            message: "name not resolved".to_string(),
        };
        let revision = project
            .create_error_revision(resource_id, &error, None, None)
            .await
            .unwrap();
        assert!(!revision.has_body());

        let result = project.open_revision_body(&revision).await;
        assert!(matches!(result, Err(RevisionError::NoBody { .. })));

        // Error revisions are still queryable
        let loaded = project.get_revision(revision.id).await.unwrap().unwrap();
        assert_eq!(loaded.error, Some(error));
        project.close().await;
    }

    #[tokio::test]
    async fn test_default_revision_skips_errors_and_prefers_latest() {
        let temp = TempDir::new().unwrap();
        let (project, resource_id) = project_with_resource(&temp).await;

        let first = project
            .create_revision_from_bytes(resource_id, &ok_metadata(), b"v1", None)
            .await
            .unwrap();
        let second = project
            .create_revision_from_bytes(resource_id, &ok_metadata(), b"v2", None)
            .await
            .unwrap();
        project
            .create_error_revision(
                resource_id,
                &RevisionErrorRecord {
                    kind: DownloadErrorKind::Connection,
                    message: "refused".to_string(),
                },
                None,
                None,
            )
            .await
            .unwrap();

        let default = project
            .default_revision(resource_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(default.id, second.id);
        assert!(default.id > first.id);
        project.close().await;
    }

    #[tokio::test]
    async fn test_missing_body_surfaces_body_missing() {
        let temp = TempDir::new().unwrap();
        let (project, resource_id) = project_with_resource(&temp).await;

        let revision = project
            .create_revision_from_bytes(resource_id, &ok_metadata(), b"data", None)
            .await
            .unwrap();
        std::fs::remove_file(project.revision_body_path(revision.id)).unwrap();

        let result = project.open_revision_body(&revision).await;
        assert!(matches!(result, Err(RevisionError::BodyMissing { .. })));
        project.close().await;
    }

    #[tokio::test]
    async fn test_revision_ids_strictly_increase() {
        let temp = TempDir::new().unwrap();
        let (project, resource_id) = project_with_resource(&temp).await;

        let mut last_id = 0;
        for index in 0..5 {
            let revision = project
                .create_revision_from_bytes(
                    resource_id,
                    &ok_metadata(),
                    format!("body {index}").as_bytes(),
                    None,
                )
                .await
                .unwrap();
            assert!(revision.id > last_id);
            last_id = revision.id;
        }
        project.close().await;
    }

    #[tokio::test]
    async fn test_delete_revision_removes_row_and_body() {
        let temp = TempDir::new().unwrap();
        let (project, resource_id) = project_with_resource(&temp).await;

        let revision = project
            .create_revision_from_bytes(resource_id, &ok_metadata(), b"bye", None)
            .await
            .unwrap();
        project.delete_revision(revision.id).await.unwrap();

        assert!(project.get_revision(revision.id).await.unwrap().is_none());
        assert!(!project.revision_body_path(revision.id).exists());
        project.close().await;
    }

    #[tokio::test]
    async fn test_request_cookie_persisted() {
        let temp = TempDir::new().unwrap();
        let (project, resource_id) = project_with_resource(&temp).await;

        let revision = project
            .create_revision_from_bytes(
                resource_id,
                &ok_metadata(),
                b"x",
                Some("session=abc123"),
            )
            .await
            .unwrap();
        let loaded = project.get_revision(revision.id).await.unwrap().unwrap();
        assert_eq!(loaded.request_cookie.as_deref(), Some("session=abc123"));
        project.close().await;
    }
}
