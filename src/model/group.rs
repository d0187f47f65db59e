//! Resource Groups: named URL patterns with derived membership.
//!
//! A group's membership is never stored; it is the set of Resources whose
//! URL matches the group's pattern, recomputed on demand. Three strategies
//! serve the computation, picked per query:
//!
//! - the in-memory URL index, when loaded (a `BTreeMap` range scan bounded
//!   by the pattern's literal prefix),
//! - an indexed database range scan, when the pattern has a literal prefix,
//! - a streaming full-table scan otherwise.
//!
//! Membership is exposed as a lazy, restartable [`MemberCursor`]; the first
//! [`EAGER_MEMBER_COUNT`] members are materialized eagerly to drive UIs.

use std::collections::VecDeque;

use tracing::{debug, instrument};

use crate::model::{Resource, ResourceId};
use crate::pattern::UrlPattern;
use crate::project::{Project, ProjectError};

/// Members materialized eagerly when a cursor is created.
pub const EAGER_MEMBER_COUNT: usize = 100;

/// Rows fetched per database round-trip while scanning membership.
const SCAN_BATCH_SIZE: usize = 500;

/// The "source" of a group: downloading the source is asserted to reveal
/// all of the group's members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupSource {
    /// No source.
    #[default]
    None,
    /// A Root Resource by id.
    Root(i64),
    /// Another group by id.
    Group(i64),
}

impl GroupSource {
    fn to_columns(self) -> (Option<&'static str>, Option<i64>) {
        match self {
            Self::None => (None, None),
            Self::Root(id) => (Some("root_resource"), Some(id)),
            Self::Group(id) => (Some("resource_group"), Some(id)),
        }
    }

    fn from_columns(source_type: Option<&str>, source_id: Option<i64>) -> Self {
        match (source_type, source_id) {
            (Some("root_resource"), Some(id)) => Self::Root(id),
            (Some("resource_group"), Some(id)) => Self::Group(id),
            _ => Self::None,
        }
    }
}

/// A named URL pattern.
#[derive(Debug, Clone)]
pub struct ResourceGroup {
    /// Stable identifier.
    pub id: i64,
    /// Display name. Possibly empty.
    pub name: String,
    /// The membership pattern.
    pub pattern: UrlPattern,
    /// Where new members are expected to be discovered.
    pub source: GroupSource,
    /// Members of this group are excluded from automatic embedded-resource
    /// downloads.
    pub do_not_download: bool,
}

impl ResourceGroup {
    /// Whether the URL belongs to this group.
    #[must_use]
    pub fn contains_url(&self, url: &str) -> bool {
        self.pattern.matches(url)
    }

    /// The name shown in UIs: the display name, or the pattern when
    /// unnamed.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.pattern.as_str()
        } else {
            &self.name
        }
    }
}

impl Project {
    /// Creates a group.
    ///
    /// The pattern must be non-empty and compile; the source, when given,
    /// must exist and must not introduce a source cycle.
    #[instrument(skip(self))]
    pub async fn create_resource_group(
        &self,
        name: &str,
        url_pattern: &str,
        source: GroupSource,
        do_not_download: bool,
    ) -> Result<ResourceGroup, ProjectError> {
        self.ensure_writable()?;
        let pattern = UrlPattern::compile(url_pattern)?;
        self.validate_group_source(source, None).await?;

        let (source_type, source_id) = source.to_columns();
        let id = sqlx::query(
            "INSERT INTO resource_group (name, url_pattern, source_type, source_id, do_not_download) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(url_pattern)
        .bind(source_type)
        .bind(source_id)
        .bind(i64::from(do_not_download))
        .execute(self.db().pool())
        .await?
        .last_insert_rowid();

        debug!(id, url_pattern, "created resource group");
        Ok(ResourceGroup {
            id,
            name: name.to_string(),
            pattern,
            source,
            do_not_download,
        })
    }

    /// All groups, in creation order.
    pub async fn resource_groups(&self) -> Result<Vec<ResourceGroup>, ProjectError> {
        let rows: Vec<(i64, String, String, Option<String>, Option<i64>, i64)> = sqlx::query_as(
            "SELECT id, name, url_pattern, source_type, source_id, do_not_download \
             FROM resource_group ORDER BY id",
        )
        .fetch_all(self.db().pool())
        .await?;
        rows.into_iter()
            .map(|(id, name, url_pattern, source_type, source_id, dnd)| {
                Ok(ResourceGroup {
                    id,
                    name,
                    pattern: UrlPattern::compile(&url_pattern)?,
                    source: GroupSource::from_columns(source_type.as_deref(), source_id),
                    do_not_download: dnd != 0,
                })
            })
            .collect()
    }

    /// Loads a group by id.
    pub async fn get_resource_group(
        &self,
        id: i64,
    ) -> Result<Option<ResourceGroup>, ProjectError> {
        let row: Option<(String, String, Option<String>, Option<i64>, i64)> = sqlx::query_as(
            "SELECT name, url_pattern, source_type, source_id, do_not_download \
             FROM resource_group WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.db().pool())
        .await?;
        row.map(|(name, url_pattern, source_type, source_id, dnd)| {
            Ok(ResourceGroup {
                id,
                name,
                pattern: UrlPattern::compile(&url_pattern)?,
                source: GroupSource::from_columns(source_type.as_deref(), source_id),
                do_not_download: dnd != 0,
            })
        })
        .transpose()
    }

    /// Changes a group's source, refusing cycles.
    #[instrument(skip(self))]
    pub async fn set_group_source(
        &self,
        group_id: i64,
        source: GroupSource,
    ) -> Result<(), ProjectError> {
        self.ensure_writable()?;
        self.validate_group_source(source, Some(group_id)).await?;

        let (source_type, source_id) = source.to_columns();
        let done = sqlx::query(
            "UPDATE resource_group SET source_type = ?, source_id = ? WHERE id = ?",
        )
        .bind(source_type)
        .bind(source_id)
        .bind(group_id)
        .execute(self.db().pool())
        .await?;
        if done.rows_affected() == 0 {
            return Err(ProjectError::EntityNotFound {
                what: format!("resource group {group_id}"),
            });
        }
        Ok(())
    }

    /// Changes a group's do-not-download flag.
    pub async fn set_group_do_not_download(
        &self,
        group_id: i64,
        do_not_download: bool,
    ) -> Result<(), ProjectError> {
        self.ensure_writable()?;
        sqlx::query("UPDATE resource_group SET do_not_download = ? WHERE id = ?")
            .bind(i64::from(do_not_download))
            .bind(group_id)
            .execute(self.db().pool())
            .await?;
        Ok(())
    }

    /// Renames a group.
    pub async fn rename_resource_group(
        &self,
        group_id: i64,
        name: &str,
    ) -> Result<(), ProjectError> {
        self.ensure_writable()?;
        sqlx::query("UPDATE resource_group SET name = ? WHERE id = ?")
            .bind(name)
            .bind(group_id)
            .execute(self.db().pool())
            .await?;
        Ok(())
    }

    /// Deletes a group. Groups sourced from it fall back to no source.
    #[instrument(skip(self))]
    pub async fn delete_resource_group(&self, group_id: i64) -> Result<(), ProjectError> {
        self.ensure_writable()?;
        let mut tx = self.db().pool().begin().await?;
        sqlx::query(
            "UPDATE resource_group SET source_type = NULL, source_id = NULL \
             WHERE source_type = 'resource_group' AND source_id = ?",
        )
        .bind(group_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM resource_group WHERE id = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Opens a membership cursor over a group, with the first
    /// [`EAGER_MEMBER_COUNT`] members materialized.
    pub async fn group_members(
        &self,
        group: &ResourceGroup,
    ) -> Result<MemberCursor, ProjectError> {
        self.resources_matching_pattern(group.pattern.clone()).await
    }

    /// Opens a membership cursor over an arbitrary pattern.
    pub async fn resources_matching_pattern(
        &self,
        pattern: UrlPattern,
    ) -> Result<MemberCursor, ProjectError> {
        let mut cursor = MemberCursor {
            project: self.clone(),
            pattern,
            buffer: VecDeque::new(),
            last_url: None,
            exhausted: false,
        };
        cursor.refill(EAGER_MEMBER_COUNT).await?;
        Ok(cursor)
    }

    /// Whether the URL belongs to any do-not-download group.
    pub async fn url_in_do_not_download_group(&self, url: &str) -> Result<bool, ProjectError> {
        let groups = self.resource_groups().await?;
        Ok(groups
            .iter()
            .any(|group| group.do_not_download && group.contains_url(url)))
    }

    async fn validate_group_source(
        &self,
        source: GroupSource,
        editing_group_id: Option<i64>,
    ) -> Result<(), ProjectError> {
        match source {
            GroupSource::None => Ok(()),
            GroupSource::Root(id) => {
                if self.get_root_resource(id).await?.is_none() {
                    return Err(ProjectError::EntityNotFound {
                        what: format!("root resource {id}"),
                    });
                }
                Ok(())
            }
            GroupSource::Group(id) => {
                let Some(mut current) = self.get_resource_group(id).await? else {
                    return Err(ProjectError::EntityNotFound {
                        what: format!("resource group {id}"),
                    });
                };
                // Walk the source chain; hitting the group being edited
                // means the assignment would close a loop
                let Some(editing) = editing_group_id else {
                    return Ok(());
                };
                if current.id == editing {
                    return Err(ProjectError::SourceCycle);
                }
                loop {
                    match current.source {
                        GroupSource::Group(next_id) => {
                            if next_id == editing {
                                return Err(ProjectError::SourceCycle);
                            }
                            match self.get_resource_group(next_id).await? {
                                Some(next) => current = next,
                                None => return Ok(()),
                            }
                        }
                        GroupSource::Root(_) | GroupSource::None => return Ok(()),
                    }
                }
            }
        }
    }
}

/// A lazy, restartable sequence of a pattern's member Resources, ordered
/// by URL.
pub struct MemberCursor {
    project: Project,
    pattern: UrlPattern,
    buffer: VecDeque<Resource>,
    last_url: Option<String>,
    exhausted: bool,
}

impl MemberCursor {
    /// The members materialized so far and not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> impl Iterator<Item = &Resource> {
        self.buffer.iter()
    }

    /// Whether the underlying scan has reached the end.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.buffer.is_empty()
    }

    /// Takes up to `limit` members, scanning further as needed.
    pub async fn next_batch(&mut self, limit: usize) -> Result<Vec<Resource>, ProjectError> {
        if self.buffer.len() < limit && !self.exhausted {
            let needed = limit - self.buffer.len();
            self.refill(needed).await?;
        }
        let take = limit.min(self.buffer.len());
        Ok(self.buffer.drain(..take).collect())
    }

    /// Collects every remaining member. Intended for tests and small
    /// groups.
    pub async fn collect_all(mut self) -> Result<Vec<Resource>, ProjectError> {
        let mut all: Vec<Resource> = self.buffer.drain(..).collect();
        while !self.exhausted {
            self.refill(SCAN_BATCH_SIZE).await?;
            if self.buffer.is_empty() {
                break;
            }
            all.extend(self.buffer.drain(..));
        }
        Ok(all)
    }

    /// Restarts the scan from the beginning.
    pub async fn restart(&mut self) -> Result<(), ProjectError> {
        self.buffer.clear();
        self.last_url = None;
        self.exhausted = false;
        self.refill(EAGER_MEMBER_COUNT).await
    }

    /// Scans until at least `count` more members are buffered or the scan
    /// ends.
    async fn refill(&mut self, count: usize) -> Result<(), ProjectError> {
        let prefix = self.pattern.literal_prefix().to_string();
        let mut matched = 0;
        while matched < count && !self.exhausted {
            // Strategy selection happens per round so a URL index loaded
            // mid-scan gets picked up
            let rows = if self.project.urls_loaded() {
                self.scan_in_memory(&prefix)
            } else {
                self.scan_database(&prefix).await?
            };
            if rows.is_empty() {
                self.exhausted = true;
                break;
            }
            for resource in rows {
                if self.pattern.matches(&resource.url) {
                    self.buffer.push_back(resource);
                    matched += 1;
                }
            }
        }
        Ok(())
    }

    /// One scan round over the in-memory URL index.
    fn scan_in_memory(&mut self, prefix: &str) -> Vec<Resource> {
        let mut rows = Vec::new();
        let mut left_prefix_region = false;
        {
            #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
            let index = self.project.inner.url_index.read().unwrap();
            let Some(index) = index.as_ref() else {
                return Vec::new();
            };

            let range: Box<dyn Iterator<Item = (&String, &i64)>> = match &self.last_url {
                Some(last) => Box::new(index.by_url.range::<String, _>((
                    std::ops::Bound::Excluded(last.clone()),
                    std::ops::Bound::Unbounded,
                ))),
                None if prefix.is_empty() => Box::new(index.by_url.iter()),
                None => Box::new(index.by_url.range(prefix.to_string()..)),
            };
            for (url, id) in range.take(SCAN_BATCH_SIZE) {
                if !prefix.is_empty() && !url.starts_with(prefix) {
                    // Ordered scan has left the prefix region; nothing
                    // further can match
                    left_prefix_region = true;
                    break;
                }
                rows.push(Resource {
                    id: ResourceId(*id),
                    url: url.clone(),
                });
            }
        }

        if left_prefix_region || rows.len() < SCAN_BATCH_SIZE {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.last_url = Some(last.url.clone());
        }
        rows
    }

    /// One scan round over the database.
    async fn scan_database(&mut self, prefix: &str) -> Result<Vec<Resource>, ProjectError> {
        let batch = i64::try_from(SCAN_BATCH_SIZE).unwrap_or(500);
        // First round starts at the literal prefix (inclusive, so the
        // prefix itself can match); later rounds continue past the last
        // URL seen. With no prefix this degrades to a full streaming scan.
        let rows: Vec<(i64, String)> = match &self.last_url {
            Some(after) => {
                sqlx::query_as("SELECT id, url FROM resource WHERE url > ? ORDER BY url LIMIT ?")
                    .bind(after)
                    .bind(batch)
                    .fetch_all(self.project.db().pool())
                    .await?
            }
            None => {
                sqlx::query_as("SELECT id, url FROM resource WHERE url >= ? ORDER BY url LIMIT ?")
                    .bind(prefix)
                    .bind(batch)
                    .fetch_all(self.project.db().pool())
                    .await?
            }
        };

        let mut resources = Vec::new();
        for (id, url) in rows {
            if !prefix.is_empty() && !url.starts_with(prefix) {
                if url.as_str() > prefix {
                    // Past the prefix region; early termination
                    self.exhausted = true;
                    break;
                }
                continue;
            }
            resources.push(Resource {
                id: ResourceId(id),
                url,
            });
        }
        if let Some(last) = resources.last() {
            self.last_url = Some(last.url.clone());
        } else if !self.exhausted {
            self.exhausted = true;
        }
        Ok(resources)
    }
}
