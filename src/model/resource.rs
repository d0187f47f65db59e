//! Resources: downloadable absolute URLs.
//!
//! A Resource is created lazily the first time its URL is referenced - by
//! direct user input, by a discovered link, or by a group pattern probe.
//! URLs are normalized on every ingress, so one logical page maps to one
//! Resource no matter how it was spelled at the point of discovery.
//!
//! Persisted Resources have positive ids. Negative ids form a tagged
//! in-memory-only space used for external URLs and for Resources created
//! while the project is read-only; Save-As assigns real ids to the latter.

use std::fmt;

use tracing::{debug, instrument};

use crate::project::{Project, ProjectError};
use crate::urls;

/// Identifier of a [`Resource`].
///
/// Negative ids identify unsaved, in-memory-only Resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub i64);

impl ResourceId {
    /// Whether this id belongs to the unsaved (in-memory-only) id space.
    #[must_use]
    pub fn is_unsaved(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A downloadable absolute URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Stable identifier; negative when unsaved.
    pub id: ResourceId,
    /// The canonical URL.
    pub url: String,
}

impl Resource {
    /// Whether this Resource is an external URL excluded from the archive.
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.url.starts_with(urls::EXTERNAL_URL_PREFIX)
    }
}

/// Result of a bulk resource creation, partitioned in input order.
#[derive(Debug, Default)]
pub struct BulkCreateOutcome {
    /// Resources that did not exist before the call.
    pub created: Vec<Resource>,
    /// Resources that already existed (including duplicates within the
    /// input batch).
    pub existing: Vec<Resource>,
}

impl Project {
    /// Looks up the Resource for a URL, creating it if absent.
    ///
    /// The URL is normalized first; lookup then probes the URL's
    /// alternatives oldest-storage-form-first, so an archive written by an
    /// earlier version keeps resolving to its existing Resources. A miss
    /// inserts the fully-normalized form.
    ///
    /// External URLs and read-only projects produce unsaved (negative-id)
    /// Resources instead of database rows.
    #[instrument(skip(self))]
    pub async fn get_or_create_resource(&self, raw_url: &str) -> Result<Resource, ProjectError> {
        if let Some(existing) = self.get_resource_by_url(raw_url).await? {
            return Ok(existing);
        }

        let aliases = self.aliases();
        let normal = urls::normalize(raw_url, &aliases, self.plugins());
        if normal.is_external || self.readonly() {
            return Ok(self.intern_unsaved_resource(&normal.url));
        }

        let id = sqlx::query("INSERT INTO resource (url) VALUES (?)")
            .bind(&normal.url)
            .execute(self.db().pool())
            .await?
            .last_insert_rowid();
        self.index_resource(id, &normal.url);
        debug!(id, url = %normal.url, "created resource");
        Ok(Resource {
            id: ResourceId(id),
            url: normal.url,
        })
    }

    /// Looks up the Resource for a URL without creating it.
    ///
    /// Probes the URL's normalization alternatives in order; the first form
    /// that exists wins.
    pub async fn get_resource_by_url(
        &self,
        raw_url: &str,
    ) -> Result<Option<Resource>, ProjectError> {
        let aliases = self.aliases();
        let alternatives = urls::resource_url_alternatives(raw_url, &aliases, self.plugins());

        // Unsaved resources (externals, read-only creations) take priority
        // within their own id space
        {
            #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
            let unsaved = self.inner.unsaved.lock().unwrap();
            for alternative in &alternatives {
                if let Some(&id) = unsaved.by_url.get(alternative) {
                    return Ok(Some(Resource {
                        id: ResourceId(id),
                        url: alternative.clone(),
                    }));
                }
            }
        }

        if self.urls_loaded() {
            #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
            let index = self.inner.url_index.read().unwrap();
            if let Some(index) = index.as_ref() {
                for alternative in &alternatives {
                    if let Some(&id) = index.by_url.get(alternative) {
                        return Ok(Some(Resource {
                            id: ResourceId(id),
                            url: alternative.clone(),
                        }));
                    }
                }
            }
            return Ok(None);
        }

        // One round-trip for all alternatives; pick the earliest
        let placeholders = vec!["?"; alternatives.len()].join(", ");
        let query = format!("SELECT id, url FROM resource WHERE url IN ({placeholders})");
        let mut rows = sqlx::query_as::<_, (i64, String)>(&query);
        for alternative in &alternatives {
            rows = rows.bind(alternative);
        }
        let found: Vec<(i64, String)> = rows.fetch_all(self.db().pool()).await?;
        for alternative in &alternatives {
            if let Some((id, url)) = found.iter().find(|(_, url)| url == alternative) {
                return Ok(Some(Resource {
                    id: ResourceId(*id),
                    url: url.clone(),
                }));
            }
        }
        Ok(None)
    }

    /// Looks up a Resource by id, including unsaved ids.
    pub async fn get_resource_by_id(
        &self,
        id: ResourceId,
    ) -> Result<Option<Resource>, ProjectError> {
        if id.is_unsaved() {
            #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
            let unsaved = self.inner.unsaved.lock().unwrap();
            return Ok(unsaved.by_id.get(&id.0).map(|url| Resource {
                id,
                url: url.clone(),
            }));
        }
        let row: Option<(String,)> = sqlx::query_as("SELECT url FROM resource WHERE id = ?")
            .bind(id.0)
            .fetch_optional(self.db().pool())
            .await?;
        Ok(row.map(|(url,)| Resource { id, url }))
    }

    /// Creates many Resources in one database round-trip.
    ///
    /// Returns the created and already-existing Resources partitioned in
    /// input order. A URL appearing twice in the input is created once and
    /// reported as existing on its second appearance.
    #[instrument(skip_all, fields(count = raw_urls.len()))]
    pub async fn create_resources_bulk(
        &self,
        raw_urls: &[String],
    ) -> Result<BulkCreateOutcome, ProjectError> {
        let mut outcome = BulkCreateOutcome::default();
        if raw_urls.is_empty() {
            return Ok(outcome);
        }

        enum Slot {
            Existing(Resource),
            Unsaved(Resource),
            New(usize),
            DuplicateOfNew(usize),
        }

        let aliases = self.aliases();
        let mut slots: Vec<Slot> = Vec::with_capacity(raw_urls.len());
        let mut new_urls: Vec<String> = Vec::new();
        for raw_url in raw_urls {
            if let Some(existing) = self.get_resource_by_url(raw_url).await? {
                slots.push(Slot::Existing(existing));
                continue;
            }
            let normal = urls::normalize(raw_url, &aliases, self.plugins());
            if let Some(index) = new_urls.iter().position(|url| url == &normal.url) {
                slots.push(Slot::DuplicateOfNew(index));
                continue;
            }
            if normal.is_external || self.readonly() {
                slots.push(Slot::Unsaved(self.intern_unsaved_resource(&normal.url)));
                continue;
            }
            new_urls.push(normal.url);
            slots.push(Slot::New(new_urls.len() - 1));
        }

        // One batched INSERT + COMMIT for everything new
        let mut new_ids: Vec<i64> = Vec::with_capacity(new_urls.len());
        if !new_urls.is_empty() {
            let mut tx = self.db().pool().begin().await?;
            for url in &new_urls {
                let id = sqlx::query("INSERT INTO resource (url) VALUES (?)")
                    .bind(url)
                    .execute(&mut *tx)
                    .await?
                    .last_insert_rowid();
                new_ids.push(id);
            }
            tx.commit().await?;
            for (id, url) in new_ids.iter().zip(&new_urls) {
                self.index_resource(*id, url);
            }
        }

        for slot in slots {
            match slot {
                Slot::Existing(resource) => outcome.existing.push(resource),
                Slot::Unsaved(resource) => outcome.created.push(resource),
                Slot::New(index) => outcome.created.push(Resource {
                    id: ResourceId(new_ids[index]),
                    url: new_urls[index].clone(),
                }),
                Slot::DuplicateOfNew(index) => outcome.existing.push(Resource {
                    id: ResourceId(new_ids[index]),
                    url: new_urls[index].clone(),
                }),
            }
        }

        debug!(
            created = outcome.created.len(),
            existing = outcome.existing.len(),
            "bulk-created resources"
        );
        Ok(outcome)
    }

    /// Deletes a Resource and all of its Revisions.
    ///
    /// Refused while a Root Resource references it.
    #[instrument(skip(self))]
    pub async fn delete_resource(&self, id: ResourceId) -> Result<(), ProjectError> {
        self.ensure_writable()?;

        let root_count: i64 =
            sqlx::query_scalar("SELECT count(1) FROM root_resource WHERE resource_id = ?")
                .bind(id.0)
                .fetch_one(self.db().pool())
                .await?;
        if root_count > 0 {
            return Err(ProjectError::InUse {
                what: format!("resource {id}"),
            });
        }

        // Revisions go first: rows, then any published bodies
        let revision_ids: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM resource_revision WHERE resource_id = ?")
                .bind(id.0)
                .fetch_all(self.db().pool())
                .await?;
        for (revision_id,) in &revision_ids {
            self.delete_revision(*revision_id).await?;
        }

        let url: Option<(String,)> = sqlx::query_as("SELECT url FROM resource WHERE id = ?")
            .bind(id.0)
            .fetch_optional(self.db().pool())
            .await?;
        sqlx::query("DELETE FROM resource WHERE id = ?")
            .bind(id.0)
            .execute(self.db().pool())
            .await?;

        if let Some((url,)) = url {
            #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
            let mut index = self.inner.url_index.write().unwrap();
            if let Some(index) = index.as_mut() {
                index.by_url.remove(&url);
            }
        }
        Ok(())
    }

    /// The number of persisted Resources.
    pub async fn resource_count(&self) -> Result<i64, ProjectError> {
        Ok(sqlx::query_scalar("SELECT count(1) FROM resource")
            .fetch_one(self.db().pool())
            .await?)
    }

    fn intern_unsaved_resource(&self, url: &str) -> Resource {
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
        let mut unsaved = self.inner.unsaved.lock().unwrap();
        let id = unsaved.intern(url);
        Resource {
            id: ResourceId(id),
            url: url.to_string(),
        }
    }

    fn index_resource(&self, id: i64, url: &str) {
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
        let mut index = self.inner.url_index.write().unwrap();
        if let Some(index) = index.as_mut() {
            index.by_url.insert(url.to_string(), id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::project::OpenOptions;
    use tempfile::TempDir;

    async fn open_project(temp: &TempDir) -> Project {
        Project::create(temp.path().join("test.crystalproj"), OpenOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_or_create_normalizes_and_persists() {
        let temp = TempDir::new().unwrap();
        let project = open_project(&temp).await;

        let resource = project
            .get_or_create_resource("HTTP://Example.COM/Comic#frag")
            .await
            .unwrap();
        assert_eq!(resource.url, "http://example.com/Comic");
        assert!(resource.id.0 >= 1);
        assert!(!resource.id.is_unsaved());
        project.close().await;
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent_across_spellings() {
        let temp = TempDir::new().unwrap();
        let project = open_project(&temp).await;

        let first = project
            .get_or_create_resource("https://example.com/page")
            .await
            .unwrap();
        let second = project
            .get_or_create_resource("HTTPS://EXAMPLE.COM/page#top")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(project.resource_count().await.unwrap(), 1);
        project.close().await;
    }

    #[tokio::test]
    async fn test_lookup_prefers_preexisting_less_normal_form() {
        let temp = TempDir::new().unwrap();
        let project = open_project(&temp).await;

        // Simulate an archive written before fragment stripping: the stored
        // URL is a less-normalized alternative of the input
        sqlx::query("INSERT INTO resource (url) VALUES ('https://example.com/page#top')")
            .execute(project.db().pool())
            .await
            .unwrap();

        let resource = project
            .get_or_create_resource("https://example.com/page#top")
            .await
            .unwrap();
        assert_eq!(resource.url, "https://example.com/page#top");
        assert_eq!(project.resource_count().await.unwrap(), 1);
        project.close().await;
    }

    #[tokio::test]
    async fn test_external_url_never_persisted() {
        let temp = TempDir::new().unwrap();
        let project = open_project(&temp).await;
        project
            .create_alias("https://ads.example/", "https://ads.example/", true)
            .await
            .unwrap();

        let resource = project
            .get_or_create_resource("https://ads.example/banner.png")
            .await
            .unwrap();
        assert!(resource.id.is_unsaved());
        assert!(resource.is_external());
        assert_eq!(
            resource.url,
            "crystal://external/https://ads.example/banner.png"
        );
        assert_eq!(project.resource_count().await.unwrap(), 0);

        // Same URL resolves to the same unsaved Resource
        let again = project
            .get_or_create_resource("https://ads.example/banner.png")
            .await
            .unwrap();
        assert_eq!(resource.id, again.id);
        project.close().await;
    }

    #[tokio::test]
    async fn test_bulk_create_partitions_in_input_order() {
        let temp = TempDir::new().unwrap();
        let project = open_project(&temp).await;

        project
            .get_or_create_resource("https://example.com/existing")
            .await
            .unwrap();

        let outcome = project
            .create_resources_bulk(&[
                "https://example.com/a".to_string(),
                "https://example.com/existing".to_string(),
                "https://example.com/b".to_string(),
                "https://example.com/a".to_string(), // duplicate within batch
            ])
            .await
            .unwrap();

        let created_urls: Vec<&str> = outcome.created.iter().map(|r| r.url.as_str()).collect();
        let existing_urls: Vec<&str> = outcome.existing.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(created_urls, ["https://example.com/a", "https://example.com/b"]);
        assert_eq!(
            existing_urls,
            ["https://example.com/existing", "https://example.com/a"]
        );
        assert!(outcome.created.iter().all(|r| r.id.0 > 0));
        project.close().await;
    }

    #[tokio::test]
    async fn test_bulk_then_individual_matches_individual_state() {
        let temp = TempDir::new().unwrap();
        let project = open_project(&temp).await;

        let urls: Vec<String> = (1..=5)
            .map(|i| format!("https://example.com/{i}"))
            .collect();
        project.create_resources_bulk(&urls).await.unwrap();

        for url in &urls {
            let resource = project.get_or_create_resource(url).await.unwrap();
            assert_eq!(&resource.url, url);
        }
        assert_eq!(project.resource_count().await.unwrap(), 5);
        project.close().await;
    }

    #[tokio::test]
    async fn test_readonly_project_defers_to_unsaved_set() {
        let temp = TempDir::new().unwrap();
        let project = open_project(&temp).await;
        let path = project.path().to_path_buf();
        project.close().await;

        let project = Project::open(
            &path,
            OpenOptions {
                readonly: true,
                ..OpenOptions::default()
            },
        )
        .await
        .unwrap();

        let resource = project
            .get_or_create_resource("https://example.com/unsaved")
            .await
            .unwrap();
        assert!(resource.id.is_unsaved());
        assert_eq!(project.resource_count().await.unwrap(), 0);
        project.close().await;
    }

    #[tokio::test]
    async fn test_lookup_uses_loaded_index() {
        let temp = TempDir::new().unwrap();
        let project = open_project(&temp).await;

        let created = project
            .get_or_create_resource("https://example.com/indexed")
            .await
            .unwrap();
        project.load_urls().await.unwrap();

        let found = project
            .get_resource_by_url("https://example.com/indexed")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, created.id);

        // New creations keep the index current
        let late = project
            .get_or_create_resource("https://example.com/late")
            .await
            .unwrap();
        let found = project
            .get_resource_by_url("https://example.com/late")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, late.id);
        project.close().await;
    }

    #[tokio::test]
    async fn test_delete_resource_refused_while_rooted() {
        let temp = TempDir::new().unwrap();
        let project = open_project(&temp).await;

        let resource = project
            .get_or_create_resource("https://example.com/")
            .await
            .unwrap();
        project
            .create_root_resource("Home", resource.id)
            .await
            .unwrap();

        let result = project.delete_resource(resource.id).await;
        assert!(matches!(result, Err(ProjectError::InUse { .. })));
        project.close().await;
    }
}
