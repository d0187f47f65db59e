//! Root Resources: user-named anchors into the archive.
//!
//! A Root Resource gives one Resource a human-readable name and marks it as
//! a deliberate entry point. A Resource may be referenced by at most one
//! Root Resource, and a rooted Resource cannot be deleted.

use tracing::instrument;

use crate::model::ResourceId;
use crate::project::{Project, ProjectError};

/// A user-named anchor pointing at exactly one Resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootResource {
    /// Stable identifier.
    pub id: i64,
    /// Free-text name. Possibly empty.
    pub name: String,
    /// The anchored Resource.
    pub resource_id: ResourceId,
}

impl Project {
    /// Creates a Root Resource anchoring `resource_id` under `name`.
    ///
    /// Fails with [`ProjectError::AlreadyExists`] if the Resource is
    /// already anchored, and [`ProjectError::EntityNotFound`] if it is
    /// unsaved or absent.
    #[instrument(skip(self))]
    pub async fn create_root_resource(
        &self,
        name: &str,
        resource_id: ResourceId,
    ) -> Result<RootResource, ProjectError> {
        self.ensure_writable()?;
        if self.get_resource_by_id(resource_id).await?.is_none() || resource_id.is_unsaved() {
            return Err(ProjectError::EntityNotFound {
                what: format!("resource {resource_id}"),
            });
        }

        let result = sqlx::query("INSERT INTO root_resource (name, resource_id) VALUES (?, ?)")
            .bind(name)
            .bind(resource_id.0)
            .execute(self.db().pool())
            .await;
        match result {
            Ok(done) => Ok(RootResource {
                id: done.last_insert_rowid(),
                name: name.to_string(),
                resource_id,
            }),
            Err(error) if is_unique_violation(&error) => Err(ProjectError::AlreadyExists {
                what: format!("root resource for resource {resource_id}"),
            }),
            Err(error) => Err(error.into()),
        }
    }

    /// All Root Resources, in creation order.
    pub async fn root_resources(&self) -> Result<Vec<RootResource>, ProjectError> {
        let rows: Vec<(i64, String, i64)> =
            sqlx::query_as("SELECT id, name, resource_id FROM root_resource ORDER BY id")
                .fetch_all(self.db().pool())
                .await?;
        Ok(rows
            .into_iter()
            .map(|(id, name, resource_id)| RootResource {
                id,
                name,
                resource_id: ResourceId(resource_id),
            })
            .collect())
    }

    /// Loads a Root Resource by id.
    pub async fn get_root_resource(&self, id: i64) -> Result<Option<RootResource>, ProjectError> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT name, resource_id FROM root_resource WHERE id = ?")
                .bind(id)
                .fetch_optional(self.db().pool())
                .await?;
        Ok(row.map(|(name, resource_id)| RootResource {
            id,
            name,
            resource_id: ResourceId(resource_id),
        }))
    }

    /// Finds a Root Resource by its exact name.
    pub async fn find_root_resource_by_name(
        &self,
        name: &str,
    ) -> Result<Option<RootResource>, ProjectError> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT id, resource_id FROM root_resource WHERE name = ? LIMIT 1")
                .bind(name)
                .fetch_optional(self.db().pool())
                .await?;
        Ok(row.map(|(id, resource_id)| RootResource {
            id,
            name: name.to_string(),
            resource_id: ResourceId(resource_id),
        }))
    }

    /// Renames a Root Resource.
    pub async fn rename_root_resource(&self, id: i64, name: &str) -> Result<(), ProjectError> {
        self.ensure_writable()?;
        let done = sqlx::query("UPDATE root_resource SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id)
            .execute(self.db().pool())
            .await?;
        if done.rows_affected() == 0 {
            return Err(ProjectError::EntityNotFound {
                what: format!("root resource {id}"),
            });
        }
        Ok(())
    }

    /// Deletes a Root Resource. Groups sourced from it fall back to no
    /// source.
    #[instrument(skip(self))]
    pub async fn delete_root_resource(&self, id: i64) -> Result<(), ProjectError> {
        self.ensure_writable()?;
        let mut tx = self.db().pool().begin().await?;
        sqlx::query(
            "UPDATE resource_group SET source_type = NULL, source_id = NULL \
             WHERE source_type = 'root_resource' AND source_id = ?",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM root_resource WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db_error) if db_error.message().contains("UNIQUE constraint failed")
    )
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
    async fn test_create_and_list_root_resources() {
        let temp = TempDir::new().unwrap();
        let project = open_project(&temp).await;

        let comic = project
            .get_or_create_resource("https://xkcd.com/1/")
            .await
            .unwrap();
        let root = project
            .create_root_resource("First Comic", comic.id)
            .await
            .unwrap();
        assert_eq!(root.name, "First Comic");
        assert_eq!(root.resource_id, comic.id);

        let all = project.root_resources().await.unwrap();
        assert_eq!(all, vec![root]);
        project.close().await;
    }

    #[tokio::test]
    async fn test_resource_can_have_at_most_one_root() {
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

        let result = project.create_root_resource("Also Home", resource.id).await;
        assert!(matches!(result, Err(ProjectError::AlreadyExists { .. })));
        project.close().await;
    }

    #[tokio::test]
    async fn test_root_resource_requires_persisted_resource() {
        let temp = TempDir::new().unwrap();
        let project = open_project(&temp).await;

        let result = project
            .create_root_resource("Ghost", ResourceId(424_242))
            .await;
        assert!(matches!(result, Err(ProjectError::EntityNotFound { .. })));
        project.close().await;
    }

    #[tokio::test]
    async fn test_rename_and_delete_root_resource() {
        let temp = TempDir::new().unwrap();
        let project = open_project(&temp).await;

        let resource = project
            .get_or_create_resource("https://example.com/")
            .await
            .unwrap();
        let root = project
            .create_root_resource("Old Name", resource.id)
            .await
            .unwrap();

        project
            .rename_root_resource(root.id, "New Name")
            .await
            .unwrap();
        let loaded = project.get_root_resource(root.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "New Name");

        project.delete_root_resource(root.id).await.unwrap();
        assert!(project.get_root_resource(root.id).await.unwrap().is_none());

        // Resource becomes deletable once unrooted
        project.delete_resource(resource.id).await.unwrap();
        project.close().await;
    }

    #[tokio::test]
    async fn test_find_by_name() {
        let temp = TempDir::new().unwrap();
        let project = open_project(&temp).await;

        let resource = project
            .get_or_create_resource("https://example.com/")
            .await
            .unwrap();
        project
            .create_root_resource("Named", resource.id)
            .await
            .unwrap();

        assert!(project
            .find_root_resource_by_name("Named")
            .await
            .unwrap()
            .is_some());
        assert!(project
            .find_root_resource_by_name("Unnamed")
            .await
            .unwrap()
            .is_none());
        project.close().await;
    }
}
