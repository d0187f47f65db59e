//! Aliases: URL prefix rewrite rules.
//!
//! An Alias makes URLs under a Source URL Prefix equivalent to the same
//! URLs under a Target URL Prefix. During normalization the first matching
//! alias (in id order) rewrites the URL; an alias whose target is marked
//! external routes the URL out of the archive entirely, to be served as a
//! redirect to the live web.

use tracing::instrument;

use crate::db::Database;
use crate::model::root_resource::is_unique_violation;
use crate::project::{Project, ProjectError};

/// A URL prefix rewrite rule. Both prefixes always end in `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    /// Stable identifier; `None` for in-memory-only aliases.
    pub id: Option<i64>,
    /// Prefix to match. Unique per project.
    pub source_url_prefix: String,
    /// Prefix substituted in.
    pub target_url_prefix: String,
    /// Whether the target points at the live web rather than the archive.
    pub target_is_external: bool,
}

impl Alias {
    /// Creates an alias value not backed by the database.
    #[must_use]
    pub fn unsaved(
        source_url_prefix: &str,
        target_url_prefix: &str,
        target_is_external: bool,
    ) -> Self {
        Self {
            id: None,
            source_url_prefix: source_url_prefix.to_string(),
            target_url_prefix: target_url_prefix.to_string(),
            target_is_external,
        }
    }

    /// Loads every alias in id order.
    pub(crate) async fn load_all(db: &Database) -> Result<Vec<Alias>, sqlx::Error> {
        let rows: Vec<(i64, String, String, i64)> = sqlx::query_as(
            "SELECT id, source_url_prefix, target_url_prefix, target_is_external \
             FROM alias ORDER BY id",
        )
        .fetch_all(db.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, source, target, external)| Alias {
                id: Some(id),
                source_url_prefix: source,
                target_url_prefix: target,
                target_is_external: external != 0,
            })
            .collect())
    }
}

fn validate_prefix(prefix: &str) -> Result<(), ProjectError> {
    if prefix.ends_with('/') {
        Ok(())
    } else {
        Err(ProjectError::InvalidAliasPrefix {
            prefix: prefix.to_string(),
        })
    }
}

impl Project {
    /// Creates an alias.
    ///
    /// Both prefixes must end in `/`; the source prefix must be unique.
    #[instrument(skip(self))]
    pub async fn create_alias(
        &self,
        source_url_prefix: &str,
        target_url_prefix: &str,
        target_is_external: bool,
    ) -> Result<Alias, ProjectError> {
        self.ensure_writable()?;
        validate_prefix(source_url_prefix)?;
        validate_prefix(target_url_prefix)?;

        let result = sqlx::query(
            "INSERT INTO alias (source_url_prefix, target_url_prefix, target_is_external) \
             VALUES (?, ?, ?)",
        )
        .bind(source_url_prefix)
        .bind(target_url_prefix)
        .bind(i64::from(target_is_external))
        .execute(self.db().pool())
        .await;
        let id = match result {
            Ok(done) => done.last_insert_rowid(),
            Err(error) if is_unique_violation(&error) => {
                return Err(ProjectError::AlreadyExists {
                    what: format!("alias with source prefix {source_url_prefix:?}"),
                })
            }
            Err(error) => return Err(error.into()),
        };

        let alias = Alias {
            id: Some(id),
            source_url_prefix: source_url_prefix.to_string(),
            target_url_prefix: target_url_prefix.to_string(),
            target_is_external,
        };
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
        self.inner.aliases.write().unwrap().push(alias.clone());
        Ok(alias)
    }

    /// Updates an alias's target prefix and external flag.
    #[instrument(skip(self))]
    pub async fn update_alias_target(
        &self,
        id: i64,
        target_url_prefix: &str,
        target_is_external: bool,
    ) -> Result<(), ProjectError> {
        self.ensure_writable()?;
        validate_prefix(target_url_prefix)?;

        let done = sqlx::query(
            "UPDATE alias SET target_url_prefix = ?, target_is_external = ? WHERE id = ?",
        )
        .bind(target_url_prefix)
        .bind(i64::from(target_is_external))
        .bind(id)
        .execute(self.db().pool())
        .await?;
        if done.rows_affected() == 0 {
            return Err(ProjectError::EntityNotFound {
                what: format!("alias {id}"),
            });
        }

        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
        let mut aliases = self.inner.aliases.write().unwrap();
        if let Some(alias) = aliases.iter_mut().find(|a| a.id == Some(id)) {
            alias.target_url_prefix = target_url_prefix.to_string();
            alias.target_is_external = target_is_external;
        }
        Ok(())
    }

    /// Deletes an alias.
    #[instrument(skip(self))]
    pub async fn delete_alias(&self, id: i64) -> Result<(), ProjectError> {
        self.ensure_writable()?;
        sqlx::query("DELETE FROM alias WHERE id = ?")
            .bind(id)
            .execute(self.db().pool())
            .await?;
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
        self.inner.aliases.write().unwrap().retain(|a| a.id != Some(id));
        Ok(())
    }

    /// Finds the alias with the given source prefix.
    #[must_use]
    pub fn get_alias(&self, source_url_prefix: &str) -> Option<Alias> {
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
        self.inner
            .aliases
            .read()
            .unwrap()
            .iter()
            .find(|a| a.source_url_prefix == source_url_prefix)
            .cloned()
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
    async fn test_create_alias_validates_prefixes() {
        let temp = TempDir::new().unwrap();
        let project = open_project(&temp).await;

        let result = project
            .create_alias("https://a.example", "https://b.example/", false)
            .await;
        assert!(matches!(result, Err(ProjectError::InvalidAliasPrefix { .. })));

        let result = project
            .create_alias("https://a.example/", "https://b.example", false)
            .await;
        assert!(matches!(result, Err(ProjectError::InvalidAliasPrefix { .. })));
        project.close().await;
    }

    #[tokio::test]
    async fn test_source_prefix_unique() {
        let temp = TempDir::new().unwrap();
        let project = open_project(&temp).await;

        project
            .create_alias("https://a.example/", "https://b.example/", false)
            .await
            .unwrap();
        let result = project
            .create_alias("https://a.example/", "https://c.example/", false)
            .await;
        assert!(matches!(result, Err(ProjectError::AlreadyExists { .. })));
        project.close().await;
    }

    #[tokio::test]
    async fn test_aliases_survive_reopen_in_id_order() {
        let temp = TempDir::new().unwrap();
        let project = open_project(&temp).await;
        let path = project.path().to_path_buf();

        project
            .create_alias("https://b.example/", "https://target.example/", false)
            .await
            .unwrap();
        project
            .create_alias("https://a.example/", "https://target.example/", true)
            .await
            .unwrap();
        project.close().await;

        let project = Project::open(&path, OpenOptions::default()).await.unwrap();
        let aliases = project.aliases();
        assert_eq!(aliases.len(), 2);
        assert_eq!(aliases[0].source_url_prefix, "https://b.example/");
        assert_eq!(aliases[1].source_url_prefix, "https://a.example/");
        assert!(aliases[1].target_is_external);
        project.close().await;
    }

    #[tokio::test]
    async fn test_update_and_delete_alias() {
        let temp = TempDir::new().unwrap();
        let project = open_project(&temp).await;

        let alias = project
            .create_alias("https://a.example/", "https://b.example/", false)
            .await
            .unwrap();
        let id = alias.id.unwrap();

        project
            .update_alias_target(id, "https://c.example/", true)
            .await
            .unwrap();
        let updated = project.get_alias("https://a.example/").unwrap();
        assert_eq!(updated.target_url_prefix, "https://c.example/");
        assert!(updated.target_is_external);

        project.delete_alias(id).await.unwrap();
        assert!(project.get_alias("https://a.example/").is_none());
        project.close().await;
    }

    #[tokio::test]
    async fn test_alias_changes_affect_normalization_immediately() {
        let temp = TempDir::new().unwrap();
        let project = open_project(&temp).await;

        project
            .create_alias("https://old.example/", "https://new.example/", false)
            .await
            .unwrap();
        let resource = project
            .get_or_create_resource("https://old.example/page")
            .await
            .unwrap();
        assert_eq!(resource.url, "https://new.example/page");
        project.close().await;
    }
}
