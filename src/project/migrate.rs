//! Major-version migration of the revision body layout.
//!
//! Version 1 stored bodies flat (`revisions/<id>`), which collapses under
//! multi-million-revision archives. Version 2 splits the id into a
//! 4,096-way directory fan-out (see [`layout::body_path`]). The migration
//! renames every body into a replacement tree built under
//! `revisions.inprogress/`, commits the version bump, then swaps the trees.
//!
//! The migration is monotone and resumable: killed at any point, the next
//! writable open picks up where it left off. The commit of
//! `major_version = 2` is the point of no return; before it, a crash
//! resumes the renames; after it, a crash resumes the tree swap.

use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use super::layout;
use super::ProjectError;
use crate::db::Database;

/// Renames flushed to disk between directory syncs, matching the fan-out of
/// one leaf directory.
const RENAME_FLUSH_INTERVAL: u64 = layout::DIRECTORY_FANOUT;

/// Revision ids fetched per database round-trip while migrating.
const ID_BATCH_SIZE: i64 = 10_000;

/// Observer of migration progress.
///
/// The listener may decline the migration up front or cancel it mid-flight
/// by returning `false`; a cancelled migration resumes on the next writable
/// open.
pub trait MigrationProgress: Send + Sync {
    /// About to migrate approximately `approx_total` revisions.
    /// Return `false` to decline.
    fn will_upgrade_revisions(&self, approx_total: u64) -> bool {
        let _ = approx_total;
        true
    }

    /// Revision number `index` (1-based) has been migrated.
    /// Return `false` to cancel.
    fn upgrading_revision(&self, index: u64) -> bool {
        let _ = index;
        true
    }

    /// All revisions are migrated and the tree swap is complete.
    fn did_upgrade_revisions(&self) {}
}

/// Resumes an interrupted migration, if the on-disk state calls for it.
///
/// Dispatch is keyed on the committed `major_version`:
/// - already at the target with `revisions.inprogress/` still present:
///   the crash happened after the point of no return; finish the tree swap.
/// - still at 1 with migration leftovers present: resume the renames (and
///   everything after them).
pub(crate) async fn resume_if_needed(
    project_path: &Path,
    db: &Database,
    major_version: &mut u32,
    progress: Option<&dyn MigrationProgress>,
) -> Result<(), ProjectError> {
    let in_progress_dir = project_path.join(layout::IN_PROGRESS_REVISIONS_DIRNAME);
    let migration_marker = read_major_version_old(db).await?;

    if *major_version >= 2 {
        if in_progress_dir.is_dir() {
            info!("finishing interrupted migration commit");
            finalize_tree_swap(project_path)?;
        }
        if migration_marker.is_some() {
            delete_major_version_old(db).await?;
        }
        return Ok(());
    }

    if *major_version == 1 && (in_progress_dir.is_dir() || migration_marker == Some(1)) {
        info!("resuming interrupted v1 -> v2 migration");
        migrate_v1_to_v2(project_path, db, progress).await?;
        *major_version = 2;
    }
    Ok(())
}

/// Migrates the revision tree from the flat v1 layout to the hierarchical
/// v2 layout.
///
/// Steps:
/// 1. Record `major_version_old = 1` (marks a migration in progress).
/// 2. Create `revisions.inprogress/`.
/// 3. Rename each body into its v2 path, syncing directory metadata every
///    [`RENAME_FLUSH_INTERVAL`] renames and at the end.
/// 4. Commit `major_version = 2` - the point of no return.
/// 5. Swap the trees and sync the project directory.
/// 6. Clear `major_version_old`.
#[instrument(skip_all, fields(path = %project_path.display()))]
pub(crate) async fn migrate_v1_to_v2(
    project_path: &Path,
    db: &Database,
    progress: Option<&dyn MigrationProgress>,
) -> Result<(), ProjectError> {
    let revisions_dir = project_path.join(layout::REVISIONS_DIRNAME);
    let in_progress_dir = project_path.join(layout::IN_PROGRESS_REVISIONS_DIRNAME);

    let max_id: Option<i64> = sqlx::query_scalar("SELECT max(id) FROM resource_revision")
        .fetch_one(db.pool())
        .await?;
    let approx_total = u64::try_from(max_id.unwrap_or(0)).unwrap_or(0);
    if max_id.unwrap_or(0) > layout::MAX_V2_REVISION_ID {
        warn!("revision ids exceed the v2 layout capacity; declining migration");
        return Err(ProjectError::MigrationCancelled);
    }

    if let Some(listener) = progress {
        if !listener.will_upgrade_revisions(approx_total) {
            debug!("migration declined by listener");
            return Err(ProjectError::MigrationCancelled);
        }
    }

    set_major_version_old(db, 1).await?;
    if !in_progress_dir.is_dir() {
        std::fs::create_dir(&in_progress_dir)
            .map_err(|e| ProjectError::io(&in_progress_dir, e))?;
    }

    // Move every body into its new location. A body already moved by an
    // earlier cancelled run, or never written at all, shows up as
    // NotFound and is skipped.
    let mut migrated: u64 = 0;
    let mut renames_since_flush: u64 = 0;
    let mut last_parent: Option<PathBuf> = None;
    let mut after_id: i64 = 0;
    loop {
        let ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM resource_revision WHERE id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(after_id)
        .bind(ID_BATCH_SIZE)
        .fetch_all(db.pool())
        .await?;
        if ids.is_empty() {
            break;
        }

        for (id,) in &ids {
            let id = *id;
            after_id = id;

            let old_path = revisions_dir.join(id.to_string());
            let (parent_rel, leaf) = layout::v2_split(id);
            let new_parent = in_progress_dir.join(&parent_rel);
            if last_parent.as_ref() != Some(&new_parent) {
                // Entering a new leaf directory: flush the renames queued in
                // the previous one before moving on
                if let Some(previous) = last_parent.take() {
                    if renames_since_flush > 0 {
                        layout::fsync_dir(&previous)
                            .map_err(|e| ProjectError::io(&previous, e))?;
                        renames_since_flush = 0;
                    }
                }
                std::fs::create_dir_all(&new_parent)
                    .map_err(|e| ProjectError::io(&new_parent, e))?;
                last_parent = Some(new_parent.clone());
            }

            match std::fs::rename(&old_path, new_parent.join(&leaf)) {
                Ok(()) => {
                    migrated += 1;
                    renames_since_flush += 1;
                    if renames_since_flush >= RENAME_FLUSH_INTERVAL {
                        layout::fsync_dir(&new_parent)
                            .map_err(|e| ProjectError::io(&new_parent, e))?;
                        renames_since_flush = 0;
                    }
                }
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    // Already moved by an earlier run, or the revision has
                    // no body (error-only or empty)
                }
                Err(error) => return Err(ProjectError::io(&old_path, error)),
            }

            if let Some(listener) = progress {
                if !listener.upgrading_revision(migrated) {
                    info!(migrated, "migration cancelled; will resume on next open");
                    return Err(ProjectError::MigrationCancelled);
                }
            }
        }
    }

    if let Some(parent) = last_parent {
        if renames_since_flush > 0 {
            layout::fsync_dir(&parent).map_err(|e| ProjectError::io(&parent, e))?;
        }
    }

    // Point of no return: after this commit the project is a v2 project
    // and any crash resumes the tree swap instead of the renames
    sqlx::query("INSERT OR REPLACE INTO project_property (name, value) VALUES ('major_version', '2')")
        .execute(db.pool())
        .await?;

    finalize_tree_swap(project_path)?;
    delete_major_version_old(db).await?;

    if let Some(listener) = progress {
        listener.did_upgrade_revisions();
    }
    info!(migrated, "migrated project to major version 2");
    Ok(())
}

/// Completes the migration's filesystem finalization: moves the old flat
/// tree aside for deletion and installs the new tree in its place.
///
/// Idempotent: callable any number of times, including after a crash at any
/// intermediate point.
fn finalize_tree_swap(project_path: &Path) -> Result<(), ProjectError> {
    let revisions_dir = project_path.join(layout::REVISIONS_DIRNAME);
    let in_progress_dir = project_path.join(layout::IN_PROGRESS_REVISIONS_DIRNAME);
    let tmp_dir = project_path.join(layout::TEMPORARY_DIRNAME);
    let old_revisions_dir = tmp_dir.join("old_revisions");

    if !in_progress_dir.is_dir() {
        // Swap already completed
        return Ok(());
    }

    // Move aside the old revisions directory and queue it for deletion
    // (tmp/ is cleared on every writable open)
    if revisions_dir.is_dir() {
        if !tmp_dir.is_dir() {
            std::fs::create_dir_all(&tmp_dir).map_err(|e| ProjectError::io(&tmp_dir, e))?;
        }
        if old_revisions_dir.exists() {
            std::fs::remove_dir_all(&old_revisions_dir)
                .map_err(|e| ProjectError::io(&old_revisions_dir, e))?;
        }
        std::fs::rename(&revisions_dir, &old_revisions_dir)
            .map_err(|e| ProjectError::io(&revisions_dir, e))?;
    }

    std::fs::rename(&in_progress_dir, &revisions_dir)
        .map_err(|e| ProjectError::io(&in_progress_dir, e))?;
    layout::fsync_dir(project_path).map_err(|e| ProjectError::io(project_path, e))?;
    Ok(())
}

async fn read_major_version_old(db: &Database) -> Result<Option<u32>, ProjectError> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT value FROM project_property WHERE name = 'major_version_old'")
            .fetch_optional(db.pool())
            .await?;
    Ok(row.and_then(|(v,)| v).and_then(|v| v.parse().ok()))
}

async fn set_major_version_old(db: &Database, version: u32) -> Result<(), ProjectError> {
    sqlx::query("INSERT OR REPLACE INTO project_property (name, value) VALUES ('major_version_old', ?)")
        .bind(version.to_string())
        .execute(db.pool())
        .await?;
    Ok(())
}

async fn delete_major_version_old(db: &Database) -> Result<(), ProjectError> {
    sqlx::query("DELETE FROM project_property WHERE name = 'major_version_old'")
        .execute(db.pool())
        .await?;
    Ok(())
}
