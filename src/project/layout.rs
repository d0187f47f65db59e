//! On-disk layout of a `.crystalproj` directory.
//!
//! ```text
//! <name>.crystalproj/
//!   database.sqlite        relational metadata
//!   revisions/             revision bodies (layout depends on major_version)
//!   revisions.inprogress/  transient, only during the v1 -> v2 migration
//!   tmp/                   staging area, cleared on each writable open
//!   OPEN ME.crystalopen    opener stub, magic bytes "CrOp"
//!   README.txt             static user-facing note
//!   icons/, desktop.ini, .directory   platform icon integration
//! ```
//!
//! The body path of a revision is a pure function of the project's
//! `major_version` and the revision id; see [`body_path`].

use std::io;
use std::path::{Path, PathBuf};

/// Extension of a project directory.
pub const PROJECT_EXTENSION: &str = ".crystalproj";

/// Extension of a project directory mid Save-As; renamed to
/// [`PROJECT_EXTENSION`] only after the copy fully succeeds.
pub const PARTIAL_PROJECT_EXTENSION: &str = ".crystalproj-partial";

/// Metadata database file, inside the project directory.
pub const DATABASE_FILENAME: &str = "database.sqlite";

/// Revision body tree.
pub const REVISIONS_DIRNAME: &str = "revisions";

/// Replacement revision tree being built by the v1 -> v2 migration.
pub const IN_PROGRESS_REVISIONS_DIRNAME: &str = "revisions.inprogress";

/// Staging directory for partially-written bodies. Cleared on writable open.
pub const TEMPORARY_DIRNAME: &str = "tmp";

/// Opener stub that desktop environments can associate with the app.
pub const OPENER_FILENAME: &str = "OPEN ME.crystalopen";

/// Magic bytes (four-CC) at the start of the opener stub.
pub const OPENER_MAGIC: &[u8; 4] = b"CrOp";

/// User-facing README dropped into every writable project.
pub const README_FILENAME: &str = "README.txt";

pub(crate) const README_CONTENT: &str = "\
This folder is a Crystal project, a browsable archive of one or more websites.

To view the archived sites, open the \"OPEN ME\" file with Crystal,
or open this folder from inside Crystal.

Do not rename or edit the files in this folder by hand;
doing so can corrupt the archive.
";

/// Windows folder-icon metadata file.
pub const DESKTOP_INI_FILENAME: &str = "desktop.ini";

pub(crate) const DESKTOP_INI_CONTENT: &str = "\
[.ShellClassInfo]\r\nIconResource=icons\\docicon.ico,0\r\n";

/// KDE folder-icon metadata file.
pub const DOT_DIRECTORY_FILENAME: &str = ".directory";

pub(crate) const DOT_DIRECTORY_CONTENT: &str = "[Desktop Entry]\nIcon=crystalproj\n";

/// Directory holding platform icon assets referenced by `desktop.ini`.
pub const ICONS_DIRNAME: &str = "icons";

/// Latest on-disk format this build can open.
pub const LATEST_SUPPORTED_MAJOR_VERSION: u32 = 2;

/// Per-directory fanout of the hierarchical (v2) body layout: 16^3 entries.
pub const DIRECTORY_FANOUT: u64 = 4096;

/// Highest revision id representable by the v2 layout (15 hex digits).
pub const MAX_V2_REVISION_ID: i64 = (16_i64.pow(15)) - 1;

/// Returns the body file path for a revision id under the given layout
/// version.
///
/// - `major_version == 1`: `revisions/<id>` (flat decimal).
/// - `major_version == 2`: the id is written as 15 hex digits and split
///   `AAA/BBB/CCC/DDD/EEE`; the final component is the file.
///
/// # Panics
///
/// Debug-asserts that `major_version` is a supported version; release
/// builds fall back to the v2 layout for unknown versions.
#[must_use]
pub fn body_path(project_dir: &Path, major_version: u32, revision_id: i64) -> PathBuf {
    debug_assert!(
        (1..=LATEST_SUPPORTED_MAJOR_VERSION).contains(&major_version),
        "unsupported major version {major_version}"
    );
    let revisions = project_dir.join(REVISIONS_DIRNAME);
    if major_version == 1 {
        revisions.join(revision_id.to_string())
    } else {
        let (parent, leaf) = v2_split(revision_id);
        revisions.join(parent).join(leaf)
    }
}

/// Splits a revision id into the v2 parent path (`AAA/BBB/CCC/DDD`) and
/// leaf filename (`EEE`).
#[must_use]
pub fn v2_split(revision_id: i64) -> (PathBuf, String) {
    let hex = format!("{revision_id:015x}");
    let parent = PathBuf::from(&hex[0..3])
        .join(&hex[3..6])
        .join(&hex[6..9])
        .join(&hex[9..12]);
    (parent, hex[12..15].to_string())
}

/// Flushes directory metadata (renames, creations) to stable storage.
///
/// A rename is only durable once its containing directory has been synced;
/// the revision write protocol and the v1 -> v2 migration both depend on
/// this.
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    // Directories cannot be opened for writing; a read handle suffices for
    // fsync on the platforms we support.
    let handle = std::fs::File::open(dir)?;
    handle.sync_all()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_body_path_v1_is_flat_decimal() {
        let path = body_path(Path::new("p.crystalproj"), 1, 1234);
        assert_eq!(path, Path::new("p.crystalproj/revisions/1234"));
    }

    #[test]
    fn test_body_path_v2_is_hex_split() {
        let path = body_path(Path::new("p.crystalproj"), 2, 1);
        assert_eq!(
            path,
            Path::new("p.crystalproj/revisions/000/000/000/000/001")
        );

        let path = body_path(Path::new("p.crystalproj"), 2, 0x0123_4567_89ab_cde);
        assert_eq!(
            path,
            Path::new("p.crystalproj/revisions/012/345/678/9ab/cde")
        );
    }

    #[test]
    fn test_v2_split_max_id() {
        let (parent, leaf) = v2_split(MAX_V2_REVISION_ID);
        assert_eq!(parent, Path::new("fff/fff/fff/fff"));
        assert_eq!(leaf, "fff");
    }

    #[test]
    fn test_v2_capacity() {
        // 15 hex digits of capacity, 4,096 entries per directory level
        assert_eq!(MAX_V2_REVISION_ID, 0xfff_fff_fff_fff_fff);
        assert_eq!(DIRECTORY_FANOUT, 16 * 16 * 16);
    }

    #[test]
    fn test_fsync_dir_on_real_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        fsync_dir(temp_dir.path()).unwrap();
    }
}
