//! Projects: the durable root of an archive.
//!
//! A project is a `.crystalproj` directory (see [`layout`]) plus the
//! in-memory view riding on top of it. The [`Project`] handle is cheap to
//! clone and shared by the entity model, the scheduler, and the download
//! pipeline; it is the only long-lived mutable state in the crate.
//!
//! # Open modes
//!
//! A project opens *writable*, *read-only* (requested explicitly, or forced
//! when the filesystem refuses writes), or *migrating* (transiently, while
//! the revision layout is upgraded). Read-only projects defer new Resources
//! to an in-memory unsaved set that is flushed by [`Project::save_as`].

pub mod layout;
pub mod migrate;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::db::{Database, DbError};
use crate::model::Alias;
use crate::plugins::PluginRegistry;
use migrate::MigrationProgress;

/// For large volumes, the minimum free space required to write any more
/// revision bodies: 4 GiB.
const LARGE_DISK_MIN_FREE_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// For small volumes, the minimum fraction of total space that must be free.
const SMALL_DISK_MIN_FREE_FRACTION: f64 = 0.05;

/// Witnesses required before the orphaned-last-revision repair may delete a
/// row: this many earlier bodies must be readable, proving the filesystem is
/// healthy and the missing body is a genuine failed rollback.
pub(crate) const ROLLBACK_REPAIR_WITNESSES: usize = 3;

/// Errors opening or operating on a project.
#[derive(Debug, Error)]
pub enum ProjectError {
    /// The path does not contain a project.
    #[error("no project found at {path}")]
    NotFound {
        /// The path that was probed.
        path: PathBuf,
    },

    /// The directory exists and is non-empty, but has no database file.
    #[error("{path} is not a project (database file missing from non-empty directory)")]
    InvalidDirectory {
        /// The path that was probed.
        path: PathBuf,
    },

    /// The project was written by a newer version of the on-disk format.
    #[error("project has major version {found}; this build supports at most {latest}")]
    TooNew {
        /// Version recorded in the project.
        found: u32,
        /// Latest version this build understands.
        latest: u32,
    },

    /// A write was attempted on a read-only project.
    #[error("project is open read-only")]
    ReadOnly,

    /// The volume is too full to safely write revision bodies.
    #[error("volume too full to download ({free} bytes free, {required} required)")]
    DiskFull {
        /// Free bytes on the volume.
        free: u64,
        /// Minimum free bytes required.
        required: u64,
    },

    /// The user declined or cancelled a migration mid-open.
    #[error("project migration was cancelled")]
    MigrationCancelled,

    /// An entity with the same identity already exists.
    #[error("{what} already exists")]
    AlreadyExists {
        /// Description of the conflicting entity.
        what: String,
    },

    /// A referenced entity does not exist.
    #[error("{what} not found")]
    EntityNotFound {
        /// Description of the missing entity.
        what: String,
    },

    /// The entity is referenced by another entity and cannot be deleted.
    #[error("{what} is still referenced and cannot be deleted")]
    InUse {
        /// Description of the referenced entity.
        what: String,
    },

    /// Assigning the group source would create a cycle.
    #[error("resource group source would form a cycle")]
    SourceCycle,

    /// An alias URL prefix is malformed.
    #[error("alias URL prefix must end in '/': {prefix:?}")]
    InvalidAliasPrefix {
        /// The offending prefix.
        prefix: String,
    },

    /// A group URL pattern failed to compile.
    #[error(transparent)]
    Pattern(#[from] crate::pattern::PatternError),

    /// Database open/migration failure.
    #[error(transparent)]
    Db(#[from] DbError),

    /// Database query failure.
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Filesystem failure.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// The path where the error occurred.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A JSON-encoded column or property failed to decode.
    #[error("corrupt metadata: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProjectError {
    /// Creates an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// HTML parser flavor selected by the `html_parser_type` project property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HtmlParserType {
    /// The fast regex-assisted parser.
    Basic,
    /// The forgiving tree-building parser.
    #[default]
    Soup,
}

impl HtmlParserType {
    /// Returns the property string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Soup => "soup",
        }
    }

    fn from_property(value: &str) -> Option<Self> {
        match value {
            "basic" => Some(Self::Basic),
            "soup" => Some(Self::Soup),
            _ => None,
        }
    }
}

/// How entity titles are composed from a URL and a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntityTitleFormat {
    /// `https://example.com/ - Home`
    #[default]
    UrlName,
    /// `Home - https://example.com/`
    NameUrl,
}

impl EntityTitleFormat {
    /// Returns the property string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UrlName => "url_name",
            Self::NameUrl => "name_url",
        }
    }

    fn from_property(value: &str) -> Option<Self> {
        match value {
            "url_name" => Some(Self::UrlName),
            "name_url" => Some(Self::NameUrl),
            _ => None,
        }
    }
}

/// Options controlling how a project is opened.
pub struct OpenOptions {
    /// Open read-only even if the filesystem would permit writes.
    pub readonly: bool,
    /// Whether to migrate an older project to the latest format on open.
    /// When `false`, a v1 project stays on the flat body layout.
    pub accept_migration: bool,
    /// Listener for migration progress; may cancel the migration.
    pub progress: Option<Arc<dyn MigrationProgress>>,
    /// URL normalizer plug-ins; defaults to the built-in set.
    pub plugins: Option<PluginRegistry>,
    /// Assume a resource downloaded earlier in this session is still fresh
    /// and skip re-downloading it.
    pub assume_session_fresh: bool,
    /// How long a same-session download stays fresh. `None` means the whole
    /// session.
    pub session_fresh_window: Option<Duration>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            readonly: false,
            accept_migration: true,
            progress: None,
            plugins: None,
            assume_session_fresh: true,
            session_fresh_window: None,
        }
    }
}

impl fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenOptions")
            .field("readonly", &self.readonly)
            .field("accept_migration", &self.accept_migration)
            .field("progress", &self.progress.is_some())
            .field("assume_session_fresh", &self.assume_session_fresh)
            .field("session_fresh_window", &self.session_fresh_window)
            .finish()
    }
}

/// In-memory index of every persisted resource URL.
///
/// The `BTreeMap` keying supports prefix range scans for group membership.
pub(crate) struct UrlIndex {
    pub(crate) by_url: BTreeMap<String, i64>,
}

/// Resources that exist only in memory: externals, and Resources created
/// while the project is read-only. Ids are negative and never collide with
/// database ids.
pub(crate) struct UnsavedResources {
    next_id: i64,
    pub(crate) by_url: HashMap<String, i64>,
    pub(crate) by_id: HashMap<i64, String>,
}

impl UnsavedResources {
    fn new() -> Self {
        Self {
            next_id: -1,
            by_url: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    /// Returns the id for the URL, allocating a fresh negative id if new.
    pub(crate) fn intern(&mut self, url: &str) -> i64 {
        if let Some(&id) = self.by_url.get(url) {
            return id;
        }
        let id = self.next_id;
        self.next_id -= 1;
        self.by_url.insert(url.to_string(), id);
        self.by_id.insert(id, url.to_string());
        id
    }
}

pub(crate) struct ProjectInner {
    path: PathBuf,
    db: Database,
    readonly: bool,
    forced_readonly: bool,
    major_version: u32,
    plugins: PluginRegistry,
    assume_session_fresh: bool,
    session_fresh_window: Option<Duration>,
    pub(crate) aliases: RwLock<Vec<Alias>>,
    pub(crate) url_index: RwLock<Option<UrlIndex>>,
    pub(crate) unsaved: Mutex<UnsavedResources>,
}

/// An open project. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Project {
    pub(crate) inner: Arc<ProjectInner>,
}

impl fmt::Debug for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Project")
            .field("path", &self.inner.path)
            .field("readonly", &self.inner.readonly)
            .field("major_version", &self.inner.major_version)
            .finish()
    }
}

impl Project {
    /// Creates a new empty project at `path` and opens it writable.
    ///
    /// New projects are created at the latest format version.
    ///
    /// # Errors
    ///
    /// Fails if `path` exists and is non-empty, or on any I/O or database
    /// error.
    #[instrument(skip(path, options), fields(path = %path.as_ref().display()))]
    pub async fn create(
        path: impl AsRef<Path>,
        options: OpenOptions,
    ) -> Result<Self, ProjectError> {
        let path = path.as_ref();

        if path.exists() {
            let mut entries = std::fs::read_dir(path).map_err(|e| ProjectError::io(path, e))?;
            if entries.next().is_some() {
                return Err(ProjectError::InvalidDirectory {
                    path: path.to_path_buf(),
                });
            }
        } else {
            std::fs::create_dir_all(path).map_err(|e| ProjectError::io(path, e))?;
        }

        // Create the database at the latest metadata schema, then stamp the
        // latest body layout version
        let db = Database::open_writable(&path.join(layout::DATABASE_FILENAME)).await?;
        sqlx::query("INSERT INTO project_property (name, value) VALUES ('major_version', ?)")
            .bind(layout::LATEST_SUPPORTED_MAJOR_VERSION.to_string())
            .execute(db.pool())
            .await?;
        db.close().await;

        std::fs::create_dir(path.join(layout::REVISIONS_DIRNAME))
            .map_err(|e| ProjectError::io(path, e))?;

        info!("created project");
        Self::open(path, options).await
    }

    /// Opens an existing project directory.
    ///
    /// Follows the open sequence: validate the directory shape, open the
    /// database (falling back to read-only if the filesystem demands it),
    /// check the format version, repair interrupted writes and migrations,
    /// offer a format upgrade, then refresh the auxiliary files.
    #[instrument(skip(path, options), fields(path = %path.as_ref().display()))]
    pub async fn open(
        path: impl AsRef<Path>,
        options: OpenOptions,
    ) -> Result<Self, ProjectError> {
        let path = path.as_ref().to_path_buf();

        // 1. Validate directory shape
        if !path.is_dir() {
            return Err(ProjectError::NotFound { path });
        }
        let db_path = path.join(layout::DATABASE_FILENAME);
        if !db_path.is_file() {
            let mut entries = std::fs::read_dir(&path).map_err(|e| ProjectError::io(&path, e))?;
            return Err(if entries.next().is_some() {
                ProjectError::InvalidDirectory { path }
            } else {
                ProjectError::NotFound { path }
            });
        }

        // 2. Open the database, detecting filesystem-forced read-only
        let mut forced_readonly = false;
        let db = if options.readonly {
            Database::open_readonly(&db_path).await?
        } else {
            match Database::open_writable(&db_path).await {
                Ok(db) => db,
                Err(error) if is_readonly_filesystem_error(&error) => {
                    warn!(%error, "filesystem refused writes; opening read-only");
                    forced_readonly = true;
                    Database::open_readonly(&db_path).await?
                }
                Err(error) => return Err(error.into()),
            }
        };
        let readonly = options.readonly || forced_readonly;

        // 3. Check the format version
        let mut major_version = read_major_version(&db).await?;
        if major_version > layout::LATEST_SUPPORTED_MAJOR_VERSION {
            let found = major_version;
            db.close().await;
            return Err(ProjectError::TooNew {
                found,
                latest: layout::LATEST_SUPPORTED_MAJOR_VERSION,
            });
        }

        let progress = options.progress.as_deref();
        if !readonly {
            // 4. Repair: resume an interrupted migration, then clean up any
            //    revision orphaned by a failed rollback
            migrate::resume_if_needed(&path, &db, &mut major_version, progress).await?;
            repair_incomplete_rollback(&path, &db, major_version).await?;

            // 5. Offer migration to the latest version
            if major_version < layout::LATEST_SUPPORTED_MAJOR_VERSION && options.accept_migration {
                migrate::migrate_v1_to_v2(&path, &db, progress).await?;
                major_version = layout::LATEST_SUPPORTED_MAJOR_VERSION;
            }

            // 6. Refresh auxiliary files
            clear_temporary_dir(&path)?;
            ensure_auxiliary_files(&path)?;
        }

        let aliases = Alias::load_all(&db).await?;

        debug!(major_version, readonly, "opened project");
        Ok(Self {
            inner: Arc::new(ProjectInner {
                path,
                db,
                readonly,
                forced_readonly,
                major_version,
                plugins: options.plugins.unwrap_or_default(),
                assume_session_fresh: options.assume_session_fresh,
                session_fresh_window: options.session_fresh_window,
                aliases: RwLock::new(aliases),
                url_index: RwLock::new(None),
                unsaved: Mutex::new(UnsavedResources::new()),
            }),
        })
    }

    /// The project directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Whether the project rejects writes.
    #[must_use]
    pub fn readonly(&self) -> bool {
        self.inner.readonly
    }

    /// Whether read-only mode was forced by the filesystem rather than
    /// requested.
    #[must_use]
    pub fn forced_readonly(&self) -> bool {
        self.inner.forced_readonly
    }

    /// The revision body layout version.
    #[must_use]
    pub fn major_version(&self) -> u32 {
        self.inner.major_version
    }

    /// The URL normalizer plug-ins configured at open time.
    #[must_use]
    pub fn plugins(&self) -> &PluginRegistry {
        &self.inner.plugins
    }

    /// Whether same-session downloads are assumed fresh.
    #[must_use]
    pub fn assume_session_fresh(&self) -> bool {
        self.inner.assume_session_fresh
    }

    /// How long a same-session download stays fresh; `None` = whole session.
    #[must_use]
    pub fn session_fresh_window(&self) -> Option<Duration> {
        self.inner.session_fresh_window
    }

    pub(crate) fn db(&self) -> &Database {
        &self.inner.db
    }

    /// Returns an error if the project is read-only.
    pub(crate) fn ensure_writable(&self) -> Result<(), ProjectError> {
        if self.inner.readonly {
            Err(ProjectError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// The staging directory for partially-written bodies.
    #[must_use]
    pub fn temporary_dir(&self) -> PathBuf {
        self.inner.path.join(layout::TEMPORARY_DIRNAME)
    }

    /// The revision body tree.
    #[must_use]
    pub fn revisions_dir(&self) -> PathBuf {
        self.inner.path.join(layout::REVISIONS_DIRNAME)
    }

    /// Resolves the body path for a revision id under this project's layout.
    #[must_use]
    pub fn revision_body_path(&self, revision_id: i64) -> PathBuf {
        layout::body_path(&self.inner.path, self.inner.major_version, revision_id)
    }

    // === Free space ===

    /// Verifies the volume has room for more revision bodies.
    ///
    /// The threshold is `min(4 GiB, 5% of the volume)`: big disks keep an
    /// absolute reserve, small disks a fractional one.
    pub fn check_free_space(&self) -> Result<(), ProjectError> {
        let free = fs2::available_space(&self.inner.path)
            .map_err(|e| ProjectError::io(&self.inner.path, e))?;
        let total = fs2::total_space(&self.inner.path)
            .map_err(|e| ProjectError::io(&self.inner.path, e))?;

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let required = LARGE_DISK_MIN_FREE_BYTES
            .min((total as f64 * SMALL_DISK_MIN_FREE_FRACTION) as u64);
        if free < required {
            return Err(ProjectError::DiskFull { free, required });
        }
        Ok(())
    }

    // === Properties ===

    /// Reads a raw project property.
    pub async fn get_property(&self, name: &str) -> Result<Option<String>, ProjectError> {
        let value: Option<(Option<String>,)> =
            sqlx::query_as("SELECT value FROM project_property WHERE name = ?")
                .bind(name)
                .fetch_optional(self.inner.db.pool())
                .await?;
        Ok(value.and_then(|(v,)| v))
    }

    /// Writes a raw project property in its own transaction.
    pub async fn set_property(&self, name: &str, value: &str) -> Result<(), ProjectError> {
        self.ensure_writable()?;
        sqlx::query("INSERT OR REPLACE INTO project_property (name, value) VALUES (?, ?)")
            .bind(name)
            .bind(value)
            .execute(self.inner.db.pool())
            .await?;
        Ok(())
    }

    /// Deletes a raw project property.
    pub async fn delete_property(&self, name: &str) -> Result<(), ProjectError> {
        self.ensure_writable()?;
        sqlx::query("DELETE FROM project_property WHERE name = ?")
            .bind(name)
            .execute(self.inner.db.pool())
            .await?;
        Ok(())
    }

    /// The URL prefix most links in this project share, if configured.
    pub async fn default_url_prefix(&self) -> Result<Option<String>, ProjectError> {
        self.get_property("default_url_prefix").await
    }

    /// Sets the default URL prefix.
    pub async fn set_default_url_prefix(&self, prefix: &str) -> Result<(), ProjectError> {
        self.set_property("default_url_prefix", prefix).await
    }

    /// The configured HTML parser flavor.
    pub async fn html_parser_type(&self) -> Result<HtmlParserType, ProjectError> {
        Ok(self
            .get_property("html_parser_type")
            .await?
            .as_deref()
            .and_then(HtmlParserType::from_property)
            .unwrap_or_default())
    }

    /// Sets the HTML parser flavor.
    pub async fn set_html_parser_type(&self, value: HtmlParserType) -> Result<(), ProjectError> {
        self.set_property("html_parser_type", value.as_str()).await
    }

    /// The configured entity title format.
    pub async fn entity_title_format(&self) -> Result<EntityTitleFormat, ProjectError> {
        Ok(self
            .get_property("entity_title_format")
            .await?
            .as_deref()
            .and_then(EntityTitleFormat::from_property)
            .unwrap_or_default())
    }

    /// The project-wide request cookie header value, if any.
    pub async fn request_cookie(&self) -> Result<Option<String>, ProjectError> {
        self.get_property("request_cookie").await
    }

    /// Sets the project-wide request cookie header value.
    pub async fn set_request_cookie(&self, cookie: &str) -> Result<(), ProjectError> {
        self.set_property("request_cookie", cookie).await
    }

    /// Whether the project request cookie should be attached to a request
    /// for `url`: only within the default URL prefix when one is set.
    pub async fn request_cookie_applies_to(&self, url: &str) -> Result<bool, ProjectError> {
        match self.default_url_prefix().await? {
            Some(prefix) => Ok(url.starts_with(&prefix)),
            None => Ok(true),
        }
    }

    // === URL index ===

    /// Loads every resource URL into the in-memory index.
    ///
    /// Until this is called, lookups and group membership fall back to
    /// database queries. Idempotent.
    #[instrument(skip(self))]
    pub async fn load_urls(&self) -> Result<(), ProjectError> {
        if self.urls_loaded() {
            return Ok(());
        }
        let rows: Vec<(i64, String)> = sqlx::query_as("SELECT id, url FROM resource ORDER BY id")
            .fetch_all(self.inner.db.pool())
            .await?;
        let mut by_url = BTreeMap::new();
        for (id, url) in rows {
            by_url.insert(url, id);
        }
        let count = by_url.len();
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
        {
            *self.inner.url_index.write().unwrap() = Some(UrlIndex { by_url });
        }
        debug!(count, "loaded URL index");
        Ok(())
    }

    /// Whether the in-memory URL index has been loaded.
    #[must_use]
    pub fn urls_loaded(&self) -> bool {
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
        self.inner.url_index.read().unwrap().is_some()
    }

    /// A snapshot of the aliases, in id order.
    #[must_use]
    pub fn aliases(&self) -> Vec<Alias> {
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
        self.inner.aliases.read().unwrap().clone()
    }

    // === Save As ===

    /// Copies this project to `dest`, flushing unsaved resources into the
    /// copy, and returns the copy opened writable.
    ///
    /// The copy is staged under the `.crystalproj-partial` extension and
    /// renamed to its final name only after it is complete.
    #[instrument(skip(self, dest), fields(dest = %dest.as_ref().display()))]
    pub async fn save_as(&self, dest: impl AsRef<Path>) -> Result<Self, ProjectError> {
        let dest = dest.as_ref();
        let partial = partial_path_for(dest);

        if partial.exists() {
            std::fs::remove_dir_all(&partial).map_err(|e| ProjectError::io(&partial, e))?;
        }

        // Copy everything but the staging directory contents
        copy_project_tree(&self.inner.path, &partial)?;

        // Flush unsaved (negative-id) resources into the copy with one
        // batched INSERT. External URLs stay in-memory-only.
        let unsaved_urls: Vec<String> = {
            #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
            let unsaved = self.inner.unsaved.lock().unwrap();
            unsaved
                .by_url
                .keys()
                .filter(|url| !url.starts_with(crate::urls::EXTERNAL_URL_PREFIX))
                .cloned()
                .collect()
        };
        if !unsaved_urls.is_empty() {
            let db = Database::open_writable(&partial.join(layout::DATABASE_FILENAME)).await?;
            let mut tx = db.pool().begin().await?;
            for url in &unsaved_urls {
                sqlx::query("INSERT OR IGNORE INTO resource (url) VALUES (?)")
                    .bind(url)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            db.close().await;
            info!(count = unsaved_urls.len(), "flushed unsaved resources");
        }

        if dest.exists() {
            std::fs::remove_dir_all(dest).map_err(|e| ProjectError::io(dest, e))?;
        }
        std::fs::rename(&partial, dest).map_err(|e| ProjectError::io(&partial, e))?;

        Self::open(dest, OpenOptions::default()).await
    }

    /// Closes the database pool. The handle must not be used afterwards.
    pub async fn close(&self) {
        self.inner.db.close().await;
    }
}

/// Derives the staging path for a Save-As destination.
fn partial_path_for(dest: &Path) -> PathBuf {
    let name = dest.file_name().map_or_else(
        || layout::PARTIAL_PROJECT_EXTENSION.to_string(),
        |n| {
            let n = n.to_string_lossy();
            match n.strip_suffix(layout::PROJECT_EXTENSION) {
                Some(stem) => format!("{stem}{}", layout::PARTIAL_PROJECT_EXTENSION),
                None => format!("{n}{}", layout::PARTIAL_PROJECT_EXTENSION),
            }
        },
    );
    dest.with_file_name(name)
}

/// Recursively copies a project directory, skipping staging contents.
fn copy_project_tree(src: &Path, dest: &Path) -> Result<(), ProjectError> {
    std::fs::create_dir_all(dest).map_err(|e| ProjectError::io(dest, e))?;
    let mut stack = vec![(src.to_path_buf(), dest.to_path_buf())];
    while let Some((src_dir, dest_dir)) = stack.pop() {
        let entries = std::fs::read_dir(&src_dir).map_err(|e| ProjectError::io(&src_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| ProjectError::io(&src_dir, e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| ProjectError::io(entry.path(), e))?;
            let from = entry.path();
            let to = dest_dir.join(entry.file_name());
            if file_type.is_dir() {
                // The staging dir is recreated empty in the copy
                std::fs::create_dir_all(&to).map_err(|e| ProjectError::io(&to, e))?;
                if entry.file_name() != layout::TEMPORARY_DIRNAME {
                    stack.push((from, to));
                }
            } else if file_type.is_file() {
                std::fs::copy(&from, &to).map_err(|e| ProjectError::io(&from, e))?;
            }
        }
    }
    Ok(())
}

/// Reads `major_version` directly, before any properties cache exists.
/// A project without the property predates versioning and is v1.
pub(crate) async fn read_major_version(db: &Database) -> Result<u32, ProjectError> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT value FROM project_property WHERE name = 'major_version'")
            .fetch_optional(db.pool())
            .await?;
    match row.and_then(|(v,)| v) {
        Some(value) => value
            .parse()
            .map_err(|_| ProjectError::Json(serde_json::Error::io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("non-numeric major_version: {value:?}"),
            )))),
        None => Ok(1),
    }
}

fn is_readonly_filesystem_error(error: &DbError) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("readonly")
        || message.contains("read-only")
        || message.contains("permission denied")
        || message.contains("access is denied")
        || message.contains("unable to open database file")
}

/// Empties the staging directory, creating it if missing.
fn clear_temporary_dir(project_path: &Path) -> Result<(), ProjectError> {
    let tmp = project_path.join(layout::TEMPORARY_DIRNAME);
    if tmp.is_dir() {
        let entries = std::fs::read_dir(&tmp).map_err(|e| ProjectError::io(&tmp, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| ProjectError::io(&tmp, e))?;
            let path = entry.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(error) = result {
                warn!(path = %path.display(), %error, "could not clear staging entry");
            }
        }
    } else {
        std::fs::create_dir_all(&tmp).map_err(|e| ProjectError::io(&tmp, e))?;
    }
    Ok(())
}

/// Recreates any missing discoverable files in the project directory.
fn ensure_auxiliary_files(project_path: &Path) -> Result<(), ProjectError> {
    let revisions = project_path.join(layout::REVISIONS_DIRNAME);
    if !revisions.is_dir() {
        std::fs::create_dir_all(&revisions).map_err(|e| ProjectError::io(&revisions, e))?;
    }

    // Opener stub: any *.crystalopen file counts
    let has_opener = std::fs::read_dir(project_path)
        .map_err(|e| ProjectError::io(project_path, e))?
        .flatten()
        .any(|entry| entry.file_name().to_string_lossy().ends_with(".crystalopen"));
    if !has_opener {
        let opener = project_path.join(layout::OPENER_FILENAME);
        std::fs::write(&opener, layout::OPENER_MAGIC).map_err(|e| ProjectError::io(&opener, e))?;

        let readme = project_path.join(layout::README_FILENAME);
        if !readme.exists() {
            std::fs::write(&readme, layout::README_CONTENT)
                .map_err(|e| ProjectError::io(&readme, e))?;
        }
    }

    let desktop_ini = project_path.join(layout::DESKTOP_INI_FILENAME);
    if !desktop_ini.exists() {
        std::fs::write(&desktop_ini, layout::DESKTOP_INI_CONTENT)
            .map_err(|e| ProjectError::io(&desktop_ini, e))?;
        let icons = project_path.join(layout::ICONS_DIRNAME);
        if !icons.is_dir() {
            std::fs::create_dir_all(&icons).map_err(|e| ProjectError::io(&icons, e))?;
        }
    }

    let dot_directory = project_path.join(layout::DOT_DIRECTORY_FILENAME);
    if !dot_directory.exists() {
        std::fs::write(&dot_directory, layout::DOT_DIRECTORY_CONTENT)
            .map_err(|e| ProjectError::io(&dot_directory, e))?;
    }

    Ok(())
}

/// Deletes the last revision row when its body is missing and a failed
/// rollback is the likely cause.
///
/// Revisions are written with sequential ids, so a rollback that failed due
/// to a disk-wide I/O failure can only have affected the most recent write.
/// The row is deleted only when the [`ROLLBACK_REPAIR_WITNESSES`] most
/// recent earlier body-bearing revisions are all readable, which rules out
/// an unmounted or flaky filesystem masquerading as a missing body.
async fn repair_incomplete_rollback(
    project_path: &Path,
    db: &Database,
    major_version: u32,
) -> Result<(), ProjectError> {
    let last: Option<(i64, String)> =
        sqlx::query_as("SELECT id, error FROM resource_revision ORDER BY id DESC LIMIT 1")
            .fetch_optional(db.pool())
            .await?;
    let Some((last_id, last_error)) = last else {
        return Ok(());
    };
    if last_error != "null" {
        // No body expected; no rollback could have been attempted
        return Ok(());
    }
    let last_body = layout::body_path(project_path, major_version, last_id);
    if last_body.is_file() {
        return Ok(());
    }

    let witnesses: Vec<(i64,)> = sqlx::query_as(
        "SELECT id FROM resource_revision \
         WHERE error = 'null' AND id < ? \
         ORDER BY id DESC LIMIT ?",
    )
    .bind(last_id)
    .bind(i64::try_from(ROLLBACK_REPAIR_WITNESSES).unwrap_or(3))
    .fetch_all(db.pool())
    .await?;
    if witnesses.len() < ROLLBACK_REPAIR_WITNESSES {
        // Not enough history to tell a failed rollback from a flaky disk;
        // be conservative
        return Ok(());
    }
    for (witness_id,) in &witnesses {
        let body = layout::body_path(project_path, major_version, *witness_id);
        if std::fs::File::open(&body).is_err() {
            // Multiple unreadable bodies suggests a filesystem problem, not
            // a rollback failure
            return Ok(());
        }
    }

    warn!(
        revision_id = last_id,
        "cleaning up likely-orphaned revision: missing body, probable rollback failure"
    );
    sqlx::query("DELETE FROM resource_revision WHERE id = ?")
        .bind(last_id)
        .execute(db.pool())
        .await?;
    Ok(())
}
