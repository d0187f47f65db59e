//! Crystal Core
//!
//! The storage engine and download scheduler behind the Crystal website
//! archiver. Crystal downloads web pages for long-term preservation and
//! serves them back for browsing; this crate is the part that persists the
//! archive, keeps the in-memory entity model consistent with it, and runs
//! downloads in parallel without being rude to origin servers.
//!
//! # Architecture
//!
//! - [`db`] - SQLite connectivity for the project metadata database
//! - [`project`] - the `.crystalproj` on-disk format: open/create/migrate
//! - [`model`] - Resources, Root Resources, Resource Groups, Revisions, Aliases
//! - [`urls`] - URL normalization applied on every ingress
//! - [`scheduler`] - the task tree and the worker pool that drains it
//! - [`download`] - the HTTP fetch half of the download pipeline
//! - [`parse`] - pluggable link extractors over HTML/CSS/JSON/feeds
//!
//! The [`project::Project`] is the durable root: everything else can be
//! reconstructed from the database plus the revision body tree.
//!
//! # Example
//!
//! ```no_run
//! use crystal_core::project::{OpenOptions, Project};
//! use crystal_core::scheduler::{DownloadPriority, Scheduler, SchedulerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let project = Project::open("sites/xkcd.crystalproj", OpenOptions::default()).await?;
//! let resource = project.get_or_create_resource("https://xkcd.com/1/").await?;
//! let scheduler = Scheduler::spawn(project.clone(), SchedulerConfig::default());
//! let revision = scheduler
//!     .download_resource(resource.id, DownloadPriority::Interactive)?
//!     .await?;
//! println!("archived {} as revision {}", resource.url, revision.id);
//! # Ok(())
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod db;
pub mod download;
pub mod http_date;
pub mod model;
pub mod parse;
pub mod pattern;
pub mod plugins;
pub mod project;
pub mod scheduler;
pub mod urls;

// Re-export commonly used types
pub use db::Database;
pub use download::{DownloadErrorKind, DownloadOutcome, Fetcher};
pub use model::{
    Alias, Resource, ResourceGroup, ResourceId, Revision, RevisionId, RevisionMetadata,
    RootResource,
};
pub use parse::{Link, LinkKind, ParserRegistry};
pub use pattern::UrlPattern;
pub use project::{OpenOptions, Project, ProjectError};
pub use scheduler::{
    DownloadPriority, Scheduler, SchedulerConfig, TaskId, TaskKind, TaskListener, TaskState,
};
pub use urls::NormalizedUrl;
