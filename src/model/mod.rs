//! The in-memory entity model.
//!
//! Five entity kinds ride on top of the project store:
//!
//! - [`Resource`] - a downloadable absolute URL, created lazily on first
//!   reference and identified by its canonical URL.
//! - [`Revision`] - one concrete fetch of a Resource: response metadata, an
//!   optional error record, and (usually) a body blob on disk.
//! - [`RootResource`] - a user-named anchor pointing at exactly one
//!   Resource.
//! - [`ResourceGroup`] - a named URL pattern whose membership is the set of
//!   matching Resources, derived on demand.
//! - [`Alias`] - a URL prefix rewrite rule, optionally routing URLs out of
//!   the archive entirely.
//!
//! Entities are plain values; all persistence goes through [`Project`]
//! methods defined alongside each entity type.
//!
//! [`Project`]: crate::project::Project

pub mod alias;
pub mod group;
pub mod resource;
pub mod revision;
pub mod root_resource;

pub use alias::Alias;
pub use group::{GroupSource, MemberCursor, ResourceGroup};
pub use resource::{BulkCreateOutcome, Resource, ResourceId};
pub use revision::{
    Revision, RevisionError, RevisionErrorRecord, RevisionId, RevisionMetadata,
};
pub use root_resource::RootResource;
