//! The task tree: kinds, states, and the listener contract.
//!
//! Tasks form one tree per project, rooted at a always-present container
//! node. All structural mutation happens on the scheduler loop; observers
//! watch through [`TaskListener`] callbacks.
//!
//! State transitions are monotonic:
//! `pending -> running -> (completed | failed | cancelled)`. A task never
//! reverts. Sibling *completion events* are re-sorted into creation order
//! inside container tasks before listeners see them, even though the
//! underlying network fetches finish out of order.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::model::{MemberCursor, Resource, ResourceId, Revision, RevisionId};
use crate::parse::Link;
use crate::scheduler::SchedulerError;

/// Identifier of a task within one scheduler's tree.
pub type TaskId = u64;

/// The id of the always-present per-project root container.
pub const ROOT_TASK_ID: TaskId = 1;

/// What a task does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// The per-project container for top-level tasks.
    Root,
    /// Fetch one URL's bytes and headers, producing one Revision.
    DownloadResourceBody {
        /// The Resource to fetch.
        resource_id: ResourceId,
    },
    /// Body + link parsing + embedded-resource downloads.
    DownloadResource {
        /// The Resource to download.
        resource_id: ResourceId,
    },
    /// Run the parser facade over a revision and record discovered
    /// Resources.
    ParseLinks {
        /// The revision whose body is parsed.
        revision_id: RevisionId,
    },
    /// Refresh group membership by downloading the group's source.
    UpdateGroupMembers {
        /// The group being refreshed.
        group_id: i64,
    },
    /// Update members, then download each member.
    DownloadGroup {
        /// The group being downloaded.
        group_id: i64,
    },
}

impl TaskKind {
    /// Short machine-readable label, used in logs and task titles.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::DownloadResourceBody { .. } => "download_resource_body",
            Self::DownloadResource { .. } => "download_resource",
            Self::ParseLinks { .. } => "parse_links",
            Self::UpdateGroupMembers { .. } => "update_group_members",
            Self::DownloadGroup { .. } => "download_group",
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, not yet running.
    Pending,
    /// Work dispatched.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error. Stays in the tree until dismissed.
    Failed,
    /// Cancelled by the user or by a cancelled ancestor.
    Cancelled,
}

impl TaskState {
    /// Whether this state is final.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Scheduling priority of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadPriority {
    /// The user asked for this directly, or the serving layer needs it now.
    /// Bypasses the politeness delay.
    Interactive,
    /// Group downloads and other bulk work. Politeness applies.
    #[default]
    Background,
}

/// Observer of the task tree.
///
/// Callbacks run on the scheduler loop; implementations must not block.
pub trait TaskListener: Send + Sync {
    /// A task was added under `parent_id`.
    fn on_task_added(&self, parent_id: TaskId, task_id: TaskId, kind: &TaskKind, title: &str) {
        let _ = (parent_id, task_id, kind, title);
    }

    /// A task reported progress.
    fn on_task_progress(&self, task_id: TaskId, units_done: u64, units_total: Option<u64>) {
        let _ = (task_id, units_done, units_total);
    }

    /// A task changed state. Terminal sibling states arrive in creation
    /// order within a container.
    fn on_task_state(&self, task_id: TaskId, state: TaskState, error: Option<&str>) {
        let _ = (task_id, state, error);
    }

    /// A completed top-level task was pruned from the tree.
    fn on_task_removed(&self, task_id: TaskId) {
        let _ = task_id;
    }

    /// The scheduler became busy (first task added) or idle (tree
    /// drained). Embedders use this to inhibit or release OS idle sleep.
    fn on_scheduler_busy(&self, busy: bool) {
        let _ = busy;
    }
}

/// A top-level task serialized into the `hibernated_tasks` project
/// property on close and reconstituted on the next writable open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HibernatedTask {
    /// An incomplete top-level resource download.
    DownloadResource {
        /// The Resource id.
        resource_id: i64,
    },
    /// An incomplete top-level group download.
    DownloadGroup {
        /// The group id.
        group_id: i64,
    },
}

/// Payload a finished task hands to its parent.
pub(crate) enum Done {
    Unit,
    Revision(Revision),
    Links(Vec<Link>),
}

/// Per-kind bookkeeping attached to a task node.
pub(crate) enum Detail {
    Root,
    DownloadResource(DownloadResourceState),
    Body(BodyState),
    ParseLinks,
    UpdateGroupMembers,
    DownloadGroup(DownloadGroupState),
}

pub(crate) struct DownloadResourceState {
    pub resource: Resource,
    /// Resource ids on the embed chain leading here, for the
    /// self-reference guard.
    pub ancestors: Arc<HashSet<ResourceId>>,
    /// Embed nesting depth; zero for pages.
    pub embed_depth: usize,
    /// Whether this download occupies a politeness page slot.
    pub is_page: bool,
    /// The revision produced by the body child.
    pub revision: Option<Revision>,
    /// Whether the body child actually hit the network.
    pub fetched: bool,
    /// Set once the final phase has added all the children it will add.
    pub embeds_scheduled: bool,
    /// Futures waiting on the body revision.
    pub waiters: Vec<oneshot::Sender<Result<Revision, SchedulerError>>>,
}

pub(crate) struct BodyState {
    pub resource: Resource,
    /// Wall-clock threshold that bypasses the session-fresh short-circuit.
    pub stale_before: Option<chrono::DateTime<chrono::Utc>>,
    /// Staging file the worker writes into.
    pub staging_path: std::path::PathBuf,
    /// Whether a network fetch happened (vs the session-fresh cache hit).
    pub did_download: bool,
}

pub(crate) struct DownloadGroupState {
    pub group_id: i64,
    pub cursor: Option<MemberCursor>,
    /// Total members materialized as children so far.
    pub members_spawned: u64,
    /// Set once the member cursor is exhausted.
    pub members_exhausted: bool,
}

/// One node of the task tree.
pub(crate) struct TaskNode {
    pub id: TaskId,
    pub kind: TaskKind,
    pub title: String,
    pub state: TaskState,
    pub priority: DownloadPriority,
    pub parent: Option<TaskId>,
    pub children: Vec<TaskId>,
    /// Number of children whose terminal state has been applied, in
    /// creation order.
    pub applied_children: usize,
    /// Children finished out of order, buffered until their older siblings
    /// complete. Keyed by child index.
    pub ready_children: BTreeMap<usize, ()>,
    pub error: Option<String>,
    pub done: Option<Done>,
    pub cancel: CancellationToken,
    pub detail: Detail,
}

impl TaskNode {
    /// Whether every child added so far has had its completion applied.
    #[must_use]
    pub fn all_children_applied(&self) -> bool {
        self.applied_children == self.children.len()
    }
}
