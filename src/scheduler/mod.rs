//! The cooperative download scheduler.
//!
//! One scheduler runs per open project. A single loop owns the task tree
//! and every database write; a bounded pool of workers performs network
//! fetches and CPU parses, which never touch the database. Workers report
//! back over a message channel and the loop commits their results, so
//! there is exactly one writer per project at all times.
//!
//! # Politeness
//!
//! Background page downloads are serialized: the next page starts only
//! after the previous page (body plus embedded resources) has completed
//! and the politeness delay has elapsed. Embedded resources within a page
//! do not consume delay slots. An aggregate pacing interval additionally
//! caps the fetch rate across all workers. Interactive downloads bypass
//! the page gate entirely.
//!
//! # Lifecycle
//!
//! On [`Scheduler::shutdown`] the incomplete top-level downloads are
//! written to the `hibernated_tasks` project property; the next scheduler
//! spawned on a writable open reconstitutes them exactly once.

pub mod task;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::download::{DownloadOutcome, Fetcher, FetcherConfig};
use crate::model::{Resource, ResourceId, Revision};
use crate::parse::{DocumentKind, Link, LinkKind, ParserRegistry};
use crate::project::Project;
use crate::urls;

pub use task::{
    DownloadPriority, HibernatedTask, TaskId, TaskKind, TaskListener, TaskState, ROOT_TASK_ID,
};
use task::{
    BodyState, Detail, Done, DownloadGroupState, DownloadResourceState, TaskNode,
};

/// Default minimum wall-clock interval between successive page downloads.
pub const DEFAULT_POLITENESS_DELAY: Duration = Duration::from_secs(1);

/// Default bound on concurrent network fetches.
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 4;

/// Default aggregate pacing: at most 2 fetch starts per second.
pub const DEFAULT_MIN_FETCH_INTERVAL: Duration = Duration::from_millis(500);

/// Default cap on embedded-resource recursion.
pub const DEFAULT_MAX_EMBED_DEPTH: usize = 3;

/// Default bound on simultaneously materialized group member tasks.
pub const DEFAULT_GROUP_CHILD_WINDOW: usize = 100;

/// Errors surfaced through scheduler handles and download futures.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// The scheduler loop has exited.
    #[error("scheduler is shut down")]
    ShutDown,

    /// The task was cancelled before producing a result.
    #[error("task was cancelled")]
    Cancelled,

    /// The task failed; the message carries the store-level cause.
    #[error("task failed: {message}")]
    TaskFailed {
        /// Human-readable cause.
        message: String,
    },
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Minimum interval between successive background page downloads.
    /// Zero disables the page gate (tests).
    pub politeness_delay: Duration,
    /// Bound on concurrent network fetches.
    pub max_concurrent_fetches: usize,
    /// Minimum interval between any two fetch starts.
    pub min_fetch_interval: Duration,
    /// Maximum embedded-resource nesting depth.
    pub max_embed_depth: usize,
    /// Maximum group member tasks materialized at once.
    pub group_child_window: usize,
    /// Fetcher configuration (timeouts, User-Agent).
    pub fetcher: FetcherConfig,
    /// Parser selection table.
    pub parsers: Arc<ParserRegistry>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            politeness_delay: DEFAULT_POLITENESS_DELAY,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            min_fetch_interval: DEFAULT_MIN_FETCH_INTERVAL,
            max_embed_depth: DEFAULT_MAX_EMBED_DEPTH,
            group_child_window: DEFAULT_GROUP_CHILD_WINDOW,
            fetcher: FetcherConfig::default(),
            parsers: Arc::new(ParserRegistry::new()),
        }
    }
}

/// A pending download result, resolved when the resource's body revision
/// commits (before embedded resources finish).
pub struct DownloadHandle {
    receiver: oneshot::Receiver<Result<Revision, SchedulerError>>,
}

impl DownloadHandle {
    /// Waits for the body revision.
    pub async fn wait(self) -> Result<Revision, SchedulerError> {
        self.receiver
            .await
            .unwrap_or(Err(SchedulerError::ShutDown))
    }
}

impl std::future::IntoFuture for DownloadHandle {
    type Output = Result<Revision, SchedulerError>;
    type IntoFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

enum Command {
    DownloadResource {
        resource_id: ResourceId,
        priority: DownloadPriority,
        stale_before: Option<DateTime<Utc>>,
        waiter: oneshot::Sender<Result<Revision, SchedulerError>>,
    },
    DownloadGroup {
        group_id: i64,
        reply: oneshot::Sender<Result<TaskId, SchedulerError>>,
    },
    UpdateGroupMembers {
        group_id: i64,
        reply: oneshot::Sender<Result<TaskId, SchedulerError>>,
    },
    Cancel {
        task_id: TaskId,
    },
    AddListener(Arc<dyn TaskListener>),
    WaitIdle(oneshot::Sender<()>),
    ResumeHibernated,
    Worker(WorkerEvent),
    Shutdown(oneshot::Sender<()>),
}

enum WorkerEvent {
    /// Fetch finished; `outcome` is `None` when the worker saw the cancel
    /// token first.
    FetchDone {
        task_id: TaskId,
        outcome: Option<DownloadOutcome>,
    },
    ParseDone {
        task_id: TaskId,
        links: Vec<Link>,
    },
}

/// Handle to a project's scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    command_tx: mpsc::UnboundedSender<Command>,
}

impl Scheduler {
    /// Starts a scheduler for the project.
    ///
    /// If the project is writable and carries hibernated tasks, they are
    /// reconstituted immediately (and exactly once).
    #[must_use]
    #[allow(clippy::expect_used)] // static client configuration cannot fail in practice
    pub fn spawn(project: Project, config: SchedulerConfig) -> Self {
        let fetcher = Fetcher::new(config.fetcher.clone())
            .expect("failed to build HTTP client with static configuration");
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let core = SchedulerCore::new(project, config, fetcher, command_tx.clone());
        tokio::spawn(run_loop(core, command_rx));

        let _ = command_tx.send(Command::ResumeHibernated);
        Self { command_tx }
    }

    /// Schedules a resource download and returns a handle resolving to the
    /// body revision.
    pub fn download_resource(
        &self,
        resource_id: ResourceId,
        priority: DownloadPriority,
    ) -> Result<DownloadHandle, SchedulerError> {
        self.download_resource_with(resource_id, priority, None)
    }

    /// Schedules a resource download with a staleness threshold: a cached
    /// same-session result older than `stale_before` is re-downloaded.
    pub fn download_resource_with(
        &self,
        resource_id: ResourceId,
        priority: DownloadPriority,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<DownloadHandle, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(Command::DownloadResource {
                resource_id,
                priority,
                stale_before,
                waiter: tx,
            })
            .map_err(|_| SchedulerError::ShutDown)?;
        Ok(DownloadHandle { receiver: rx })
    }

    /// Schedules a group download: membership update, then every member.
    pub async fn download_group(&self, group_id: i64) -> Result<TaskId, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(Command::DownloadGroup {
                group_id,
                reply: tx,
            })
            .map_err(|_| SchedulerError::ShutDown)?;
        rx.await.unwrap_or(Err(SchedulerError::ShutDown))
    }

    /// Schedules a group membership refresh.
    pub async fn update_group_members(&self, group_id: i64) -> Result<TaskId, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(Command::UpdateGroupMembers {
                group_id,
                reply: tx,
            })
            .map_err(|_| SchedulerError::ShutDown)?;
        rx.await.unwrap_or(Err(SchedulerError::ShutDown))
    }

    /// Cancels a task and all of its descendants. Idempotent; cancelling a
    /// finished task is a no-op.
    pub fn cancel(&self, task_id: TaskId) -> Result<(), SchedulerError> {
        self.command_tx
            .send(Command::Cancel { task_id })
            .map_err(|_| SchedulerError::ShutDown)
    }

    /// Registers a task tree observer.
    pub fn add_listener(&self, listener: Arc<dyn TaskListener>) -> Result<(), SchedulerError> {
        self.command_tx
            .send(Command::AddListener(listener))
            .map_err(|_| SchedulerError::ShutDown)
    }

    /// Resolves once the task tree has drained.
    pub async fn wait_idle(&self) -> Result<(), SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(Command::WaitIdle(tx))
            .map_err(|_| SchedulerError::ShutDown)?;
        rx.await.map_err(|_| SchedulerError::ShutDown)
    }

    /// Hibernates incomplete top-level downloads and stops the scheduler.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Shutdown(tx))
            .map_err(|_| SchedulerError::ShutDown)?;
        rx.await.map_err(|_| SchedulerError::ShutDown)
    }
}

/// Same-session download record backing the freshness short-circuit.
struct SessionEntry {
    at: Instant,
    wall: DateTime<Utc>,
}

struct SchedulerCore {
    project: Project,
    config: SchedulerConfig,
    fetcher: Fetcher,
    command_tx: mpsc::UnboundedSender<Command>,
    listeners: Vec<Arc<dyn TaskListener>>,
    nodes: HashMap<TaskId, TaskNode>,
    next_task_id: TaskId,
    fetch_semaphore: Arc<Semaphore>,
    /// Body tasks waiting for the politeness page gate, FIFO.
    pending_pages: VecDeque<TaskId>,
    /// The page download currently holding the gate.
    active_page: Option<TaskId>,
    /// Earliest start time for the next gated page.
    page_gate: Instant,
    /// Earliest start time for the next fetch of any kind.
    next_fetch_slot: Instant,
    /// Leader body task per resource currently fetching, with follower
    /// body tasks waiting on the same result.
    in_flight: HashMap<ResourceId, (TaskId, Vec<TaskId>)>,
    /// Resources downloaded this session.
    session: HashMap<ResourceId, SessionEntry>,
    /// Tasks whose terminal state awaits parent-side processing.
    finish_queue: VecDeque<TaskId>,
    idle_waiters: Vec<oneshot::Sender<()>>,
    busy: bool,
}

async fn run_loop(mut core: SchedulerCore, mut command_rx: mpsc::UnboundedReceiver<Command>) {
    core.create_root();
    loop {
        core.pump().await;

        let deadline = core.next_deadline();
        let command = if let Some(deadline) = deadline {
            tokio::select! {
                command = command_rx.recv() => command,
                () = tokio::time::sleep_until(deadline) => continue,
            }
        } else {
            command_rx.recv().await
        };

        let Some(command) = command else { break };
        if core.handle_command(command).await {
            break;
        }
    }
    debug!("scheduler loop exited");
}

impl SchedulerCore {
    fn new(
        project: Project,
        config: SchedulerConfig,
        fetcher: Fetcher,
        command_tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let permits = config.max_concurrent_fetches.max(1);
        Self {
            project,
            config,
            fetcher,
            command_tx,
            listeners: Vec::new(),
            nodes: HashMap::new(),
            next_task_id: ROOT_TASK_ID,
            fetch_semaphore: Arc::new(Semaphore::new(permits)),
            pending_pages: VecDeque::new(),
            active_page: None,
            page_gate: Instant::now(),
            next_fetch_slot: Instant::now(),
            in_flight: HashMap::new(),
            session: HashMap::new(),
            finish_queue: VecDeque::new(),
            idle_waiters: Vec::new(),
            busy: false,
        }
    }

    fn create_root(&mut self) {
        let root = TaskNode {
            id: ROOT_TASK_ID,
            kind: TaskKind::Root,
            title: "Project tasks".to_string(),
            state: TaskState::Running,
            priority: DownloadPriority::Background,
            parent: None,
            children: Vec::new(),
            applied_children: 0,
            ready_children: std::collections::BTreeMap::new(),
            error: None,
            done: None,
            cancel: CancellationToken::new(),
            detail: Detail::Root,
        };
        self.next_task_id = ROOT_TASK_ID + 1;
        self.nodes.insert(ROOT_TASK_ID, root);
    }

    fn next_deadline(&self) -> Option<Instant> {
        if self.active_page.is_none() && !self.pending_pages.is_empty() {
            Some(self.page_gate)
        } else {
            None
        }
    }

    /// Returns `true` when the loop should exit.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::DownloadResource {
                resource_id,
                priority,
                stale_before,
                waiter,
            } => {
                self.start_resource_download(resource_id, priority, stale_before, waiter)
                    .await;
            }
            Command::DownloadGroup { group_id, reply } => {
                let result = self.start_group_download(group_id).await;
                let _ = reply.send(result);
            }
            Command::UpdateGroupMembers { group_id, reply } => {
                let result = self.start_group_update(group_id, ROOT_TASK_ID).await;
                let _ = reply.send(result);
            }
            Command::Cancel { task_id } => self.cancel_subtree(task_id),
            Command::AddListener(listener) => self.listeners.push(listener),
            Command::WaitIdle(reply) => {
                if self.is_idle() {
                    let _ = reply.send(());
                } else {
                    self.idle_waiters.push(reply);
                }
            }
            Command::ResumeHibernated => self.resume_hibernated().await,
            Command::Worker(event) => self.handle_worker_event(event).await,
            Command::Shutdown(reply) => {
                self.hibernate().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    // === Top-level task creation ===

    async fn start_resource_download(
        &mut self,
        resource_id: ResourceId,
        priority: DownloadPriority,
        stale_before: Option<DateTime<Utc>>,
        waiter: oneshot::Sender<Result<Revision, SchedulerError>>,
    ) {
        let resource = match self.project.get_resource_by_id(resource_id).await {
            Ok(Some(resource)) => resource,
            Ok(None) => {
                let _ = waiter.send(Err(SchedulerError::TaskFailed {
                    message: format!("resource {resource_id} not found"),
                }));
                return;
            }
            Err(error) => {
                let _ = waiter.send(Err(SchedulerError::TaskFailed {
                    message: error.to_string(),
                }));
                return;
            }
        };
        if resource.is_external() {
            let _ = waiter.send(Err(SchedulerError::TaskFailed {
                message: format!("{} is external and cannot be downloaded", resource.url),
            }));
            return;
        }

        let task_id = self
            .create_download_resource(
                ROOT_TASK_ID,
                resource,
                priority,
                stale_before,
                Arc::new(HashSet::new()),
                0,
                true,
            )
            .await;
        if let Some(node) = self.nodes.get_mut(&task_id) {
            if let Detail::DownloadResource(state) = &mut node.detail {
                state.waiters.push(waiter);
            }
        }
        self.drain_finished().await;
    }

    async fn start_group_download(&mut self, group_id: i64) -> Result<TaskId, SchedulerError> {
        let group = match self.project.get_resource_group(group_id).await {
            Ok(Some(group)) => group,
            Ok(None) => {
                return Err(SchedulerError::TaskFailed {
                    message: format!("resource group {group_id} not found"),
                })
            }
            Err(error) => {
                return Err(SchedulerError::TaskFailed {
                    message: error.to_string(),
                })
            }
        };

        let task_id = self.add_node(
            ROOT_TASK_ID,
            TaskKind::DownloadGroup { group_id },
            format!("Downloading group: {}", group.display_name()),
            DownloadPriority::Background,
            Detail::DownloadGroup(DownloadGroupState {
                group_id,
                cursor: None,
                members_spawned: 0,
                members_exhausted: false,
            }),
        );
        self.set_state(task_id, TaskState::Running);

        // Phase 1: refresh membership by downloading the group's source
        self.start_group_update(group_id, task_id).await?;
        self.drain_finished().await;
        Ok(task_id)
    }

    async fn start_group_update(
        &mut self,
        group_id: i64,
        parent_id: TaskId,
    ) -> Result<TaskId, SchedulerError> {
        let group = match self.project.get_resource_group(group_id).await {
            Ok(Some(group)) => group,
            Ok(None) => {
                return Err(SchedulerError::TaskFailed {
                    message: format!("resource group {group_id} not found"),
                })
            }
            Err(error) => {
                return Err(SchedulerError::TaskFailed {
                    message: error.to_string(),
                })
            }
        };

        // Walk the source chain iteratively, nesting one UpdateGroupMembers
        // node per hop; cycles were rejected at edit time. The innermost
        // node's completion bubbles up through the chain.
        let task_id = self.add_node(
            parent_id,
            TaskKind::UpdateGroupMembers { group_id },
            format!("Updating members: {}", group.display_name()),
            DownloadPriority::Background,
            Detail::UpdateGroupMembers,
        );
        self.set_state(task_id, TaskState::Running);

        let mut current_parent = task_id;
        let mut current_group = group;
        loop {
            match current_group.source {
                crate::model::GroupSource::None => {
                    // Nothing to download; membership is derived on demand
                    self.mark_finished(current_parent, TaskState::Completed, Done::Unit, None);
                    break;
                }
                crate::model::GroupSource::Root(root_id) => {
                    let resource = match self.project.get_root_resource(root_id).await {
                        Ok(Some(root)) => {
                            self.project.get_resource_by_id(root.resource_id).await.ok().flatten()
                        }
                        _ => None,
                    };
                    match resource {
                        Some(resource) => {
                            self.create_download_resource(
                                current_parent,
                                resource,
                                DownloadPriority::Background,
                                None,
                                Arc::new(HashSet::new()),
                                0,
                                true,
                            )
                            .await;
                        }
                        None => {
                            self.mark_finished(
                                current_parent,
                                TaskState::Completed,
                                Done::Unit,
                                None,
                            );
                        }
                    }
                    break;
                }
                crate::model::GroupSource::Group(source_group_id) => {
                    let Ok(Some(source_group)) =
                        self.project.get_resource_group(source_group_id).await
                    else {
                        self.mark_finished(current_parent, TaskState::Completed, Done::Unit, None);
                        break;
                    };
                    let child_id = self.add_node(
                        current_parent,
                        TaskKind::UpdateGroupMembers {
                            group_id: source_group_id,
                        },
                        format!("Updating members: {}", source_group.display_name()),
                        DownloadPriority::Background,
                        Detail::UpdateGroupMembers,
                    );
                    self.set_state(child_id, TaskState::Running);
                    current_parent = child_id;
                    current_group = source_group;
                }
            }
        }
        self.drain_finished().await;
        Ok(task_id)
    }

    // === Node management ===

    fn add_node(
        &mut self,
        parent_id: TaskId,
        kind: TaskKind,
        title: String,
        priority: DownloadPriority,
        detail: Detail,
    ) -> TaskId {
        let id = self.next_task_id;
        self.next_task_id += 1;

        let parent_cancel = self
            .nodes
            .get(&parent_id)
            .map_or_else(CancellationToken::new, |p| p.cancel.child_token());
        let node = TaskNode {
            id,
            kind: kind.clone(),
            title: title.clone(),
            state: TaskState::Pending,
            priority,
            parent: Some(parent_id),
            children: Vec::new(),
            applied_children: 0,
            ready_children: std::collections::BTreeMap::new(),
            error: None,
            done: None,
            cancel: parent_cancel,
            detail,
        };
        self.nodes.insert(id, node);
        if let Some(parent) = self.nodes.get_mut(&parent_id) {
            parent.children.push(id);
        }
        for listener in &self.listeners {
            listener.on_task_added(parent_id, id, &kind, &title);
        }
        self.set_busy(true);
        id
    }

    fn set_state(&mut self, task_id: TaskId, state: TaskState) {
        let Some(node) = self.nodes.get_mut(&task_id) else {
            return;
        };
        if node.state.is_terminal() || node.state == state {
            return;
        }
        node.state = state;
        if !state.is_terminal() {
            // Terminal states are announced during ordered application
            for listener in &self.listeners {
                listener.on_task_state(task_id, state, None);
            }
        }
    }

    /// Records a terminal state and queues parent-side processing.
    fn mark_finished(
        &mut self,
        task_id: TaskId,
        state: TaskState,
        done: Done,
        error: Option<String>,
    ) {
        debug_assert!(state.is_terminal());
        let Some(node) = self.nodes.get_mut(&task_id) else {
            return;
        };
        if node.state.is_terminal() {
            return;
        }
        node.state = state;
        node.error = error;
        node.done = Some(done);
        debug!(task_id = node.id, title = %node.title, ?state, "task finished");
        self.note_page_terminal(task_id);
        self.finish_queue.push_back(task_id);
    }

    /// Releases the politeness gate when a page download reaches a terminal
    /// state.
    fn note_page_terminal(&mut self, task_id: TaskId) {
        let Some(node) = self.nodes.get(&task_id) else {
            return;
        };
        let Detail::DownloadResource(state) = &node.detail else {
            return;
        };
        if !state.is_page {
            return;
        }
        if state.fetched {
            let gate = Instant::now() + self.config.politeness_delay;
            if gate > self.page_gate {
                self.page_gate = gate;
            }
        }
        if self.active_page == Some(task_id) {
            self.active_page = None;
        }
    }

    /// Applies queued terminal states: announces them in creation order
    /// within each container and runs parent reactions.
    async fn drain_finished(&mut self) {
        while let Some(finished_id) = self.finish_queue.pop_front() {
            let Some(parent_id) = self.nodes.get(&finished_id).and_then(|n| n.parent) else {
                continue;
            };

            if parent_id == ROOT_TASK_ID {
                // Top-level tasks are independent; completions apply as
                // they arrive
                self.apply_child(parent_id, finished_id).await;
                continue;
            }

            // Buffer and re-sort into creation order
            let ready: Vec<TaskId> = {
                let Some(parent) = self.nodes.get_mut(&parent_id) else {
                    continue;
                };
                let Some(index) = parent.children.iter().position(|&c| c == finished_id) else {
                    continue;
                };
                parent.ready_children.insert(index, ());

                let mut ready = Vec::new();
                while parent.ready_children.contains_key(&parent.applied_children) {
                    parent.ready_children.remove(&parent.applied_children);
                    ready.push(parent.children[parent.applied_children]);
                    parent.applied_children += 1;
                }
                ready
            };
            for child_id in ready {
                self.apply_child(parent_id, child_id).await;
            }
        }
    }

    /// Announces a child's terminal state and runs the parent's reaction.
    async fn apply_child(&mut self, parent_id: TaskId, child_id: TaskId) {
        let (child_state, child_error) = {
            let Some(child) = self.nodes.get(&child_id) else {
                return;
            };
            (child.state, child.error.clone())
        };
        for listener in &self.listeners {
            listener.on_task_state(child_id, child_state, child_error.as_deref());
        }

        if parent_id == ROOT_TASK_ID {
            {
                let Some(root) = self.nodes.get_mut(&ROOT_TASK_ID) else {
                    return;
                };
                root.applied_children += 1;
            }
            // Completed top-level tasks are pruned so the tree stays
            // bounded; failed tasks remain until dismissed
            if matches!(child_state, TaskState::Completed | TaskState::Cancelled) {
                self.remove_subtree(child_id);
            }
            return;
        }

        let parent_detail_kind = self.nodes.get(&parent_id).map(|n| n.kind.clone());
        match parent_detail_kind {
            Some(TaskKind::DownloadResource { .. }) => {
                self.apply_to_download_resource(parent_id, child_id).await;
            }
            Some(TaskKind::DownloadGroup { .. }) => {
                self.apply_to_download_group(parent_id, child_id).await;
            }
            Some(TaskKind::UpdateGroupMembers { .. }) => {
                let state = self
                    .nodes
                    .get(&parent_id)
                    .map_or(TaskState::Completed, |n| n.state);
                if !state.is_terminal() {
                    self.mark_finished(parent_id, TaskState::Completed, Done::Unit, None);
                }
            }
            _ => {}
        }
    }

    // === DownloadResource ===

    #[allow(clippy::too_many_arguments)]
    async fn create_download_resource(
        &mut self,
        parent_id: TaskId,
        resource: Resource,
        priority: DownloadPriority,
        stale_before: Option<DateTime<Utc>>,
        ancestors: Arc<HashSet<ResourceId>>,
        embed_depth: usize,
        is_page: bool,
    ) -> TaskId {
        let resource_id = resource.id;
        let task_id = self.add_node(
            parent_id,
            TaskKind::DownloadResource { resource_id },
            format!("Downloading: {}", resource.url),
            priority,
            Detail::DownloadResource(DownloadResourceState {
                resource: resource.clone(),
                ancestors,
                embed_depth,
                is_page,
                revision: None,
                fetched: false,
                embeds_scheduled: false,
                waiters: Vec::new(),
            }),
        );
        self.set_state(task_id, TaskState::Running);

        let staging_path = self
            .project
            .temporary_dir()
            .join(format!("fetch-{task_id}.body"));
        let body_id = self.add_node(
            task_id,
            TaskKind::DownloadResourceBody { resource_id },
            format!("Downloading body: {}", resource.url),
            priority,
            Detail::Body(BodyState {
                resource,
                stale_before,
                staging_path,
                did_download: false,
            }),
        );

        let gated = is_page && priority == DownloadPriority::Background;
        if gated {
            self.pending_pages.push_back(body_id);
        } else {
            self.dispatch_fetch(body_id).await;
        }
        task_id
    }

    /// Admits and dispatches a body fetch.
    async fn dispatch_fetch(&mut self, body_id: TaskId) {
        let (resource, stale_before) = {
            let Some(node) = self.nodes.get(&body_id) else {
                return;
            };
            if node.state.is_terminal() {
                return;
            }
            let Detail::Body(state) = &node.detail else {
                return;
            };
            (state.resource.clone(), state.stale_before)
        };
        self.set_state(body_id, TaskState::Running);

        // Admission: session-fresh short-circuit
        if self.project.assume_session_fresh() {
            let session_entry = self
                .session
                .get(&resource.id)
                .map(|entry| (entry.at, entry.wall));
            if let Some((fetched_at, fetched_wall)) = session_entry {
                let window_ok = self
                    .project
                    .session_fresh_window()
                    .map_or(true, |window| fetched_at.elapsed() <= window);
                let stale_ok = stale_before.map_or(true, |threshold| fetched_wall >= threshold);
                if window_ok && stale_ok {
                    if let Ok(Some(revision)) = self.project.default_revision(resource.id).await {
                        debug!(resource = %resource.url, "session-fresh cache hit");
                        self.mark_finished(
                            body_id,
                            TaskState::Completed,
                            Done::Revision(revision),
                            None,
                        );
                        return;
                    }
                }
            }
        }

        // Admission: one download per URL at a time; later requests share
        // the leader's result
        if let Some((_, followers)) = self.in_flight.get_mut(&resource.id) {
            followers.push(body_id);
            return;
        }

        // Admission: store must be writable with room to grow
        if self.project.readonly() {
            self.mark_finished(
                body_id,
                TaskState::Failed,
                Done::Unit,
                Some("project is open read-only".to_string()),
            );
            return;
        }
        if let Err(error) = self.project.check_free_space() {
            self.mark_finished(
                body_id,
                TaskState::Failed,
                Done::Unit,
                Some(error.to_string()),
            );
            return;
        }

        // Cookie resolution happens here so workers never touch the
        // database
        let cookie = match self.project.request_cookie().await {
            Ok(Some(cookie)) => {
                match self.project.request_cookie_applies_to(&resource.url).await {
                    Ok(true) => Some(cookie),
                    _ => None,
                }
            }
            _ => None,
        };
        if let Some(node) = self.nodes.get_mut(&body_id) {
            if let Detail::Body(state) = &mut node.detail {
                state.did_download = true;
            }
        }

        self.in_flight.insert(resource.id, (body_id, Vec::new()));

        // Aggregate pacing: reserve the next fetch slot
        let slot = self.next_fetch_slot.max(Instant::now());
        self.next_fetch_slot = slot + self.config.min_fetch_interval;

        let staging_path = match self.nodes.get(&body_id) {
            Some(node) => match &node.detail {
                Detail::Body(state) => state.staging_path.clone(),
                _ => return,
            },
            None => return,
        };
        let token = self
            .nodes
            .get(&body_id)
            .map_or_else(CancellationToken::new, |n| n.cancel.clone());
        let fetcher = self.fetcher.clone();
        let semaphore = Arc::clone(&self.fetch_semaphore);
        let command_tx = self.command_tx.clone();
        let url = resource.url.clone();

        tokio::spawn(async move {
            tokio::time::sleep_until(slot).await;
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            let outcome = tokio::select! {
                () = token.cancelled() => None,
                outcome = fetcher.fetch(&url, cookie.as_deref(), &staging_path) => Some(outcome),
            };
            let _ = command_tx.send(Command::Worker(WorkerEvent::FetchDone {
                task_id: body_id,
                outcome,
            }));
        });
    }

    async fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::FetchDone { task_id, outcome } => {
                self.on_fetch_done(task_id, outcome).await;
            }
            WorkerEvent::ParseDone { task_id, links } => {
                self.on_parse_done(task_id, links).await;
            }
        }
        self.drain_finished().await;
    }

    async fn on_fetch_done(&mut self, body_id: TaskId, outcome: Option<DownloadOutcome>) {
        if !self.nodes.contains_key(&body_id) {
            // The task was pruned while the fetch was in flight. Clear any
            // in-flight record it led so the resource does not stay
            // blocked, and re-dispatch its followers.
            let resource_id = self
                .in_flight
                .iter()
                .find(|(_, (leader, _))| *leader == body_id)
                .map(|(resource_id, _)| *resource_id);
            if let Some(resource_id) = resource_id {
                if let Some((_, followers)) = self.in_flight.remove(&resource_id) {
                    self.promote_followers(followers).await;
                }
            }
            return;
        }
        let (resource, staging_path) = {
            let Some(node) = self.nodes.get(&body_id) else {
                return;
            };
            let Detail::Body(state) = &node.detail else {
                return;
            };
            (state.resource.clone(), state.staging_path.clone())
        };
        let followers = self
            .in_flight
            .remove(&resource.id)
            .map(|(_, followers)| followers)
            .unwrap_or_default();

        let cancelled = self
            .nodes
            .get(&body_id)
            .map_or(true, |n| n.state == TaskState::Cancelled);
        let Some(outcome) = outcome else {
            // Worker saw the cancel token; nothing was staged
            let _ = tokio::fs::remove_file(&staging_path).await;
            self.promote_followers(followers).await;
            return;
        };
        if cancelled {
            let _ = tokio::fs::remove_file(&staging_path).await;
            self.promote_followers(followers).await;
            return;
        }

        // Commit on the scheduler loop: the one writer per project
        let cookie = self.resolve_commit_cookie(&resource).await;
        let result = if let Some(error) = &outcome.error {
            self.project
                .create_error_revision(
                    resource.id,
                    error,
                    outcome.metadata.as_ref(),
                    cookie.as_deref(),
                )
                .await
        } else {
            self.project
                .commit_revision(
                    resource.id,
                    cookie.as_deref(),
                    None,
                    outcome.metadata.as_ref(),
                    outcome.body_staged.then_some(staging_path.as_path()),
                )
                .await
        };

        match result {
            Ok(revision) => {
                self.session.insert(
                    resource.id,
                    SessionEntry {
                        at: Instant::now(),
                        wall: Utc::now(),
                    },
                );
                for follower_id in followers {
                    self.mark_finished(
                        follower_id,
                        TaskState::Completed,
                        Done::Revision(revision.clone()),
                        None,
                    );
                }
                self.mark_finished(body_id, TaskState::Completed, Done::Revision(revision), None);
            }
            Err(error) => {
                let message = error.to_string();
                warn!(url = %resource.url, %message, "revision commit failed");
                for follower_id in followers {
                    self.mark_finished(
                        follower_id,
                        TaskState::Failed,
                        Done::Unit,
                        Some(message.clone()),
                    );
                }
                self.mark_finished(body_id, TaskState::Failed, Done::Unit, Some(message));
            }
        }
    }

    async fn resolve_commit_cookie(&self, resource: &Resource) -> Option<String> {
        match self.project.request_cookie().await {
            Ok(Some(cookie)) => match self
                .project
                .request_cookie_applies_to(&resource.url)
                .await
            {
                Ok(true) => Some(cookie),
                _ => None,
            },
            _ => None,
        }
    }

    /// Re-dispatches follower body fetches after their leader was
    /// cancelled.
    async fn promote_followers(&mut self, followers: Vec<TaskId>) {
        for follower_id in followers {
            let live = self
                .nodes
                .get(&follower_id)
                .is_some_and(|n| !n.state.is_terminal());
            if live {
                self.dispatch_fetch(follower_id).await;
            }
        }
    }

    async fn apply_to_download_resource(&mut self, parent_id: TaskId, child_id: TaskId) {
        let (child_kind, child_state, child_done_revision, child_links, child_error) = {
            let Some(child) = self.nodes.get(&child_id) else {
                return;
            };
            let revision = match &child.done {
                Some(Done::Revision(revision)) => Some(revision.clone()),
                _ => None,
            };
            let links = match &child.done {
                Some(Done::Links(links)) => Some(links.clone()),
                _ => None,
            };
            (
                child.kind.clone(),
                child.state,
                revision,
                links,
                child.error.clone(),
            )
        };

        match child_kind {
            TaskKind::DownloadResourceBody { .. } => {
                let did_download = match self.nodes.get(&child_id) {
                    Some(node) => match &node.detail {
                        Detail::Body(state) => state.did_download,
                        _ => false,
                    },
                    None => false,
                };
                match child_state {
                    TaskState::Completed => {
                        let revision = child_done_revision;
                        let (should_parse, base_url) = {
                            let Some(parent) = self.nodes.get_mut(&parent_id) else {
                                return;
                            };
                            let Detail::DownloadResource(state) = &mut parent.detail else {
                                return;
                            };
                            state.fetched = did_download;
                            state.revision.clone_from(&revision);
                            for waiter in state.waiters.drain(..) {
                                if let Some(revision) = &revision {
                                    let _ = waiter.send(Ok(revision.clone()));
                                }
                            }
                            let parseable = did_download
                                && revision.as_ref().is_some_and(|r| {
                                    r.has_body()
                                        && self.config.parsers.kind_for(r.content_type().as_deref())
                                            != DocumentKind::Opaque
                                });
                            (parseable, state.resource.url.clone())
                        };

                        if should_parse {
                            if let Some(revision) = revision {
                                self.spawn_parse(parent_id, revision, base_url);
                            }
                        } else {
                            self.finish_expansion(parent_id);
                        }
                    }
                    TaskState::Failed => {
                        self.resolve_waiters_err(
                            parent_id,
                            SchedulerError::TaskFailed {
                                message: child_error.clone().unwrap_or_default(),
                            },
                        );
                        self.mark_finished(parent_id, TaskState::Failed, Done::Unit, child_error);
                    }
                    TaskState::Cancelled => {
                        self.resolve_waiters_err(parent_id, SchedulerError::Cancelled);
                        self.mark_finished(parent_id, TaskState::Cancelled, Done::Unit, None);
                    }
                    TaskState::Pending | TaskState::Running => {}
                }
            }
            TaskKind::ParseLinks { .. } => {
                // A failed parse demotes to "no links discovered"
                let links = match child_state {
                    TaskState::Completed => child_links.unwrap_or_default(),
                    _ => Vec::new(),
                };
                self.schedule_embeds(parent_id, links).await;
                self.finish_expansion(parent_id);
            }
            _ => {
                // An embedded download finished (in any state); embed
                // failures do not fail the page
                self.try_complete_download_resource(parent_id);
            }
        }
    }

    fn resolve_waiters_err(&mut self, task_id: TaskId, error: SchedulerError) {
        if let Some(node) = self.nodes.get_mut(&task_id) {
            if let Detail::DownloadResource(state) = &mut node.detail {
                for waiter in state.waiters.drain(..) {
                    let _ = waiter.send(Err(error.clone()));
                }
            }
        }
    }

    fn spawn_parse(&mut self, parent_id: TaskId, revision: Revision, base_url: String) {
        let parse_id = self.add_node(
            parent_id,
            TaskKind::ParseLinks {
                revision_id: revision.id,
            },
            format!("Parsing links: {base_url}"),
            DownloadPriority::Background,
            Detail::ParseLinks,
        );
        self.set_state(parse_id, TaskState::Running);

        let body_path = self.project.revision_body_path(revision.id);
        let content_type = revision.content_type();
        let parsers = Arc::clone(&self.config.parsers);
        let command_tx = self.command_tx.clone();
        let token = self
            .nodes
            .get(&parse_id)
            .map_or_else(CancellationToken::new, |n| n.cancel.clone());

        // Parse on a worker: pure CPU over the published body file
        tokio::spawn(async move {
            let links = if token.is_cancelled() {
                Vec::new()
            } else {
                match tokio::fs::read(&body_path).await {
                    Ok(body) => parsers.parse(&body, content_type.as_deref(), &base_url),
                    Err(_) => Vec::new(),
                }
            };
            let _ = command_tx.send(Command::Worker(WorkerEvent::ParseDone {
                task_id: parse_id,
                links,
            }));
        });
    }

    async fn on_parse_done(&mut self, parse_id: TaskId, links: Vec<Link>) {
        let live = self
            .nodes
            .get(&parse_id)
            .is_some_and(|n| !n.state.is_terminal());
        if !live {
            return;
        }

        // Discovered links become Resources in one batched insert
        let urls: Vec<String> = links.iter().map(|l| l.url.clone()).collect();
        if !urls.is_empty() && !self.project.readonly() {
            if let Err(error) = self.project.create_resources_bulk(&urls).await {
                warn!(%error, "recording discovered links failed");
            }
        }

        self.mark_finished(parse_id, TaskState::Completed, Done::Links(links), None);
    }

    async fn schedule_embeds(&mut self, parent_id: TaskId, links: Vec<Link>) {
        let (resource, ancestors, embed_depth, priority, suppress) = {
            let Some(parent) = self.nodes.get(&parent_id) else {
                return;
            };
            let Detail::DownloadResource(state) = &parent.detail else {
                return;
            };
            // Error pages do not pull in their embedded resources
            let suppress = state
                .revision
                .as_ref()
                .is_some_and(Revision::is_http_error_page)
                || state.embed_depth >= self.config.max_embed_depth;
            (
                state.resource.clone(),
                Arc::clone(&state.ancestors),
                state.embed_depth,
                parent.priority,
                suppress,
            )
        };
        if suppress {
            return;
        }

        let mut next_ancestors = HashSet::clone(&ancestors);
        next_ancestors.insert(resource.id);
        let next_ancestors = Arc::new(next_ancestors);

        let mut scheduled: HashSet<ResourceId> = HashSet::new();
        for link in links {
            if link.kind != LinkKind::Embedded {
                continue;
            }
            if link.url.starts_with(urls::EXTERNAL_URL_PREFIX) {
                continue;
            }
            let embed = match self.project.get_resource_by_url(&link.url).await {
                Ok(Some(embed)) => embed,
                _ => continue,
            };
            if embed.is_external() {
                continue;
            }
            // Self-reference guard: a page embedding itself (or an
            // ancestor) does not recurse
            if embed.id == resource.id || next_ancestors.contains(&embed.id) {
                continue;
            }
            if scheduled.contains(&embed.id) {
                continue;
            }
            match self.project.url_in_do_not_download_group(&embed.url).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(error) => {
                    warn!(%error, "do-not-download check failed; skipping embed");
                    continue;
                }
            }
            scheduled.insert(embed.id);
            self.create_download_resource(
                parent_id,
                embed,
                priority,
                None,
                Arc::clone(&next_ancestors),
                embed_depth + 1,
                false,
            )
            .await;
        }
    }

    /// Marks that the final phase has added all children it will add, then
    /// checks for completion.
    fn finish_expansion(&mut self, task_id: TaskId) {
        if let Some(node) = self.nodes.get_mut(&task_id) {
            if let Detail::DownloadResource(state) = &mut node.detail {
                state.embeds_scheduled = true;
            }
        }
        self.try_complete_download_resource(task_id);
    }

    fn try_complete_download_resource(&mut self, task_id: TaskId) {
        let complete = {
            let Some(node) = self.nodes.get(&task_id) else {
                return;
            };
            if node.state.is_terminal() {
                return;
            }
            match &node.detail {
                Detail::DownloadResource(state) => {
                    state.embeds_scheduled && node.all_children_applied()
                }
                _ => false,
            }
        };
        if complete {
            self.mark_finished(task_id, TaskState::Completed, Done::Unit, None);
        }
    }

    // === DownloadGroup ===

    async fn apply_to_download_group(&mut self, group_task_id: TaskId, child_id: TaskId) {
        let child_kind = match self.nodes.get(&child_id) {
            Some(node) => node.kind.clone(),
            None => return,
        };

        if matches!(child_kind, TaskKind::UpdateGroupMembers { .. }) {
            // Phase 2: membership is fresh; open the member cursor
            let group_id = match self.nodes.get(&group_task_id) {
                Some(node) => match &node.detail {
                    Detail::DownloadGroup(state) => state.group_id,
                    _ => return,
                },
                None => return,
            };
            let cursor = match self.project.get_resource_group(group_id).await {
                Ok(Some(group)) => self.project.group_members(&group).await.ok(),
                _ => None,
            };
            match cursor {
                Some(cursor) => {
                    if let Some(node) = self.nodes.get_mut(&group_task_id) {
                        if let Detail::DownloadGroup(state) = &mut node.detail {
                            state.cursor = Some(cursor);
                        }
                    }
                }
                None => {
                    self.mark_finished(
                        group_task_id,
                        TaskState::Failed,
                        Done::Unit,
                        Some(format!("resource group {group_id} disappeared")),
                    );
                    return;
                }
            }
        } else {
            // A member finished; report progress
            let (done, total) = match self.nodes.get(&group_task_id) {
                Some(node) => (
                    node.applied_children.saturating_sub(1) as u64,
                    match &node.detail {
                        Detail::DownloadGroup(state) if state.members_exhausted => {
                            Some(state.members_spawned)
                        }
                        _ => None,
                    },
                ),
                None => (0, None),
            };
            for listener in &self.listeners {
                listener.on_task_progress(group_task_id, done, total);
            }
        }

        self.fill_group_members(group_task_id).await;
    }

    /// Pulls more members from the cursor, keeping at most
    /// `group_child_window` member tasks outstanding. This bounds memory
    /// for arbitrarily large groups.
    async fn fill_group_members(&mut self, group_task_id: TaskId) {
        loop {
            let (outstanding, exhausted, want) = {
                let Some(node) = self.nodes.get(&group_task_id) else {
                    return;
                };
                if node.state.is_terminal() {
                    return;
                }
                let Detail::DownloadGroup(state) = &node.detail else {
                    return;
                };
                let outstanding = node.children.len() - node.applied_children;
                (
                    outstanding,
                    state.members_exhausted,
                    self.config.group_child_window.saturating_sub(outstanding),
                )
            };

            if !exhausted && want > 0 {
                let batch = {
                    let Some(node) = self.nodes.get_mut(&group_task_id) else {
                        return;
                    };
                    let Detail::DownloadGroup(state) = &mut node.detail else {
                        return;
                    };
                    match &mut state.cursor {
                        Some(cursor) => match cursor.next_batch(want).await {
                            Ok(batch) => {
                                if batch.len() < want {
                                    state.members_exhausted = true;
                                }
                                batch
                            }
                            Err(error) => {
                                warn!(%error, "group member scan failed");
                                state.members_exhausted = true;
                                Vec::new()
                            }
                        },
                        None => {
                            state.members_exhausted = true;
                            Vec::new()
                        }
                    }
                };

                let made_progress = !batch.is_empty();
                for member in batch {
                    if member.is_external() {
                        continue;
                    }
                    match self
                        .project
                        .url_in_do_not_download_group(&member.url)
                        .await
                    {
                        Ok(true) => continue,
                        Ok(false) => {}
                        Err(_) => continue,
                    }
                    if let Some(node) = self.nodes.get_mut(&group_task_id) {
                        if let Detail::DownloadGroup(state) = &mut node.detail {
                            state.members_spawned += 1;
                        }
                    }
                    self.create_download_resource(
                        group_task_id,
                        member,
                        DownloadPriority::Background,
                        None,
                        Arc::new(HashSet::new()),
                        0,
                        true,
                    )
                    .await;
                }
                if made_progress {
                    continue;
                }
            }

            // Complete when the cursor is dry and every member has been
            // applied
            let complete = {
                let Some(node) = self.nodes.get(&group_task_id) else {
                    return;
                };
                match &node.detail {
                    Detail::DownloadGroup(state) => {
                        state.members_exhausted && node.all_children_applied()
                    }
                    _ => false,
                }
            };
            if complete {
                self.mark_finished(group_task_id, TaskState::Completed, Done::Unit, None);
            }
            return;
        }
    }

    // === Cancellation ===

    fn cancel_subtree(&mut self, task_id: TaskId) {
        if task_id == ROOT_TASK_ID {
            return;
        }
        let mut stack = vec![task_id];
        let mut cancelled_leaves = Vec::new();
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get_mut(&current) else {
                continue;
            };
            stack.extend(node.children.iter().copied());
            if node.state.is_terminal() {
                continue;
            }
            node.cancel.cancel();
            node.state = TaskState::Cancelled;
            node.done = Some(Done::Unit);
            cancelled_leaves.push(current);
        }
        if cancelled_leaves.is_empty() {
            return;
        }
        info!(task_id, count = cancelled_leaves.len(), "cancelled tasks");

        // Descendants announce immediately; the subtree root goes through
        // ordered application at its parent
        for &cancelled in &cancelled_leaves {
            self.resolve_waiters_err(cancelled, SchedulerError::Cancelled);
            self.note_page_terminal(cancelled);
            if cancelled == task_id {
                self.finish_queue.push_back(cancelled);
            } else {
                for listener in &self.listeners {
                    listener.on_task_state(cancelled, TaskState::Cancelled, None);
                }
            }
        }
        let nodes = &self.nodes;
        self.pending_pages
            .retain(|id| nodes.get(id).is_some_and(|n| !n.state.is_terminal()));
    }

    fn remove_subtree(&mut self, task_id: TaskId) {
        let mut stack = vec![task_id];
        let mut removed = Vec::new();
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                stack.extend(node.children);
                removed.push(current);
            }
        }
        if let Some(root) = self.nodes.get_mut(&ROOT_TASK_ID) {
            if let Some(index) = root.children.iter().position(|&c| c == task_id) {
                root.children.remove(index);
                if index < root.applied_children {
                    root.applied_children -= 1;
                }
            }
        }
        for listener in &self.listeners {
            listener.on_task_removed(task_id);
        }
        debug!(task_id, nodes = removed.len(), "pruned completed task");
    }

    // === Hibernation ===

    async fn hibernate(&mut self) {
        let mut hibernated = Vec::new();
        if let Some(root) = self.nodes.get(&ROOT_TASK_ID) {
            for &child_id in &root.children {
                let Some(child) = self.nodes.get(&child_id) else {
                    continue;
                };
                if child.state.is_terminal() {
                    continue;
                }
                match &child.kind {
                    TaskKind::DownloadResource { resource_id } if !resource_id.is_unsaved() => {
                        hibernated.push(HibernatedTask::DownloadResource {
                            resource_id: resource_id.0,
                        });
                    }
                    TaskKind::DownloadGroup { group_id } => {
                        hibernated.push(HibernatedTask::DownloadGroup {
                            group_id: *group_id,
                        });
                    }
                    _ => {}
                }
            }
        }

        if !self.project.readonly() {
            let result = if hibernated.is_empty() {
                self.project.delete_property("hibernated_tasks").await
            } else {
                match serde_json::to_string(&hibernated) {
                    Ok(encoded) => self.project.set_property("hibernated_tasks", &encoded).await,
                    Err(error) => {
                        warn!(%error, "could not encode hibernated tasks");
                        Ok(())
                    }
                }
            };
            if let Err(error) = result {
                warn!(%error, "could not persist hibernated tasks");
            } else if !hibernated.is_empty() {
                info!(count = hibernated.len(), "hibernated tasks");
            }
        }

        // Abort in-flight work; partially-written revisions roll back via
        // the write protocol
        if let Some(root) = self.nodes.get(&ROOT_TASK_ID) {
            root.cancel.cancel();
        }
    }

    #[instrument(skip(self))]
    async fn resume_hibernated(&mut self) {
        if self.project.readonly() {
            return;
        }
        let encoded = match self.project.get_property("hibernated_tasks").await {
            Ok(Some(encoded)) => encoded,
            _ => return,
        };
        // Consume the property first so tasks reappear exactly once
        if let Err(error) = self.project.delete_property("hibernated_tasks").await {
            warn!(%error, "could not clear hibernated tasks");
            return;
        }
        let tasks: Vec<HibernatedTask> = match serde_json::from_str(&encoded) {
            Ok(tasks) => tasks,
            Err(error) => {
                warn!(%error, "corrupt hibernated task record; dropping");
                return;
            }
        };
        info!(count = tasks.len(), "resuming hibernated tasks");

        for hibernated in tasks {
            match hibernated {
                HibernatedTask::DownloadResource { resource_id } => {
                    if let Ok(Some(resource)) = self
                        .project
                        .get_resource_by_id(ResourceId(resource_id))
                        .await
                    {
                        self.create_download_resource(
                            ROOT_TASK_ID,
                            resource,
                            DownloadPriority::Background,
                            None,
                            Arc::new(HashSet::new()),
                            0,
                            true,
                        )
                        .await;
                    }
                }
                HibernatedTask::DownloadGroup { group_id } => {
                    let _ = self.start_group_download(group_id).await;
                }
            }
        }
        self.drain_finished().await;
    }

    // === Pump & idle tracking ===

    async fn pump(&mut self) {
        loop {
            self.drain_finished().await;

            if self.active_page.is_some() || Instant::now() < self.page_gate {
                break;
            }
            let Some(body_id) = self.pending_pages.pop_front() else {
                break;
            };
            let live = self
                .nodes
                .get(&body_id)
                .is_some_and(|n| !n.state.is_terminal());
            if !live {
                continue;
            }
            self.active_page = self.nodes.get(&body_id).and_then(|n| n.parent);
            self.dispatch_fetch(body_id).await;
        }
        self.drain_finished().await;
        self.update_idle();
    }

    fn is_idle(&self) -> bool {
        let root_busy = self
            .nodes
            .get(&ROOT_TASK_ID)
            .is_some_and(|root| {
                root.children.iter().any(|child_id| {
                    self.nodes
                        .get(child_id)
                        .is_some_and(|child| !child.state.is_terminal())
                })
            });
        !root_busy && self.pending_pages.is_empty() && self.finish_queue.is_empty()
    }

    fn set_busy(&mut self, busy: bool) {
        if self.busy != busy {
            self.busy = busy;
            for listener in &self.listeners {
                listener.on_scheduler_busy(busy);
            }
        }
    }

    fn update_idle(&mut self) {
        if self.is_idle() {
            self.set_busy(false);
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        } else {
            self.set_busy(true);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.politeness_delay, Duration::from_secs(1));
        assert_eq!(config.max_concurrent_fetches, 4);
        assert_eq!(config.min_fetch_interval, Duration::from_millis(500));
        assert_eq!(config.max_embed_depth, 3);
        assert_eq!(config.group_child_window, 100);
    }

    #[test]
    fn test_scheduler_error_display() {
        assert_eq!(
            SchedulerError::ShutDown.to_string(),
            "scheduler is shut down"
        );
        assert_eq!(
            SchedulerError::TaskFailed {
                message: "volume too full".to_string()
            }
            .to_string(),
            "task failed: volume too full"
        );
    }
}
