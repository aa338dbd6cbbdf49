//! Central scheduler.
//!
//! The [`Dispatcher`] owns the node pool, the priority queue, the job table
//! and the admin control flags. Every mutation goes through one
//! `tokio::sync::Mutex`, so no two assignment passes or completion handlers
//! ever interleave. Outbound traffic (launch and kill messages) is
//! fire-and-forget on the bus; database writes happen after the lock is
//! released and never roll back in-memory state.
//!
//! # Flow
//!
//! 1. Node agents send `node-ready` on [`DISPATCHER_TOPIC`]; the node joins the pool.
//! 2. [`Dispatcher::submit_job`] queues every task of a job at the job's priority.
//! 3. The assignment pass matches the head of the highest priority with the
//!    eligible node that has the most free CPUs and sends `launch-task`.
//! 4. `task-started` / `task-complete` from the node update the task, free
//!    the slot, and trigger another assignment pass.
//!
//! State changes are announced as [`DispatcherEvent`]s on a broadcast channel.

pub mod events;
pub mod kill;
pub mod snapshot;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;

use crate::bus::topic::{node_topic, DISPATCHER_TOPIC};
use crate::bus::{
    BusConnection, BusMessage, ConnectionEvent, ConnectionInfo, GridMessage, MessageBus,
    NodeReady, Subscription, TaskDescriptor, TaskResult, TaskStarted,
};
use crate::config::DispatcherConfig;
use crate::db::JobDatabase;
use crate::error::{GridError, Result};
use crate::scheduler::assigner::NodeReadyOutcome;
use crate::scheduler::job::{JobInfo, JobProgress, TaskResultItem};
use crate::scheduler::{
    Job, JobId, JobStatus, JobSubmission, NodeItem, NodePool, QueueJson, TaskQueue, TaskRef,
    TaskStatus,
};
use crate::user::GridUser;

pub use events::DispatcherEvent;
pub use snapshot::{DispControl, DispatcherJson};

/// Upper bound on the delay between finished-job eviction sweeps
const EVICTION_SWEEP_MAX: Duration = Duration::from_secs(60);

pub(crate) struct DispatcherState {
    conn: BusConnection,
    jobs: HashMap<JobId, Job>,
    queue: TaskQueue,
    nodes: NodePool,
    control: DispControl,
}

/// Inbound streams handed back by [`Dispatcher::new`] for [`Dispatcher::run`].
pub struct DispatcherInbox {
    pub messages: Subscription,
    pub connections: broadcast::Receiver<ConnectionEvent>,
}

pub struct Dispatcher {
    state: Mutex<DispatcherState>,
    bus: MessageBus,
    db: Arc<dyn JobDatabase>,
    config: DispatcherConfig,
    events: broadcast::Sender<DispatcherEvent>,
}

impl Dispatcher {
    /// Connect to the bus and subscribe to the dispatcher topic.
    pub fn new(
        bus: MessageBus,
        db: Arc<dyn JobDatabase>,
        config: DispatcherConfig,
    ) -> Result<(Arc<Self>, DispatcherInbox)> {
        let connections = bus.watch();
        let conn = bus.connect();
        let messages = conn.subscribe(DISPATCHER_TOPIC)?;
        let (events, _) = broadcast::channel(config.event_capacity);

        let dispatcher = Self {
            state: Mutex::new(DispatcherState {
                conn,
                jobs: HashMap::new(),
                queue: TaskQueue::new(),
                nodes: NodePool::new(),
                control: DispControl::default(),
            }),
            bus,
            db,
            config,
            events,
        };

        Ok((
            Arc::new(dispatcher),
            DispatcherInbox {
                messages,
                connections,
            },
        ))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DispatcherEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub(crate) fn emit(&self, event: DispatcherEvent) {
        tracing::trace!(event = event.name(), "Dispatcher event");
        let _ = self.events.send(event);
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().await
    }

    /// Process inbound bus traffic until shutdown.
    ///
    /// Reconnects to the bus (with a new connection id) if the dispatcher's
    /// own connection is dropped.
    pub async fn run(self: Arc<Self>, mut inbox: DispatcherInbox, shutdown: CancellationToken) {
        tracing::info!("Dispatcher started");
        let mut sweep = self.config.finished_job_retention().map(|retention| {
            tokio::time::interval(retention.clamp(Duration::from_millis(10), EVICTION_SWEEP_MAX))
        });
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Dispatcher shutting down");
                    self.lock().await.conn.disconnect();
                    break;
                }

                msg = inbox.messages.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => {
                        tracing::warn!("Dispatcher bus connection lost, reconnecting");
                        self.emit(DispatcherEvent::Error("dispatcher bus connection lost".to_string()));
                        match self.reconnect().await {
                            Ok(messages) => inbox.messages = messages,
                            Err(e) => {
                                tracing::error!(error = %e, "Dispatcher resubscribe failed");
                                break;
                            }
                        }
                    }
                },

                event = inbox.connections.recv() => match event {
                    Ok(event) => self.handle_connection_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Missed bus connection events, reconciling nodes");
                        self.reconcile_connections().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                _ = next_sweep(&mut sweep) => {
                    self.evict_finished_jobs().await;
                }
            }
        }
    }

    /// Drop finished jobs older than the retention period from memory.
    /// Returns how many were dropped.
    pub async fn evict_finished_jobs(&self) -> usize {
        let Some(retention) = self.config.finished_job_retention() else {
            return 0;
        };
        let mut state = self.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.finished_at.is_some_and(|t| t.elapsed() >= retention))
        });
        let evicted = before - state.jobs.len();
        if evicted > 0 {
            tracing::info!(evicted, "Finished jobs evicted");
            self.emit(DispatcherEvent::JobsTrackingChanged);
        }
        evicted
    }

    async fn reconnect(&self) -> Result<Subscription> {
        let mut state = self.lock().await;
        state.conn = self.bus.connect();
        state.conn.subscribe(DISPATCHER_TOPIC)
    }

    pub async fn handle_message(self: &Arc<Self>, msg: BusMessage) {
        match msg.body {
            GridMessage::NodeReady(ready) => self.node_ready(&msg.from, ready).await,
            GridMessage::TaskStarted(started) => self.task_started(&msg.from, started).await,
            GridMessage::TaskComplete(result) => self.task_complete(&msg.from, result).await,
            other => {
                tracing::warn!(from = %msg.from, kind = other.kind(), "Unexpected message on dispatcher topic");
            }
        }
    }

    pub async fn handle_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        if let ConnectionEvent::Disconnected(id) = event {
            self.node_disconnected(&id).await;
        }
    }

    async fn reconcile_connections(self: &Arc<Self>) {
        let stale: Vec<String> = {
            let state = self.lock().await;
            state
                .nodes
                .items()
                .into_iter()
                .filter(|n| n.connected && !self.bus.is_connected(&n.id))
                .map(|n| n.id)
                .collect()
        };
        for id in stale {
            self.node_disconnected(&id).await;
        }
    }

    // =========================================================================
    // Job lifecycle
    // =========================================================================

    pub async fn submit_job(
        &self,
        user: &GridUser,
        submission: JobSubmission,
        notification_cookie: Option<String>,
    ) -> Result<JobId> {
        if !user.profile.can_submit_job {
            return Err(GridError::NotAuthorized(format!(
                "user {} may not submit jobs",
                user.user_name
            )));
        }
        let job = Job::from_submission(user, submission, notification_cookie)?;
        if self.lock().await.control.queue_closed {
            return Err(GridError::QueueClosed);
        }

        // Nodes read execution parameters from the database, so a job that
        // cannot be registered could never run. Nothing is in memory yet.
        if let Err(e) = self.db.register_job(&job).await {
            tracing::error!(job_id = %job.job_id, error = %e, "Failed to persist submitted job, rejecting it");
            self.emit(DispatcherEvent::Error(e.to_string()));
            return Err(e);
        }

        let job_id = job.job_id;
        let progress = {
            let mut state = self.lock().await;
            if state.control.queue_closed {
                drop(state);
                if let Err(e) = self.db.discard_job(&job_id).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to discard job rejected by a closed queue");
                }
                return Err(GridError::QueueClosed);
            }
            for task in &job.tasks {
                state
                    .queue
                    .push_back(job.priority, TaskRef::new(job_id, task.task_id));
            }
            tracing::info!(
                job_id = %job_id,
                user = %job.user_name,
                priority = job.priority,
                num_tasks = job.num_tasks(),
                "Job submitted"
            );
            let progress = job.progress();
            state.jobs.insert(job_id, job);

            self.emit(DispatcherEvent::JobSubmitted(job_id));
            self.emit(DispatcherEvent::QueueChanged);
            self.emit(DispatcherEvent::JobsTrackingChanged);
            self.emit(DispatcherEvent::JobStatusChanged(progress));
            self.dispatch_pending(&mut state)
        };
        self.persist(progress).await;
        Ok(job_id)
    }

    /// Submit a copy of an existing job: every task, or only the ones that
    /// did not complete successfully.
    pub async fn resubmit_job(
        &self,
        user: &GridUser,
        old_job_id: JobId,
        failed_tasks_only: bool,
        notification_cookie: Option<String>,
    ) -> Result<JobId> {
        let submission = {
            let state = self.lock().await;
            let old = state
                .jobs
                .get(&old_job_id)
                .ok_or(GridError::JobNotFound(old_job_id))?;
            JobSubmission {
                description: old.description.clone(),
                cookie: old.cookie.clone(),
                priority: Some(old.priority),
                tasks: old
                    .tasks
                    .iter()
                    .filter(|t| !failed_tasks_only || t.status != TaskStatus::Complete)
                    .map(|t| t.item())
                    .collect(),
            }
        };
        if submission.tasks.is_empty() {
            return Err(GridError::InvalidJob(format!(
                "job {} has no failed tasks to re-submit",
                old_job_id
            )));
        }
        tracing::info!(old_job_id = %old_job_id, failed_tasks_only, "Re-submitting job");
        self.submit_job(user, submission, notification_cookie).await
    }

    /// Falls back to the job database for jobs no longer held in memory.
    pub async fn get_job_info(&self, job_id: JobId) -> Result<JobInfo> {
        let tracked = self.lock().await.jobs.get(&job_id).map(Job::info);
        match tracked {
            Some(info) => Ok(info),
            None => self.db.get_job_info(&job_id).await,
        }
    }

    pub async fn get_job_progress(&self, job_id: JobId) -> Result<JobProgress> {
        let tracked = self.lock().await.jobs.get(&job_id).map(Job::progress);
        match tracked {
            Some(progress) => Ok(progress),
            None => self.db.get_job_info(&job_id).await.map(|info| JobProgress {
                job_id,
                status: info.status,
                num_tasks: info.num_tasks,
                num_tasks_finished: info.num_tasks_finished,
                success: info.success,
            }),
        }
    }

    pub async fn get_job_result(&self, job_id: JobId) -> Result<Vec<TaskResultItem>> {
        self.lock()
            .await
            .jobs
            .get(&job_id)
            .map(Job::results)
            .ok_or(GridError::JobNotFound(job_id))
    }

    /// Client connection to notify about a job's progress
    pub async fn notification_cookie(&self, job_id: JobId) -> Option<String> {
        self.lock()
            .await
            .jobs
            .get(&job_id)
            .and_then(|j| j.notification_cookie.clone())
    }

    /// Tracked jobs, oldest first
    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        let state = self.lock().await;
        let mut jobs: Vec<JobInfo> = state.jobs.values().map(Job::info).collect();
        jobs.sort_by_key(|j| j.submit_time);
        jobs
    }

    pub async fn task_status(&self, task: TaskRef) -> Option<TaskStatus> {
        self.lock()
            .await
            .jobs
            .get(&task.job_id)
            .and_then(|j| j.task(task.task_id))
            .map(|t| t.status)
    }

    // =========================================================================
    // Snapshots and admin controls
    // =========================================================================

    pub async fn get_json(&self) -> DispatcherJson {
        let state = self.lock().await;
        DispatcherJson {
            nodes: state.nodes.items(),
            queue: state.queue.snapshot(),
            disp_control: state.control,
        }
    }

    pub async fn nodes(&self) -> Vec<NodeItem> {
        self.lock().await.nodes.items()
    }

    pub async fn queue(&self) -> QueueJson {
        self.lock().await.queue.snapshot()
    }

    pub async fn disp_control(&self) -> DispControl {
        self.lock().await.control
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.bus.connections()
    }

    pub async fn set_dispatching_enabled(&self, enabled: bool) -> DispControl {
        let (control, progress) = {
            let mut state = self.lock().await;
            let changed = state.control.dispatch_enabled != enabled;
            state.control.dispatch_enabled = enabled;
            if changed {
                tracing::info!(enabled, "Dispatching toggled");
                self.emit(DispatcherEvent::CtrlChanged(state.control));
            }
            let progress = if enabled {
                self.dispatch_pending(&mut state)
            } else {
                Vec::new()
            };
            (state.control, progress)
        };
        self.persist(progress).await;
        control
    }

    pub async fn set_queue_opened(&self, open: bool) -> DispControl {
        let mut state = self.lock().await;
        let closed = !open;
        if state.control.queue_closed != closed {
            state.control.queue_closed = closed;
            tracing::info!(open, "Queue intake toggled");
            self.emit(DispatcherEvent::CtrlChanged(state.control));
        }
        state.control
    }

    pub async fn set_node_enabled(&self, node_id: &str, enabled: bool) -> Result<NodeItem> {
        let (item, progress) = {
            let mut state = self.lock().await;
            let changed = state
                .nodes
                .set_enabled(node_id, enabled)
                .ok_or_else(|| GridError::NodeNotFound(node_id.to_string()))?;
            if changed {
                tracing::info!(node_id, enabled, "Node toggled");
                self.emit(if enabled {
                    DispatcherEvent::NodeEnabled(node_id.to_string())
                } else {
                    DispatcherEvent::NodeDisabled(node_id.to_string())
                });
            }
            let progress = if enabled {
                self.dispatch_pending(&mut state)
            } else {
                Vec::new()
            };
            let item = state
                .nodes
                .get(node_id)
                .map(|n| n.item())
                .ok_or_else(|| GridError::NodeNotFound(node_id.to_string()))?;
            (item, progress)
        };
        self.persist(progress).await;
        Ok(item)
    }

    // =========================================================================
    // Node traffic
    // =========================================================================

    async fn node_ready(&self, node_id: &str, ready: NodeReady) {
        if !self.bus.is_connected(node_id) {
            tracing::debug!(node_id, "node-ready from a closed connection ignored");
            return;
        }
        let progress = {
            let mut state = self.lock().await;
            let outcome = state.nodes.node_ready(node_id, &ready.name, ready.num_cpus);
            if outcome == NodeReadyOutcome::Added {
                self.emit(DispatcherEvent::NodeAdded(node_id.to_string()));
            }
            self.emit(DispatcherEvent::NodeReady(node_id.to_string()));
            self.emit(DispatcherEvent::NodesUsageChanged);
            self.dispatch_pending(&mut state)
        };
        self.persist(progress).await;
    }

    async fn task_started(&self, node_id: &str, started: TaskStarted) {
        let mut state = self.lock().await;
        let DispatcherState { jobs, nodes, .. } = &mut *state;
        let Some(task) = jobs
            .get_mut(&started.job_id)
            .and_then(|j| j.task_mut(started.task_id))
        else {
            tracing::warn!(job_id = %started.job_id, task_id = started.task_id, "task-started for unknown task");
            return;
        };
        if !task.status.is_active() {
            tracing::debug!(
                job_id = %started.job_id,
                task_id = started.task_id,
                status = %task.status,
                "Stale task-started ignored"
            );
            return;
        }
        if !reported_by_owner(nodes, task.assigned_node_id.as_deref(), node_id) {
            tracing::warn!(
                job_id = %started.job_id,
                task_id = started.task_id,
                from = node_id,
                pid = started.pid,
                "task-started from a node that does not own the task ignored"
            );
            return;
        }
        task.status = TaskStatus::Running;
        task.pid = Some(started.pid);
        tracing::debug!(job_id = %started.job_id, task_id = started.task_id, node_id, pid = started.pid, "Task running");
    }

    async fn task_complete(&self, node_id: &str, result: TaskResult) {
        let progress = {
            let mut state = self.lock().await;
            let mut progress = match self.complete_task(&mut state, node_id, &result) {
                Some(p) => vec![p],
                None => return,
            };
            progress.extend(self.dispatch_pending(&mut state));
            progress
        };
        self.persist(progress).await;
    }

    fn complete_task(
        &self,
        state: &mut DispatcherState,
        node_id: &str,
        result: &TaskResult,
    ) -> Option<JobProgress> {
        let DispatcherState { jobs, nodes, .. } = state;
        let Some(job) = jobs.get_mut(&result.job_id) else {
            tracing::warn!(job_id = %result.job_id, task_id = result.task_id, "task-complete for unknown job");
            return None;
        };
        let killing = job.killing;
        let Some(task) = job.task_mut(result.task_id) else {
            tracing::warn!(job_id = %result.job_id, task_id = result.task_id, "task-complete for unknown task");
            return None;
        };
        if !task.status.is_active() {
            tracing::debug!(job_id = %result.job_id, task_id = result.task_id, status = %task.status, "Stale task-complete ignored");
            return None;
        }

        let assigned = task.assigned_node_id.clone().unwrap_or_default();
        if !reported_by_owner(nodes, Some(&assigned), node_id) {
            tracing::warn!(
                job_id = %result.job_id,
                task_id = result.task_id,
                from = node_id,
                assigned = %assigned,
                "task-complete from a node that does not own the task ignored"
            );
            return None;
        }

        task.status = if result.success {
            TaskStatus::Complete
        } else if killing {
            TaskStatus::Killed
        } else {
            TaskStatus::Failed
        };
        task.ret_code = result.ret_code;
        if task.pid.is_none() {
            task.pid = result.pid;
        }
        tracing::info!(
            job_id = %result.job_id,
            task_id = result.task_id,
            node_id = %assigned,
            status = %task.status,
            "Task finished"
        );

        nodes.release(&assigned);
        let finished = job.record_task_finished();
        let progress = job.progress();

        self.emit(DispatcherEvent::NodesUsageChanged);
        self.emit(DispatcherEvent::JobStatusChanged(progress.clone()));
        if finished {
            tracing::info!(job_id = %job.job_id, status = %job.status, success = job.success, "Job finished");
            self.emit(DispatcherEvent::JobFinished(job.job_id));
            self.emit(DispatcherEvent::JobsTrackingChanged);
        }
        Some(progress)
    }

    async fn node_disconnected(self: &Arc<Self>, node_id: &str) {
        let orphans = {
            let mut state = self.lock().await;
            if !state.nodes.disconnect(node_id) {
                return;
            }
            let orphans = state
                .jobs
                .values()
                .flat_map(|j| j.tasks.iter())
                .filter(|t| t.status.is_active() && t.assigned_node_id.as_deref() == Some(node_id))
                .count();
            tracing::warn!(node_id, orphans, "Node disconnected");
            self.emit(DispatcherEvent::NodeRemoved(node_id.to_string()));
            self.emit(DispatcherEvent::NodesUsageChanged);
            orphans
        };

        if orphans == 0 {
            return;
        }
        if let Some(grace) = self.config.orphan_requeue_grace() {
            let dispatcher = Arc::clone(self);
            let node_id = node_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                dispatcher.requeue_orphans(&node_id).await;
            });
        }
    }

    /// Return tasks still held by a disconnected node to the front of their queues
    pub async fn requeue_orphans(&self, node_id: &str) -> usize {
        let (requeued, progress) = {
            let mut state = self.lock().await;
            if state.nodes.get(node_id).is_some_and(|n| n.connected) {
                return 0;
            }
            let DispatcherState {
                jobs, queue, nodes, ..
            } = &mut *state;

            let mut requeued = 0;
            let mut progress = Vec::new();
            for job in jobs.values_mut() {
                let mut killed = 0;
                for task in job.tasks.iter_mut().rev() {
                    if !task.status.is_active() || task.assigned_node_id.as_deref() != Some(node_id) {
                        continue;
                    }
                    nodes.release(node_id);
                    task.pid = None;
                    if job.killing {
                        task.status = TaskStatus::Killed;
                        killed += 1;
                    } else {
                        task.status = TaskStatus::Pending;
                        queue.push_front(job.priority, TaskRef::new(job.job_id, task.task_id));
                        requeued += 1;
                    }
                }
                if killed == 0 {
                    continue;
                }
                for _ in 0..killed {
                    if job.record_task_finished() {
                        self.emit(DispatcherEvent::JobFinished(job.job_id));
                        self.emit(DispatcherEvent::JobsTrackingChanged);
                    }
                }
                let p = job.progress();
                self.emit(DispatcherEvent::JobStatusChanged(p.clone()));
                progress.push(p);
            }
            tracing::info!(node_id, requeued, "Orphaned tasks requeued");
            if requeued > 0 {
                self.emit(DispatcherEvent::QueueChanged);
            }
            self.emit(DispatcherEvent::NodesUsageChanged);
            progress.extend(self.dispatch_pending(&mut state));
            (requeued, progress)
        };
        self.persist(progress).await;
        requeued
    }

    // =========================================================================
    // Assignment
    // =========================================================================

    /// Assign as many queued tasks as capacity allows and launch them.
    /// Returns progress records of jobs whose status changed.
    pub(crate) fn dispatch_pending(&self, state: &mut DispatcherState) -> Vec<JobProgress> {
        if !state.control.dispatch_enabled {
            return Vec::new();
        }
        let DispatcherState {
            conn,
            jobs,
            queue,
            nodes,
            ..
        } = state;

        let assignments = nodes.assign_pending(queue);
        if assignments.is_empty() {
            return Vec::new();
        }

        let mut progress = Vec::new();
        for assignment in &assignments {
            let TaskRef { job_id, task_id } = assignment.task;
            let Some(job) = jobs.get_mut(&job_id) else {
                tracing::error!(job_id = %job_id, "Queued task references a missing job");
                continue;
            };
            if let Some(task) = job.task_mut(task_id) {
                task.status = TaskStatus::Assigned;
                task.assigned_node_id = Some(assignment.node_id.clone());
            }
            if job.status == JobStatus::Queued {
                job.status = JobStatus::Running;
                let p = job.progress();
                self.emit(DispatcherEvent::JobStatusChanged(p.clone()));
                self.emit(DispatcherEvent::JobsTrackingChanged);
                progress.push(p);
            }

            let msg = GridMessage::LaunchTask(TaskDescriptor { job_id, task_id });
            if let Err(e) = conn.send(&node_topic(&assignment.node_id), msg) {
                tracing::error!(
                    job_id = %job_id,
                    task_id,
                    node_id = %assignment.node_id,
                    error = %e,
                    "Failed to send launch-task"
                );
                self.emit(DispatcherEvent::Error(e.to_string()));
            }
        }

        self.emit(DispatcherEvent::QueueChanged);
        self.emit(DispatcherEvent::NodesUsageChanged);
        progress
    }

    /// Best-effort database write of job progress
    pub(crate) async fn persist(&self, progress: Vec<JobProgress>) {
        for p in progress {
            if let Err(e) = self.db.update_job_progress(&p).await {
                tracing::warn!(job_id = %p.job_id, error = %e, "Failed to persist job progress");
                self.emit(DispatcherEvent::Error(e.to_string()));
            }
        }
    }
}

async fn next_sweep(sweep: &mut Option<Interval>) {
    match sweep {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Task reports are taken from the node the task is assigned to, or from any
/// node once the assigned one is no longer connected.
fn reported_by_owner(nodes: &NodePool, assigned: Option<&str>, from: &str) -> bool {
    match assigned {
        Some(assigned) if assigned != from => !nodes.get(assigned).is_some_and(|n| n.connected),
        _ => true,
    }
}
