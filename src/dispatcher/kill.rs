//! Kill-job protocol.
//!
//! A kill marks the job, drops its queued tasks, asks every node holding one
//! of its running tasks to terminate that task's process tree, and then polls
//! until all tasks are terminal or the poll budget runs out. Nodes never
//! acknowledge a kill; the outcome arrives as ordinary `task-complete`
//! messages.

use std::collections::{BTreeMap, HashSet};

use crate::bus::topic::node_topic;
use crate::bus::GridMessage;
use crate::dispatcher::{Dispatcher, DispatcherEvent, DispatcherState};
use crate::error::{GridError, Result};
use crate::scheduler::job::JobProgress;
use crate::scheduler::{JobId, NodeId, TaskStatus};
use crate::user::GridUser;

enum KillStart {
    AlreadyTerminal,
    Pending(Vec<JobProgress>),
}

impl Dispatcher {
    /// Kill a job. Resolves once every task is terminal, or fails with
    /// [`GridError::KillTimeout`] after `kill_max_polls` polls, leaving the
    /// job in whatever partial state it reached.
    pub async fn kill_job(&self, user: &GridUser, job_id: JobId) -> Result<()> {
        {
            let state = self.lock().await;
            let job = state
                .jobs
                .get(&job_id)
                .ok_or(GridError::JobNotFound(job_id))?;
            if job.user_id != user.user_id && !user.profile.can_kill_other_users_job {
                return Err(GridError::NotAuthorized(format!(
                    "user {} may not kill job {} of user {}",
                    user.user_name, job_id, job.user_name
                )));
            }
        }

        tracing::info!(job_id = %job_id, user = %user.user_name, "Kill job requested");
        self.emit(DispatcherEvent::KillJobBegin(job_id));

        let mut signalled = HashSet::new();
        let start = {
            let mut state = self.lock().await;
            self.begin_kill(&mut state, job_id, &mut signalled)?
        };
        let progress = match start {
            KillStart::AlreadyTerminal => {
                self.emit(DispatcherEvent::KillJobEnd {
                    job_id,
                    error: None,
                });
                return Ok(());
            }
            KillStart::Pending(progress) => progress,
        };
        self.persist(progress).await;

        let max_polls = self.config().kill_max_polls;
        let mut interval = tokio::time::interval(self.config().kill_poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately; every poll waits a full interval
        interval.tick().await;

        if self.job_terminal(job_id).await {
            return self.finish_kill(job_id).await;
        }
        for poll in 1..=max_polls {
            interval.tick().await;
            self.emit(DispatcherEvent::KillJobPoll { job_id, poll });
            tracing::debug!(job_id = %job_id, poll, "Kill job poll");

            let mut state = self.lock().await;
            let Some(job) = state.jobs.get(&job_id) else {
                return Err(GridError::JobNotFound(job_id));
            };
            if job.status.is_terminal() {
                drop(state);
                return self.finish_kill(job_id).await;
            }
            // Tasks that reported a pid after the previous signal round
            self.signal_running(&mut state, job_id, &mut signalled);
        }

        let err = GridError::KillTimeout {
            job_id,
            polls: max_polls,
        };
        tracing::warn!(job_id = %job_id, polls = max_polls, "Kill job timed out");
        self.emit(DispatcherEvent::KillJobEnd {
            job_id,
            error: Some(err.to_string()),
        });
        Err(err)
    }

    async fn job_terminal(&self, job_id: JobId) -> bool {
        self.lock()
            .await
            .jobs
            .get(&job_id)
            .map_or(true, |j| j.status.is_terminal())
    }

    async fn finish_kill(&self, job_id: JobId) -> Result<()> {
        tracing::info!(job_id = %job_id, "Job killed");
        self.emit(DispatcherEvent::KillJobEnd {
            job_id,
            error: None,
        });
        Ok(())
    }

    fn begin_kill(
        &self,
        state: &mut DispatcherState,
        job_id: JobId,
        signalled: &mut HashSet<u32>,
    ) -> Result<KillStart> {
        let DispatcherState { jobs, queue, .. } = &mut *state;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(GridError::JobNotFound(job_id))?;
        if job.status.is_terminal() {
            tracing::debug!(job_id = %job_id, status = %job.status, "Kill on finished job is a no-op");
            return Ok(KillStart::AlreadyTerminal);
        }
        job.killing = true;

        let removed = queue.remove_job(&job_id);
        for task_ref in &removed {
            if let Some(task) = job.task_mut(task_ref.task_id) {
                task.status = TaskStatus::Killed;
            }
        }

        let mut progress = Vec::new();
        if !removed.is_empty() {
            tracing::info!(job_id = %job_id, dequeued = removed.len(), "Queued tasks of killed job dropped");
            let mut finished = false;
            for _ in &removed {
                finished |= job.record_task_finished();
            }
            let p = job.progress();
            self.emit(DispatcherEvent::QueueChanged);
            self.emit(DispatcherEvent::JobStatusChanged(p.clone()));
            if finished {
                self.emit(DispatcherEvent::JobFinished(job_id));
                self.emit(DispatcherEvent::JobsTrackingChanged);
            }
            progress.push(p);
        }

        self.signal_running(state, job_id, signalled);
        Ok(KillStart::Pending(progress))
    }

    /// Send one `kill-processes-tree` per node for the job's active tasks
    /// whose pids have not been signalled yet.
    fn signal_running(
        &self,
        state: &mut DispatcherState,
        job_id: JobId,
        signalled: &mut HashSet<u32>,
    ) {
        let Some(job) = state.jobs.get(&job_id) else {
            return;
        };
        let mut by_node: BTreeMap<NodeId, Vec<u32>> = BTreeMap::new();
        for task in job.tasks.iter().filter(|t| t.status.is_active()) {
            let (Some(node_id), Some(pid)) = (&task.assigned_node_id, task.pid) else {
                continue;
            };
            if signalled.insert(pid) {
                by_node.entry(node_id.clone()).or_default().push(pid);
            }
        }

        for (node_id, pids) in by_node {
            tracing::info!(job_id = %job_id, node_id = %node_id, pids = ?pids, "Sending kill-processes-tree");
            if let Err(e) = state
                .conn
                .send(&node_topic(&node_id), GridMessage::KillProcessesTree(pids))
            {
                tracing::error!(job_id = %job_id, node_id = %node_id, error = %e, "Failed to send kill-processes-tree");
                self.emit(DispatcherEvent::Error(e.to_string()));
            }
        }
    }
}
