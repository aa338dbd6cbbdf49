//! Job database collaborator.
//!
//! The dispatcher's in-memory state is authoritative for scheduling; the
//! database is an audit and recovery log written on a best-effort basis.
//! Node agents read task execution parameters from it and record task start
//! and end. [`MemoryJobDatabase`] is the in-process implementation used by the
//! binary and the tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bus::TaskDescriptor;
use crate::error::{GridError, Result};
use crate::scheduler::job::{Job, JobId, JobInfo, JobProgress, TaskId, TaskItem};
use crate::user::UserProfile;
use crate::worker::executor::TaskExecResult;

/// Everything a node needs to start one task's process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecParams {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub cmd: String,
    pub stdin: Option<String>,
    pub env: Vec<(String, String)>,
}

#[async_trait]
pub trait JobDatabase: Send + Sync {
    async fn register_job(&self, job: &Job) -> Result<()>;

    /// Forget a registered job that was never queued
    async fn discard_job(&self, job_id: &JobId) -> Result<()>;

    async fn update_job_progress(&self, progress: &JobProgress) -> Result<()>;

    /// Last recorded state of a job, including ones the dispatcher no longer tracks
    async fn get_job_info(&self, job_id: &JobId) -> Result<JobInfo>;

    async fn get_task_exec_params(
        &self,
        task: &TaskDescriptor,
        node_id: &str,
        node_name: &str,
    ) -> Result<TaskExecParams>;

    async fn mark_task_start(&self, task: &TaskDescriptor, pid: u32) -> Result<()>;

    async fn mark_task_end(&self, task: &TaskDescriptor, result: &TaskExecResult) -> Result<()>;

    async fn get_user_profile(&self, user_id: &str) -> Result<UserProfile>;
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub item: TaskItem,
    pub node_id: Option<String>,
    pub pid: Option<u32>,
    pub result: Option<TaskExecResult>,
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub info: JobInfo,
    pub tasks: Vec<TaskRecord>,
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, JobRecord>,
    profiles: HashMap<String, UserProfile>,
}

/// In-memory [`JobDatabase`]. Writes can be made to fail to exercise the
/// best-effort paths.
#[derive(Default)]
pub struct MemoryJobDatabase {
    state: Mutex<MemoryState>,
    fail_writes: AtomicBool,
}

impl MemoryJobDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GridError::Db("database unavailable".to_string()));
        }
        Ok(())
    }

    /// Make every subsequent write fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn add_user_profile(&self, user_id: impl Into<String>, profile: UserProfile) {
        self.lock().profiles.insert(user_id.into(), profile);
    }

    pub fn job_record(&self, job_id: &JobId) -> Option<JobRecord> {
        self.lock().jobs.get(job_id).cloned()
    }

    pub fn task_record(&self, job_id: &JobId, task_id: TaskId) -> Option<TaskRecord> {
        self.lock()
            .jobs
            .get(job_id)
            .and_then(|j| j.tasks.get(task_id as usize))
            .cloned()
    }

    fn with_task<T>(
        &self,
        task: &TaskDescriptor,
        f: impl FnOnce(&mut TaskRecord) -> T,
    ) -> Result<T> {
        let mut state = self.lock();
        let record = state
            .jobs
            .get_mut(&task.job_id)
            .and_then(|j| j.tasks.get_mut(task.task_id as usize))
            .ok_or_else(|| {
                GridError::Db(format!("no task {} in job {}", task.task_id, task.job_id))
            })?;
        Ok(f(record))
    }
}

#[async_trait]
impl JobDatabase for MemoryJobDatabase {
    async fn register_job(&self, job: &Job) -> Result<()> {
        self.check_writable()?;
        let record = JobRecord {
            info: job.info(),
            tasks: job
                .tasks
                .iter()
                .map(|t| TaskRecord {
                    item: t.item(),
                    node_id: None,
                    pid: None,
                    result: None,
                })
                .collect(),
        };
        self.lock().jobs.insert(job.job_id, record);
        Ok(())
    }

    async fn discard_job(&self, job_id: &JobId) -> Result<()> {
        self.check_writable()?;
        self.lock().jobs.remove(job_id);
        Ok(())
    }

    async fn update_job_progress(&self, progress: &JobProgress) -> Result<()> {
        self.check_writable()?;
        let mut state = self.lock();
        let record = state
            .jobs
            .get_mut(&progress.job_id)
            .ok_or_else(|| GridError::Db(format!("no job {}", progress.job_id)))?;
        record.info.status = progress.status;
        record.info.num_tasks_finished = progress.num_tasks_finished;
        record.info.success = progress.success;
        Ok(())
    }

    async fn get_job_info(&self, job_id: &JobId) -> Result<JobInfo> {
        self.lock()
            .jobs
            .get(job_id)
            .map(|record| record.info.clone())
            .ok_or(GridError::JobNotFound(*job_id))
    }

    async fn get_task_exec_params(
        &self,
        task: &TaskDescriptor,
        node_id: &str,
        node_name: &str,
    ) -> Result<TaskExecParams> {
        let item = self.with_task(task, |record| {
            record.node_id = Some(node_id.to_string());
            record.item.clone()
        })?;
        Ok(TaskExecParams {
            job_id: task.job_id,
            task_id: task.task_id,
            cmd: item.cmd,
            stdin: item.stdin,
            env: vec![
                ("GRID_JOB_ID".to_string(), task.job_id.to_string()),
                ("GRID_TASK_ID".to_string(), task.task_id.to_string()),
                ("GRID_NODE_ID".to_string(), node_id.to_string()),
                ("GRID_NODE_NAME".to_string(), node_name.to_string()),
            ],
        })
    }

    async fn mark_task_start(&self, task: &TaskDescriptor, pid: u32) -> Result<()> {
        self.check_writable()?;
        self.with_task(task, |record| record.pid = Some(pid))
    }

    async fn mark_task_end(&self, task: &TaskDescriptor, result: &TaskExecResult) -> Result<()> {
        self.check_writable()?;
        self.with_task(task, |record| record.result = Some(result.clone()))
    }

    async fn get_user_profile(&self, user_id: &str) -> Result<UserProfile> {
        self.lock()
            .profiles
            .get(user_id)
            .cloned()
            .ok_or_else(|| GridError::NotAuthorized(format!("no profile for user {}", user_id)))
    }
}
