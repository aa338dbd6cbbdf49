use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::user::GridUser;

pub type JobId = Uuid;
/// Index of a task within its job
pub type TaskId = u32;
/// Bus connection id of a node agent
pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Aborted)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "QUEUED"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Finished => write!(f, "FINISHED"),
            JobStatus::Aborted => write!(f, "ABORTED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Complete,
    Failed,
    Killed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Killed
        )
    }

    /// Holding a CPU slot on a node
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "PENDING"),
            TaskStatus::Assigned => write!(f, "ASSIGNED"),
            TaskStatus::Running => write!(f, "RUNNING"),
            TaskStatus::Complete => write!(f, "COMPLETE"),
            TaskStatus::Failed => write!(f, "FAILED"),
            TaskStatus::Killed => write!(f, "KILLED"),
        }
    }
}

/// One task line of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskItem {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

impl TaskItem {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            cookie: None,
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// A job as handed to the dispatcher, already parsed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSubmission {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cookie: Option<String>,
    /// Falls back to the submitting user's profile priority
    #[serde(default)]
    pub priority: Option<i32>,
    pub tasks: Vec<TaskItem>,
}

impl JobSubmission {
    pub fn new(tasks: Vec<TaskItem>) -> Self {
        Self {
            tasks,
            ..Default::default()
        }
    }

    pub fn from_commands<I, S>(cmds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(cmds.into_iter().map(TaskItem::new).collect())
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(GridError::InvalidJob("no tasks for job".to_string()));
        }
        if let Some(i) = self.tasks.iter().position(|t| t.cmd.trim().is_empty()) {
            return Err(GridError::InvalidJob(format!(
                "cmd not optional for task {}",
                i
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub cmd: String,
    pub cookie: Option<String>,
    pub stdin: Option<String>,
    pub status: TaskStatus,
    /// Kept after completion for audit
    pub assigned_node_id: Option<NodeId>,
    pub pid: Option<u32>,
    pub ret_code: Option<i32>,
}

impl Task {
    pub fn new(job_id: JobId, task_id: TaskId, item: TaskItem) -> Self {
        Self {
            task_id,
            job_id,
            cmd: item.cmd,
            cookie: item.cookie,
            stdin: item.stdin,
            status: TaskStatus::Pending,
            assigned_node_id: None,
            pid: None,
            ret_code: None,
        }
    }

    pub fn item(&self) -> TaskItem {
        TaskItem {
            cmd: self.cmd.clone(),
            cookie: self.cookie.clone(),
            stdin: self.stdin.clone(),
        }
    }
}

/// Compact progress record pushed to the submitting client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub job_id: JobId,
    pub status: JobStatus,
    pub num_tasks: usize,
    pub num_tasks_finished: usize,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub job_id: JobId,
    pub description: Option<String>,
    pub cookie: Option<String>,
    pub user_id: String,
    pub user_name: String,
    pub priority: i32,
    pub submit_time: DateTime<Utc>,
    pub status: JobStatus,
    pub num_tasks: usize,
    pub num_tasks_finished: usize,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultItem {
    pub task_id: TaskId,
    pub cmd: String,
    pub cookie: Option<String>,
    pub status: TaskStatus,
    pub node_id: Option<NodeId>,
    pub pid: Option<u32>,
    pub ret_code: Option<i32>,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: JobId,
    pub description: Option<String>,
    pub cookie: Option<String>,
    pub priority: i32,
    pub submit_time: DateTime<Utc>,
    pub user_id: String,
    pub user_name: String,
    pub tasks: Vec<Task>,
    pub status: JobStatus,
    pub num_tasks_finished: usize,
    pub success: bool,
    /// Client connection that receives `status-changed` for this job
    pub notification_cookie: Option<String>,
    /// Set once a kill has been requested
    pub killing: bool,
    /// When the job reached a terminal status
    pub finished_at: Option<Instant>,
}

impl Job {
    pub fn from_submission(
        user: &GridUser,
        submission: JobSubmission,
        notification_cookie: Option<String>,
    ) -> Result<Self> {
        submission.validate()?;
        let job_id = Uuid::new_v4();
        let tasks = submission
            .tasks
            .into_iter()
            .enumerate()
            .map(|(i, item)| Task::new(job_id, i as TaskId, item))
            .collect();

        Ok(Self {
            job_id,
            description: submission.description,
            cookie: submission.cookie,
            priority: submission.priority.unwrap_or(user.profile.priority),
            submit_time: Utc::now(),
            user_id: user.user_id.clone(),
            user_name: user.user_name.clone(),
            tasks,
            status: JobStatus::Queued,
            num_tasks_finished: 0,
            success: false,
            notification_cookie,
            killing: false,
            finished_at: None,
        })
    }

    pub fn task(&self, task_id: TaskId) -> Option<&Task> {
        self.tasks.get(task_id as usize)
    }

    pub fn task_mut(&mut self, task_id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(task_id as usize)
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// Record a task reaching a terminal status. Returns true when this was
    /// the job's last outstanding task and the job itself is now terminal.
    pub fn record_task_finished(&mut self) -> bool {
        self.num_tasks_finished += 1;
        if self.num_tasks_finished < self.tasks.len() {
            return false;
        }
        self.success = self.tasks.iter().all(|t| t.status == TaskStatus::Complete);
        self.status = if self.killing && !self.success {
            JobStatus::Aborted
        } else {
            JobStatus::Finished
        };
        self.finished_at = Some(Instant::now());
        true
    }

    pub fn progress(&self) -> JobProgress {
        JobProgress {
            job_id: self.job_id,
            status: self.status,
            num_tasks: self.tasks.len(),
            num_tasks_finished: self.num_tasks_finished,
            success: self.success,
        }
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            job_id: self.job_id,
            description: self.description.clone(),
            cookie: self.cookie.clone(),
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            priority: self.priority,
            submit_time: self.submit_time,
            status: self.status,
            num_tasks: self.tasks.len(),
            num_tasks_finished: self.num_tasks_finished,
            success: self.success,
        }
    }

    pub fn results(&self) -> Vec<TaskResultItem> {
        self.tasks
            .iter()
            .map(|t| TaskResultItem {
                task_id: t.task_id,
                cmd: t.cmd.clone(),
                cookie: t.cookie.clone(),
                status: t.status,
                node_id: t.assigned_node_id.clone(),
                pid: t.pid,
                ret_code: t.ret_code,
                success: t.status == TaskStatus::Complete,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::UserProfile;

    fn user() -> GridUser {
        GridUser::new("u1", "alice", UserProfile::user())
    }

    #[test]
    fn submission_requires_tasks() {
        let err = JobSubmission::new(vec![]).validate().unwrap_err();
        assert!(matches!(err, GridError::InvalidJob(_)));
    }

    #[test]
    fn submission_requires_commands() {
        let sub = JobSubmission::new(vec![TaskItem::new("echo 1"), TaskItem::new("  ")]);
        match sub.validate() {
            Err(GridError::InvalidJob(msg)) => assert!(msg.contains("task 1")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn job_priority_defaults_to_profile() {
        let job = Job::from_submission(&user(), JobSubmission::from_commands(["true"]), None)
            .unwrap();
        assert_eq!(job.priority, UserProfile::user().priority);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.tasks[0].status, TaskStatus::Pending);
        assert_eq!(job.tasks[0].job_id, job.job_id);

        let job = Job::from_submission(
            &user(),
            JobSubmission::from_commands(["true"]).with_priority(1),
            None,
        )
        .unwrap();
        assert_eq!(job.priority, 1);
    }

    #[test]
    fn last_task_finishes_job() {
        let mut job =
            Job::from_submission(&user(), JobSubmission::from_commands(["a", "b"]), None).unwrap();
        job.tasks[0].status = TaskStatus::Complete;
        assert!(!job.record_task_finished());
        job.tasks[1].status = TaskStatus::Failed;
        assert!(job.record_task_finished());
        assert_eq!(job.status, JobStatus::Finished);
        assert!(!job.success);
    }

    #[test]
    fn killed_job_is_aborted() {
        let mut job =
            Job::from_submission(&user(), JobSubmission::from_commands(["a"]), None).unwrap();
        job.killing = true;
        job.tasks[0].status = TaskStatus::Killed;
        assert!(job.record_task_finished());
        assert_eq!(job.status, JobStatus::Aborted);
    }

    #[test]
    fn status_serializes_upper_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Aborted).unwrap(),
            "\"ABORTED\""
        );
        assert_eq!(TaskStatus::Assigned.to_string(), "ASSIGNED");
    }
}
