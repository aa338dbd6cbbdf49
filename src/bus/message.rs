use serde::{Deserialize, Serialize};

use crate::autoscaler::AutoScalerJson;
use crate::bus::ConnectionInfo;
use crate::dispatcher::DispControl;
use crate::scheduler::job::{JobId, JobProgress, TaskId};
use crate::scheduler::{NodeItem, QueueJson};

/// Envelope carried on every topic: `{"type": ..., "content": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "kebab-case")]
pub enum GridMessage {
    // node -> dispatcher
    NodeReady(NodeReady),
    TaskStarted(TaskStarted),
    TaskComplete(TaskResult),

    // dispatcher -> node
    LaunchTask(TaskDescriptor),
    KillProcessesTree(Vec<u32>),

    // dispatcher -> client
    StatusChanged(JobProgress),
    QueueChanged(QueueJson),
    NodesChanged(Vec<NodeItem>),
    CtrlChanged(DispControl),
    TrackingChanged,
    AutoscalerChanged(AutoScalerJson),
    ConnectionsChanged(Vec<ConnectionInfo>),
}

impl GridMessage {
    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            GridMessage::NodeReady(_) => "node-ready",
            GridMessage::TaskStarted(_) => "task-started",
            GridMessage::TaskComplete(_) => "task-complete",
            GridMessage::LaunchTask(_) => "launch-task",
            GridMessage::KillProcessesTree(_) => "kill-processes-tree",
            GridMessage::StatusChanged(_) => "status-changed",
            GridMessage::QueueChanged(_) => "queue-changed",
            GridMessage::NodesChanged(_) => "nodes-changed",
            GridMessage::CtrlChanged(_) => "ctrl-changed",
            GridMessage::TrackingChanged => "tracking-changed",
            GridMessage::AutoscalerChanged(_) => "autoscaler-changed",
            GridMessage::ConnectionsChanged(_) => "connections-changed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReady {
    #[serde(rename = "numCPUs")]
    pub num_cpus: usize,
    pub name: String,
}

/// What a node needs to look up and run one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    pub job_id: JobId,
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStarted {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub success: bool,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub ret_code: Option<i32>,
    /// Signal that terminated the process, if any
    #[serde(default)]
    pub signal: Option<i32>,
}

impl TaskResult {
    pub fn failed(task: TaskDescriptor) -> Self {
        Self {
            job_id: task.job_id,
            task_id: task.task_id,
            success: false,
            pid: None,
            ret_code: None,
            signal: None,
        }
    }
}
