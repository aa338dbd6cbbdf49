use crate::dispatcher::DispControl;
use crate::scheduler::job::{JobId, JobProgress, NodeId};

/// State changes announced by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatcherEvent {
    QueueChanged,
    NodesUsageChanged,
    NodeAdded(NodeId),
    NodeReady(NodeId),
    NodeRemoved(NodeId),
    NodeEnabled(NodeId),
    NodeDisabled(NodeId),
    CtrlChanged(DispControl),
    JobsTrackingChanged,
    JobStatusChanged(JobProgress),
    JobSubmitted(JobId),
    JobFinished(JobId),
    KillJobBegin(JobId),
    KillJobPoll { job_id: JobId, poll: u32 },
    KillJobEnd { job_id: JobId, error: Option<String> },
    Error(String),
}

impl DispatcherEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DispatcherEvent::QueueChanged => "queue-changed",
            DispatcherEvent::NodesUsageChanged => "nodes-usage-changed",
            DispatcherEvent::NodeAdded(_) => "node-added",
            DispatcherEvent::NodeReady(_) => "node-ready",
            DispatcherEvent::NodeRemoved(_) => "node-removed",
            DispatcherEvent::NodeEnabled(_) => "node-enabled",
            DispatcherEvent::NodeDisabled(_) => "node-disabled",
            DispatcherEvent::CtrlChanged(_) => "ctrl-changed",
            DispatcherEvent::JobsTrackingChanged => "jobs-tracking-changed",
            DispatcherEvent::JobStatusChanged(_) => "job-status-changed",
            DispatcherEvent::JobSubmitted(_) => "job-submitted",
            DispatcherEvent::JobFinished(_) => "job-finished",
            DispatcherEvent::KillJobBegin(_) => "kill-job-begin",
            DispatcherEvent::KillJobPoll { .. } => "kill-job-poll",
            DispatcherEvent::KillJobEnd { .. } => "kill-job-end",
            DispatcherEvent::Error(_) => "error",
        }
    }

    /// Node topology changes, broadcast to clients without coalescing
    pub fn is_topology(&self) -> bool {
        matches!(
            self,
            DispatcherEvent::NodeAdded(_)
                | DispatcherEvent::NodeReady(_)
                | DispatcherEvent::NodeRemoved(_)
                | DispatcherEvent::NodeEnabled(_)
                | DispatcherEvent::NodeDisabled(_)
        )
    }
}
