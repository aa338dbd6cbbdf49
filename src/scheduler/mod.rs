pub mod assigner;
pub mod job;
pub mod queue;

pub use assigner::{Assignment, NodeItem, NodePool};
pub use job::{Job, JobId, JobStatus, JobSubmission, NodeId, Task, TaskId, TaskItem, TaskStatus};
pub use queue::{QueueJson, TaskQueue, TaskRef};
