use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::scheduler::job::{JobId, TaskId};

/// Reference to a task inside the job table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    pub job_id: JobId,
    pub task_id: TaskId,
}

impl TaskRef {
    pub fn new(job_id: JobId, task_id: TaskId) -> Self {
        Self { job_id, task_id }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityLevel {
    pub priority: i32,
    pub num_tasks: usize,
}

/// Queue snapshot for clients, highest priority first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJson {
    pub num_tasks: usize,
    pub priorities: Vec<PriorityLevel>,
}

/// Pending tasks bucketed by priority. Larger numbers run first; within a
/// priority tasks keep their insertion order.
#[derive(Debug, Default)]
pub struct TaskQueue {
    levels: BTreeMap<i32, VecDeque<TaskRef>>,
    len: usize,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, priority: i32, task: TaskRef) {
        self.levels.entry(priority).or_default().push_back(task);
        self.len += 1;
    }

    /// Put a task ahead of everything at its priority (used for requeues)
    pub fn push_front(&mut self, priority: i32, task: TaskRef) {
        self.levels.entry(priority).or_default().push_front(task);
        self.len += 1;
    }

    /// Head task of the highest non-empty priority
    pub fn peek_highest(&self) -> Option<(i32, TaskRef)> {
        self.levels
            .iter()
            .rev()
            .find_map(|(p, q)| q.front().map(|t| (*p, *t)))
    }

    pub fn pop_highest(&mut self) -> Option<(i32, TaskRef)> {
        let priority = self.peek_highest()?.0;
        let level = self.levels.get_mut(&priority)?;
        let task = level.pop_front()?;
        if level.is_empty() {
            self.levels.remove(&priority);
        }
        self.len -= 1;
        Some((priority, task))
    }

    /// Remove every queued task of a job, returning what was removed
    pub fn remove_job(&mut self, job_id: &JobId) -> Vec<TaskRef> {
        let mut removed = Vec::new();
        for level in self.levels.values_mut() {
            level.retain(|t| {
                if t.job_id == *job_id {
                    removed.push(*t);
                    false
                } else {
                    true
                }
            });
        }
        self.levels.retain(|_, q| !q.is_empty());
        self.len -= removed.len();
        removed
    }

    pub fn contains(&self, task: &TaskRef) -> bool {
        self.levels.values().any(|q| q.contains(task))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn snapshot(&self) -> QueueJson {
        QueueJson {
            num_tasks: self.len,
            priorities: self
                .levels
                .iter()
                .rev()
                .map(|(p, q)| PriorityLevel {
                    priority: *p,
                    num_tasks: q.len(),
                })
                .collect(),
        }
    }
}
