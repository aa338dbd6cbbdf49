use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::job::NodeId;
use crate::scheduler::queue::{TaskQueue, TaskRef};

/// Node state tracking
#[derive(Debug, Clone)]
pub struct NodeState {
    pub id: NodeId,
    pub name: String,
    pub num_cpus: usize,
    pub cpus_used: usize,
    pub enabled: bool,
    pub connected: bool,
    pub registered_at: DateTime<Utc>,
    /// Registration order, used to break selection ties
    seq: u64,
}

impl NodeState {
    pub fn free_cpus(&self) -> usize {
        self.num_cpus.saturating_sub(self.cpus_used)
    }

    pub fn is_eligible(&self) -> bool {
        self.enabled && self.connected && self.free_cpus() > 0
    }

    pub fn item(&self) -> NodeItem {
        NodeItem {
            id: self.id.clone(),
            name: self.name.clone(),
            num_cpus: self.num_cpus,
            cpus_used: self.cpus_used,
            enabled: self.enabled,
            connected: self.connected,
        }
    }
}

/// Node row as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeItem {
    pub id: NodeId,
    pub name: String,
    #[serde(rename = "numCPUs")]
    pub num_cpus: usize,
    #[serde(rename = "cpusUsed")]
    pub cpus_used: usize,
    pub enabled: bool,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeReadyOutcome {
    Added,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub task: TaskRef,
    pub node_id: NodeId,
    pub priority: i32,
}

/// Worker machines known to the dispatcher.
#[derive(Debug, Default)]
pub struct NodePool {
    nodes: HashMap<NodeId, NodeState>,
    next_seq: u64,
}

impl NodePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node on `node-ready`, or refresh its advertised capacity
    pub fn node_ready(&mut self, id: &str, name: &str, num_cpus: usize) -> NodeReadyOutcome {
        if let Some(node) = self.nodes.get_mut(id) {
            if num_cpus < node.cpus_used {
                tracing::warn!(
                    node_id = id,
                    num_cpus,
                    cpus_used = node.cpus_used,
                    "Node shrank below its usage, keeping current usage as capacity"
                );
            }
            node.num_cpus = num_cpus.max(node.cpus_used);
            node.name = name.to_string();
            node.connected = true;
            return NodeReadyOutcome::Updated;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.nodes.insert(
            id.to_string(),
            NodeState {
                id: id.to_string(),
                name: name.to_string(),
                num_cpus,
                cpus_used: 0,
                enabled: true,
                connected: true,
                registered_at: Utc::now(),
                seq,
            },
        );
        tracing::info!(node_id = id, name, num_cpus, "Node registered");
        NodeReadyOutcome::Added
    }

    pub fn get(&self, id: &str) -> Option<&NodeState> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Returns `None` for an unknown node, otherwise whether the flag changed
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Option<bool> {
        let node = self.nodes.get_mut(id)?;
        let changed = node.enabled != enabled;
        node.enabled = enabled;
        Some(changed)
    }

    /// Mark a node's bus connection as gone. The node is dropped right away
    /// when idle; otherwise it lingers (unschedulable) until its remaining
    /// tasks are released. Returns false for unknown or already disconnected nodes.
    pub fn disconnect(&mut self, id: &str) -> bool {
        let Some(node) = self.nodes.get_mut(id) else {
            return false;
        };
        if !node.connected {
            return false;
        }
        node.connected = false;
        if node.cpus_used == 0 {
            self.nodes.remove(id);
        }
        true
    }

    pub fn acquire(&mut self, id: &str) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) if node.cpus_used < node.num_cpus => {
                node.cpus_used += 1;
                true
            }
            _ => false,
        }
    }

    /// Free one slot. A disconnected node disappears once it is idle.
    pub fn release(&mut self, id: &str) -> bool {
        let Some(node) = self.nodes.get_mut(id) else {
            return false;
        };
        if node.cpus_used == 0 {
            tracing::warn!(node_id = id, "Release on idle node ignored");
            return false;
        }
        node.cpus_used -= 1;
        if !node.connected && node.cpus_used == 0 {
            self.nodes.remove(id);
            tracing::debug!(node_id = id, "Disconnected node drained and dropped");
        }
        true
    }

    /// Eligible node with the most free CPUs, earliest registration on ties
    pub fn select_node(&self) -> Option<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.is_eligible())
            .max_by(|a, b| a.free_cpus().cmp(&b.free_cpus()).then(b.seq.cmp(&a.seq)))
            .map(|n| n.id.clone())
    }

    /// Nodes in registration order
    pub fn items(&self) -> Vec<NodeItem> {
        let mut nodes: Vec<&NodeState> = self.nodes.values().collect();
        nodes.sort_by_key(|n| n.seq);
        nodes.into_iter().map(NodeState::item).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Match queued tasks to nodes until the queue is empty or no node has
    /// room for the head task. The head of the highest priority blocks
    /// everything below it.
    pub fn assign_pending(&mut self, queue: &mut TaskQueue) -> Vec<Assignment> {
        let mut assignments = Vec::new();
        while !queue.is_empty() {
            let Some(node_id) = self.select_node() else {
                break;
            };
            let Some((priority, task)) = queue.pop_highest() else {
                break;
            };
            self.acquire(&node_id);
            tracing::debug!(
                job_id = %task.job_id,
                task_id = task.task_id,
                node_id = %node_id,
                priority,
                "Task assigned"
            );
            assignments.push(Assignment {
                task,
                node_id,
                priority,
            });
        }
        assignments
    }
}
