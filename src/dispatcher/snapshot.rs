use serde::{Deserialize, Serialize};

use crate::scheduler::{NodeItem, QueueJson};

/// Admin flags gating intake and assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispControl {
    pub dispatch_enabled: bool,
    pub queue_closed: bool,
}

impl Default for DispControl {
    fn default() -> Self {
        Self {
            dispatch_enabled: true,
            queue_closed: false,
        }
    }
}

/// Point-in-time view for polling clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherJson {
    pub nodes: Vec<NodeItem>,
    pub queue: QueueJson,
    pub disp_control: DispControl,
}
