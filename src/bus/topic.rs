//! Topic names shared by the dispatcher, node agents and clients.

/// Inbound topic of the dispatcher (node -> dispatcher)
pub const DISPATCHER_TOPIC: &str = "/topic/dispatcher";

/// Dispatcher state broadcasts (queue, nodes, control flags, tracking)
pub const DISPATCHER_STATE_TOPIC: &str = "/topic/dispatcher-state";

pub const AUTOSCALER_TOPIC: &str = "/topic/autoscaler";

pub fn node_topic(node_id: &str) -> String {
    format!("/topic/node/{}", node_id)
}

/// Per-connection topic on which a client hears about the jobs it submitted
pub fn job_notification_topic(conn_id: &str) -> String {
    format!("/topic/job-notification/{}", conn_id)
}
