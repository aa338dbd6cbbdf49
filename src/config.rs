use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{GridError, Result};

/// Dispatcher tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Delay between kill-job status polls
    pub kill_poll_interval_ms: u64,
    /// Polls after which a kill is reported as timed out
    pub kill_max_polls: u32,
    /// When set, tasks stranded on a disconnected node are requeued after this delay.
    /// When unset they stay ASSIGNED until a late completion or a kill resolves them.
    pub orphan_requeue_grace_ms: Option<u64>,
    /// Buffer size of the dispatcher event channel
    pub event_capacity: usize,
    /// How long finished jobs stay in memory. Afterwards only the job
    /// database knows about them. Unset keeps them forever.
    pub finished_job_retention_ms: Option<u64>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            kill_poll_interval_ms: 1000,
            kill_max_polls: 30,
            orphan_requeue_grace_ms: None,
            event_capacity: 1024,
            finished_job_retention_ms: Some(3_600_000),
        }
    }
}

impl DispatcherConfig {
    pub fn kill_poll_interval(&self) -> Duration {
        Duration::from_millis(self.kill_poll_interval_ms)
    }

    pub fn orphan_requeue_grace(&self) -> Option<Duration> {
        self.orphan_requeue_grace_ms.map(Duration::from_millis)
    }

    pub fn finished_job_retention(&self) -> Option<Duration> {
        self.finished_job_retention_ms.map(Duration::from_millis)
    }

    pub fn with_finished_job_retention(mut self, retention_ms: Option<u64>) -> Self {
        self.finished_job_retention_ms = retention_ms;
        self
    }

    pub fn with_kill_polling(mut self, interval_ms: u64, max_polls: u32) -> Self {
        self.kill_poll_interval_ms = interval_ms;
        self.kill_max_polls = max_polls;
        self
    }

    pub fn with_orphan_requeue(mut self, grace_ms: u64) -> Self {
        self.orphan_requeue_grace_ms = Some(grace_ms);
        self
    }
}

/// Configuration of a worker machine's node agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeAgentConfig {
    /// Explicit CPU count to advertise. Overrides `reserved_cpus`.
    pub num_cpus: Option<usize>,
    /// CPUs held back from the grid when `num_cpus` is not set
    pub reserved_cpus: usize,
    /// Name reported in `node-ready`
    pub node_name: Option<String>,
    pub reconnect_interval_ms: u64,
    /// Upper bound of the random delay added to each reconnect attempt
    pub reconnect_jitter_ms: u64,
}

impl Default for NodeAgentConfig {
    fn default() -> Self {
        Self {
            num_cpus: None,
            reserved_cpus: 2,
            node_name: None,
            reconnect_interval_ms: 10_000,
            reconnect_jitter_ms: 500,
        }
    }
}

impl NodeAgentConfig {
    pub fn new(num_cpus: usize, node_name: impl Into<String>) -> Self {
        Self {
            num_cpus: Some(num_cpus),
            node_name: Some(node_name.into()),
            ..Default::default()
        }
    }

    /// CPUs this node offers to the grid. Never less than one.
    pub fn effective_cpus(&self) -> usize {
        let cpus = match self.num_cpus {
            Some(n) => n,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .saturating_sub(self.reserved_cpus),
        };
        cpus.max(1)
    }

    pub fn effective_name(&self) -> String {
        self.node_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "{?}".to_string())
    }

    pub fn with_reconnect_interval(mut self, interval_ms: u64) -> Self {
        self.reconnect_interval_ms = interval_ms;
        self.reconnect_jitter_ms = 0;
        self
    }
}

/// Client notification settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Delay between coalesced queue/usage broadcasts
    pub coalesce_interval_ms: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            coalesce_interval_ms: 3000,
        }
    }
}

impl FanoutConfig {
    pub fn coalesce_interval(&self) -> Duration {
        Duration::from_millis(self.coalesce_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub dispatcher: DispatcherConfig,
    pub node: NodeAgentConfig,
    pub fanout: FanoutConfig,
}

impl GridConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| GridError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
            .map_err(|e| GridError::Config(format!("{}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatcher_config_default() {
        let cfg = DispatcherConfig::default();
        assert_eq!(cfg.kill_poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.kill_max_polls, 30);
        assert!(cfg.orphan_requeue_grace().is_none());
        assert_eq!(cfg.finished_job_retention(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn dispatcher_config_retention_from_json() {
        let cfg = GridConfig::from_json(r#"{"dispatcher": {"finished_job_retention_ms": null}}"#)
            .unwrap();
        assert!(cfg.dispatcher.finished_job_retention().is_none());

        let cfg = GridConfig::from_json(r#"{"dispatcher": {"finished_job_retention_ms": 500}}"#)
            .unwrap();
        assert_eq!(
            cfg.dispatcher.finished_job_retention(),
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn dispatcher_config_builders() {
        let cfg = DispatcherConfig::default()
            .with_kill_polling(10, 3)
            .with_orphan_requeue(250);
        assert_eq!(cfg.kill_poll_interval(), Duration::from_millis(10));
        assert_eq!(cfg.kill_max_polls, 3);
        assert_eq!(cfg.orphan_requeue_grace(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn node_agent_explicit_cpus() {
        let cfg = NodeAgentConfig::new(4, "worker-a");
        assert_eq!(cfg.effective_cpus(), 4);
        assert_eq!(cfg.effective_name(), "worker-a");
    }

    #[test]
    fn node_agent_cpus_never_zero() {
        let cfg = NodeAgentConfig {
            num_cpus: Some(0),
            ..Default::default()
        };
        assert_eq!(cfg.effective_cpus(), 1);

        let cfg = NodeAgentConfig {
            num_cpus: None,
            reserved_cpus: usize::MAX,
            ..Default::default()
        };
        assert_eq!(cfg.effective_cpus(), 1);
    }

    #[test]
    fn grid_config_partial_json() {
        let cfg = GridConfig::from_json(
            r#"{"dispatcher": {"kill_max_polls": 5}, "node": {"num_cpus": 8}}"#,
        )
        .unwrap();
        assert_eq!(cfg.dispatcher.kill_max_polls, 5);
        assert_eq!(cfg.dispatcher.kill_poll_interval_ms, 1000);
        assert_eq!(cfg.node.num_cpus, Some(8));
        assert_eq!(cfg.fanout.coalesce_interval_ms, 3000);
    }

    #[test]
    fn grid_config_rejects_bad_json() {
        let err = GridConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, GridError::Config(_)));
    }
}
