//! Auto-scaler hook.
//!
//! The grid does not launch machines itself. An [`AutoScaler`] watches node
//! usage snapshots and decides when more workers are needed; the fan-out
//! feeds it and announces its state on the auto-scaler topic.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::scheduler::NodeItem;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchingWorker {
    pub worker_key: String,
    pub requested_at: DateTime<Utc>,
}

/// Auto-scaler state as shown to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoScalerJson {
    pub enabled: bool,
    pub scaling_up: bool,
    pub min_workers_cap: usize,
    pub max_workers_cap: usize,
    pub ramp_up_speed_ratio: f64,
    pub terminate_worker_after_minutes_idle: u32,
    pub launching_timeout_minutes: u32,
    pub launching_workers: Vec<LaunchingWorker>,
}

impl Default for AutoScalerJson {
    fn default() -> Self {
        Self {
            enabled: false,
            scaling_up: false,
            min_workers_cap: 0,
            max_workers_cap: 10,
            ramp_up_speed_ratio: 0.5,
            terminate_worker_after_minutes_idle: 1,
            launching_timeout_minutes: 10,
            launching_workers: Vec::new(),
        }
    }
}

pub trait AutoScaler: Send + Sync {
    fn enable(&self);
    fn disable(&self);
    fn set_min_workers_cap(&self, cap: usize) -> Result<()>;
    fn set_max_workers_cap(&self, cap: usize) -> Result<()>;
    fn set_ramp_up_speed_ratio(&self, ratio: f64) -> Result<()>;
    fn set_terminate_worker_after_minutes_idle(&self, minutes: u32);

    /// Request `count` new workers. Returns the keys of the workers now launching.
    fn launch_new_workers(&self, count: usize) -> Result<Vec<String>>;

    fn to_json(&self) -> AutoScalerJson;

    /// Feed a node usage snapshot. Returns true if the scaler's state changed.
    fn on_nodes_usage(&self, nodes: &[NodeItem]) -> bool;
}

/// Tracks scaling decisions without talking to any cloud API. Launch
/// requests are recorded as pending workers and retired as nodes join.
#[derive(Debug, Default)]
pub struct ManualAutoScaler {
    state: Mutex<ManualState>,
}

#[derive(Debug, Default)]
struct ManualState {
    json: AutoScalerJson,
    known_nodes: usize,
}

impl ManualAutoScaler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Workers to request for a fully busy grid of `current` workers
    fn ramp_up_count(json: &AutoScalerJson, current: usize) -> usize {
        let headroom = json
            .max_workers_cap
            .saturating_sub(current + json.launching_workers.len());
        let wanted = ((current.max(1) as f64) * json.ramp_up_speed_ratio).ceil() as usize;
        wanted.max(1).min(headroom)
    }
}

impl AutoScaler for ManualAutoScaler {
    fn enable(&self) {
        self.lock().json.enabled = true;
        tracing::info!("Auto-scaler enabled");
    }

    fn disable(&self) {
        let mut state = self.lock();
        state.json.enabled = false;
        state.json.scaling_up = false;
        tracing::info!("Auto-scaler disabled");
    }

    fn set_min_workers_cap(&self, cap: usize) -> Result<()> {
        let mut state = self.lock();
        if cap > state.json.max_workers_cap {
            return Err(GridError::Config(format!(
                "min workers cap {} exceeds max {}",
                cap, state.json.max_workers_cap
            )));
        }
        state.json.min_workers_cap = cap;
        Ok(())
    }

    fn set_max_workers_cap(&self, cap: usize) -> Result<()> {
        let mut state = self.lock();
        if cap < state.json.min_workers_cap {
            return Err(GridError::Config(format!(
                "max workers cap {} below min {}",
                cap, state.json.min_workers_cap
            )));
        }
        state.json.max_workers_cap = cap;
        Ok(())
    }

    fn set_ramp_up_speed_ratio(&self, ratio: f64) -> Result<()> {
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(GridError::Config(format!(
                "ramp-up speed ratio {} not in (0, 1]",
                ratio
            )));
        }
        self.lock().json.ramp_up_speed_ratio = ratio;
        Ok(())
    }

    fn set_terminate_worker_after_minutes_idle(&self, minutes: u32) {
        self.lock().json.terminate_worker_after_minutes_idle = minutes;
    }

    fn launch_new_workers(&self, count: usize) -> Result<Vec<String>> {
        let mut state = self.lock();
        let ManualState { json, known_nodes } = &mut *state;
        let headroom = json
            .max_workers_cap
            .saturating_sub(*known_nodes + json.launching_workers.len());
        if count > headroom {
            return Err(GridError::Config(format!(
                "launching {} workers would exceed the cap of {}",
                count, json.max_workers_cap
            )));
        }
        let keys: Vec<String> = (0..count)
            .map(|_| format!("worker-{}", Uuid::new_v4()))
            .collect();
        json.launching_workers
            .extend(keys.iter().map(|key| LaunchingWorker {
                worker_key: key.clone(),
                requested_at: Utc::now(),
            }));
        tracing::info!(count, "Launching new workers");
        Ok(keys)
    }

    fn to_json(&self) -> AutoScalerJson {
        self.lock().json.clone()
    }

    fn on_nodes_usage(&self, nodes: &[NodeItem]) -> bool {
        let mut state = self.lock();
        let before = state.json.clone();

        let connected = nodes.iter().filter(|n| n.connected).count();
        let joined = connected.saturating_sub(state.known_nodes);
        state.known_nodes = connected;
        let retire = joined.min(state.json.launching_workers.len());
        state.json.launching_workers.drain(..retire);

        let busy = nodes
            .iter()
            .filter(|n| n.connected && n.enabled)
            .all(|n| n.cpus_used >= n.num_cpus);
        let json = &mut state.json;
        json.scaling_up = json.enabled
            && (connected < json.min_workers_cap || busy)
            && connected + json.launching_workers.len() < json.max_workers_cap;

        if json.scaling_up && json.launching_workers.is_empty() {
            let count = Self::ramp_up_count(json, connected);
            for _ in 0..count {
                json.launching_workers.push(LaunchingWorker {
                    worker_key: format!("worker-{}", Uuid::new_v4()),
                    requested_at: Utc::now(),
                });
            }
            tracing::info!(count, connected, "Auto-scaler ramping up");
        }

        state.json != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, num_cpus: usize, cpus_used: usize) -> NodeItem {
        NodeItem {
            id: id.to_string(),
            name: id.to_string(),
            num_cpus,
            cpus_used,
            enabled: true,
            connected: true,
        }
    }

    #[test]
    fn disabled_scaler_never_scales() {
        let scaler = ManualAutoScaler::new();
        assert!(!scaler.on_nodes_usage(&[node("a", 2, 2)]));
        assert!(!scaler.to_json().scaling_up);
    }

    #[test]
    fn busy_grid_ramps_up_and_joining_nodes_retire_launches() {
        let scaler = ManualAutoScaler::new();
        scaler.enable();
        scaler.set_ramp_up_speed_ratio(1.0).unwrap();

        assert!(scaler.on_nodes_usage(&[node("a", 2, 2), node("b", 1, 1)]));
        let json = scaler.to_json();
        assert!(json.scaling_up);
        assert_eq!(json.launching_workers.len(), 2);

        scaler.on_nodes_usage(&[node("a", 2, 0), node("b", 1, 0), node("c", 4, 0)]);
        let json = scaler.to_json();
        assert!(!json.scaling_up);
        assert_eq!(json.launching_workers.len(), 1);
    }

    #[test]
    fn caps_are_validated() {
        let scaler = ManualAutoScaler::new();
        assert!(scaler.set_min_workers_cap(11).is_err());
        scaler.set_min_workers_cap(2).unwrap();
        assert!(scaler.set_max_workers_cap(1).is_err());
        assert!(scaler.set_ramp_up_speed_ratio(0.0).is_err());
        assert!(scaler.launch_new_workers(11).is_err());
        assert_eq!(scaler.launch_new_workers(3).unwrap().len(), 3);
    }
}
