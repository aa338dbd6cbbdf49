use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use rand::Rng;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::bus::topic::{node_topic, DISPATCHER_TOPIC};
use crate::bus::{
    BusConnection, BusMessage, GridMessage, MessageBus, NodeReady, TaskDescriptor, TaskResult,
    TaskStarted,
};
use crate::config::NodeAgentConfig;
use crate::db::JobDatabase;
use crate::error::{GridError, Result};
use crate::worker::executor::{TaskExecResult, TaskRunner, TaskRunnerEvent};
use crate::worker::process_tree::ProcessTreeKiller;

/// Why a bus session ended
enum SessionEnd {
    Shutdown,
    Lost,
}

/// Represents one worker machine to the dispatcher.
///
/// Each bus session gets a fresh connection id, which doubles as the node id
/// the dispatcher knows this machine by. Tasks launched under an older
/// session keep running and report on whichever connection is current when
/// they finish.
pub struct NodeAgent {
    config: NodeAgentConfig,
    bus: MessageBus,
    db: Arc<dyn JobDatabase>,
    killer: Arc<dyn ProcessTreeKiller>,
    conn: RwLock<Option<BusConnection>>,
}

impl NodeAgent {
    pub fn new(
        config: NodeAgentConfig,
        bus: MessageBus,
        db: Arc<dyn JobDatabase>,
        killer: Arc<dyn ProcessTreeKiller>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            db,
            killer,
            conn: RwLock::new(None),
        })
    }

    /// Node id of the current bus session
    pub async fn node_id(&self) -> Option<String> {
        self.conn.read().await.as_ref().map(|c| c.id().to_string())
    }

    pub fn name(&self) -> String {
        self.config.effective_name()
    }

    /// Connect, register and serve until shutdown, reconnecting whenever the
    /// bus session is lost.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let name = self.name();
        tracing::info!(name = %name, num_cpus = self.config.effective_cpus(), "Node agent started");

        loop {
            match self.session(&shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost => {
                    let delay = self.reconnect_delay();
                    tracing::info!(name = %name, delay_ms = delay.as_millis() as u64, "Reconnecting to bus");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if let Some(conn) = self.conn.write().await.take() {
            conn.disconnect();
        }
        tracing::info!(name = %name, "Node agent stopped");
    }

    fn reconnect_delay(&self) -> Duration {
        let jitter = if self.config.reconnect_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.reconnect_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.config.reconnect_interval_ms + jitter)
    }

    async fn session(self: &Arc<Self>, shutdown: &CancellationToken) -> SessionEnd {
        let conn = self.bus.connect();
        let node_id = conn.id().to_string();
        *self.conn.write().await = Some(conn.clone());

        let mut inbox = match conn.subscribe(&node_topic(&node_id)) {
            Ok(sub) => sub,
            Err(e) => {
                tracing::warn!(node_id = %node_id, error = %e, "Node topic subscription failed");
                conn.disconnect();
                return SessionEnd::Lost;
            }
        };

        let ready = NodeReady {
            num_cpus: self.config.effective_cpus(),
            name: self.name(),
        };
        if let Err(e) = conn.send(DISPATCHER_TOPIC, GridMessage::NodeReady(ready)) {
            tracing::warn!(node_id = %node_id, error = %e, "Failed to send node-ready");
            conn.disconnect();
            return SessionEnd::Lost;
        }
        tracing::info!(node_id = %node_id, "Node ready");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                msg = inbox.recv() => match msg {
                    Some(msg) => self.handle_message(msg),
                    None => {
                        tracing::warn!(node_id = %node_id, "Bus session lost");
                        return SessionEnd::Lost;
                    }
                },
            }
        }
    }

    fn handle_message(self: &Arc<Self>, msg: BusMessage) {
        match msg.body {
            GridMessage::LaunchTask(task) => {
                let agent = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = agent.run_task(task).await {
                        tracing::warn!(
                            job_id = %task.job_id,
                            task_id = task.task_id,
                            error = %e,
                            "Task bookkeeping failed"
                        );
                    }
                });
            }
            GridMessage::KillProcessesTree(pids) => {
                let killer = Arc::clone(&self.killer);
                tokio::task::spawn_blocking(move || {
                    for pid in pids {
                        if let Err(e) = killer.kill_tree(pid, Signal::SIGKILL) {
                            tracing::warn!(pid, error = %e, "Process tree kill failed");
                        }
                    }
                });
            }
            other => {
                tracing::warn!(from = %msg.from, kind = other.kind(), "Unexpected message on node topic");
            }
        }
    }

    /// Run one task to completion and report it to the dispatcher.
    ///
    /// `task-complete` is always attempted. The returned error reports a
    /// failure to look up the task or to record its end in the database.
    pub async fn run_task(&self, task: TaskDescriptor) -> Result<TaskExecResult> {
        let node_id = self.node_id().await.unwrap_or_default();
        let params = match self
            .db
            .get_task_exec_params(&task, &node_id, &self.name())
            .await
        {
            Ok(params) => params,
            Err(e) => {
                tracing::error!(job_id = %task.job_id, task_id = task.task_id, error = %e, "No execution parameters for task");
                self.send(GridMessage::TaskComplete(TaskResult::failed(task)))
                    .await;
                return Err(e);
            }
        };

        let mut events = TaskRunner::new(params).run();
        let mut finished = None;
        while let Some(event) = events.recv().await {
            match event {
                TaskRunnerEvent::Started(pid) => {
                    self.send(GridMessage::TaskStarted(TaskStarted {
                        job_id: task.job_id,
                        task_id: task.task_id,
                        pid,
                    }))
                    .await;
                    if let Err(e) = self.db.mark_task_start(&task, pid).await {
                        tracing::warn!(job_id = %task.job_id, task_id = task.task_id, error = %e, "Failed to record task start");
                    }
                }
                TaskRunnerEvent::Finished(result) => {
                    finished = Some(result);
                    break;
                }
            }
        }
        let result = finished.ok_or_else(|| {
            GridError::Internal(format!(
                "runner for task {} of job {} ended without a result",
                task.task_id, task.job_id
            ))
        });

        let recorded = match &result {
            Ok(result) => self.db.mark_task_end(&task, result).await,
            Err(_) => Ok(()),
        };

        let report = match &result {
            Ok(r) => TaskResult {
                job_id: task.job_id,
                task_id: task.task_id,
                success: r.success,
                pid: r.pid,
                ret_code: r.ret_code,
                signal: r.signal,
            },
            Err(_) => TaskResult::failed(task),
        };
        self.send(GridMessage::TaskComplete(report)).await;

        let result = result?;
        recorded?;
        Ok(result)
    }

    /// Send to the dispatcher on the current session, whatever it is
    async fn send(&self, msg: GridMessage) {
        let conn = self.conn.read().await.clone();
        let kind = msg.kind();
        let Some(conn) = conn else {
            tracing::warn!(kind, "No bus session, message dropped");
            return;
        };
        if let Err(e) = conn.send(DISPATCHER_TOPIC, msg) {
            tracing::warn!(kind, error = %e, "Failed to send to dispatcher");
        }
    }
}
