//! Client session.
//!
//! A [`Session`] is a logged-in user's handle on the grid: job submission,
//! job queries, kill, and the admin switches its profile allows. Progress of
//! jobs started with [`Session::run_job`] arrives over the bus on a
//! per-connection notification topic.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::autoscaler::{AutoScaler, AutoScalerJson};
use crate::bus::topic::{job_notification_topic, DISPATCHER_STATE_TOPIC};
use crate::bus::{BusConnection, ConnectionInfo, GridMessage, MessageBus, Subscription};
use crate::db::JobDatabase;
use crate::dispatcher::{DispControl, Dispatcher, DispatcherJson};
use crate::error::{GridError, Result};
use crate::scheduler::job::{JobInfo, JobProgress, TaskResultItem};
use crate::scheduler::{JobId, JobSubmission, NodeItem};
use crate::user::GridUser;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridJobEvent {
    Submitted(JobId),
    StatusChanged(JobProgress),
    /// Final progress; the job is FINISHED or ABORTED
    Done(JobProgress),
    Error(String),
}

/// A job submitted through [`Session::run_job`], with its event stream.
#[derive(Debug)]
pub struct GridJob {
    job_id: JobId,
    events: mpsc::UnboundedReceiver<GridJobEvent>,
}

impl GridJob {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub async fn next_event(&mut self) -> Option<GridJobEvent> {
        self.events.recv().await
    }

    /// Wait for the job to finish and return its final progress
    pub async fn wait(mut self) -> Result<JobProgress> {
        while let Some(event) = self.next_event().await {
            match event {
                GridJobEvent::Done(progress) => return Ok(progress),
                GridJobEvent::Error(e) => return Err(GridError::Bus(e)),
                GridJobEvent::Submitted(_) | GridJobEvent::StatusChanged(_) => {}
            }
        }
        Err(GridError::Bus(format!(
            "event stream of job {} ended",
            self.job_id
        )))
    }
}

/// Messages broadcast on the dispatcher-state topic. Closes its bus
/// connection when dropped.
pub struct DispatcherStateWatch {
    conn: BusConnection,
    sub: Subscription,
}

impl DispatcherStateWatch {
    pub async fn recv(&mut self) -> Option<GridMessage> {
        self.sub.recv().await.map(|m| m.body)
    }
}

impl Drop for DispatcherStateWatch {
    fn drop(&mut self) {
        self.conn.disconnect();
    }
}

pub struct Session {
    dispatcher: Arc<Dispatcher>,
    bus: MessageBus,
    user: GridUser,
    autoscaler: Option<Arc<dyn AutoScaler>>,
}

impl Session {
    pub fn new(dispatcher: Arc<Dispatcher>, bus: MessageBus, user: GridUser) -> Self {
        Self {
            dispatcher,
            bus,
            user,
            autoscaler: None,
        }
    }

    /// Open a session for a user known to the job database
    pub async fn login(
        dispatcher: Arc<Dispatcher>,
        bus: MessageBus,
        db: &dyn JobDatabase,
        user_id: &str,
        user_name: &str,
    ) -> Result<Self> {
        let profile = db.get_user_profile(user_id).await?;
        tracing::info!(user_id, user_name, profile = %profile.name, "Session opened");
        Ok(Self::new(
            dispatcher,
            bus,
            GridUser::new(user_id, user_name, profile),
        ))
    }

    pub fn with_autoscaler(mut self, autoscaler: Arc<dyn AutoScaler>) -> Self {
        self.autoscaler = Some(autoscaler);
        self
    }

    pub fn user(&self) -> &GridUser {
        &self.user
    }

    pub async fn submit_job(&self, submission: JobSubmission) -> Result<JobId> {
        self.dispatcher.submit_job(&self.user, submission, None).await
    }

    pub async fn resubmit_job(&self, old_job_id: JobId, failed_tasks_only: bool) -> Result<JobId> {
        self.dispatcher
            .resubmit_job(&self.user, old_job_id, failed_tasks_only, None)
            .await
    }

    /// Submit a job and follow its progress until it is done
    pub async fn run_job(&self, submission: JobSubmission) -> Result<GridJob> {
        let conn = self.bus.connect();
        let result = self.submit_tracked(&conn, submission).await;
        let (job_id, sub) = match result {
            Ok(ok) => ok,
            Err(e) => {
                conn.disconnect();
                return Err(e);
            }
        };

        let (tx, events) = mpsc::unbounded_channel();
        let _ = tx.send(GridJobEvent::Submitted(job_id));
        tokio::spawn(track_job(conn, sub, job_id, tx));
        Ok(GridJob { job_id, events })
    }

    async fn submit_tracked(
        &self,
        conn: &BusConnection,
        submission: JobSubmission,
    ) -> Result<(JobId, Subscription)> {
        // Subscribe first so no notification can be missed
        let sub = conn.subscribe(&job_notification_topic(conn.id()))?;
        let job_id = self
            .dispatcher
            .submit_job(&self.user, submission, Some(conn.id().to_string()))
            .await?;
        Ok((job_id, sub))
    }

    pub async fn get_job_info(&self, job_id: JobId) -> Result<JobInfo> {
        self.dispatcher.get_job_info(job_id).await
    }

    pub async fn get_job_result(&self, job_id: JobId) -> Result<Vec<TaskResultItem>> {
        self.dispatcher.get_job_result(job_id).await
    }

    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        self.dispatcher.list_jobs().await
    }

    pub async fn kill_job(&self, job_id: JobId) -> Result<()> {
        self.dispatcher.kill_job(&self.user, job_id).await
    }

    pub async fn get_dispatcher_json(&self) -> DispatcherJson {
        self.dispatcher.get_json().await
    }

    pub fn get_connections(&self) -> Vec<ConnectionInfo> {
        self.dispatcher.list_connections()
    }

    pub fn subscribe_dispatcher_state(&self) -> Result<DispatcherStateWatch> {
        let conn = self.bus.connect();
        match conn.subscribe(DISPATCHER_STATE_TOPIC) {
            Ok(sub) => Ok(DispatcherStateWatch { conn, sub }),
            Err(e) => {
                conn.disconnect();
                Err(e)
            }
        }
    }

    fn require(&self, allowed: bool, action: &str) -> Result<()> {
        if allowed {
            Ok(())
        } else {
            Err(GridError::NotAuthorized(format!(
                "user {} may not {}",
                self.user.user_name, action
            )))
        }
    }

    pub async fn set_dispatching_enabled(&self, enabled: bool) -> Result<DispControl> {
        self.require(
            self.user.profile.can_start_stop_dispatching,
            "start or stop dispatching",
        )?;
        Ok(self.dispatcher.set_dispatching_enabled(enabled).await)
    }

    pub async fn set_queue_opened(&self, open: bool) -> Result<DispControl> {
        self.require(self.user.profile.can_open_close_queue, "open or close the queue")?;
        Ok(self.dispatcher.set_queue_opened(open).await)
    }

    pub async fn set_node_enabled(&self, node_id: &str, enabled: bool) -> Result<NodeItem> {
        self.require(
            self.user.profile.can_enable_disable_node,
            "enable or disable nodes",
        )?;
        self.dispatcher.set_node_enabled(node_id, enabled).await
    }

    fn autoscaler(&self) -> Result<&Arc<dyn AutoScaler>> {
        self.autoscaler
            .as_ref()
            .ok_or_else(|| GridError::Config("no auto-scaler attached".to_string()))
    }

    pub fn get_autoscaler_json(&self) -> Result<AutoScalerJson> {
        Ok(self.autoscaler()?.to_json())
    }

    pub fn set_autoscaler_enabled(&self, enabled: bool) -> Result<AutoScalerJson> {
        self.require(
            self.user.profile.can_change_autoscaler_settings,
            "change auto-scaler settings",
        )?;
        let autoscaler = self.autoscaler()?;
        if enabled {
            autoscaler.enable();
        } else {
            autoscaler.disable();
        }
        Ok(autoscaler.to_json())
    }

    pub fn launch_new_workers(&self, count: usize) -> Result<Vec<String>> {
        self.require(
            self.user.profile.can_change_autoscaler_settings,
            "launch workers",
        )?;
        self.autoscaler()?.launch_new_workers(count)
    }
}

async fn track_job(
    conn: BusConnection,
    mut sub: Subscription,
    job_id: JobId,
    tx: mpsc::UnboundedSender<GridJobEvent>,
) {
    while let Some(msg) = sub.recv().await {
        let GridMessage::StatusChanged(progress) = msg.body else {
            continue;
        };
        if progress.job_id != job_id {
            continue;
        }
        if progress.status.is_terminal() {
            tracing::debug!(job_id = %job_id, status = %progress.status, "Tracked job done");
            let _ = tx.send(GridJobEvent::Done(progress));
            conn.disconnect();
            return;
        }
        if tx.send(GridJobEvent::StatusChanged(progress)).is_err() {
            // Caller dropped the job handle
            break;
        }
    }
    if conn.is_connected() {
        conn.disconnect();
    } else {
        let _ = tx.send(GridJobEvent::Error(format!(
            "notification connection for job {} lost",
            job_id
        )));
    }
}
