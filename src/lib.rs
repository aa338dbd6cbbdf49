pub mod autoscaler;
pub mod bus;
pub mod client;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod fanout;
pub mod scheduler;
pub mod shutdown;
pub mod user;
pub mod worker;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::autoscaler::AutoScaler;
use crate::bus::MessageBus;
use crate::client::Session;
use crate::config::{GridConfig, NodeAgentConfig};
use crate::db::JobDatabase;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::fanout::EventFanout;
use crate::user::GridUser;
use crate::worker::{NodeAgent, ProcessTreeKiller, ProcfsTreeKiller};

/// A running grid: bus, database, dispatcher and fan-out, constructed
/// explicitly and handed to whatever needs them.
pub struct GridContext {
    pub config: GridConfig,
    pub bus: MessageBus,
    pub db: Arc<dyn JobDatabase>,
    pub dispatcher: Arc<Dispatcher>,
    autoscaler: Option<Arc<dyn AutoScaler>>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl GridContext {
    /// Start the dispatcher and the event fan-out
    pub fn start(
        config: GridConfig,
        db: Arc<dyn JobDatabase>,
        autoscaler: Option<Arc<dyn AutoScaler>>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let bus = MessageBus::new();
        let (dispatcher, inbox) =
            Dispatcher::new(bus.clone(), Arc::clone(&db), config.dispatcher.clone())?;

        let mut fanout = EventFanout::new(Arc::clone(&dispatcher), bus.clone(), &config.fanout);
        if let Some(autoscaler) = &autoscaler {
            fanout = fanout.with_autoscaler(Arc::clone(autoscaler));
        }

        let tasks = vec![
            tokio::spawn(Arc::clone(&dispatcher).run(inbox, shutdown.clone())),
            tokio::spawn(fanout.run(shutdown.clone())),
        ];
        tracing::info!("Grid started");

        Ok(Self {
            config,
            bus,
            db,
            dispatcher,
            autoscaler,
            shutdown,
            tasks,
        })
    }

    /// Start a node agent that kills process trees through `/proc`
    pub fn spawn_node(&mut self, config: NodeAgentConfig) -> Arc<NodeAgent> {
        self.spawn_node_with_killer(config, Arc::new(ProcfsTreeKiller))
    }

    pub fn spawn_node_with_killer(
        &mut self,
        config: NodeAgentConfig,
        killer: Arc<dyn ProcessTreeKiller>,
    ) -> Arc<NodeAgent> {
        let agent = NodeAgent::new(config, self.bus.clone(), Arc::clone(&self.db), killer);
        self.tasks
            .push(tokio::spawn(Arc::clone(&agent).run(self.shutdown.clone())));
        agent
    }

    pub fn session(&self, user: GridUser) -> Session {
        let session = Session::new(Arc::clone(&self.dispatcher), self.bus.clone(), user);
        match &self.autoscaler {
            Some(autoscaler) => session.with_autoscaler(Arc::clone(autoscaler)),
            None => session,
        }
    }

    pub async fn login(&self, user_id: &str, user_name: &str) -> Result<Session> {
        let session = Session::login(
            Arc::clone(&self.dispatcher),
            self.bus.clone(),
            self.db.as_ref(),
            user_id,
            user_name,
        )
        .await?;
        Ok(match &self.autoscaler {
            Some(autoscaler) => session.with_autoscaler(Arc::clone(autoscaler)),
            None => session,
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel every component and wait for them to stop
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Grid component panicked");
            }
        }
        tracing::info!("Grid stopped");
    }
}
