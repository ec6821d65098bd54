use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::supervisor::Supervisor;
use crate::{
    config::Config,
    events::Bus,
    policies::ErrorPolicy,
    server::{HmrCoordinator, ServerFactory, ServerLifecycle, Terminate},
    subscribers::{Subscribe, SubscriberSet},
    worker::WorkerEnv,
};

/// Builder for constructing a [`Supervisor`].
///
/// The event bus and the [`WorkerEnv`] exist from [`SupervisorBuilder::new`]
/// on, so a server factory can be created from [`SupervisorBuilder::env`]
/// before [`SupervisorBuilder::build`] is called. Apply `with_policy` and
/// `with_terminate` first: `env()` returns a snapshot.
pub struct SupervisorBuilder {
    cfg: Config,
    env: WorkerEnv,
    subscribers: Vec<Arc<dyn Subscribe>>,
}

impl SupervisorBuilder {
    /// Creates a new builder with the given configuration.
    pub fn new(cfg: Config) -> Self {
        let bus = Bus::new(cfg.bus_capacity_clamped());
        let env = WorkerEnv::from_config(&cfg, bus);
        Self {
            cfg,
            env,
            subscribers: Vec::new(),
        }
    }

    /// Sets event subscribers for observability.
    ///
    /// Subscribers receive every runtime event through dedicated workers with
    /// bounded queues.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Replaces the error policy selected by [`Config::mode`].
    pub fn with_policy(mut self, policy: Arc<dyn ErrorPolicy>) -> Self {
        self.env.policy = policy;
        self
    }

    /// Replaces the process termination hook used by `Exit` decisions.
    pub fn with_terminate(mut self, terminate: Arc<dyn Terminate>) -> Self {
        self.env = self.env.with_terminate(terminate);
        self
    }

    /// Collaborators to hand to workers and server factories.
    pub fn env(&self) -> WorkerEnv {
        self.env.clone()
    }

    /// Builds the supervisor around `factory`.
    ///
    /// Must be called within a tokio runtime: subscriber workers are spawned here.
    pub fn build(self, factory: impl ServerFactory) -> Supervisor {
        let bus = self.env.bus.clone();
        let subs = Arc::new(SubscriberSet::new(self.subscribers, bus.clone()));
        let lifecycle = ServerLifecycle::with_env(Arc::new(factory), self.env.clone());
        let hmr = HmrCoordinator::new(lifecycle.clone(), bus.clone());

        Supervisor::new_internal(
            self.cfg,
            self.env,
            subs,
            lifecycle,
            hmr,
            CancellationToken::new(),
        )
    }
}
