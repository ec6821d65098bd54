//! Runtime core: the supervisor that ties every component together.
//!
//! Internal modules:
//! - [`supervisor`]: runs the server lifecycle, fans events out, handles shutdown;
//! - [`builder`]: wires bus, worker environment, subscribers, lifecycle and reload coordinator;
//! - [`shutdown`]: cross-platform shutdown signal handling.
//!
//! ## Wiring
//! ```text
//! SupervisorBuilder::new(cfg)
//!   ├─► Bus::new(cfg.bus_capacity)
//!   └─► WorkerEnv { policy: cfg.error_policy(), settings, bus, terminate }
//!            │
//!            └──► user builds a ServerFactory (e.g. PoolServerFactory) from env()
//! build(factory)
//!   ├─► SubscriberSet::new(subscribers, bus)
//!   ├─► ServerLifecycle::with_env(factory, env)
//!   └─► HmrCoordinator::new(lifecycle, bus)
//! ```

mod builder;
mod shutdown;
mod supervisor;

pub use builder::SupervisorBuilder;
pub use supervisor::Supervisor;
