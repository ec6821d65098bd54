//! # Event subscribers.
//!
//! Runtime components publish [`Event`](crate::events::Event)s to the
//! [`Bus`](crate::events::Bus); the supervisor forwards every event to a
//! [`SubscriberSet`], which feeds each [`Subscribe`] implementation through its
//! own bounded queue.
//!
//! ```text
//! ManagedWorker / WorkerPool / PoolManager / ServerLifecycle / JobRunner
//!        │ publish(Event)
//!        ▼
//!       Bus ──► Supervisor listener ──► SubscriberSet::emit(&Event)
//!                                          ├──► [queue] ─► LogWriter
//!                                          └──► [queue] ─► custom subscribers
//! ```

mod embedded;
mod set;
mod subscribe;

pub use embedded::LogWriter;
pub use set::SubscriberSet;
pub(crate) use set::panic_message;
pub use subscribe::Subscribe;
