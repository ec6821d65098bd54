//! # Built-in subscribers
//!
//! - [`LogWriter`]: renders events through `tracing`.

mod log;

pub use log::LogWriter;
