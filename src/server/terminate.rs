//! # Process termination.
//!
//! An `Exit` decision of the error policy ends the whole process. The call goes
//! through [`Terminate`] so embedders (and tests) can intercept it.

use std::sync::Mutex;

/// Ends the process on behalf of an error policy decision.
pub trait Terminate: Send + Sync + 'static {
    /// Terminates with the given exit code.
    fn exit(&self, code: i32);
}

/// Calls [`std::process::exit`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessExit;

impl Terminate for ProcessExit {
    fn exit(&self, code: i32) {
        tracing::error!(code, "terminating process");
        std::process::exit(code);
    }
}

/// Records exit requests instead of exiting.
///
/// Useful for embedding the runtime inside a host that owns the process, and in tests.
#[derive(Debug, Default)]
pub struct RecordExit {
    codes: Mutex<Vec<i32>>,
}

impl RecordExit {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit codes requested so far.
    pub fn codes(&self) -> Vec<i32> {
        self.codes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Terminate for RecordExit {
    fn exit(&self, code: i32) {
        tracing::warn!(code, "exit requested");
        self.codes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(code);
    }
}
