//! Process exit codes and the fatal-error path.

use std::sync::{Mutex, PoisonError};

use tracing::error;

use crate::error::RrrError;

// Exit codes follow sysexits.h where one fits.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const PROTOCOL_MISMATCH: i32 = 76;
pub const CONFIG_ERROR: i32 = 78;

/// Where fatal errors end up.
pub trait ExitHook: Send + Sync {
    fn exit(&self, code: i32);
}

/// Terminates the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExit;

impl ExitHook for ProcessExit {
    fn exit(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Records exit requests instead of terminating, for embedders that
/// manage their own shutdown and for tests.
#[derive(Debug, Default)]
pub struct RecordingExit {
    codes: Mutex<Vec<i32>>,
}

impl RecordingExit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every code passed to `exit`, in order.
    pub fn codes(&self) -> Vec<i32> {
        self.codes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ExitHook for RecordingExit {
    fn exit(&self, code: i32) {
        self.codes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(code);
    }
}

/// Exit code for an error that reached the top of the stack.
pub fn exit_code(err: &RrrError) -> i32 {
    match err {
        RrrError::DuplicateService(_) | RrrError::ServiceOutOfRange { .. } => CONFIG_ERROR,
        RrrError::UnregisteredService(_) => PROTOCOL_MISMATCH,
        RrrError::Channel(err) if err.is_fatal() => PROTOCOL_MISMATCH,
        RrrError::Channel(_) => FAILURE,
    }
}

/// Report a fatal error on stderr and the log, then hand `code` to the hook.
pub fn report_fatal(hook: &dyn ExitHook, code: i32, message: &str) {
    eprintln!("leapio: fatal: {message}");
    error!(code, "{message}");
    hook.exit(code);
}
