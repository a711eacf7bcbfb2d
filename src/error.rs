use std::time::Duration;

use thiserror::Error;

use crate::launcher::LauncherState;

/// Everything that can end a launch early.
///
/// Transient health-check failures are not represented here: they are
/// retried by the poll loop and never reach the caller.
#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to spawn backend '{program}': {source}")]
    BackendSpawnFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Backend did not report healthy after {attempts} health checks ({elapsed:?})")]
    BackendTimeout { attempts: u32, elapsed: Duration },

    #[error("Backend exited before becoming ready (exit code: {0:?})")]
    BackendExited(Option<i32>),

    #[error("Failed to spawn frontend '{program}': {source}")]
    FrontendSpawnFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Frontend exited with code {0}")]
    FrontendExitNonZero(i32),

    #[error("Launch cancelled")]
    Cancelled,

    #[error("Invalid launcher transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: LauncherState,
        to: LauncherState,
    },
}

impl LauncherError {
    /// Process exit code reported by the binary for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            LauncherError::Config(_) => 2,
            LauncherError::BackendSpawnFailure { .. } => 3,
            LauncherError::BackendTimeout { .. } => 4,
            LauncherError::BackendExited(_) => 5,
            LauncherError::FrontendSpawnFailure { .. } => 6,
            LauncherError::FrontendExitNonZero(code) => *code,
            LauncherError::Cancelled => 130,
            LauncherError::InvalidTransition { .. } => 70,
        }
    }
}

impl From<serde_json::Error> for LauncherError {
    fn from(e: serde_json::Error) -> Self {
        LauncherError::Config(format!("Invalid config file: {}", e))
    }
}
