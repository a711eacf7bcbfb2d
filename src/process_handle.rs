use std::process::ExitStatus;
use std::time::Instant;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Backend,
    Frontend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    /// Exit code, `None` when ended by a signal.
    Exited(Option<i32>),
    /// Released by the launcher; no longer observed.
    Unknown,
}

/// A child process started by the launcher.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub role: ProcessRole,
    pub pid: Option<u32>,
    pub started_at: Instant,
    pub started_wall: DateTime<Utc>,
    pub liveness: Liveness,
}

impl ProcessHandle {
    pub fn started(role: ProcessRole, pid: Option<u32>) -> Self {
        Self {
            role,
            pid,
            started_at: Instant::now(),
            started_wall: Utc::now(),
            liveness: Liveness::Running,
        }
    }

    pub fn is_running(&self) -> bool {
        self.liveness == Liveness::Running
    }

    pub fn mark_exited(&mut self, status: ExitStatus) {
        self.liveness = Liveness::Exited(status.code());
    }

    pub fn mark_released(&mut self) {
        self.liveness = Liveness::Unknown;
    }
}

/// Exit code for a finished child; signals map to `128 + signal` on Unix.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
