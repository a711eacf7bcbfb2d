//! Frontend process
//!
//! The desktop client runs in the foreground with the launcher's own
//! environment and stdio; the launcher waits for it to exit.

use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::backend::process::resolve_interpreter;
use crate::config::FrontendConfig;
use crate::error::LauncherError;
use crate::process_handle::{exit_code, ProcessHandle, ProcessRole};

/// A frontend run that ended on its own.
#[derive(Debug, Clone)]
pub struct FrontendExit {
    pub handle: ProcessHandle,
    pub code: i32,
}

impl FrontendExit {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

pub fn frontend_command(config: &FrontendConfig) -> Command {
    let program = resolve_interpreter(&config.program, &config.working_dir);
    let mut cmd = Command::new(program);
    cmd.args(&config.args)
        .current_dir(&config.working_dir)
        .envs(&config.env)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    cmd
}

/// Spawn the frontend and block until it exits or `cancel` fires.
///
/// A non-zero exit is still returned as `Ok`; the caller decides how to
/// report it.
pub async fn run_foreground(
    config: &FrontendConfig,
    cancel: &CancellationToken,
) -> Result<FrontendExit, LauncherError> {
    let mut child = frontend_command(config)
        .spawn()
        .map_err(|source| LauncherError::FrontendSpawnFailure {
            program: config.program.clone(),
            source,
        })?;

    let mut handle = ProcessHandle::started(ProcessRole::Frontend, child.id());
    log::info!("[Frontend] Started (PID: {:?})", handle.pid);

    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|source| LauncherError::FrontendSpawnFailure {
                program: config.program.clone(),
                source,
            })?;
            handle.mark_exited(status);
            let code = exit_code(status);
            if code == 0 {
                log::info!("[Frontend] Exited normally");
            } else {
                log::warn!("[Frontend] Exited with code {}", code);
            }
            Ok(FrontendExit { handle, code })
        }
        _ = cancel.cancelled() => {
            log::info!("[Frontend] Cancelled, stopping client...");
            let _ = child.kill().await;
            Err(LauncherError::Cancelled)
        }
    }
}
