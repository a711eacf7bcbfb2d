//! Backend Handle
//!
//! Owns the spawned backend process and applies its lifetime policy:
//! an owned backend is stopped when the launcher finishes, a detached one
//! is released and keeps running.

use std::process::Child;
use std::time::Duration;

use crate::config::{BackendConfig, BackendLifetime};
use crate::error::LauncherError;
use crate::process_handle::{Liveness, ProcessHandle, ProcessRole};

use super::process::{force_kill_process, graceful_kill_process, spawn_backend};

pub struct BackendHandle {
    child: Option<Child>,
    handle: ProcessHandle,
    lifetime: BackendLifetime,
    shutdown_grace: Duration,
}

impl BackendHandle {
    /// Spawn the backend described by `config`.
    pub fn spawn(config: &BackendConfig) -> Result<Self, LauncherError> {
        let child = spawn_backend(config).map_err(|source| LauncherError::BackendSpawnFailure {
            program: config.program.clone(),
            source,
        })?;

        let handle = ProcessHandle::started(ProcessRole::Backend, Some(child.id()));
        log::info!(
            "[Backend] Started (PID: {}, lifetime: {:?})",
            child.id(),
            config.lifetime
        );

        Ok(Self {
            child: Some(child),
            handle,
            lifetime: config.lifetime,
            shutdown_grace: config.shutdown_grace(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid
    }

    pub fn process(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Exit code if the backend has already exited.
    pub fn poll_exit(&mut self) -> Option<Option<i32>> {
        if let Liveness::Exited(code) = self.handle.liveness {
            return Some(code);
        }
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                self.handle.mark_exited(status);
                log::warn!("[Backend] Process exited with {}", status);
                Some(status.code())
            }
            Ok(None) => None,
            Err(e) => {
                log::error!("[Backend] Error checking process status: {}", e);
                None
            }
        }
    }

    /// Error out if the backend has died; used between health checks.
    pub fn ensure_alive(&mut self) -> Result<(), LauncherError> {
        match self.poll_exit() {
            Some(code) => Err(LauncherError::BackendExited(code)),
            None => Ok(()),
        }
    }

    /// Stop the backend: SIGINT first, kill after the grace period.
    pub async fn terminate(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        let pid = child.id();

        if let Ok(Some(status)) = child.try_wait() {
            self.handle.mark_exited(status);
            self.child = None;
            return;
        }

        log::info!("[Backend] Initiating graceful shutdown (PID: {})...", pid);
        graceful_kill_process(pid);

        let start = std::time::Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    log::info!("[Backend] Stopped gracefully");
                    self.handle.mark_exited(status);
                    self.child = None;
                    return;
                }
                Ok(None) => {
                    if start.elapsed() > self.shutdown_grace {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    log::error!("[Backend] Error checking process status: {}", e);
                    break;
                }
            }
        }

        log::info!("[Backend] Graceful shutdown timeout, force killing...");
        self.force_kill();

        // Reap without blocking the runtime
        for _ in 0..20 {
            if self.reap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        log::warn!("[Backend] Process {} not reaped after kill", pid);
        self.child = None;
        self.handle.mark_released();
    }

    /// Send SIGKILL to the process group. Does not wait.
    fn force_kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            force_kill_process(child.id());
            let _ = child.kill();
        }
    }

    /// Collect the exit status if the child is gone.
    fn reap(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return true;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.handle.mark_exited(status);
                self.child = None;
                true
            }
            Ok(None) => false,
            Err(_) => {
                self.handle.mark_released();
                self.child = None;
                true
            }
        }
    }

    /// Let the backend keep running without the launcher.
    pub fn detach(mut self) -> ProcessHandle {
        if self.child.take().is_some() {
            self.handle.mark_released();
            log::info!(
                "[Backend] Left running (PID: {:?}); stop it manually when done",
                self.handle.pid
            );
        }
        self.handle.clone()
    }

    /// Apply the lifetime policy at launcher exit.
    pub async fn finish(mut self) -> ProcessHandle {
        match self.lifetime {
            BackendLifetime::Owned => {
                self.terminate().await;
                self.handle.clone()
            }
            BackendLifetime::Detached => self.detach(),
        }
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        if self.lifetime == BackendLifetime::Owned && self.child.is_some() {
            self.force_kill();
            let _ = self.reap();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::BackendOutput;
    use std::path::PathBuf;

    fn shell_backend(script: &str, lifetime: BackendLifetime) -> BackendConfig {
        BackendConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: PathBuf::from("."),
            lifetime,
            output: Some(BackendOutput::Null),
            shutdown_grace_ms: 2000,
            ..Default::default()
        }
    }

    #[test]
    fn test_spawn_failure_for_missing_program() {
        let mut config = shell_backend("true", BackendLifetime::Owned);
        config.program = "/no/such/interpreter".to_string();
        let err = BackendHandle::spawn(&config).err().unwrap();
        assert!(matches!(err, LauncherError::BackendSpawnFailure { .. }));
    }

    #[test]
    fn test_spawn_failure_for_missing_working_dir() {
        let mut config = shell_backend("true", BackendLifetime::Owned);
        config.working_dir = PathBuf::from("/no/such/dir");
        let err = BackendHandle::spawn(&config).err().unwrap();
        assert!(matches!(err, LauncherError::BackendSpawnFailure { .. }));
    }

    #[tokio::test]
    async fn test_exit_is_detected() {
        let config = shell_backend("exit 7", BackendLifetime::Owned);
        let mut backend = BackendHandle::spawn(&config).unwrap();

        let mut code = None;
        for _ in 0..50 {
            if let Some(c) = backend.poll_exit() {
                code = Some(c);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(code, Some(Some(7)));
        assert!(matches!(
            backend.ensure_alive(),
            Err(LauncherError::BackendExited(Some(7)))
        ));
    }

    #[tokio::test]
    async fn test_owned_backend_is_terminated_on_finish() {
        let config = shell_backend("sleep 30", BackendLifetime::Owned);
        let backend = BackendHandle::spawn(&config).unwrap();
        assert!(backend.process().is_running());

        let handle = backend.finish().await;
        assert!(matches!(handle.liveness, Liveness::Exited(_)));
    }

    #[tokio::test]
    async fn test_venv_interpreter_under_relative_working_dir() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::Builder::new().prefix("backend-rel").tempdir_in(".").unwrap();
        let working_dir = PathBuf::from(dir.path().file_name().unwrap());
        let bin = working_dir.join("venv").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let python = bin.join("python");
        std::fs::write(&python, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = BackendConfig {
            program: "python".to_string(),
            args: Vec::new(),
            working_dir,
            lifetime: BackendLifetime::Owned,
            output: Some(BackendOutput::Null),
            ..Default::default()
        };
        let mut backend = BackendHandle::spawn(&config).unwrap();

        let mut code = None;
        for _ in 0..50 {
            if let Some(c) = backend.poll_exit() {
                code = Some(c);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(code, Some(Some(0)));
    }

    #[test]
    fn test_drop_does_not_wait_for_owned_backend() {
        let config = shell_backend("trap '' INT TERM; sleep 30", BackendLifetime::Owned);
        let backend = BackendHandle::spawn(&config).unwrap();

        let start = std::time::Instant::now();
        drop(backend);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_detached_backend_is_released() {
        let config = shell_backend("sleep 1", BackendLifetime::Detached);
        let backend = BackendHandle::spawn(&config).unwrap();
        let pid = backend.pid();

        let handle = backend.finish().await;
        assert_eq!(handle.liveness, Liveness::Unknown);
        assert_eq!(handle.pid, pid);
    }
}
