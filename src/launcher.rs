//! Launch sequence
//!
//! `Idle → BackendStarting → BackendPolling → BackendReady → FrontendRunning → Done`,
//! with `BackendSpawnFailed`, `BackendTimeout`, `BackendExited`,
//! `FrontendSpawnFailed` and `Cancelled` as terminal failures.

use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::backend::health::{health_check, wait_for_ready_while, HealthProbe, HttpHealthProbe};
use crate::backend::BackendHandle;
use crate::config::LauncherConfig;
use crate::error::LauncherError;
use crate::frontend::{run_foreground, FrontendExit};
use crate::process_handle::ProcessHandle;
use crate::readiness::{fixed_delay, ReadinessStrategy, ReadySignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherState {
    Idle,
    BackendStarting,
    BackendPolling,
    BackendReady,
    FrontendRunning,
    Done,
    BackendSpawnFailed,
    BackendTimeout,
    BackendExited,
    FrontendSpawnFailed,
    Cancelled,
}

impl LauncherState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LauncherState::Done
                | LauncherState::BackendSpawnFailed
                | LauncherState::BackendTimeout
                | LauncherState::BackendExited
                | LauncherState::FrontendSpawnFailed
                | LauncherState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: LauncherState) -> bool {
        use LauncherState::*;
        matches!(
            (self, next),
            (Idle, BackendStarting)
                | (BackendStarting, BackendPolling)
                | (BackendStarting, BackendSpawnFailed)
                | (BackendStarting, Cancelled)
                | (BackendPolling, BackendReady)
                | (BackendPolling, BackendTimeout)
                | (BackendPolling, BackendExited)
                | (BackendPolling, Cancelled)
                | (BackendReady, FrontendRunning)
                | (BackendReady, Cancelled)
                | (FrontendRunning, Done)
                | (FrontendRunning, FrontendSpawnFailed)
                | (FrontendRunning, Cancelled)
        )
    }

    /// Failure state an error ends the sequence in, given where it happened.
    fn failure_for(error: &LauncherError, current: LauncherState) -> LauncherState {
        match error {
            LauncherError::BackendSpawnFailure { .. } => LauncherState::BackendSpawnFailed,
            LauncherError::BackendTimeout { .. } => LauncherState::BackendTimeout,
            LauncherError::BackendExited(_) => LauncherState::BackendExited,
            LauncherError::FrontendSpawnFailure { .. } => LauncherState::FrontendSpawnFailed,
            LauncherError::Cancelled => LauncherState::Cancelled,
            _ => current,
        }
    }
}

/// A state change and when it happened.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub state: LauncherState,
    pub at: Instant,
}

/// What a completed launch looked like.
#[derive(Debug, Clone)]
pub struct LaunchReport {
    /// `None` when an already running backend was reused.
    pub backend: Option<ProcessHandle>,
    pub ready: ReadySignal,
    pub frontend: FrontendExit,
}

pub struct Launcher<P = HttpHealthProbe> {
    config: LauncherConfig,
    probe: Option<P>,
    state: LauncherState,
    history: Vec<Transition>,
    cancel: CancellationToken,
}

impl Launcher<HttpHealthProbe> {
    pub fn new(config: LauncherConfig, cancel: CancellationToken) -> Result<Self, LauncherError> {
        config.validate()?;
        let probe = match config.readiness.strategy() {
            ReadinessStrategy::HealthPoll {
                url,
                marker,
                request_timeout,
                api_key,
                ..
            } => Some(HttpHealthProbe::new(url, marker, api_key, request_timeout)?),
            ReadinessStrategy::FixedDelay(_) => None,
        };
        Ok(Self::from_parts(config, probe, cancel))
    }
}

impl<P: HealthProbe> Launcher<P> {
    /// Use a custom probe instead of HTTP.
    pub fn with_probe(config: LauncherConfig, probe: P, cancel: CancellationToken) -> Self {
        Self::from_parts(config, Some(probe), cancel)
    }

    fn from_parts(config: LauncherConfig, probe: Option<P>, cancel: CancellationToken) -> Self {
        Self {
            config,
            probe,
            state: LauncherState::Idle,
            history: vec![Transition {
                state: LauncherState::Idle,
                at: Instant::now(),
            }],
            cancel,
        }
    }

    pub fn state(&self) -> LauncherState {
        self.state
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// When `state` was entered, if it was.
    pub fn entered_at(&self, state: LauncherState) -> Option<Instant> {
        self.history.iter().find(|t| t.state == state).map(|t| t.at)
    }

    fn transition(&mut self, next: LauncherState) -> Result<(), LauncherError> {
        if !self.state.can_transition_to(next) {
            return Err(LauncherError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        log::debug!("[Launcher] {:?} -> {:?}", self.state, next);
        self.state = next;
        self.history.push(Transition {
            state: next,
            at: Instant::now(),
        });
        Ok(())
    }

    fn fail(&mut self, error: LauncherError) -> LauncherError {
        let next = LauncherState::failure_for(&error, self.state);
        if next != self.state && self.transition(next).is_err() {
            log::warn!("[Launcher] Cannot record {:?} from {:?}", next, self.state);
        }
        error
    }

    /// Start the backend, or `None` if an already running one is reused.
    pub async fn start_backend(&mut self) -> Result<Option<BackendHandle>, LauncherError> {
        self.transition(LauncherState::BackendStarting)?;
        log::info!("[Launcher] Starting backend...");

        if self.config.backend.reuse_running {
            if let Some(probe) = &self.probe {
                if health_check(probe).await {
                    log::info!("[Backend] Already running and healthy, not spawning another");
                    return Ok(None);
                }
            }
        }

        match BackendHandle::spawn(&self.config.backend) {
            Ok(handle) => Ok(Some(handle)),
            Err(e) => {
                log::error!("[Launcher] {}", e);
                Err(self.fail(e))
            }
        }
    }

    /// Gate: health polling or the fixed fallback delay.
    pub async fn wait_until_ready(
        &mut self,
        backend: Option<&mut BackendHandle>,
    ) -> Result<ReadySignal, LauncherError> {
        self.transition(LauncherState::BackendPolling)?;

        let result = match (self.config.readiness.strategy(), &self.probe) {
            (ReadinessStrategy::HealthPoll { url, policy, .. }, Some(probe)) => {
                match policy.timeout {
                    Some(t) => log::info!(
                        "[Launcher] Waiting for {} (every {:?}, timeout {:?})",
                        url,
                        policy.interval,
                        t
                    ),
                    None => log::info!(
                        "[Launcher] Waiting for {} (every {:?}, no timeout)",
                        url,
                        policy.interval
                    ),
                }
                let fail_on_exit = self.config.backend.fail_on_exit;
                let mut backend = backend;
                wait_for_ready_while(probe, policy, &self.cancel, || match backend.as_mut() {
                    Some(b) if fail_on_exit => b.ensure_alive(),
                    _ => Ok(()),
                })
                .await
                .map(|ready| ReadySignal::Healthy {
                    attempts: ready.attempts,
                    elapsed: ready.elapsed,
                })
            }
            (ReadinessStrategy::FixedDelay(delay), _) => fixed_delay(delay, &self.cancel).await,
            (ReadinessStrategy::HealthPoll { .. }, None) => Err(LauncherError::Config(
                "health polling configured without a probe".to_string(),
            )),
        };

        match result {
            Ok(signal) => {
                self.transition(LauncherState::BackendReady)?;
                log::info!("[Launcher] Backend ready");
                Ok(signal)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Run the frontend in the foreground until it exits.
    pub async fn launch_frontend(&mut self) -> Result<FrontendExit, LauncherError> {
        if self.cancel.is_cancelled() {
            return Err(self.fail(LauncherError::Cancelled));
        }
        self.transition(LauncherState::FrontendRunning)?;
        log::info!("[Launcher] Starting frontend...");

        match run_foreground(&self.config.frontend, &self.cancel).await {
            Ok(exit) => {
                self.transition(LauncherState::Done)?;
                Ok(exit)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// The whole sequence. A non-zero frontend exit is reported as
    /// `FrontendExitNonZero` after the backend's lifetime policy is applied.
    pub async fn run(&mut self) -> Result<LaunchReport, LauncherError> {
        let mut backend = self.start_backend().await?;

        let outcome = match self.wait_until_ready(backend.as_mut()).await {
            Ok(ready) => self.launch_frontend().await.map(|exit| (ready, exit)),
            Err(e) => Err(e),
        };

        let backend = match backend {
            Some(handle) => Some(handle.finish().await),
            None => None,
        };

        let (ready, frontend) = outcome?;
        if !frontend.success() {
            return Err(LauncherError::FrontendExitNonZero(frontend.code));
        }
        log::info!("[Launcher] Done");
        Ok(LaunchReport {
            backend,
            ready,
            frontend,
        })
    }
}
