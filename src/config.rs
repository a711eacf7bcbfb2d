//! Launcher Configuration
//!
//! Defaults, the optional `launcher.json` file, and `LAUNCHER_*` environment
//! overrides. Every path and interpreter the launcher uses is resolved here
//! and handed to the spawn calls explicitly.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LauncherError;
use crate::readiness::ReadinessStrategy;
use crate::retry::RetryPolicy;

/// Config file looked up in the current directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "launcher.json";

pub const DEFAULT_HEALTH_URL: &str = "http://127.0.0.1:5000/health";
pub const DEFAULT_HEALTH_MARKER: &str = "healthy";

/// Device-selection variable forwarded to the backend untouched.
pub const DEVICE_SELECTION_VAR: &str = "CUDA_VISIBLE_DEVICES";

/// What happens to the backend once the launcher is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendLifetime {
    /// Terminated when the launcher exits or is cancelled.
    Owned,
    /// Left running after the launcher exits.
    #[default]
    Detached,
}

impl BackendLifetime {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "owned" | "kill" => Some(Self::Owned),
            "detached" | "detach" => Some(Self::Detached),
            _ => None,
        }
    }
}

/// Where the backend's stdout/stderr go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendOutput {
    /// Read line by line into the launcher log.
    Forward,
    Inherit,
    Null,
    /// Appended to a file.
    File(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessMode {
    #[default]
    Health,
    Fixed,
}

impl ReadinessMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "health" | "poll" => Some(Self::Health),
            "fixed" | "delay" => Some(Self::Fixed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Interpreter or executable. `python`/`python3` resolve to a venv
    /// interpreter under `working_dir` when one exists.
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Start from the launcher's own environment.
    pub inherit_env: bool,
    /// Copied from the launcher's environment even when `inherit_env` is off.
    pub forward_env: Vec<String>,
    pub lifetime: BackendLifetime,
    /// Defaults to a log file for detached backends and `forward` otherwise.
    pub output: Option<BackendOutput>,
    pub shutdown_grace_ms: u64,
    /// Stop waiting as soon as the backend process has exited.
    pub fail_on_exit: bool,
    /// Skip spawning when something already answers healthy on the health URL.
    pub reuse_running: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["main.py".to_string()],
            working_dir: PathBuf::from("backend"),
            env: BTreeMap::new(),
            inherit_env: true,
            forward_env: vec![DEVICE_SELECTION_VAR.to_string()],
            lifetime: BackendLifetime::default(),
            output: None,
            shutdown_grace_ms: 10_000,
            fail_on_exit: true,
            reuse_running: false,
        }
    }
}

impl BackendConfig {
    pub fn effective_output(&self) -> BackendOutput {
        match (&self.output, self.lifetime) {
            (Some(output), _) => output.clone(),
            (None, BackendLifetime::Detached) => {
                BackendOutput::File(self.working_dir.join("backend.log"))
            }
            (None, BackendLifetime::Owned) => BackendOutput::Forward,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["main.py".to_string()],
            working_dir: PathBuf::from("."),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub mode: ReadinessMode,
    pub health_url: String,
    /// Case-sensitive substring looked for in the response body.
    pub marker: String,
    pub poll_interval_ms: u64,
    /// `None` polls until ready or cancelled.
    pub timeout_ms: Option<u64>,
    pub request_timeout_ms: u64,
    pub fixed_delay_ms: u64,
    /// Sent as a bearer token with each health check.
    pub api_key: Option<String>,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            mode: ReadinessMode::default(),
            health_url: DEFAULT_HEALTH_URL.to_string(),
            marker: DEFAULT_HEALTH_MARKER.to_string(),
            poll_interval_ms: 2000,
            timeout_ms: None,
            request_timeout_ms: 5000,
            fixed_delay_ms: 10_000,
            api_key: None,
        }
    }
}

impl ReadinessConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        let interval = Duration::from_millis(self.poll_interval_ms);
        match self.timeout_ms {
            Some(ms) => RetryPolicy::bounded(interval, Duration::from_millis(ms)),
            None => RetryPolicy::unbounded(interval),
        }
    }

    pub fn strategy(&self) -> ReadinessStrategy {
        match self.mode {
            ReadinessMode::Health => ReadinessStrategy::HealthPoll {
                url: self.health_url.clone(),
                marker: self.marker.clone(),
                policy: self.retry_policy(),
                request_timeout: Duration::from_millis(self.request_timeout_ms),
                api_key: self.api_key.clone(),
            },
            ReadinessMode::Fixed => {
                ReadinessStrategy::FixedDelay(Duration::from_millis(self.fixed_delay_ms))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub backend: BackendConfig,
    pub frontend: FrontendConfig,
    pub readiness: ReadinessConfig,
}

impl LauncherConfig {
    /// Load from `path`, or from `launcher.json` in the current directory if
    /// it exists, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, LauncherError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    log::info!("[Config] No {} found, using defaults", DEFAULT_CONFIG_FILE);
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, LauncherError> {
        let content = fs::read_to_string(path).map_err(|e| {
            LauncherError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = serde_json::from_str::<Self>(&content)?;
        log::info!("[Config] Loaded {}", path.display());
        Ok(config)
    }

    /// Apply `LAUNCHER_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), LauncherError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), LauncherError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LAUNCHER_BACKEND_PROGRAM") {
            self.backend.program = v;
        }
        if let Some(v) = lookup("LAUNCHER_BACKEND_DIR") {
            self.backend.working_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("LAUNCHER_BACKEND_LIFETIME") {
            self.backend.lifetime = BackendLifetime::from_str(&v).ok_or_else(|| {
                LauncherError::Config(format!("Unknown backend lifetime '{}'", v))
            })?;
        }
        if let Some(v) = lookup("LAUNCHER_FRONTEND_PROGRAM") {
            self.frontend.program = v;
        }
        if let Some(v) = lookup("LAUNCHER_FRONTEND_DIR") {
            self.frontend.working_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("LAUNCHER_READINESS") {
            self.readiness.mode = ReadinessMode::from_str(&v).ok_or_else(|| {
                LauncherError::Config(format!("Unknown readiness mode '{}'", v))
            })?;
        }
        if let Some(v) = lookup("LAUNCHER_HEALTH_URL") {
            self.readiness.health_url = v;
        }
        if let Some(v) = lookup("LAUNCHER_HEALTH_MARKER") {
            self.readiness.marker = v;
        }
        if let Some(v) = lookup("LAUNCHER_POLL_INTERVAL_MS") {
            self.readiness.poll_interval_ms = parse_ms("LAUNCHER_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("LAUNCHER_TIMEOUT_MS") {
            // 0 or "none" means poll forever
            self.readiness.timeout_ms = match v.trim() {
                "" | "none" | "0" => None,
                s => Some(parse_ms("LAUNCHER_TIMEOUT_MS", s)?),
            };
        }
        if let Some(v) = lookup("LAUNCHER_FIXED_DELAY_MS") {
            self.readiness.fixed_delay_ms = parse_ms("LAUNCHER_FIXED_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("LAUNCHER_API_KEY") {
            self.readiness.api_key = Some(v).filter(|k| !k.is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), LauncherError> {
        if self.backend.program.trim().is_empty() {
            return Err(LauncherError::Config("backend.program is empty".to_string()));
        }
        if self.frontend.program.trim().is_empty() {
            return Err(LauncherError::Config("frontend.program is empty".to_string()));
        }

        let readiness = &self.readiness;
        if readiness.mode == ReadinessMode::Health {
            if readiness.poll_interval_ms == 0 {
                return Err(LauncherError::Config(
                    "readiness.poll_interval_ms must be greater than 0".to_string(),
                ));
            }
            if readiness.marker.is_empty() {
                return Err(LauncherError::Config("readiness.marker is empty".to_string()));
            }
            let url = url::Url::parse(&readiness.health_url).map_err(|e| {
                LauncherError::Config(format!(
                    "Invalid health URL '{}': {}",
                    readiness.health_url, e
                ))
            })?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(LauncherError::Config(format!(
                    "Health URL must be http or https, got '{}'",
                    url.scheme()
                )));
            }
        }
        Ok(())
    }
}

fn parse_ms(key: &str, value: &str) -> Result<u64, LauncherError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| LauncherError::Config(format!("{} must be milliseconds, got '{}'", key, value)))
}
