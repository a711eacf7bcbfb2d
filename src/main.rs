//! inference-launcher
//!
//! Starts the inference backend, waits for its health endpoint, then runs
//! the desktop client. With no arguments everything comes from
//! `launcher.json`, `LAUNCHER_*` variables and built-in defaults.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use inference_launcher::config::{BackendLifetime, ReadinessMode};
use inference_launcher::{Launcher, LauncherConfig};

/// Start the backend, wait until it is healthy, then run the client
#[derive(Parser, Debug)]
#[command(name = "inference-launcher")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./launcher.json when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Health endpoint to poll
    #[arg(long)]
    health_url: Option<String>,

    /// Delay between health checks
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Give up if the backend is not healthy after this long
    #[arg(long, conflicts_with = "no_timeout")]
    timeout_ms: Option<u64>,

    /// Poll until the backend is healthy, however long it takes
    #[arg(long)]
    no_timeout: bool,

    /// Skip health checks and wait this long after starting the backend
    #[arg(long)]
    fixed_delay_ms: Option<u64>,

    /// Stop the backend when the launcher exits
    #[arg(long, conflicts_with = "detach_backend")]
    kill_backend_on_exit: bool,

    /// Leave the backend running after the launcher exits
    #[arg(long)]
    detach_backend: bool,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn apply(&self, config: &mut LauncherConfig) {
        if let Some(url) = &self.health_url {
            config.readiness.health_url = url.clone();
        }
        if let Some(ms) = self.poll_interval_ms {
            config.readiness.poll_interval_ms = ms;
        }
        if let Some(ms) = self.timeout_ms {
            config.readiness.timeout_ms = Some(ms);
        }
        if self.no_timeout {
            config.readiness.timeout_ms = None;
        }
        if let Some(ms) = self.fixed_delay_ms {
            config.readiness.mode = ReadinessMode::Fixed;
            config.readiness.fixed_delay_ms = ms;
        }
        if self.kill_backend_on_exit {
            config.backend.lifetime = BackendLifetime::Owned;
        }
        if self.detach_backend {
            config.backend.lifetime = BackendLifetime::Detached;
        }
    }
}

fn load_config(cli: &Cli) -> Result<LauncherConfig> {
    let mut config = LauncherConfig::load(cli.config.as_deref()).context("loading configuration")?;
    config.apply_env().context("reading LAUNCHER_* environment")?;
    cli.apply(&mut config);
    config.validate().context("validating configuration")?;
    Ok(config)
}

/// Cancel on Ctrl-C, and on SIGTERM where there is one.
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("[Launcher] Cannot listen for SIGTERM: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        log::info!("[Launcher] Interrupted, shutting down...");
        cancel.cancel();
    });
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            log::error!("[Config] {:#}", e);
            return exit_code(2);
        }
    };

    if cli.print_config {
        match serde_json::to_string_pretty(&config) {
            Ok(json) => {
                println!("{}", json);
                return ExitCode::SUCCESS;
            }
            Err(e) => {
                log::error!("[Config] {}", e);
                return exit_code(2);
            }
        }
    }

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let mut launcher = match Launcher::new(config, cancel) {
        Ok(launcher) => launcher,
        Err(e) => {
            log::error!("[Launcher] {}", e);
            return exit_code(e.exit_code());
        }
    };

    match launcher.run().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("[Launcher] {} (state: {:?})", e, launcher.state());
            if let Some(first) = launcher.history().first() {
                for t in launcher.history() {
                    log::debug!("[Launcher]   {:?} at +{:?}", t.state, t.at - first.at);
                }
            }
            exit_code(e.exit_code())
        }
    }
}
