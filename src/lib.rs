//! Inference launcher
//!
//! Starts a local inference backend as a child process, waits until its
//! health endpoint reports ready (or a fixed fallback delay elapses), then
//! runs the desktop client in the foreground.

pub mod backend;
pub mod config;
pub mod error;
pub mod frontend;
pub mod launcher;
pub mod process_handle;
pub mod readiness;
pub mod retry;

pub use config::LauncherConfig;
pub use error::LauncherError;
pub use launcher::{LaunchReport, Launcher, LauncherState};
