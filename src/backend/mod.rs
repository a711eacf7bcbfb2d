//! Backend Management Module
//!
//! Runs the inference server as a subprocess and tells when it is ready.

pub mod health;
pub mod manager;
pub mod process;

pub use health::{HealthProbe, HealthStatus, HttpHealthProbe};
pub use manager::BackendHandle;
