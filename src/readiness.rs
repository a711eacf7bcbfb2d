//! Readiness gate between backend spawn and frontend spawn.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::LauncherError;
use crate::retry::RetryPolicy;

/// How the launcher decides the backend can be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessStrategy {
    /// Poll an HTTP endpoint until the body contains `marker`.
    HealthPoll {
        url: String,
        marker: String,
        policy: RetryPolicy,
        request_timeout: Duration,
        api_key: Option<String>,
    },
    /// Wait a fixed time after spawn without looking at the backend.
    FixedDelay(Duration),
}

/// How the gate was passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadySignal {
    Healthy { attempts: u32, elapsed: Duration },
    /// Degraded mode: readiness was assumed, not observed.
    DelayElapsed(Duration),
}

impl ReadySignal {
    pub fn is_observed(&self) -> bool {
        matches!(self, ReadySignal::Healthy { .. })
    }
}

/// Sleep for `delay` unless cancelled first.
pub async fn fixed_delay(
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<ReadySignal, LauncherError> {
    log::warn!(
        "[Launcher] No health check configured, assuming backend is ready after {:?}",
        delay
    );
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LauncherError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(ReadySignal::DelayElapsed(delay)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn fixed_delay_waits_exactly() {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let signal = fixed_delay(Duration::from_millis(10_000), &cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(10_000));
        assert_eq!(signal, ReadySignal::DelayElapsed(Duration::from_millis(10_000)));
        assert!(!signal.is_observed());
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_delay_is_cancellable() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fixed_delay(Duration::from_secs(60), &cancel).await.unwrap_err();
        assert!(matches!(err, LauncherError::Cancelled));
    }
}
