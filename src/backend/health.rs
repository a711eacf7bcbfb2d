//! Backend Health Checks
//!
//! A single probe classifies one GET against the health endpoint; the
//! readiness wait repeats it on a `RetryPolicy` until the marker shows up.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::LauncherError;
use crate::retry::{retry_until, Attempt, RetryError, RetryPolicy};

/// Result of one health check. Recomputed on every poll, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// No response: not listening yet, reset, or timed out.
    Unknown,
    /// Answered, but without the marker.
    Unhealthy,
    Healthy,
}

/// One health check against the backend.
pub trait HealthProbe {
    /// `budget` caps how long this check may take.
    fn check(&self, budget: Option<Duration>) -> impl Future<Output = HealthStatus> + Send;
}

/// Classify a response body. The marker is a case-sensitive substring.
pub fn classify_body(body: &str, marker: &str) -> HealthStatus {
    if body.contains(marker) {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    }
}

/// GETs a URL and looks for the marker anywhere in the body.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
    marker: String,
    api_key: Option<String>,
    request_timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(
        url: impl Into<String>,
        marker: impl Into<String>,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, LauncherError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| LauncherError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            marker: marker.into(),
            api_key,
            request_timeout,
        })
    }
}

impl HealthProbe for HttpHealthProbe {
    async fn check(&self, budget: Option<Duration>) -> HealthStatus {
        let timeout = budget.map_or(self.request_timeout, |b| b.min(self.request_timeout));

        let mut request = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(timeout);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            // Any status counts; only the body decides
            Ok(response) => match response.text().await {
                Ok(body) => classify_body(&body, &self.marker),
                Err(e) => {
                    log::debug!("[Backend] Unreadable health response: {}", e);
                    HealthStatus::Unhealthy
                }
            },
            Err(e) => {
                log::debug!("[Backend] Health check not answered: {}", e);
                HealthStatus::Unknown
            }
        }
    }
}

/// Outcome of a successful readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Wait for the backend to respond healthy
pub async fn wait_for_ready<P: HealthProbe>(
    probe: &P,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Ready, LauncherError> {
    wait_for_ready_while(probe, policy, cancel, || Ok(())).await
}

/// Like [`wait_for_ready`], but runs `still_viable` before each check and
/// stops with its error as soon as it fails.
pub async fn wait_for_ready_while<P, F>(
    probe: &P,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut still_viable: F,
) -> Result<Ready, LauncherError>
where
    P: HealthProbe,
    F: FnMut() -> Result<(), LauncherError>,
{
    let result = retry_until(policy, cancel, |ctx| {
        let viable = still_viable();
        async move {
            if let Err(e) = viable {
                return Attempt::Abort(e);
            }
            let status = probe.check(ctx.remaining).await;
            log::debug!("[Backend] Health check #{}: {:?}", ctx.number, status);
            match status {
                HealthStatus::Healthy => Attempt::Ready(()),
                HealthStatus::Unknown | HealthStatus::Unhealthy => Attempt::NotYet,
            }
        }
    })
    .await;

    match result {
        Ok(outcome) => {
            log::info!(
                "[Backend] Server ready after {} checks ({:?})",
                outcome.attempts,
                outcome.elapsed
            );
            Ok(Ready {
                attempts: outcome.attempts,
                elapsed: outcome.elapsed,
            })
        }
        Err(RetryError::TimedOut { attempts, elapsed }) => {
            log::error!(
                "[Backend] Startup timeout: not healthy after {} checks ({:?})",
                attempts,
                elapsed
            );
            Err(LauncherError::BackendTimeout { attempts, elapsed })
        }
        Err(RetryError::Cancelled) => Err(LauncherError::Cancelled),
        Err(RetryError::Aborted(e)) => Err(e),
    }
}

/// Single check against an already running backend.
pub async fn health_check<P: HealthProbe>(probe: &P) -> bool {
    probe.check(None).await == HealthStatus::Healthy
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Reports `Unknown` until the given check number, then healthy.
    struct ScriptedProbe {
        healthy_from: Option<u32>,
        calls: AtomicU32,
        seen_at: Mutex<Vec<Duration>>,
        start: Instant,
    }

    impl ScriptedProbe {
        fn new(healthy_from: Option<u32>) -> Self {
            Self {
                healthy_from,
                calls: AtomicU32::new(0),
                seen_at: Mutex::new(Vec::new()),
                start: Instant::now(),
            }
        }
    }

    impl HealthProbe for ScriptedProbe {
        async fn check(&self, _budget: Option<Duration>) -> HealthStatus {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen_at.lock().unwrap().push(self.start.elapsed());
            match self.healthy_from {
                Some(from) if n >= from => HealthStatus::Healthy,
                _ => HealthStatus::Unknown,
            }
        }
    }

    #[test]
    fn test_marker_is_case_sensitive_substring() {
        assert_eq!(
            classify_body("service is healthy and running", "healthy"),
            HealthStatus::Healthy
        );
        assert_eq!(
            classify_body(r#"{"status":"healthy"}"#, "healthy"),
            HealthStatus::Healthy
        );
        assert_eq!(classify_body("HEALTHY", "healthy"), HealthStatus::Unhealthy);
        assert_eq!(classify_body("starting", "healthy"), HealthStatus::Unhealthy);
        assert_eq!(classify_body("", "healthy"), HealthStatus::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_third_poll() {
        let probe = ScriptedProbe::new(Some(3));
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::unbounded(Duration::from_millis(2000));

        let ready = wait_for_ready(&probe, policy, &cancel).await.unwrap();

        assert_eq!(ready.attempts, 3);
        assert!(ready.elapsed >= Duration::from_millis(4000));
        assert!(ready.elapsed < Duration::from_millis(6000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_healthy_times_out() {
        let probe = ScriptedProbe::new(None);
        let cancel = CancellationToken::new();
        let policy =
            RetryPolicy::bounded(Duration::from_millis(2000), Duration::from_millis(30000));

        let err = wait_for_ready(&probe, policy, &cancel).await.unwrap_err();

        match err {
            LauncherError::BackendTimeout { elapsed, .. } => {
                assert!(elapsed >= Duration::from_millis(30000));
                assert!(elapsed < Duration::from_millis(32000));
            }
            other => panic!("expected BackendTimeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_check_is_retried_once_per_interval() {
        let probe = ScriptedProbe::new(Some(2));
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::unbounded(Duration::from_millis(2000));

        wait_for_ready(&probe, policy, &cancel).await.unwrap();

        assert_eq!(
            *probe.seen_at.lock().unwrap(),
            vec![Duration::ZERO, Duration::from_millis(2000)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_viability_check_aborts_wait() {
        let probe = ScriptedProbe::new(None);
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::unbounded(Duration::from_millis(100));
        let mut checks = 0;

        let err = wait_for_ready_while(&probe, policy, &cancel, || {
            checks += 1;
            if checks > 2 {
                Err(LauncherError::BackendExited(Some(1)))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, LauncherError::BackendExited(Some(1))));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unknown() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let probe = HttpHealthProbe::new(
            format!("http://127.0.0.1:{}/health", port),
            "healthy",
            None,
            Duration::from_secs(1),
        )
        .unwrap();

        assert_eq!(probe.check(None).await, HealthStatus::Unknown);
        assert!(!health_check(&probe).await);
    }
}
