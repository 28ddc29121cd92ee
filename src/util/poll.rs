//! Bounded readiness polling

use crate::config::PollSettings;
use crate::error::{PipelineError, PipelineResult};
use std::future::Future;
use std::time::Instant;
use tracing::debug;

/// Calls `probe` up to `settings.attempts` times, sleeping `settings.interval`
/// between attempts. Returns the attempt number that succeeded, or a
/// [`PipelineError::ReadinessTimeout`] naming `what`.
pub async fn poll_until<F, Fut>(what: &str, settings: PollSettings, mut probe: F) -> PipelineResult<u32>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    for attempt in 1..=settings.attempts {
        if probe().await {
            debug!(what, attempt, "Ready");
            return Ok(attempt);
        }
        debug!(what, attempt, max = settings.attempts, "Not ready yet");
        if attempt < settings.attempts {
            tokio::time::sleep(settings.interval).await;
        }
    }

    Err(PipelineError::ReadinessTimeout {
        what: what.to_string(),
        attempts: settings.attempts,
        elapsed: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ready_on_third_attempt() {
        let mut calls = 0;
        let attempt = poll_until("thing", PollSettings::new(5, Duration::ZERO), || {
            calls += 1;
            let ready = calls >= 3;
            async move { ready }
        })
        .await
        .unwrap();
        assert_eq!(attempt, 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_bounded_attempts() {
        let mut calls = 0;
        let err = poll_until("socket", PollSettings::new(4, Duration::ZERO), || {
            calls += 1;
            async { false }
        })
        .await
        .unwrap_err();

        assert_eq!(calls, 4);
        match err {
            PipelineError::ReadinessTimeout { what, attempts, .. } => {
                assert_eq!(what, "socket");
                assert_eq!(attempts, 4);
            }
            other => panic!("Expected ReadinessTimeout, got {:?}", other),
        }
    }
}
