//! Bounded polling with a deadline.
//!
//! Health gating waits are expressed as "check every `interval` until the
//! check passes or `timeout` elapses". Time comes from `tokio::time`, so
//! tests run these loops against a paused clock.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// How a poll loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The check passed after this many attempts
    Ready { attempts: u32, elapsed: Duration },
    /// The deadline passed without the check succeeding
    TimedOut { attempts: u32 },
}

impl PollOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. })
    }
}

/// Poll `check` every `interval` until it returns `true` or `timeout` elapses.
///
/// The first check runs immediately. The loop never sleeps past the
/// deadline, and a final check is made at the deadline itself.
pub async fn poll_until<F, Fut>(interval: Duration, timeout: Duration, mut check: F) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if check().await {
            let elapsed = start.elapsed();
            debug!("Poll ready after {} attempt(s), {:?}", attempts, elapsed);
            return PollOutcome::Ready { attempts, elapsed };
        }

        let now = Instant::now();
        if now >= deadline {
            debug!("Poll timed out after {} attempt(s)", attempts);
            return PollOutcome::TimedOut { attempts };
        }

        let remaining = deadline - now;
        sleep(interval.min(remaining)).await;
    }
}
