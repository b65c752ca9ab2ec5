//! Connection state and the fixed-interval retry loop.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Default pause between reconnect attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

/// Connectivity of a client to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing pulled yet.
    Idle,
    Connected,
    /// Serving entries loaded from the cache directory.
    UsingCache,
    Retrying,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connected => "connected",
            ConnectionState::UsingCache => "using_cache",
            ConnectionState::Retrying => "retrying",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attempt {
    /// Connected and reconciled; stop retrying.
    Recovered,
    /// Try again on the next tick.
    Retry,
    /// Give up for good.
    Abandon,
}

/// Why the retry loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    Recovered,
    Abandoned,
    Cancelled,
}

/// Runs `attempt` every `interval`, first after one full interval, until it
/// recovers, gives up, or `token` is cancelled.
pub(crate) async fn retry_loop<F, Fut>(
    interval: Duration,
    token: CancellationToken,
    mut attempt: F,
) -> Exit
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt>,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Exit::Cancelled,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => return Exit::Cancelled,
            outcome = attempt() => outcome,
        };
        match outcome {
            Attempt::Recovered => return Exit::Recovered,
            Attempt::Abandon => return Exit::Abandoned,
            Attempt::Retry => continue,
        }
    }
}
