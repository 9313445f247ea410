//! Resilient Connection Supervisor
//!
//! Establishes a connection to an external system (broker or store) with a
//! bounded number of attempts and a configurable wait between them. Each
//! supervisor owns one connection lifecycle with its own attempt counter, so
//! a slow store never holds back the broker or the other way round.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::errors::MessagingError;

/// Wait between failed connection attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Same interval after every failure
    Fixed { interval: Duration },
    /// `initial * multiplier^(attempt - 1)`, capped at `max`
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: u32,
    },
    /// Exponential delay scaled by a random factor in `[0.5, 1.0)`
    ExponentialJitter {
        initial: Duration,
        max: Duration,
        multiplier: u32,
    },
}

impl BackoffStrategy {
    pub fn fixed(interval: Duration) -> Self {
        Self::Fixed { interval }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed { interval } => *interval,
            BackoffStrategy::Exponential {
                initial,
                max,
                multiplier,
            } => exponential_delay(*initial, *max, *multiplier, attempt),
            BackoffStrategy::ExponentialJitter {
                initial,
                max,
                multiplier,
            } => {
                let capped = exponential_delay(*initial, *max, *multiplier, attempt);
                let jitter_factor = 0.5 + (rand::random::<f64>() * 0.5);
                capped.mul_f64(jitter_factor)
            }
        }
    }
}

fn exponential_delay(initial: Duration, max: Duration, multiplier: u32, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    multiplier
        .checked_pow(exponent)
        .and_then(|factor| initial.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

/// Bounded retry contract for one connection target.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffStrategy::fixed(Duration::from_secs(5)),
        }
    }
}

/// Lifecycle of a supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Something that can open a connection to one target.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Send;

    /// Name of the target for logs and errors. Must not leak credentials.
    fn target(&self) -> String;

    async fn connect(&self) -> Result<Self::Connection, MessagingError>;
}

/// Shared, read-only view of a supervisor's connection state.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    state: Arc<RwLock<ConnectionState>>,
}

impl ConnectionStatus {
    pub fn get(&self) -> ConnectionState {
        *self.state.read()
    }
}

/// Connects to one target with bounded retry and tracks its state.
pub struct ConnectionSupervisor {
    policy: RetryPolicy,
    state: Arc<RwLock<ConnectionState>>,
}

impl ConnectionSupervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: Arc::clone(&self.state),
        }
    }

    /// Record that a previously established connection was lost.
    pub fn mark_disconnected(&self) {
        *self.state.write() = ConnectionState::Disconnected;
    }

    /// Try to connect up to `max_attempts` times, waiting the backoff delay
    /// between attempts. No wait follows the final failure.
    #[instrument(skip(self, connector), fields(endpoint = %connector.target()))]
    pub async fn connect<C: Connector + ?Sized>(
        &self,
        connector: &C,
    ) -> Result<C::Connection, MessagingError> {
        let max_attempts = self.policy.max_attempts.max(1);
        *self.state.write() = ConnectionState::Connecting;

        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match connector.connect().await {
                Ok(connection) => {
                    *self.state.write() = ConnectionState::Connected;
                    info!(attempt, "Connected");
                    return Ok(connection);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt == max_attempts {
                        break;
                    }
                    let delay = self.policy.backoff.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        *self.state.write() = ConnectionState::Disconnected;
        Err(MessagingError::ConnectionExhausted {
            target: connector.target(),
            attempts: max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    /// Fails until the configured attempt, recording when each attempt ran.
    struct FlakyTarget {
        succeed_on: Option<u32>,
        attempts: AtomicU32,
        started: Instant,
        attempt_times: parking_lot::Mutex<Vec<Duration>>,
    }

    impl FlakyTarget {
        fn new(succeed_on: Option<u32>) -> Self {
            Self {
                succeed_on,
                attempts: AtomicU32::new(0),
                started: Instant::now(),
                attempt_times: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Connector for FlakyTarget {
        type Connection = u32;

        fn target(&self) -> String {
            "flaky".to_string()
        }

        async fn connect(&self) -> Result<u32, MessagingError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            self.attempt_times.lock().push(self.started.elapsed());
            match self.succeed_on {
                Some(n) if attempt >= n => Ok(attempt),
                _ => Err(MessagingError::connection("flaky", "refused")),
            }
        }
    }

    fn fixed_policy(max_attempts: u32, secs: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: BackoffStrategy::fixed(Duration::from_secs(secs)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_on_nth_attempt_with_backoff_between() {
        let target = FlakyTarget::new(Some(3));
        let supervisor = ConnectionSupervisor::new(fixed_policy(5, 5));

        let connection = supervisor.connect(&target).await.unwrap();

        assert_eq!(connection, 3);
        assert_eq!(target.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(supervisor.state(), ConnectionState::Connected);

        let times = target.attempt_times.lock().clone();
        assert_eq!(times.len(), 3);
        for pair in times.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_secs(5), "gap was {gap:?}");
            assert!(gap < Duration::from_secs(6), "gap was {gap:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success_does_not_wait() {
        let target = FlakyTarget::new(Some(1));
        let supervisor = ConnectionSupervisor::new(fixed_policy(5, 5));
        let started = Instant::now();

        supervisor.connect(&target).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts() {
        let target = FlakyTarget::new(None);
        let supervisor = ConnectionSupervisor::new(fixed_policy(4, 2));

        let err = supervisor.connect(&target).await.unwrap_err();

        assert_eq!(target.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        match err {
            MessagingError::ConnectionExhausted {
                target, attempts, ..
            } => {
                assert_eq!(target, "flaky");
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // three waits, none after the final failure
        let times = target.attempt_times.lock().clone();
        let last = times.last().copied().unwrap();
        assert!(last >= Duration::from_secs(6) && last < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_supervisors_keep_separate_counters() {
        let broker = FlakyTarget::new(Some(1));
        let store = FlakyTarget::new(Some(3));
        let broker_supervisor = ConnectionSupervisor::new(fixed_policy(5, 5));
        let store_supervisor = ConnectionSupervisor::new(fixed_policy(5, 5));

        let (b, s) = tokio::join!(
            broker_supervisor.connect(&broker),
            store_supervisor.connect(&store)
        );

        assert_eq!(b.unwrap(), 1);
        assert_eq!(s.unwrap(), 3);
        assert_eq!(broker.attempt_times.lock()[0], Duration::ZERO);
    }

    #[test]
    fn test_exponential_backoff_grows_and_caps() {
        let backoff = BackoffStrategy::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2,
        };

        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(800));
        assert_eq!(backoff.delay_for(5), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(200), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_half_to_full_delay() {
        let backoff = BackoffStrategy::ExponentialJitter {
            initial: Duration::from_millis(400),
            max: Duration::from_secs(10),
            multiplier: 2,
        };

        for _ in 0..100 {
            let delay = backoff.delay_for(2);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(800));
        }
    }

    #[test]
    fn test_default_policy_matches_deployment() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff, BackoffStrategy::fixed(Duration::from_secs(5)));
    }
}
