//! Tiered reconnection state machine
//!
//! Shared by upstream backends and downstream endpoints. A machine decides how
//! long to wait before the next connection attempt:
//!
//! - **fast retry**: `min(initial × multiplier^k, max)` for the first `max_attempts` failures
//! - **infinite retry**: a fixed long delay, switching to an even longer sleep interval once
//!   `sleep_threshold` infinite attempts have failed
//! - **terminal**: no more attempts, reported once
//!
//! Every scheduled attempt carries the machine's generation. Manual close, manual reconnect
//! and re-enable bump the generation, so a timer that fires late is recognised as stale and
//! dropped instead of reviving a connection the owner tore down.

use std::future::Future;
use std::time::Duration;

use mcphub_shared::ReconnectPolicy;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tunables that sit next to a [`ReconnectPolicy`]
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectLimits {
    /// Infinite-phase attempts before sleep mode kicks in
    pub sleep_threshold: u32,
    /// Delay used once in sleep mode
    pub sleep_interval: Duration,
    /// Upper bound on infinite-phase attempts (None = unbounded)
    pub max_infinite_retries: Option<u32>,
    /// Fixed retry interval that bypasses the tiers entirely
    pub aggressive_interval: Option<Duration>,
}

impl Default for ReconnectLimits {
    fn default() -> Self {
        Self {
            sleep_threshold: 12,
            sleep_interval: Duration::from_secs(2 * 60 * 60),
            max_infinite_retries: None,
            aggressive_interval: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    FastRetry(u32),
    InfiniteRetry(u32),
    Terminal,
}

/// What the owner should do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt; the attempt must present `generation` when it fires
    Retry { delay: Duration, generation: u64 },
    /// Retries just ran out. Returned once per terminal transition.
    Exhausted,
    /// Already terminal, nothing to do
    Stopped,
}

/// Delay for the k-th fast attempt (k starts at 0)
pub fn fast_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let scaled = policy.initial_delay as f64 * policy.backoff_multiplier.powi(exponent);
    let capped = scaled.min(policy.max_delay as f64).max(0.0);
    Duration::from_millis(capped as u64)
}

/// Retry state for one backend or endpoint
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    entity: String,
    policy: ReconnectPolicy,
    limits: ReconnectLimits,
    phase: Phase,
    fast_attempts: u32,
    infinite_attempts: u32,
    sleeping: bool,
    generation: u64,
}

impl ReconnectMachine {
    pub fn new(entity: impl Into<String>, policy: ReconnectPolicy, limits: ReconnectLimits) -> Self {
        Self {
            entity: entity.into(),
            policy,
            limits,
            phase: Phase::Disconnected,
            fast_attempts: 0,
            infinite_attempts: 0,
            sleeping: false,
            generation: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    pub fn is_terminal(&self) -> bool {
        self.phase == Phase::Terminal
    }

    pub fn fast_attempts(&self) -> u32 {
        self.fast_attempts
    }

    pub fn infinite_attempts(&self) -> u32 {
        self.infinite_attempts
    }

    /// True when an attempt issued for `generation` may still act
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.phase != Phase::Terminal
    }

    /// Replace the policy, e.g. after the owning record was edited
    pub fn set_policy(&mut self, policy: ReconnectPolicy) {
        self.policy = policy;
    }

    /// Mark an attempt as started. Returns the generation it runs under,
    /// or None when the machine is terminal.
    pub fn begin_connect(&mut self) -> Option<u64> {
        if self.phase == Phase::Terminal {
            return None;
        }
        self.phase = Phase::Connecting;
        Some(self.generation)
    }

    /// A connection came up: all counters reset and sleep mode clears
    pub fn on_connected(&mut self) {
        self.fast_attempts = 0;
        self.infinite_attempts = 0;
        self.sleeping = false;
        self.phase = Phase::Connected;
    }

    /// A connect attempt failed or a live connection dropped
    pub fn on_failure(&mut self) -> RetryDecision {
        if self.phase == Phase::Terminal {
            return RetryDecision::Stopped;
        }

        if let Some(interval) = self.limits.aggressive_interval {
            self.phase = Phase::FastRetry(self.fast_attempts);
            self.fast_attempts = self.fast_attempts.saturating_add(1);
            return self.retry(interval);
        }

        if self.fast_attempts < self.policy.max_attempts {
            let k = self.fast_attempts;
            self.fast_attempts += 1;
            self.phase = Phase::FastRetry(k);
            return self.retry(fast_delay(&self.policy, k));
        }

        if !self.policy.infinite_reconnect {
            tracing::warn!(
                entity = %self.entity,
                attempts = self.fast_attempts,
                "Reconnect attempts exhausted"
            );
            self.phase = Phase::Terminal;
            return RetryDecision::Exhausted;
        }

        let m = self.infinite_attempts;
        if let Some(max) = self.limits.max_infinite_retries {
            if m >= max {
                tracing::warn!(
                    entity = %self.entity,
                    infinite_attempts = m,
                    "Maximum infinite reconnect attempts reached, giving up"
                );
                self.phase = Phase::Terminal;
                return RetryDecision::Exhausted;
            }
        }

        if !self.sleeping && m >= self.limits.sleep_threshold {
            tracing::info!(
                entity = %self.entity,
                interval = ?self.limits.sleep_interval,
                "Entering reconnect sleep mode"
            );
            self.sleeping = true;
        }

        self.infinite_attempts += 1;
        self.phase = Phase::InfiniteRetry(m);
        let delay = if self.sleeping {
            self.limits.sleep_interval
        } else {
            self.policy.infinite_retry_delay()
        };
        self.retry(delay)
    }

    fn retry(&self, delay: Duration) -> RetryDecision {
        RetryDecision::Retry {
            delay,
            generation: self.generation,
        }
    }

    /// Owner tore the connection down. Unconditionally terminal; pending attempts go stale.
    pub fn manual_close(&mut self) {
        self.generation += 1;
        self.phase = Phase::Terminal;
    }

    /// Start over from a clean slate (manual reconnect or explicit re-enable).
    /// Pending attempts from before the reset go stale.
    pub fn reset(&mut self) {
        self.generation += 1;
        self.fast_attempts = 0;
        self.infinite_attempts = 0;
        self.sleeping = false;
        self.phase = Phase::Disconnected;
    }

    /// [`reset`](Self::reset) under a generation issued by the owner. Owners
    /// that drop and recreate machines use this so generations never repeat.
    pub fn reset_to(&mut self, generation: u64) {
        self.reset();
        self.generation = generation;
    }
}

/// Run `attempt` after `delay` unless `cancel` fires first
pub fn spawn_retry<F, Fut>(delay: Duration, cancel: CancellationToken, attempt: F) -> JoinHandle<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => attempt().await,
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32, infinite: bool) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            initial_delay: 100,
            max_delay: 1_000,
            backoff_multiplier: 2.0,
            infinite_reconnect: infinite,
            infinite_retry_delay: 5_000,
        }
    }

    fn delay_of(decision: RetryDecision) -> Duration {
        match decision {
            RetryDecision::Retry { delay, .. } => delay,
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_fast_delays_are_monotonic_and_capped() {
        let mut machine = ReconnectMachine::new("b", policy(6, false), ReconnectLimits::default());
        let delays: Vec<Duration> = (0..6).map(|_| delay_of(machine.on_failure())).collect();

        let expected: Vec<Duration> = [100, 200, 400, 800, 1_000, 1_000]
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect();
        assert_eq!(delays, expected);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(machine.phase(), Phase::FastRetry(5));
    }

    #[test]
    fn test_exhausted_without_infinite_mode_reports_once() {
        let mut machine = ReconnectMachine::new("b", policy(2, false), ReconnectLimits::default());
        machine.on_failure();
        machine.on_failure();

        assert_eq!(machine.on_failure(), RetryDecision::Exhausted);
        assert!(machine.is_terminal());
        assert_eq!(machine.on_failure(), RetryDecision::Stopped);
        assert_eq!(machine.begin_connect(), None);
    }

    #[test]
    fn test_infinite_mode_never_resumes_fast_delays() {
        let limits = ReconnectLimits {
            sleep_threshold: 3,
            sleep_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let mut machine = ReconnectMachine::new("b", policy(2, true), limits);
        machine.on_failure();
        machine.on_failure();

        let infinite: Vec<Duration> = (0..5).map(|_| delay_of(machine.on_failure())).collect();
        assert_eq!(&infinite[..3], &[Duration::from_secs(5); 3]);
        assert_eq!(&infinite[3..], &[Duration::from_secs(60); 2]);
        assert!(machine.is_sleeping());
        assert_eq!(machine.phase(), Phase::InfiniteRetry(4));
    }

    #[test]
    fn test_max_infinite_retries_goes_terminal() {
        let limits = ReconnectLimits {
            max_infinite_retries: Some(2),
            ..Default::default()
        };
        let mut machine = ReconnectMachine::new("b", policy(1, true), limits);
        machine.on_failure();
        machine.on_failure();
        machine.on_failure();

        assert_eq!(machine.on_failure(), RetryDecision::Exhausted);
        assert!(machine.is_terminal());
    }

    #[test]
    fn test_success_resets_counters_and_sleep_mode() {
        let limits = ReconnectLimits {
            sleep_threshold: 0,
            ..Default::default()
        };
        let mut machine = ReconnectMachine::new("b", policy(1, true), limits);
        machine.on_failure();
        machine.on_failure();
        assert!(machine.is_sleeping());

        machine.begin_connect();
        machine.on_connected();
        assert_eq!(machine.phase(), Phase::Connected);
        assert_eq!(machine.fast_attempts(), 0);
        assert_eq!(machine.infinite_attempts(), 0);
        assert!(!machine.is_sleeping());
        assert_eq!(delay_of(machine.on_failure()), Duration::from_millis(100));
    }

    #[test]
    fn test_aggressive_interval_bypasses_tiers() {
        let limits = ReconnectLimits {
            aggressive_interval: Some(Duration::from_secs(2)),
            ..Default::default()
        };
        let mut machine = ReconnectMachine::new("e", policy(1, false), limits);
        for _ in 0..20 {
            assert_eq!(delay_of(machine.on_failure()), Duration::from_secs(2));
        }

        machine.manual_close();
        assert_eq!(machine.on_failure(), RetryDecision::Stopped);
    }

    #[test]
    fn test_manual_close_makes_pending_generation_stale() {
        let mut machine = ReconnectMachine::new("e", policy(3, true), ReconnectLimits::default());
        let RetryDecision::Retry { generation, .. } = machine.on_failure() else {
            panic!("expected retry");
        };
        assert!(machine.is_current(generation));

        machine.manual_close();
        assert!(!machine.is_current(generation));
        assert!(machine.is_terminal());

        // Only an explicit reset reopens it, under a fresh generation
        machine.reset();
        assert!(!machine.is_current(generation));
        assert_eq!(machine.begin_connect(), Some(machine.generation()));
    }

    #[test]
    fn test_reset_to_adopts_owner_generation() {
        let mut machine = ReconnectMachine::new("b", policy(3, false), ReconnectLimits::default());
        machine.on_failure();
        machine.manual_close();

        machine.reset_to(42);
        assert_eq!(machine.generation(), 42);
        assert_eq!(machine.phase(), Phase::Disconnected);
        assert_eq!(machine.fast_attempts(), 0);
        assert!(machine.is_current(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let counter = Arc::clone(&fired);
        let handle = spawn_retry(Duration::from_secs(5), cancel.clone(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_secs(1)).await;
        cancel.cancel();
        tokio::time::advance(Duration::from_secs(10)).await;
        handle.await.unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let handle = spawn_retry(
            Duration::from_millis(500),
            CancellationToken::new(),
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        handle.await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
