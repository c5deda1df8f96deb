//! Reconnect decision logic for client transports.
//!
//! Grounded on `original_source/unilink/transport/tcp_client/detail/
//! reconnect_logic.hpp` for the decision ordering and the 30s delay clamp,
//! and on `flux_network::tcp::connector::ConnectionManager::maybe_reconnect`
//! for the retry-budget/attempt-count bookkeeping shape.

use std::time::Duration;

use rand::Rng;

/// Hard ceiling on any policy-supplied reconnect delay.
const MAX_RECONNECT_DELAY: Duration = Duration::from_millis(30_000);

/// `max_retries` semantics: `0` means "never retry", a positive value caps
/// the attempt count, and a negative value means "retry forever".
#[derive(Clone, Copy, Debug)]
pub enum MaxRetries {
    Never,
    Limited(u32),
    Infinite,
}

impl MaxRetries {
    /// Mirrors the original's `int` encoding: `0` -> never, `< 0` ->
    /// infinite, otherwise limited to that many attempts.
    pub fn from_raw(raw: i64) -> Self {
        if raw == 0 {
            MaxRetries::Never
        } else if raw < 0 {
            MaxRetries::Infinite
        } else {
            MaxRetries::Limited(raw as u32)
        }
    }
}

/// A pluggable delay schedule consulted once a retry has been decided on.
pub trait ReconnectPolicy: Send + Sync {
    /// The delay to wait before attempt number `attempt` (1-based).
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// A constant delay between every attempt.
pub struct FixedInterval {
    pub interval: Duration,
}

impl ReconnectPolicy for FixedInterval {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.interval
    }
}

/// Doubling backoff from `base`, capped at `max`, with up to `jitter_ratio`
/// of the computed delay added as uniform random jitter.
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter_ratio: f64,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration, jitter_ratio: f64) -> Self {
        Self { base, max, jitter_ratio: jitter_ratio.clamp(0.0, 1.0) }
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let scaled = self.base.as_secs_f64() * 2f64.powi(exponent as i32);
        let capped = scaled.min(self.max.as_secs_f64());
        let jitter = if self.jitter_ratio > 0.0 {
            rand::rng().random_range(0.0..=self.jitter_ratio) * capped
        } else {
            0.0
        };
        Duration::from_secs_f64(capped + jitter)
    }
}

/// The outcome of a reconnect decision.
#[derive(Debug, PartialEq, Eq)]
pub enum ReconnectDecision {
    Stop,
    Retry { delay: Duration },
}

/// Tracks attempt count against a retry budget and produces reconnect
/// decisions, optionally consulting a [`ReconnectPolicy`] for delay.
pub struct ReconnectController {
    max_retries: MaxRetries,
    policy: Option<Box<dyn ReconnectPolicy>>,
    attempt_count: u32,
}

impl ReconnectController {
    pub fn new(max_retries: MaxRetries, policy: Option<Box<dyn ReconnectPolicy>>) -> Self {
        Self { max_retries, policy, attempt_count: 0 }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Decides whether to retry after a failure.
    ///
    /// Order matches the original exactly: a non-retryable error stops
    /// immediately, then the retry budget is checked, and only then is a
    /// policy (if any) consulted for delay.
    pub fn decide(&mut self, retryable: bool) -> ReconnectDecision {
        if !retryable {
            return ReconnectDecision::Stop;
        }
        if let MaxRetries::Never = self.max_retries {
            return ReconnectDecision::Stop;
        }
        if let MaxRetries::Limited(limit) = self.max_retries {
            if self.attempt_count >= limit {
                return ReconnectDecision::Stop;
            }
        }

        self.attempt_count += 1;
        let delay = match &self.policy {
            Some(policy) => policy.next_delay(self.attempt_count).min(MAX_RECONNECT_DELAY),
            None => Duration::ZERO,
        };
        ReconnectDecision::Retry { delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_retries_stop_immediately() {
        let mut ctl = ReconnectController::new(MaxRetries::Never, None);
        assert_eq!(ctl.decide(true), ReconnectDecision::Stop);
    }

    #[test]
    fn non_retryable_error_stops_even_with_budget_left() {
        let mut ctl = ReconnectController::new(MaxRetries::Infinite, None);
        assert_eq!(ctl.decide(false), ReconnectDecision::Stop);
    }

    #[test]
    fn limited_budget_exhausts() {
        let mut ctl = ReconnectController::new(MaxRetries::Limited(2), None);
        assert_eq!(ctl.decide(true), ReconnectDecision::Retry { delay: Duration::ZERO });
        assert_eq!(ctl.decide(true), ReconnectDecision::Retry { delay: Duration::ZERO });
        assert_eq!(ctl.decide(true), ReconnectDecision::Stop);
    }

    #[test]
    fn infinite_budget_never_stops_on_retryable_errors() {
        let mut ctl = ReconnectController::new(MaxRetries::Infinite, None);
        for _ in 0..1000 {
            assert_eq!(ctl.decide(true), ReconnectDecision::Retry { delay: Duration::ZERO });
        }
    }

    #[test]
    fn no_policy_means_immediate_retry() {
        let mut ctl = ReconnectController::new(MaxRetries::Limited(1), None);
        assert_eq!(ctl.decide(true), ReconnectDecision::Retry { delay: Duration::ZERO });
    }

    #[test]
    fn policy_delay_is_clamped_to_thirty_seconds() {
        struct Huge;
        impl ReconnectPolicy for Huge {
            fn next_delay(&self, _attempt: u32) -> Duration {
                Duration::from_secs(3600)
            }
        }
        let mut ctl = ReconnectController::new(MaxRetries::Infinite, Some(Box::new(Huge)));
        match ctl.decide(true) {
            ReconnectDecision::Retry { delay } => assert_eq!(delay, MAX_RECONNECT_DELAY),
            ReconnectDecision::Stop => panic!("expected retry"),
        }
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(5), 0.0);
        assert_eq!(policy.next_delay(1), Duration::from_millis(100));
        assert_eq!(policy.next_delay(2), Duration::from_millis(200));
        assert_eq!(policy.next_delay(3), Duration::from_millis(400));
        assert_eq!(policy.next_delay(20), Duration::from_secs(5));
    }

    #[test]
    fn max_retries_from_raw_encodes_original_semantics() {
        assert!(matches!(MaxRetries::from_raw(0), MaxRetries::Never));
        assert!(matches!(MaxRetries::from_raw(-1), MaxRetries::Infinite));
        assert!(matches!(MaxRetries::from_raw(5), MaxRetries::Limited(5)));
    }

    #[test]
    fn reset_clears_attempt_count() {
        let mut ctl = ReconnectController::new(MaxRetries::Limited(1), None);
        ctl.decide(true);
        assert_eq!(ctl.attempt_count(), 1);
        ctl.reset();
        assert_eq!(ctl.attempt_count(), 0);
    }
}
