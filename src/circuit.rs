use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use log::{info, warn};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    Other,
}

/// What the breaker allows for a target right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Open; the last failure kind decides how the short-circuit is reported.
    Rejected(FailureKind),
}

#[derive(Debug, Default)]
struct TargetHealth {
    consecutive_failures: u32,
    last_failure: Option<FailureKind>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Per-target consecutive-failure breaker.
///
/// After `threshold` consecutive failures the target is open. Once `cooldown`
/// has elapsed a single trial request is let through; its success closes the
/// target again, its failure re-opens it.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    targets: Mutex<HashMap<String, TargetHealth>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            threshold: threshold.max(1),
            cooldown,
            targets: Mutex::new(HashMap::new()),
        }
    }

    pub fn admit(&self, target: &str) -> Admission {
        let mut targets = self.targets.lock().unwrap_or_else(|p| p.into_inner());
        let health = targets.entry(target.to_string()).or_default();
        match health.opened_at {
            None => Admission::Allowed,
            Some(opened) => {
                let kind = health.last_failure.unwrap_or(FailureKind::Other);
                if health.trial_in_flight || opened.elapsed() < self.cooldown {
                    Admission::Rejected(kind)
                } else {
                    info!("Circuit for {} half-open, allowing one trial", target);
                    health.trial_in_flight = true;
                    Admission::Allowed
                }
            }
        }
    }

    pub fn record_success(&self, target: &str) {
        let mut targets = self.targets.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(health) = targets.get_mut(target) {
            if health.opened_at.is_some() {
                info!("Circuit for {} closed", target);
            }
            *health = TargetHealth::default();
        }
    }

    pub fn record_failure(&self, target: &str, kind: FailureKind) {
        let mut targets = self.targets.lock().unwrap_or_else(|p| p.into_inner());
        let health = targets.entry(target.to_string()).or_default();
        health.consecutive_failures += 1;
        health.last_failure = Some(kind);
        health.trial_in_flight = false;
        if health.opened_at.is_some() {
            health.opened_at = Some(Instant::now());
        } else if health.consecutive_failures >= self.threshold {
            warn!(
                "Circuit for {} opened after {} consecutive failures",
                target, health.consecutive_failures
            );
            health.opened_at = Some(Instant::now());
        }
    }

    pub fn is_open(&self, target: &str) -> bool {
        let targets = self.targets.lock().unwrap_or_else(|p| p.into_inner());
        targets.get(target).map_or(false, |h| h.opened_at.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        for _ in 0..2 {
            assert_eq!(breaker.admit("api"), Admission::Allowed);
            breaker.record_failure("api", FailureKind::Other);
        }
        assert!(!breaker.is_open("api"));
        breaker.record_failure("api", FailureKind::RateLimited);
        assert!(breaker.is_open("api"));
        assert_eq!(breaker.admit("api"), Admission::Rejected(FailureKind::RateLimited));
        // other targets unaffected
        assert_eq!(breaker.admit("search"), Admission::Allowed);
    }

    #[test]
    fn success_resets_the_count() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure("api", FailureKind::Other);
        breaker.record_success("api");
        breaker.record_failure("api", FailureKind::Other);
        assert!(!breaker.is_open("api"));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_allows_single_trial_after_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        breaker.record_failure("api", FailureKind::Other);
        assert_eq!(breaker.admit("api"), Admission::Rejected(FailureKind::Other));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(breaker.admit("api"), Admission::Allowed);
        assert_eq!(breaker.admit("api"), Admission::Rejected(FailureKind::Other));

        breaker.record_success("api");
        assert!(!breaker.is_open("api"));
        assert_eq!(breaker.admit("api"), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        breaker.record_failure("api", FailureKind::Other);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(breaker.admit("api"), Admission::Allowed);
        breaker.record_failure("api", FailureKind::Other);
        assert_eq!(breaker.admit("api"), Admission::Rejected(FailureKind::Other));
    }
}
