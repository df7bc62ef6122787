//! Retry policy: exponential backoff with jitter and error classification.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::time::Duration;

/// How a transmission failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Transient; retry with backoff.
    Retryable,
    /// Permanent; do not retry.
    Fatal,
}

/// Exponential backoff profile.
///
/// `delay(attempt) = min(max_delay, base_delay * multiplier^(attempt-1))`,
/// with uniform jitter of ±25 % applied to the capped delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the given attempt number (1-based), jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let exp = self.multiplier.powi(attempt as i32 - 1);
        let raw = self.base_delay.as_secs_f64() * exp;
        let capped = raw.min(self.max_delay.as_secs_f64());

        let jitter = rand::thread_rng().gen_range(-0.25..=0.25);
        let jittered = (capped * (1.0 + jitter)).max(0.0);
        Duration::from_secs_f64(jittered)
    }

    /// Next run instant after a failure on `attempt` (1-based), honoring an
    /// upstream `Retry-After` when it is longer than our own backoff but
    /// clamping it to the cap.
    pub fn next_run_at(
        &self,
        now: DateTime<Utc>,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> DateTime<Utc> {
        let mut delay = self.delay(attempt);
        if let Some(after) = retry_after {
            let after = after.min(self.max_delay);
            if after > delay {
                delay = after;
            }
        }
        now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(1))
    }
}

/// Classify an HTTP response status from an outbound call.
///
/// 429 and upstream 5xx gateway classes retry; the 4xx request classes are
/// application-logic rejections and never retry.
pub fn classify_status(status: u16) -> RetryClass {
    match status {
        429 | 502 | 503 | 504 => RetryClass::Retryable,
        400 | 401 | 403 | 404 | 409 => RetryClass::Fatal,
        s if (500..600).contains(&s) => RetryClass::Retryable,
        s if (400..500).contains(&s) => RetryClass::Fatal,
        _ => RetryClass::Retryable,
    }
}

/// Classify a transport-level failure (no HTTP status available).
/// Connection resets, refusals, DNS failures and timeouts all retry.
pub fn classify_transport_error() -> RetryClass {
    RetryClass::Retryable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        // Jitter is ±25%, so bound-check rather than equality-check.
        let d1 = policy.delay(1);
        assert!(d1 >= Duration::from_millis(750) && d1 <= Duration::from_millis(1250));

        let d2 = policy.delay(2);
        assert!(d2 >= Duration::from_millis(1500) && d2 <= Duration::from_millis(2500));

        // Attempt 10 would be 512s uncapped; must stay within 10s ± 25%.
        let d10 = policy.delay(10);
        assert!(d10 <= Duration::from_millis(12_500));
        assert!(d10 >= Duration::from_millis(7_500));
    }

    #[test]
    fn zero_attempt_treated_as_first() {
        let policy = RetryPolicy::default();
        let d = policy.delay(0);
        assert!(d <= Duration::from_millis(1250));
    }

    #[test]
    fn retry_after_extends_but_clamps() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        let at = policy.next_run_at(now, 1, Some(Duration::from_secs(8)));
        assert!(at >= now + ChronoDuration::seconds(7));

        // Retry-After beyond the cap is clamped to max_delay.
        let at = policy.next_run_at(now, 1, Some(Duration::from_secs(3600)));
        assert!(at <= now + ChronoDuration::seconds(11));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(429), RetryClass::Retryable);
        assert_eq!(classify_status(502), RetryClass::Retryable);
        assert_eq!(classify_status(503), RetryClass::Retryable);
        assert_eq!(classify_status(504), RetryClass::Retryable);
        assert_eq!(classify_status(500), RetryClass::Retryable);

        assert_eq!(classify_status(400), RetryClass::Fatal);
        assert_eq!(classify_status(401), RetryClass::Fatal);
        assert_eq!(classify_status(403), RetryClass::Fatal);
        assert_eq!(classify_status(404), RetryClass::Fatal);
        assert_eq!(classify_status(409), RetryClass::Fatal);
        assert_eq!(classify_status(422), RetryClass::Fatal);
    }
}
