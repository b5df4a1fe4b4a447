// Backoff extraction and the retry delay policy.
//
// Hints parsed from failure output constrain the retry sleep; absent a hint
// the policy is exponential with jitter, clamped to the orchestrator's
// ceiling.

use girder_types::{BackoffHint, BackoffHintSource};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

/// Hard ceiling on any retry sleep, hinted or not.
pub const MAX_BACKOFF_SECONDS: f64 = 60.0;

/// Jitter applied to computed delays, as a fraction of the base.
pub const BACKOFF_JITTER: f64 = 0.2;

static RETRY_AFTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Retry-After:\s*(\d+)").unwrap_or_else(|e| panic!("bad regex: {}", e))
});
static RATE_LIMIT_RESET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)X-RateLimit-Reset:\s*(\d+)").unwrap_or_else(|e| panic!("bad regex: {}", e))
});

/// Parse a backoff hint out of failure logs. `Retry-After` wins over
/// `X-RateLimit-Reset` when both are present.
pub fn extract_backoff_hint(logs: &str) -> Option<BackoffHint> {
    if let Some(caps) = RETRY_AFTER.captures(logs) {
        if let Ok(seconds) = caps[1].parse::<f64>() {
            return Some(BackoffHint {
                seconds,
                source: BackoffHintSource::RetryAfterHeader,
            });
        }
    }
    if let Some(caps) = RATE_LIMIT_RESET.captures(logs) {
        if let Ok(seconds) = caps[1].parse::<f64>() {
            return Some(BackoffHint {
                seconds,
                source: BackoffHintSource::RateLimitReset,
            });
        }
    }
    None
}

/// Retry delay policy. Stateless; attempt budgets live in `RetryState`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_seconds: f64,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_seconds: MAX_BACKOFF_SECONDS,
            jitter: BACKOFF_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Delay before re-running a step on its `attempt`-th retry (1-based).
    ///
    /// A hint is honored up to the clamp; otherwise `min(max, 2^attempt)`
    /// seconds with ±jitter.
    pub fn delay_seconds(&self, attempt: u32, hint: Option<BackoffHint>) -> f64 {
        let base = match hint {
            Some(hint) => hint.seconds,
            None => 2f64.powi(attempt.min(16) as i32),
        };
        let base = base.clamp(0.0, self.max_seconds);
        let jittered = base * (1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter));
        jittered.clamp(0.0, self.max_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_header_is_extracted() {
        let hint = extract_backoff_hint("HTTP 429\nRetry-After: 7\n").unwrap();
        assert_eq!(hint.seconds, 7.0);
        assert_eq!(hint.source, BackoffHintSource::RetryAfterHeader);
    }

    #[test]
    fn rate_limit_reset_is_a_fallback() {
        let hint = extract_backoff_hint("X-RateLimit-Reset: 30").unwrap();
        assert_eq!(hint.seconds, 30.0);
        assert_eq!(hint.source, BackoffHintSource::RateLimitReset);

        let both = extract_backoff_hint("Retry-After: 5\nX-RateLimit-Reset: 30").unwrap();
        assert_eq!(both.source, BackoffHintSource::RetryAfterHeader);
    }

    #[test]
    fn no_hint_in_clean_logs() {
        assert!(extract_backoff_hint("all fine").is_none());
    }

    #[test]
    fn exponential_delay_stays_within_jitter_band() {
        let policy = BackoffPolicy::default();
        for attempt in 1..=4u32 {
            let base = 2f64.powi(attempt as i32);
            for _ in 0..50 {
                let delay = policy.delay_seconds(attempt, None);
                assert!(delay >= base * 0.8 - 1e-9);
                assert!(delay <= base * 1.2 + 1e-9);
            }
        }
    }

    #[test]
    fn delays_are_clamped_to_ceiling() {
        let policy = BackoffPolicy::default();
        let hinted = policy.delay_seconds(
            1,
            Some(BackoffHint {
                seconds: 10_000.0,
                source: BackoffHintSource::RateLimitReset,
            }),
        );
        assert!(hinted <= MAX_BACKOFF_SECONDS);

        let exponential = policy.delay_seconds(30, None);
        assert!(exponential <= MAX_BACKOFF_SECONDS);
    }

    #[test]
    fn early_transient_retry_is_short() {
        // First retry: 2s base, ≤ 2.4s with jitter (scenario bound ≤ 4s).
        let policy = BackoffPolicy::default();
        let delay = policy.delay_seconds(1, None);
        assert!(delay <= 4.0);
    }
}
