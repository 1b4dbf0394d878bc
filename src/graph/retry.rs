//! Retry policy for transient Graph API statuses.

use std::time::Duration;

/// Statuses worth retrying: throttling and server-side failures.
pub const TRANSIENT_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

/// Returns `true` if a response with this status should be retried.
pub fn is_transient(status: u16) -> bool {
    TRANSIENT_STATUSES.contains(&status)
}

/// Longest delay honoured between two attempts.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Delay before the next attempt.
///
/// A numeric `Retry-After` hint wins (floored at half a second);
/// otherwise exponential backoff: 1s, 2s, 4s, ... Both are capped at
/// [`MAX_RETRY_DELAY`].
pub fn retry_delay(retry_after: Option<&str>, attempt: u32) -> Duration {
    let hinted = retry_after
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite())
        .and_then(|secs| {
            Duration::try_from_secs_f64(secs.clamp(0.5, MAX_RETRY_DELAY.as_secs_f64())).ok()
        });
    hinted
        .unwrap_or_else(|| Duration::from_secs(1u64 << attempt.min(16)))
        .min(MAX_RETRY_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient(429));
        assert!(is_transient(503));
        assert!(!is_transient(404));
        assert!(!is_transient(501));
    }

    #[test]
    fn test_retry_after_hint_is_honored() {
        assert_eq!(retry_delay(Some("3"), 0), Duration::from_secs(3));
        assert_eq!(retry_delay(Some("0"), 4), Duration::from_millis(500));
        assert_eq!(retry_delay(Some("1e30"), 0), MAX_RETRY_DELAY);
        assert_eq!(retry_delay(Some("86400"), 0), MAX_RETRY_DELAY);
        // Non-finite hints fall back to backoff
        assert_eq!(retry_delay(Some("NaN"), 1), Duration::from_secs(2));
        assert_eq!(retry_delay(Some("inf"), 2), Duration::from_secs(4));
    }

    #[test]
    fn test_exponential_backoff_without_hint() {
        assert_eq!(retry_delay(None, 0), Duration::from_secs(1));
        assert_eq!(retry_delay(None, 2), Duration::from_secs(4));
        assert_eq!(retry_delay(None, 40), MAX_RETRY_DELAY);
        // HTTP-date hints are not numeric; fall back to backoff
        assert_eq!(
            retry_delay(Some("Wed, 21 Oct 2015 07:28:00 GMT"), 1),
            Duration::from_secs(2)
        );
    }
}
