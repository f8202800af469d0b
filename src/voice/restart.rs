//! Backoff for restarting wake-word listening after capture failures

use std::time::{Duration, SystemTime};

use crate::Error;

/// How listening is restarted after a recoverable capture failure
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Attempts before giving up
    pub max_retries: u32,
    /// Delay before the first retry (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Whether a listening failure is worth retrying
///
/// Device hiccups are transient. A denied or missing microphone and a
/// monitor that was never initialized need outside action first.
#[must_use]
pub const fn is_recoverable(err: &Error) -> bool {
    matches!(err, Error::Audio(_))
}

/// Delay before restart attempt `attempt` (zero-based)
///
/// `min(base_delay * 2^attempt + jitter, max_delay)`, with up to 25% jitter
/// taken from the system clock's subsecond nanos.
#[must_use]
pub fn delay_for_attempt(policy: &RestartPolicy, attempt: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(policy.max_delay);

    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let jitter = base.mul_f64(f64::from(nanos % 250) / 1000.0);

    (base + jitter).min(policy.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_audio_failures_recoverable() {
        assert!(is_recoverable(&Error::Audio("stream dropped".into())));
        assert!(!is_recoverable(&Error::Permission("denied".into())));
        assert!(!is_recoverable(&Error::Initialization("not armed".into())));
        assert!(!is_recoverable(&Error::Config("bad".into())));
    }

    #[test]
    fn exponential_growth() {
        let policy = RestartPolicy {
            base_delay: Duration::from_millis(100),
            ..RestartPolicy::default()
        };

        assert!(delay_for_attempt(&policy, 0) >= Duration::from_millis(100));
        assert!(delay_for_attempt(&policy, 1) >= Duration::from_millis(200));
        assert!(delay_for_attempt(&policy, 2) >= Duration::from_millis(400));
    }

    #[test]
    fn jitter_within_quarter() {
        let policy = RestartPolicy {
            base_delay: Duration::from_millis(1000),
            ..RestartPolicy::default()
        };

        for _ in 0..50 {
            let d = delay_for_attempt(&policy, 0);
            assert!(d >= Duration::from_millis(1000), "below base: {d:?}");
            assert!(d <= Duration::from_millis(1250), "above 125%: {d:?}");
        }
    }

    #[test]
    fn capped_at_max() {
        let policy = RestartPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(15),
            ..RestartPolicy::default()
        };

        assert!(delay_for_attempt(&policy, 3) <= policy.max_delay);
        assert!(delay_for_attempt(&policy, u32::MAX) <= policy.max_delay);
    }
}
