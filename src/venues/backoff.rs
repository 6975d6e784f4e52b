// =============================================================================
// Reconnect Backoff — shared delay policy for all venue streams
// =============================================================================
//
// Normal failures: 5 s doubling to a 60 s cap, reset to 5 s once a
// connection subscribes successfully. Rate-limited failures sleep three
// times the current delay (capped at 300 s) while the underlying delay
// still doubles toward the normal cap.
// =============================================================================

use std::time::Duration;

const INITIAL_DELAY: Duration = Duration::from_secs(5);
const MAX_DELAY: Duration = Duration::from_secs(60);
const MAX_RATE_LIMIT_DELAY: Duration = Duration::from_secs(300);

/// Per-adapter reconnect delay state.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    /// Set while consecutive failures are rate-limit shaped, so the
    /// transition into the limited state is only logged once.
    rate_limited: bool,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current: INITIAL_DELAY,
            rate_limited: false,
        }
    }

    /// Reset to the initial delay. Called after a successful
    /// handshake-and-subscribe.
    pub fn reset(&mut self) {
        self.current = INITIAL_DELAY;
        self.rate_limited = false;
    }

    /// Delay to sleep before the next attempt; advances the sequence
    /// {5, 10, 20, 40, 60, 60, ...}.
    pub fn next_delay(&mut self) -> Duration {
        self.rate_limited = false;
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_DELAY);
        delay
    }

    /// Delay to sleep after a rate-limited failure: three times the
    /// current delay, capped at five minutes. Returns `(delay,
    /// first_transition)` where the flag is true only on the first
    /// rate-limited failure since the last success, so callers can log
    /// the transition exactly once.
    pub fn next_delay_rate_limited(&mut self) -> (Duration, bool) {
        let first = !self.rate_limited;
        self.rate_limited = true;
        let delay = (self.current * 3).min(MAX_RATE_LIMIT_DELAY);
        self.current = (self.current * 2).min(MAX_DELAY);
        (delay, first)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether an error chain looks like venue rate limiting. Stream errors
/// surface as handshake failures whose text carries the HTTP status.
pub fn is_rate_limit_error(err: &anyhow::Error) -> bool {
    let text = format!("{err:#}").to_ascii_lowercase();
    text.contains("429") || text.contains("rate limit")
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_sequence_doubles_to_the_cap() {
        let mut b = Backoff::new();
        let secs: Vec<u64> = (0..6).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn reset_returns_to_initial_delay() {
        let mut b = Backoff::new();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn rate_limited_delay_is_tripled_and_capped() {
        let mut b = Backoff::new();
        let (d1, first1) = b.next_delay_rate_limited();
        assert_eq!(d1, Duration::from_secs(15));
        assert!(first1);

        // Underlying delay doubled to 10 s, so the next limited sleep is 30 s
        // and it is no longer the first transition.
        let (d2, first2) = b.next_delay_rate_limited();
        assert_eq!(d2, Duration::from_secs(30));
        assert!(!first2);

        // Drive the underlying delay to its cap; limited sleeps cap at 300 s.
        for _ in 0..10 {
            b.next_delay_rate_limited();
        }
        let (d, _) = b.next_delay_rate_limited();
        assert_eq!(d, Duration::from_secs(180));
    }

    #[test]
    fn success_after_rate_limit_clears_the_transition_flag() {
        let mut b = Backoff::new();
        let (_, first) = b.next_delay_rate_limited();
        assert!(first);
        b.reset();
        let (_, first_again) = b.next_delay_rate_limited();
        assert!(first_again);
    }

    #[test]
    fn rate_limit_detection_matches_status_and_phrase() {
        assert!(is_rate_limit_error(&anyhow::anyhow!(
            "HTTP error: 429 Too Many Requests"
        )));
        assert!(is_rate_limit_error(&anyhow::anyhow!("Rate limit exceeded")));
        assert!(!is_rate_limit_error(&anyhow::anyhow!("connection reset")));
    }
}
