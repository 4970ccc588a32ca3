//! Reconnect backoff.

use std::time::Duration;

/// Double `current_ms`, capped at `max_ms`.
pub fn calculate_backoff(current_ms: u64, max_ms: u64) -> u64 {
    current_ms.saturating_mul(2).min(max_ms)
}

/// Exponential backoff state for one reconnecting endpoint.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    current_ms: u64,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        let initial_ms = initial_ms.max(1).min(max_ms.max(1));
        Self {
            initial_ms,
            max_ms: max_ms.max(initial_ms),
            current_ms: initial_ms,
        }
    }

    /// Delay to wait before the next attempt; grows the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_ms;
        self.current_ms = calculate_backoff(self.current_ms, self.max_ms);
        Duration::from_millis(delay)
    }

    pub fn reset(&mut self) {
        self.current_ms = self.initial_ms;
    }

    pub fn current_ms(&self) -> u64 {
        self.current_ms
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exponential_backoff_calculation() {
        assert_eq!(calculate_backoff(1000, 30000), 2000);
        assert_eq!(calculate_backoff(2000, 30000), 4000);
        assert_eq!(calculate_backoff(16000, 30000), 30000);
        assert_eq!(calculate_backoff(30000, 30000), 30000);
    }

    #[test]
    fn test_backoff_sequence_and_reset() {
        let mut backoff = Backoff::new(1000, 30000);
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
    }

    proptest! {
        #[test]
        fn prop_backoff_never_exceeds_cap(initial in 1u64..100_000, max in 1u64..100_000, steps in 0usize..64) {
            let mut backoff = Backoff::new(initial, max);
            for _ in 0..steps {
                let delay = backoff.next_delay().as_millis() as u64;
                prop_assert!(delay <= max.max(1));
            }
        }
    }
}
