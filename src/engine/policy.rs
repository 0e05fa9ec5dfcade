//! CHECK polling policy. Reference: spec section 4.C.

use std::sync::Arc;

/// Default staircase of delays (ms) between CHECK polls, indexed by attempt
/// number and clamped at the last element once attempts exceed its length.
pub const DEFAULT_STAIRCASE: &[u64] = &[50, 50, 100, 100, 250, 250, 500, 500, 1000];

/// How long to wait before the next CHECK, as a function of the attempt
/// index (0-based).
#[derive(Clone)]
pub enum PollingPolicy {
    /// The built-in staircase (spec section 4.C).
    Staircase,
    /// A fixed delay for every attempt.
    Fixed(u64),
    /// An arbitrary function of the attempt index.
    Custom(Arc<dyn Fn(u32) -> u64 + Send + Sync>),
}

impl std::fmt::Debug for PollingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollingPolicy::Staircase => write!(f, "PollingPolicy::Staircase"),
            PollingPolicy::Fixed(ms) => write!(f, "PollingPolicy::Fixed({ms})"),
            PollingPolicy::Custom(_) => write!(f, "PollingPolicy::Custom(..)"),
        }
    }
}

impl Default for PollingPolicy {
    fn default() -> Self {
        PollingPolicy::Staircase
    }
}

impl PollingPolicy {
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        match self {
            PollingPolicy::Staircase => {
                let idx = (attempt as usize).min(DEFAULT_STAIRCASE.len() - 1);
                DEFAULT_STAIRCASE[idx]
            }
            PollingPolicy::Fixed(ms) => *ms,
            PollingPolicy::Custom(f) => f(attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staircase_matches_spec_table() {
        let policy = PollingPolicy::Staircase;
        let expected = [50, 50, 100, 100, 250, 250, 500, 500, 1000];
        for (i, &want) in expected.iter().enumerate() {
            assert_eq!(policy.delay_ms(i as u32), want);
        }
    }

    #[test]
    fn staircase_clamps_past_last_entry() {
        let policy = PollingPolicy::Staircase;
        assert_eq!(policy.delay_ms(100), 1000);
    }

    #[test]
    fn fixed_is_constant() {
        let policy = PollingPolicy::Fixed(77);
        assert_eq!(policy.delay_ms(0), 77);
        assert_eq!(policy.delay_ms(50), 77);
    }

    #[test]
    fn custom_calls_function() {
        let policy = PollingPolicy::Custom(Arc::new(|attempt| attempt as u64 * 10));
        assert_eq!(policy.delay_ms(3), 30);
    }
}
