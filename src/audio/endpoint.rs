//! Endpointing: how much trailing silence closes an utterance

use serde::Deserialize;

/// Trailing-silence policy parameters, fixed for one recording session
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct EndpointPolicy {
    /// Tail used once the room has gone quiet
    pub base_tail_ms: u64,
    /// Tail used while energy stays above the floor on a longer utterance
    pub max_tail_ms: u64,
    /// RMS energy below which a chunk counts as quiet
    pub energy_floor: f32,
}

impl Default for EndpointPolicy {
    fn default() -> Self {
        Self {
            base_tail_ms: 1200,
            max_tail_ms: 2800,
            energy_floor: 0.015,
        }
    }
}

impl EndpointPolicy {
    /// Silence timeout for the current chunk
    ///
    /// Quiet tails close fast regardless of utterance length; a short
    /// utterance with residual energy gets 80% of the base tail; anything
    /// else gets the long tail.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn next_timeout_ms(&self, recent_energy: f32, is_short_utterance: bool) -> u64 {
        if recent_energy < self.energy_floor {
            self.base_tail_ms
        } else if is_short_utterance {
            (self.base_tail_ms as f64 * 0.8) as u64
        } else {
            self.max_tail_ms
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_quiet_tail_uses_base() {
        let policy = EndpointPolicy::default();
        assert_eq!(policy.next_timeout_ms(0.001, false), 1200);
        assert_eq!(policy.next_timeout_ms(0.001, true), 1200);
    }

    #[test]
    fn test_short_utterance_uses_reduced_base() {
        let policy = EndpointPolicy::default();
        assert_eq!(policy.next_timeout_ms(0.2, true), 960);
    }

    #[test]
    fn test_long_utterance_uses_max() {
        let policy = EndpointPolicy::default();
        assert_eq!(policy.next_timeout_ms(0.2, false), 2800);
    }

    #[test]
    fn test_energy_at_floor_is_not_quiet() {
        let policy = EndpointPolicy::default();
        assert_eq!(policy.next_timeout_ms(policy.energy_floor, false), 2800);
    }

    proptest! {
        #[test]
        fn below_floor_always_returns_base(
            energy in 0.0f32..0.015,
            short in any::<bool>(),
            base in 1u64..10_000,
        ) {
            let policy = EndpointPolicy { base_tail_ms: base, ..EndpointPolicy::default() };
            prop_assert_eq!(policy.next_timeout_ms(energy, short), base);
        }

        #[test]
        fn repeated_calls_are_stable(energy in 0.0f32..1.0, short in any::<bool>()) {
            let policy = EndpointPolicy::default();
            let first = policy.next_timeout_ms(energy, short);
            for _ in 0..4 {
                prop_assert_eq!(policy.next_timeout_ms(energy, short), first);
            }
        }
    }
}
