use std::time::Duration;

/// Exponential backoff with bounded, deterministic jitter.
///
/// The delay for attempt `n` (zero based) is `min(max, base * 2^n)` reduced by
/// up to `jitter_ratio` of itself. Jitter only ever shortens the delay, so no
/// delay exceeds `max`, and it is derived from `seed` so two links with
/// different client ids spread their retries while a single link stays
/// reproducible.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter_ratio: f64,
    pub seed: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter_ratio: 0.1,
            seed: 0,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter_ratio: f64) -> Self {
        Self {
            base,
            max,
            jitter_ratio: bounded_ratio(jitter_ratio),
            seed: 0,
        }
    }

    /// Seeds the jitter from a stable key such as the client id.
    pub fn seeded_from(mut self, key: &str) -> Self {
        self.seed = fnv1a(key.as_bytes());
        self
    }

    /// Delay before the connect attempt that follows `attempt` failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self.ceiling(attempt);
        let jitter = bounded_ratio(self.jitter_ratio) * unit_interval(self.seed, attempt);
        capped.saturating_sub(capped.mul_f64(jitter))
    }

    /// Delay without jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// NaN and infinities mean no jitter.
fn bounded_ratio(ratio: f64) -> f64 {
    if ratio.is_finite() {
        ratio.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

/// splitmix64 of `(seed, attempt)` mapped to `[0, 1)`.
fn unit_interval(seed: u64, attempt: u32) -> f64 {
    let mut z = seed.wrapping_add(u64::from(attempt).wrapping_mul(0x9e37_79b9_7f4a_7c15));
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_doubles_until_capped() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 0.0);
        let delays: Vec<u64> = (0..8).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(policy.delay(200), Duration::from_secs(60));
    }

    #[test]
    fn jitter_is_bounded_and_never_exceeds_max() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(5), 0.25)
            .seeded_from("factory-link-B7");
        for attempt in 0..64 {
            let ceiling = policy.ceiling(attempt);
            let delay = policy.delay(attempt);
            assert!(delay <= ceiling, "attempt {attempt}");
            assert!(delay >= ceiling.mul_f64(0.75), "attempt {attempt}");
            assert!(delay <= policy.max);
        }
    }

    #[test]
    fn non_finite_jitter_ratio_means_no_jitter() {
        for ratio in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60), ratio)
                .seeded_from("client-a");
            assert_eq!(policy.jitter_ratio, 0.0);
            assert_eq!(policy.delay(2), Duration::from_secs(4));
        }

        let mut policy = BackoffPolicy::default().seeded_from("client-a");
        policy.jitter_ratio = f64::NAN;
        assert_eq!(policy.delay(0), Duration::from_secs(1));
    }

    #[test]
    fn jitter_is_deterministic_per_seed() {
        let a = BackoffPolicy::default().seeded_from("client-a");
        let b = BackoffPolicy::default().seeded_from("client-b");
        assert_eq!(a.delay(3), a.clone().delay(3));
        assert!((0..16).any(|n| a.delay(n) != b.delay(n)));
    }
}
