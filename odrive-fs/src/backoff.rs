use std::time::Duration;

use rand::Rng;

/// Exponential backoff with full jitter, capped at `cap`. Used between
/// attempts of a retryable listing or chunk-upload request.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        let ceiling = self.ceiling(attempt);
        Duration::from_millis(rng.gen_range(0..=ceiling))
    }

    /// Deterministic variant: the full exponential ceiling for `attempt`,
    /// without jitter.
    pub fn ceiling_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.ceiling(attempt))
    }

    fn ceiling(&self, attempt: u32) -> u64 {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let cap_ms = self.cap.as_millis().min(u128::from(u64::MAX)) as u64;
        base_ms.saturating_mul(1u64 << attempt.min(16)).min(cap_ms)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(10))
    }
}
