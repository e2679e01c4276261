//! Exponential retry delays with jitter.

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `attempt` (1-based).
///
/// The nominal delay is `base * 2^(attempt - 1)` capped at `max`; the returned
/// value is drawn uniformly from the upper half of that so that workers
/// retrying together spread out.
pub fn backoff_delay(attempt: u32, (base_ms, max_ms): (u64, u64)) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let nominal = base_ms.saturating_mul(1u64 << exponent).min(max_ms);
    if nominal == 0 {
        return Duration::ZERO;
    }
    let mut rng = rand::thread_rng();
    let delay = rng.gen_range(nominal / 2..=nominal);
    Duration::from_millis(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let range = (1000, 8000);
        for _ in 0..50 {
            let first = backoff_delay(1, range).as_millis();
            assert!((500..=1000).contains(&first), "{first}");

            let third = backoff_delay(3, range).as_millis();
            assert!((2000..=4000).contains(&third), "{third}");

            let tenth = backoff_delay(10, range).as_millis();
            assert!((4000..=8000).contains(&tenth), "{tenth}");
        }
    }

    #[test]
    fn test_backoff_survives_huge_attempts() {
        let delay = backoff_delay(u32::MAX, (1000, 60_000));
        assert!(delay <= Duration::from_secs(60));
    }

    #[test]
    fn test_zero_range_means_no_wait() {
        assert_eq!(backoff_delay(4, (0, 0)), Duration::ZERO);
    }
}
