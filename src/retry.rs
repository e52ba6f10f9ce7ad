//! Retry backoff policy.
//!
//! Delay before a retried job becomes eligible again:
//! `base * 2^retry_count`, capped, with ±25% jitter to avoid retry
//! stampedes when many jobs fail at once. The Job Store expresses the
//! result as a `not_before` timestamp honored by `claim_next`.

use std::time::Duration;

use rand::Rng;

/// Jitter spread around the capped exponential delay.
const JITTER_FRACTION: f64 = 0.25;

/// Compute the backoff delay for the given retry count.
pub fn backoff_delay(base: Duration, cap: Duration, retry_count: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(retry_count.min(30)));
    let capped = exp.min(cap);
    let factor = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
    capped.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(5);
    const CAP: Duration = Duration::from_secs(300);

    #[test]
    fn delay_grows_exponentially() {
        // Jitter is ±25%, so bound-check rather than compare exactly.
        let d0 = backoff_delay(BASE, CAP, 0);
        assert!(d0 >= BASE.mul_f64(0.75) && d0 <= BASE.mul_f64(1.25));

        let d3 = backoff_delay(BASE, CAP, 3);
        let nominal = BASE * 8;
        assert!(d3 >= nominal.mul_f64(0.75) && d3 <= nominal.mul_f64(1.25));
    }

    #[test]
    fn delay_is_capped() {
        let d = backoff_delay(BASE, CAP, 20);
        assert!(d <= CAP.mul_f64(1.25));
    }

    #[test]
    fn huge_retry_count_does_not_overflow() {
        let d = backoff_delay(BASE, CAP, u32::MAX);
        assert!(d <= CAP.mul_f64(1.25));
    }
}
