//! Given historical per-minute counts and a new count, decides whether the
//! new count is an elevated outlier versus the baseline, using a Poisson
//! tail probability computed with arbitrary-precision arithmetic so large
//! means (≥ 700) don't underflow a native float.

use bigdecimal::{BigDecimal, FromPrimitive, ToPrimitive};

/// `(expected, probability_elevated)`.
pub fn analyze(historical_counts: &[i64], recent_count: i64) -> (f64, f64) {
    if historical_counts.is_empty() {
        return (0.0, 0.0);
    }

    let mean = historical_counts.iter().sum::<i64>() as f64 / historical_counts.len() as f64;
    if (recent_count as f64) < mean {
        return (mean, 0.0);
    }

    let expected = mean.max(1.0);
    let k = recent_count.max(0) as u64;
    let probability = poisson_cdf(k, expected);
    (expected, probability.clamp(0.0, 1.0))
}

/// `P(X <= k)` for `X ~ Poisson(lambda)`, accumulated in `BigDecimal` so the
/// running sum keeps precision as terms for large `lambda` shrink far below
/// `f64`'s useful range before the cumulative sum approaches 1.
fn poisson_cdf(k: u64, lambda: f64) -> f64 {
    if lambda <= 0.0 {
        return 1.0;
    }
    let lambda_bd = BigDecimal::from_f64(lambda).unwrap_or_else(|| BigDecimal::from(0));
    let mut term = exp_neg(lambda);
    let mut sum = term.clone();
    for i in 1..=k {
        term = (term * lambda_bd.clone()) / BigDecimal::from(i);
        sum += term.clone();
    }
    sum.to_f64().unwrap_or(1.0).clamp(0.0, 1.0)
}

/// `exp(-x)` in `BigDecimal`, for `x >= 0`. `f64::exp` underflows to exactly
/// 0 once `x` exceeds ~745, which would zero out every subsequent term in
/// `poisson_cdf`'s running product no matter how large `lambda` grows.
/// Halving `x` down into Taylor-series range and squaring the result back up
/// keeps the true (nonzero, sub-f64-denormal) magnitude through to the point
/// in the recurrence where it grows back into a representable range.
fn exp_neg(x: f64) -> BigDecimal {
    let mut reduced = x;
    let mut halvings = 0u32;
    while reduced > 1.0 {
        reduced /= 2.0;
        halvings += 1;
    }

    let neg_reduced = BigDecimal::from_f64(-reduced).unwrap_or_else(|| BigDecimal::from(0));
    let mut term = BigDecimal::from(1);
    let mut sum = BigDecimal::from(1);
    for n in 1..=30u64 {
        term = (term * neg_reduced.clone()) / BigDecimal::from(n);
        sum += term.clone();
    }

    for _ in 0..halvings {
        sum = &sum * &sum;
    }
    sum
}

/// The caller's significance test: an error is worth surfacing iff the
/// baseline probability clears the threshold and either the raw count is
/// high enough on its own, or it's a small count for a key never seen
/// under any reference version (a brand-new error showing up even a
/// handful of times is itself informative). `recent_count == 1` is always
/// ignored — too weak a signal either way.
pub fn is_significant(probability: f64, recent_count: i64, never_seen_under_reference: bool) -> bool {
    if recent_count == 1 {
        return false;
    }
    if probability < 0.9995 {
        return false;
    }
    recent_count >= 5 || ((2..=4).contains(&recent_count) && never_seen_under_reference)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_history_yields_zero_zero() {
        assert_eq!(analyze(&[], 10), (0.0, 0.0));
    }

    #[test]
    fn recent_below_mean_is_never_elevated() {
        let (_, p) = analyze(&[10, 10, 10], 5);
        assert_eq!(p, 0.0);
    }

    #[test]
    fn probability_is_monotone_in_recent_count() {
        let history = vec![2, 3, 2, 4, 3];
        let mut last = 0.0;
        for recent in 0..20 {
            let (_, p) = analyze(&history, recent);
            assert!(p >= last, "probability decreased at recent_count={recent}");
            last = p;
        }
    }

    #[test]
    fn large_mean_does_not_panic_or_nan() {
        let history = vec![800; 30];
        let (expected, p) = analyze(&history, 950);
        assert_eq!(expected, 800.0);
        assert!(p.is_finite());
        assert!((0.0..=1.0).contains(&p));
    }

    #[test]
    fn large_mean_far_above_baseline_is_overwhelmingly_significant() {
        // mean=800, sd=sqrt(800)~28.3; 950 is ~5.3 sigma above the mean, so
        // the true CDF is extremely close to 1. A naive f64 seed for
        // exp(-800) underflows to exactly 0 and silently collapses this to
        // 0 instead — this is the case the BigDecimal seed exists for.
        let history = vec![800; 30];
        let (_, p) = analyze(&history, 950);
        assert!(p > 0.999, "expected near-certain elevation, got {p}");
    }

    #[test]
    fn large_mean_at_the_mean_is_middling_probability() {
        let history = vec![800; 30];
        let (_, p) = analyze(&history, 800);
        assert!((0.4..0.6).contains(&p), "expected ~0.5 at the mean, got {p}");
    }

    #[test]
    fn single_occurrence_never_significant() {
        assert!(!is_significant(0.9999, 1, true));
    }

    #[test]
    fn small_count_significant_only_if_unseen_under_reference() {
        assert!(is_significant(0.9996, 3, true));
        assert!(!is_significant(0.9996, 3, false));
    }

    #[test]
    fn high_count_significant_regardless_of_history() {
        assert!(is_significant(0.9996, 6, false));
    }
}
