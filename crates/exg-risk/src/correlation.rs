//! Rolling pairwise return correlation.
//!
//! Used by the sizing veto: a candidate whose symbol moves with an
//! existing position concentrates risk instead of diversifying it.

use rust_decimal::{Decimal, MathematicalOps};

/// Minimum aligned observations before a correlation estimate is usable.
pub const MIN_CORRELATION_SAMPLES: usize = 10;

/// Pearson correlation over the aligned tails of two return series.
///
/// Series may have different lengths; only the overlapping tail is used.
/// Returns `None` when fewer than `MIN_CORRELATION_SAMPLES` observations
/// align or either series is constant.
pub fn pairwise_correlation(a: &[Decimal], b: &[Decimal]) -> Option<Decimal> {
    let n = a.len().min(b.len());
    if n < MIN_CORRELATION_SAMPLES {
        return None;
    }
    let a = &a[a.len() - n..];
    let b = &b[b.len() - n..];
    let count = Decimal::from(n as u64);

    let mean_a: Decimal = a.iter().copied().sum::<Decimal>() / count;
    let mean_b: Decimal = b.iter().copied().sum::<Decimal>() / count;

    let mut cov = Decimal::ZERO;
    let mut var_a = Decimal::ZERO;
    let mut var_b = Decimal::ZERO;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    if var_a.is_zero() || var_b.is_zero() {
        return None;
    }
    let denom = var_a.sqrt()? * var_b.sqrt()?;
    if denom.is_zero() {
        return None;
    }
    Some(cov / denom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_perfect_positive_correlation() {
        let a: Vec<Decimal> = (0..12).map(|i| Decimal::from(i) * dec!(0.001)).collect();
        let rho = pairwise_correlation(&a, &a).unwrap();
        assert!((rho - Decimal::ONE).abs() < dec!(0.0001));
    }

    #[test]
    fn test_perfect_negative_correlation() {
        let a: Vec<Decimal> = (0..12).map(|i| Decimal::from(i) * dec!(0.001)).collect();
        let b: Vec<Decimal> = a.iter().map(|r| -*r).collect();
        let rho = pairwise_correlation(&a, &b).unwrap();
        assert!((rho + Decimal::ONE).abs() < dec!(0.0001));
    }

    #[test]
    fn test_insufficient_samples() {
        let a = vec![dec!(0.001); 5];
        assert!(pairwise_correlation(&a, &a).is_none());
    }

    #[test]
    fn test_constant_series_undefined() {
        let a = vec![dec!(0.001); 20];
        let b: Vec<Decimal> = (0..20).map(|i| Decimal::from(i) * dec!(0.001)).collect();
        assert!(pairwise_correlation(&a, &b).is_none());
    }

    #[test]
    fn test_uses_aligned_tail() {
        // Long series vs short one: only the tail overlap matters.
        let mut a: Vec<Decimal> = vec![dec!(0.5); 50];
        a.extend((0..12).map(|i| Decimal::from(i) * dec!(0.001)));
        let b: Vec<Decimal> = (0..12).map(|i| Decimal::from(i) * dec!(0.001)).collect();
        let rho = pairwise_correlation(&a, &b).unwrap();
        assert!((rho - Decimal::ONE).abs() < dec!(0.0001));
    }
}
