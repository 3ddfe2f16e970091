//! Confidence scoring.
//!
//! Scores are exponentially weighted moving averages of execution outcomes:
//! `c' = (1 - alpha) * c + alpha * outcome`, where `outcome` is 1.0 for a
//! success and 0.0 for a failure. Recent runs dominate, so a workflow that
//! starts failing after a site redesign loses confidence within a few runs.

/// Apply one outcome to a confidence score. The result stays in `[0, 1]`.
pub fn apply_outcome(current: f64, success: bool, alpha: f64) -> f64 {
    let alpha = alpha.clamp(0.0, 1.0);
    let outcome = if success { 1.0 } else { 0.0 };
    ((1.0 - alpha) * current + alpha * outcome).clamp(0.0, 1.0)
}

/// Mean of a set of scores, `None` when empty.
pub fn mean(scores: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = scores
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), s| (sum + s, count + 1));
    (count > 0).then(|| sum / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_moves_towards_one() {
        let c = apply_outcome(0.5, true, 0.2);
        assert!((c - 0.6).abs() < 1e-9);
    }

    #[test]
    fn failure_moves_towards_zero() {
        let c = apply_outcome(0.5, false, 0.2);
        assert!((c - 0.4).abs() < 1e-9);
    }

    #[test]
    fn repeated_failures_decay_but_stay_bounded() {
        let mut c = 0.95;
        for _ in 0..100 {
            c = apply_outcome(c, false, 0.2);
        }
        assert!(c >= 0.0 && c < 0.01);
    }

    #[test]
    fn mean_of_empty_is_none() {
        assert_eq!(mean(Vec::<f64>::new()), None);
        let m = mean([0.4, 0.8]).unwrap();
        assert!((m - 0.6).abs() < 1e-9);
    }
}
