use crate::error::MarkowitzError;
use crate::MarkowitzResult;

/// Allowed slack on the sum-to-one and [0, 1] checks.
pub const WEIGHT_TOLERANCE: f64 = 1e-9;

/// Equal weights for n assets.
pub fn equal_weights(n: usize) -> Vec<f64> {
    vec![1.0 / n as f64; n]
}

/// Check a fully invested long-only allocation over `n` assets.
///
/// Never rescales: a vector that fails is reported, not repaired.
pub fn validate_weights(weights: &[f64], n: usize) -> MarkowitzResult<()> {
    if weights.len() != n {
        return Err(MarkowitzError::ConstraintViolation {
            reason: format!("Expected {} weights but got {}", n, weights.len()),
        });
    }
    for (i, w) in weights.iter().enumerate() {
        if !w.is_finite() {
            return Err(MarkowitzError::ConstraintViolation {
                reason: format!("Weight {} is not finite ({})", i, w),
            });
        }
        if *w < -WEIGHT_TOLERANCE || *w > 1.0 + WEIGHT_TOLERANCE {
            return Err(MarkowitzError::ConstraintViolation {
                reason: format!("Weight {} = {} outside [0, 1]", i, w),
            });
        }
    }
    let total: f64 = weights.iter().sum();
    if (total - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(MarkowitzError::ConstraintViolation {
            reason: format!("Weights sum to {} instead of 1", total),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_weights() {
        let w = equal_weights(4);
        assert_eq!(w, vec![0.25; 4]);
        assert!(validate_weights(&w, 4).is_ok());
    }

    #[test]
    fn test_equal_weights_sum_within_tolerance() {
        for n in 1..50 {
            let w = equal_weights(n);
            assert!(validate_weights(&w, n).is_ok(), "n = {n}");
        }
    }

    #[test]
    fn test_sum_not_one_rejected() {
        assert!(matches!(
            validate_weights(&[0.5, 0.4], 2),
            Err(MarkowitzError::ConstraintViolation { .. })
        ));
    }

    #[test]
    fn test_negative_weight_rejected() {
        assert!(validate_weights(&[1.2, -0.2], 2).is_err());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        assert!(validate_weights(&[1.0], 2).is_err());
    }

    #[test]
    fn test_nan_rejected() {
        assert!(validate_weights(&[f64::NAN, 1.0], 2).is_err());
    }

    #[test]
    fn test_rounding_slack_accepted() {
        assert!(validate_weights(&[0.1, 0.2, 0.7 + 1e-12], 3).is_ok());
    }
}
