use serde::{Deserialize, Serialize};

use super::weights::validate_weights;
use crate::error::MarkowitzError;
use crate::statistics::Statistics;
use crate::types::Rate;
use crate::MarkowitzResult;

/// Negative variance tolerated as rounding before the matrix is blamed.
pub const VARIANCE_TOLERANCE: f64 = 1e-12;
/// Volatility at or below which the Sharpe ratio is undefined.
pub const VOLATILITY_EPSILON: f64 = 1e-10;

/// Annualised risk/return of one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    /// Volatility was too small to divide by; `sharpe_ratio` is set to 0.
    pub degenerate: bool,
}

/// Scores weight vectors against fixed statistics.
///
/// Pure: identical inputs always give identical outputs, so one evaluator can
/// be shared by any number of sampling workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioEvaluator {
    risk_free_rate: Rate,
}

impl PortfolioEvaluator {
    pub fn new(risk_free_rate: Rate) -> Self {
        PortfolioEvaluator { risk_free_rate }
    }

    pub fn risk_free_rate(&self) -> Rate {
        self.risk_free_rate
    }

    /// Expected return, volatility and Sharpe ratio of `weights`.
    pub fn evaluate(
        &self,
        weights: &[f64],
        stats: &Statistics,
    ) -> MarkowitzResult<PortfolioMetrics> {
        stats.check_dimensions()?;
        validate_weights(weights, stats.num_assets())?;

        let expected_return = vec_dot(weights, &stats.mean_returns);
        let variance = quadratic_form(weights, &stats.covariance);

        if !variance.is_finite() || variance < -VARIANCE_TOLERANCE {
            return Err(MarkowitzError::Numerical(format!(
                "Portfolio variance {} is negative; \
                 covariance matrix is not positive semi-definite",
                variance
            )));
        }
        let volatility = variance.max(0.0).sqrt();

        let (sharpe_ratio, degenerate) = if volatility > VOLATILITY_EPSILON {
            ((expected_return - self.risk_free_rate) / volatility, false)
        } else {
            (0.0, true)
        };

        Ok(PortfolioMetrics {
            expected_return,
            volatility,
            sharpe_ratio,
            degenerate,
        })
    }
}

// ---------------------------------------------------------------------------
// Portfolio math helpers
// ---------------------------------------------------------------------------

/// Dot product.
pub(crate) fn vec_dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Matrix-vector multiplication.
pub(crate) fn mat_vec_multiply(mat: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    mat.iter().map(|row| vec_dot(row, v)).collect()
}

/// w' * Sigma * w.
pub(crate) fn quadratic_form(w: &[f64], sigma: &[Vec<f64>]) -> f64 {
    vec_dot(w, &mat_vec_multiply(sigma, w))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portfolio::weights::equal_weights;
    use pretty_assertions::assert_eq;

    fn two_asset() -> Statistics {
        Statistics::from_parts(
            vec!["A".into(), "B".into()],
            vec![0.10, 0.20],
            vec![vec![0.04, 0.0], vec![0.0, 0.09]],
        )
        .unwrap()
    }

    #[test]
    fn test_two_asset_uncorrelated() {
        let m = PortfolioEvaluator::default()
            .evaluate(&[0.5, 0.5], &two_asset())
            .unwrap();
        assert!((m.expected_return - 0.15).abs() < 1e-12);
        assert!((m.volatility - 0.0325f64.sqrt()).abs() < 1e-12);
        assert!((m.volatility - 0.1803).abs() < 1e-4);
        assert!((m.sharpe_ratio - 0.8321).abs() < 1e-3);
        assert!(!m.degenerate);
    }

    #[test]
    fn test_idempotent() {
        let stats = two_asset();
        let eval = PortfolioEvaluator::new(0.01);
        let a = eval.evaluate(&[0.3, 0.7], &stats).unwrap();
        let b = eval.evaluate(&[0.3, 0.7], &stats).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_equal_weights_equal_means() {
        let stats = Statistics::from_parts(
            vec!["A".into(), "B".into(), "C".into()],
            vec![0.08, 0.08, 0.08],
            vec![
                vec![0.04, 0.01, 0.0],
                vec![0.01, 0.09, 0.02],
                vec![0.0, 0.02, 0.16],
            ],
        )
        .unwrap();
        let m = PortfolioEvaluator::default()
            .evaluate(&equal_weights(3), &stats)
            .unwrap();
        let mean_of_means = stats.mean_returns.iter().sum::<f64>() / 3.0;
        assert!((m.expected_return - mean_of_means).abs() < 1e-15);
    }

    #[test]
    fn test_single_asset() {
        let stats =
            Statistics::from_parts(vec!["A".into()], vec![0.12], vec![vec![0.0225]]).unwrap();
        let m = PortfolioEvaluator::default()
            .evaluate(&[1.0], &stats)
            .unwrap();
        assert!((m.volatility - 0.0225f64.sqrt()).abs() < 1e-15);
        assert!((m.sharpe_ratio - 0.12 / m.volatility).abs() < 1e-12);
    }

    #[test]
    fn test_risk_free_rate() {
        let m = PortfolioEvaluator::new(0.05)
            .evaluate(&[0.5, 0.5], &two_asset())
            .unwrap();
        assert!((m.sharpe_ratio - 0.10 / 0.0325f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_zero_volatility_is_flagged_degenerate() {
        let stats = Statistics::from_parts(
            vec!["CASH".into(), "EQ".into()],
            vec![0.03, 0.10],
            vec![vec![0.0, 0.0], vec![0.0, 0.04]],
        )
        .unwrap();
        let m = PortfolioEvaluator::default()
            .evaluate(&[1.0, 0.0], &stats)
            .unwrap();
        assert!(m.degenerate);
        assert_eq!(m.sharpe_ratio, 0.0);
        assert_eq!(m.volatility, 0.0);
        assert!((m.expected_return - 0.03).abs() < 1e-15);
    }

    #[test]
    fn test_invalid_weights_not_renormalised() {
        let err = PortfolioEvaluator::default()
            .evaluate(&[1.0, 1.0], &two_asset())
            .unwrap_err();
        assert!(matches!(err, MarkowitzError::ConstraintViolation { .. }));
    }

    #[test]
    fn test_negative_variance_is_numerical_error() {
        // Symmetric but indefinite: eigenvalues 0.05 +- 0.1.
        let stats = Statistics::from_parts(
            vec!["A".into(), "B".into()],
            vec![0.1, 0.1],
            vec![vec![0.05, -0.10], vec![-0.10, 0.05]],
        )
        .unwrap();
        let err = PortfolioEvaluator::default()
            .evaluate(&[0.5, 0.5], &stats)
            .unwrap_err();
        assert!(matches!(err, MarkowitzError::Numerical(_)));
    }

    #[test]
    fn test_mismatched_covariance_rejected() {
        let mut stats = two_asset();
        stats.covariance = vec![vec![0.01]];
        let err = PortfolioEvaluator::default()
            .evaluate(&[0.5, 0.5], &stats)
            .unwrap_err();
        assert!(matches!(
            err,
            MarkowitzError::InvalidInput { ref field, .. } if field == "covariance"
        ));
    }
}
