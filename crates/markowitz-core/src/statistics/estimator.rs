use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics as _;
use tracing::{debug, warn};

use super::returns::ReturnMatrix;
use crate::config::DEFAULT_TRADING_DAYS_PER_YEAR;
use crate::error::MarkowitzError;
use crate::types::Ticker;
use crate::MarkowitzResult;

/// Eigenvalue ratio below which the covariance matrix counts as singular.
const SINGULARITY_RATIO: f64 = 1e-12;
const SYMMETRY_TOLERANCE: f64 = 1e-10;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Spectral summary of a covariance matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conditioning {
    pub min_eigenvalue: f64,
    pub max_eigenvalue: f64,
    /// `max / min`; absent when the matrix is singular.
    pub condition_number: Option<f64>,
    pub singular: bool,
}

/// Annualised mean returns and covariance of a set of assets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub tickers: Vec<Ticker>,
    pub mean_returns: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
    /// Annualisation basis, known only when estimated from daily returns.
    pub trading_days_per_year: Option<u32>,
    /// Daily return observations behind the estimate, if estimated.
    pub observations: Option<usize>,
    pub conditioning: Conditioning,
    pub warnings: Vec<String>,
}

impl Statistics {
    /// Wrap externally estimated annual statistics.
    pub fn from_parts(
        tickers: Vec<Ticker>,
        mean_returns: Vec<f64>,
        covariance: Vec<Vec<f64>>,
    ) -> MarkowitzResult<Self> {
        if tickers.is_empty() {
            return Err(MarkowitzError::InsufficientData(
                "At least one asset required".into(),
            ));
        }
        validate_parts(&tickers, &mean_returns, &covariance)?;

        let conditioning = conditioning(&covariance);
        let mut warnings = Vec::new();
        if conditioning.singular {
            warnings.push("Covariance matrix is singular or ill-conditioned".to_string());
        }

        Ok(Statistics {
            tickers,
            mean_returns,
            covariance,
            trading_days_per_year: None,
            observations: None,
            conditioning,
            warnings,
        })
    }

    pub fn num_assets(&self) -> usize {
        self.mean_returns.len()
    }

    /// One mean per ticker and an n x n covariance.
    pub fn check_dimensions(&self) -> MarkowitzResult<()> {
        let n = self.tickers.len();
        if self.mean_returns.len() != n {
            return Err(MarkowitzError::InvalidInput {
                field: "mean_returns".into(),
                reason: format!(
                    "Expected {} returns but got {}",
                    n,
                    self.mean_returns.len()
                ),
            });
        }
        if self.covariance.len() != n || self.covariance.iter().any(|row| row.len() != n) {
            return Err(MarkowitzError::InvalidInput {
                field: "covariance".into(),
                reason: format!("Expected a {}x{} matrix", n, n),
            });
        }
        Ok(())
    }

    /// Re-check statistics that were built or deserialized directly.
    pub fn validate(&self) -> MarkowitzResult<()> {
        validate_parts(&self.tickers, &self.mean_returns, &self.covariance)
    }

    /// Annualised volatility of each asset on its own.
    pub fn asset_volatilities(&self) -> Vec<f64> {
        (0..self.num_assets())
            .map(|i| self.covariance[i][i].max(0.0).sqrt())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Estimator
// ---------------------------------------------------------------------------

/// Annualised sample statistics from daily log-returns.
#[derive(Debug, Clone, Copy)]
pub struct StatisticsEstimator {
    trading_days_per_year: u32,
    strict: bool,
}

impl Default for StatisticsEstimator {
    fn default() -> Self {
        StatisticsEstimator::new(DEFAULT_TRADING_DAYS_PER_YEAR)
    }
}

impl StatisticsEstimator {
    pub fn new(trading_days_per_year: u32) -> Self {
        StatisticsEstimator {
            trading_days_per_year,
            strict: false,
        }
    }

    /// Fail instead of warning when there are fewer observations than assets.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn estimate(&self, returns: &ReturnMatrix) -> MarkowitzResult<Statistics> {
        if self.trading_days_per_year == 0 {
            return Err(MarkowitzError::InvalidInput {
                field: "trading_days_per_year".into(),
                reason: "Must be positive".into(),
            });
        }
        returns.check_dimensions()?;
        let n = returns.num_assets();
        let t = returns.num_observations();
        if n == 0 {
            return Err(MarkowitzError::InsufficientData(
                "At least one asset required".into(),
            ));
        }
        if t < 2 {
            return Err(MarkowitzError::InsufficientData(format!(
                "{} return observation(s); at least 2 are required for a covariance estimate",
                t
            )));
        }

        let mut warnings = Vec::new();
        if t < n {
            let msg = format!(
                "{} return observations for {} assets: covariance estimate is not well determined",
                t, n
            );
            if self.strict {
                return Err(MarkowitzError::InsufficientData(msg));
            }
            warn!("{}", msg);
            warnings.push(msg);
        }

        let scale = self.trading_days_per_year as f64;
        let columns: Vec<Vec<f64>> = (0..n).map(|a| returns.column(a)).collect();

        let mean_returns: Vec<f64> = columns.iter().map(|c| c.iter().mean() * scale).collect();

        let mut covariance = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in i..n {
                let c = columns[i].iter().covariance(columns[j].iter()) * scale;
                covariance[i][j] = c;
                covariance[j][i] = c;
            }
            // Guard against rounding on constant series.
            covariance[i][i] = covariance[i][i].max(0.0);
        }

        if let Some(a) = mean_returns.iter().position(|m| !m.is_finite()) {
            return Err(MarkowitzError::Numerical(format!(
                "Non-finite mean return for {}",
                returns.tickers[a]
            )));
        }

        let mut conditioning = conditioning(&covariance);
        if t < n {
            conditioning.singular = true;
            conditioning.condition_number = None;
        }
        if conditioning.singular && t >= n {
            let msg = format!(
                "Covariance matrix is singular or ill-conditioned \
                 (min eigenvalue {:.3e}, max {:.3e})",
                conditioning.min_eigenvalue, conditioning.max_eigenvalue
            );
            warn!("{}", msg);
            warnings.push(msg);
        }

        debug!(
            assets = n,
            observations = t,
            singular = conditioning.singular,
            "estimated annualised statistics"
        );

        Ok(Statistics {
            tickers: returns.tickers.clone(),
            mean_returns,
            covariance,
            trading_days_per_year: Some(self.trading_days_per_year),
            observations: Some(t),
            conditioning,
            warnings,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn conditioning(cov: &[Vec<f64>]) -> Conditioning {
    let n = cov.len();
    let m = DMatrix::from_fn(n, n, |i, j| cov[i][j]);
    let eigenvalues = m.symmetric_eigen().eigenvalues;
    let min_eigenvalue = eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
    let max_eigenvalue = eigenvalues
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);

    let singular = max_eigenvalue <= 0.0 || min_eigenvalue <= SINGULARITY_RATIO * max_eigenvalue;
    let condition_number = if singular {
        None
    } else {
        Some(max_eigenvalue / min_eigenvalue)
    };

    Conditioning {
        min_eigenvalue,
        max_eigenvalue,
        condition_number,
        singular,
    }
}

fn validate_parts(
    tickers: &[Ticker],
    mean_returns: &[f64],
    cov: &[Vec<f64>],
) -> MarkowitzResult<()> {
    if mean_returns.len() != tickers.len() {
        return Err(MarkowitzError::InvalidInput {
            field: "mean_returns".into(),
            reason: format!(
                "Expected {} returns but got {}",
                tickers.len(),
                mean_returns.len()
            ),
        });
    }
    if let Some(i) = mean_returns.iter().position(|m| !m.is_finite()) {
        return Err(MarkowitzError::InvalidInput {
            field: "mean_returns".into(),
            reason: format!("Non-finite mean return for {}", tickers[i]),
        });
    }
    validate_covariance_matrix(cov, tickers)
}

#[allow(clippy::needless_range_loop)]
fn validate_covariance_matrix(cov: &[Vec<f64>], tickers: &[Ticker]) -> MarkowitzResult<()> {
    let n = tickers.len();
    if cov.len() != n {
        return Err(MarkowitzError::InvalidInput {
            field: "covariance".into(),
            reason: format!("Expected {}x{} matrix but got {} rows", n, n, cov.len()),
        });
    }
    for (i, row) in cov.iter().enumerate() {
        if row.len() != n {
            return Err(MarkowitzError::InvalidInput {
                field: "covariance".into(),
                reason: format!("Row {} has {} columns, expected {}", i, row.len(), n),
            });
        }
        if row.iter().any(|v| !v.is_finite()) {
            return Err(MarkowitzError::InvalidInput {
                field: "covariance".into(),
                reason: format!("Row {} ({}) contains a non-finite value", i, tickers[i]),
            });
        }
    }
    for i in 0..n {
        if cov[i][i] < 0.0 {
            return Err(MarkowitzError::Numerical(format!(
                "Negative variance {} for {}",
                cov[i][i], tickers[i]
            )));
        }
        for j in (i + 1)..n {
            if (cov[i][j] - cov[j][i]).abs() > SYMMETRY_TOLERANCE {
                return Err(MarkowitzError::InvalidInput {
                    field: "covariance".into(),
                    reason: format!(
                        "Not symmetric: [{},{}]={} != [{},{}]={}",
                        i, j, cov[i][j], j, i, cov[j][i]
                    ),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn returns(values: Vec<Vec<f64>>) -> ReturnMatrix {
        let n = values[0].len();
        let dates = (0..values.len())
            .map(|i| NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Days::new(i as u64))
            .collect();
        ReturnMatrix {
            tickers: (0..n).map(|i| format!("A{i}")).collect(),
            dates,
            values,
            rejected: Vec::new(),
        }
    }

    #[test]
    fn test_annualised_mean_and_variance() {
        let r = returns(vec![vec![0.01], vec![0.03], vec![-0.01]]);
        let stats = StatisticsEstimator::new(252).estimate(&r).unwrap();
        assert!((stats.mean_returns[0] - 0.01 * 252.0).abs() < 1e-12);
        // sample variance of (0.01, 0.03, -0.01) = 0.0004
        assert!((stats.covariance[0][0] - 0.0004 * 252.0).abs() < 1e-12);
        assert_eq!(stats.observations, Some(3));
    }

    #[test]
    fn test_covariance_symmetric_non_negative_diagonal() {
        let r = returns(vec![
            vec![0.01, 0.02, -0.01],
            vec![-0.02, 0.01, 0.00],
            vec![0.03, -0.01, 0.02],
            vec![0.00, 0.02, -0.02],
            vec![0.01, 0.00, 0.01],
        ]);
        let stats = StatisticsEstimator::default().estimate(&r).unwrap();
        for i in 0..3 {
            assert!(stats.covariance[i][i] >= 0.0);
            for j in 0..3 {
                assert_eq!(stats.covariance[i][j], stats.covariance[j][i]);
            }
        }
        assert!(!stats.conditioning.singular);
        assert!(stats.warnings.is_empty());
    }

    #[test]
    fn test_custom_trading_days() {
        let r = returns(vec![vec![0.01], vec![0.02]]);
        let stats = StatisticsEstimator::new(12).estimate(&r).unwrap();
        assert!((stats.mean_returns[0] - 0.015 * 12.0).abs() < 1e-12);
        assert_eq!(stats.trading_days_per_year, Some(12));
    }

    #[test]
    fn test_single_observation_insufficient() {
        let r = returns(vec![vec![0.01, 0.02]]);
        assert!(matches!(
            StatisticsEstimator::default().estimate(&r),
            Err(MarkowitzError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_fewer_observations_than_assets_is_signalled() {
        let r = returns(vec![vec![0.01, 0.02, 0.00], vec![0.02, -0.01, 0.01]]);
        let stats = StatisticsEstimator::default().estimate(&r).unwrap();
        assert!(stats.conditioning.singular);
        assert!(!stats.warnings.is_empty());
        assert!(stats.warnings[0].contains("not well determined"));
    }

    #[test]
    fn test_fewer_observations_than_assets_strict_fails() {
        let r = returns(vec![vec![0.01, 0.02, 0.00], vec![0.02, -0.01, 0.01]]);
        let res = StatisticsEstimator::default().strict(true).estimate(&r);
        assert!(matches!(res, Err(MarkowitzError::InsufficientData(_))));
    }

    #[test]
    fn test_collinear_assets_flagged_singular() {
        // Second asset is exactly twice the first.
        let r = returns(vec![
            vec![0.01, 0.02],
            vec![-0.02, -0.04],
            vec![0.03, 0.06],
            vec![0.00, 0.00],
        ]);
        let stats = StatisticsEstimator::default().estimate(&r).unwrap();
        assert!(stats.conditioning.singular);
        assert_eq!(stats.conditioning.condition_number, None);
        assert_eq!(stats.warnings.len(), 1);
    }

    #[test]
    fn test_from_parts_validates() {
        let ok = Statistics::from_parts(
            vec!["A".into(), "B".into()],
            vec![0.1, 0.2],
            vec![vec![0.04, 0.0], vec![0.0, 0.09]],
        )
        .unwrap();
        assert!(!ok.conditioning.singular);
        assert_eq!(ok.trading_days_per_year, None);
        assert!((ok.conditioning.condition_number.unwrap() - 2.25).abs() < 1e-9);
        let vols = ok.asset_volatilities();
        assert!((vols[0] - 0.2).abs() < 1e-12 && (vols[1] - 0.3).abs() < 1e-12);

        let asym = Statistics::from_parts(
            vec!["A".into(), "B".into()],
            vec![0.1, 0.2],
            vec![vec![0.04, 0.01], vec![0.0, 0.09]],
        );
        assert!(asym.is_err());

        let neg = Statistics::from_parts(vec!["A".into()], vec![0.1], vec![vec![-0.01]]);
        assert!(matches!(neg, Err(MarkowitzError::Numerical(_))));

        let short = Statistics::from_parts(vec!["A".into(), "B".into()], vec![0.1], vec![]);
        assert!(short.is_err());
    }

    #[test]
    fn test_deserialized_statistics_shape_checked() {
        let ok = Statistics::from_parts(
            vec!["A".into(), "B".into()],
            vec![0.1, 0.2],
            vec![vec![0.04, 0.0], vec![0.0, 0.09]],
        )
        .unwrap();
        let mut json = serde_json::to_value(&ok).unwrap();
        json["covariance"] = serde_json::json!([[0.04]]);
        let bad: Statistics = serde_json::from_value(json).unwrap();

        assert!(matches!(
            bad.check_dimensions(),
            Err(MarkowitzError::InvalidInput { ref field, .. }) if field == "covariance"
        ));
        assert!(bad.validate().is_err());
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_ragged_return_rows_rejected() {
        let mut r = returns(vec![vec![0.01, 0.02], vec![0.02, -0.01], vec![0.0, 0.01]]);
        r.values[1] = vec![0.02];
        let res = StatisticsEstimator::default().estimate(&r);
        assert!(matches!(
            res,
            Err(MarkowitzError::InvalidInput { ref field, .. }) if field == "values"
        ));
    }
}
