use serde::{Deserialize, Serialize};

use crate::error::MarkowitzError;
use crate::types::Rate;
use crate::MarkowitzResult;

/// Trading sessions used to annualise daily statistics.
pub const DEFAULT_TRADING_DAYS_PER_YEAR: u32 = 252;
/// Monte Carlo population size.
pub const DEFAULT_SAMPLE_COUNT: usize = 10_000;

// ---------------------------------------------------------------------------
// Engine configuration
// ---------------------------------------------------------------------------

/// Every tunable of the engine. Components receive the relevant part at
/// construction, there is no ambient global state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Scaling factor from daily to annual statistics.
    #[serde(default = "default_trading_days_per_year")]
    pub trading_days_per_year: u32,
    /// Annual risk-free rate subtracted in the Sharpe ratio.
    #[serde(default)]
    pub risk_free_rate: Rate,
    /// Treat an under-determined covariance estimate as fatal instead of a warning.
    #[serde(default)]
    pub strict_statistics: bool,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
}

/// Random weight sampling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Number of random portfolios to draw.
    #[serde(default = "default_sample_count")]
    pub count: usize,
    /// Seed for reproducible populations. `None` draws from OS entropy.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Parallel workers; the population depends on (seed, workers).
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// Sharpe ratio solver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Stop when the QP step (KKT residual) falls below this.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Stop when the relative objective change falls below this.
    #[serde(default = "default_ftol")]
    pub ftol: f64,
    /// Per-asset lower bound.
    #[serde(default)]
    pub min_weight: f64,
    /// Per-asset upper bound.
    #[serde(default = "default_max_weight")]
    pub max_weight: f64,
    /// Additional solver runs from random feasible starting points.
    #[serde(default)]
    pub restarts: usize,
    /// Seed for restart starting points.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_trading_days_per_year() -> u32 {
    DEFAULT_TRADING_DAYS_PER_YEAR
}

fn default_sample_count() -> usize {
    DEFAULT_SAMPLE_COUNT
}

fn default_workers() -> usize {
    1
}

fn default_max_iterations() -> u32 {
    200
}

fn default_tolerance() -> f64 {
    1e-9
}

fn default_ftol() -> f64 {
    1e-12
}

fn default_max_weight() -> f64 {
    1.0
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            trading_days_per_year: default_trading_days_per_year(),
            risk_free_rate: 0.0,
            strict_statistics: false,
            sampler: SamplerConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            count: default_sample_count(),
            seed: None,
            workers: default_workers(),
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
            ftol: default_ftol(),
            min_weight: 0.0,
            max_weight: default_max_weight(),
            restarts: 0,
            seed: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl EngineConfig {
    pub fn validate(&self) -> MarkowitzResult<()> {
        if self.trading_days_per_year == 0 {
            return Err(invalid("trading_days_per_year", "Must be positive"));
        }
        if !self.risk_free_rate.is_finite() {
            return Err(invalid("risk_free_rate", "Must be finite"));
        }
        self.sampler.validate()?;
        self.optimizer.validate()
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> MarkowitzResult<()> {
        if self.count == 0 {
            return Err(invalid("sampler.count", "Must be at least 1"));
        }
        if self.workers == 0 {
            return Err(invalid("sampler.workers", "Must be at least 1"));
        }
        Ok(())
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> MarkowitzResult<()> {
        if self.max_iterations == 0 {
            return Err(invalid("optimizer.max_iterations", "Must be at least 1"));
        }
        if !(self.tolerance > 0.0) || !self.tolerance.is_finite() {
            return Err(invalid("optimizer.tolerance", "Must be a positive number"));
        }
        if !(self.ftol >= 0.0) || !self.ftol.is_finite() {
            return Err(invalid("optimizer.ftol", "Must be a non-negative number"));
        }
        if !(0.0..=1.0).contains(&self.min_weight) || !(0.0..=1.0).contains(&self.max_weight) {
            return Err(invalid(
                "optimizer.min_weight/max_weight",
                "Bounds must lie within [0, 1]",
            ));
        }
        if self.min_weight > self.max_weight {
            return Err(invalid("optimizer.min_weight", "min_weight > max_weight"));
        }
        Ok(())
    }

    /// Check the box admits a fully invested portfolio of `n` assets.
    pub fn validate_for_assets(&self, n: usize) -> MarkowitzResult<()> {
        self.validate()?;
        let n = n as f64;
        if self.min_weight * n > 1.0 + 1e-12 || self.max_weight * n < 1.0 - 1e-12 {
            return Err(invalid(
                "optimizer.min_weight/max_weight",
                &format!(
                    "Bounds [{}, {}] cannot sum to 1 across {} assets",
                    self.min_weight, self.max_weight, n
                ),
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> MarkowitzError {
    MarkowitzError::InvalidInput {
        field: field.into(),
        reason: reason.into(),
    }
}
