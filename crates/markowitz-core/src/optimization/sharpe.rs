use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::sqp::{self, LinearConstraints, Objective, SqpOutcome, SqpSettings};
use crate::config::OptimizerConfig;
use crate::error::MarkowitzError;
use crate::monte_carlo::sampler::draw_weights;
use crate::portfolio::evaluator::{
    mat_vec_multiply, vec_dot, VARIANCE_TOLERANCE, VOLATILITY_EPSILON,
};
use crate::portfolio::{equal_weights, PortfolioEvaluator, PortfolioMetrics};
use crate::statistics::Statistics;
use crate::MarkowitzResult;

/// Optimal volatility below this is treated as a riskless portfolio.
const RISKLESS_VOLATILITY: f64 = 1e-8;
/// ... or below this fraction of the least volatile risky asset.
const RELATIVE_RISKLESS_VOLATILITY: f64 = 1e-4;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Best allocation found by the solver, with its diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub weights: Vec<f64>,
    pub metrics: PortfolioMetrics,
    pub converged: bool,
    pub message: String,
    /// Iterations of the run that produced `weights`.
    pub iterations: u32,
    pub kkt_residual: f64,
    /// Solver runs, the equal-weight start included.
    pub starts: usize,
}

impl OptimizationResult {
    /// Turn a non-converged result into an error for callers that need a
    /// certified optimum.
    pub fn into_converged(self) -> MarkowitzResult<Self> {
        if self.converged {
            Ok(self)
        } else {
            Err(MarkowitzError::OptimizationNonConvergence {
                iterations: self.iterations,
                message: self.message,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Objective
// ---------------------------------------------------------------------------

/// -Sharpe(w), scored through the shared evaluator.
struct NegativeSharpe<'a> {
    stats: &'a Statistics,
    evaluator: PortfolioEvaluator,
}

impl Objective for NegativeSharpe<'_> {
    fn value(&self, x: &[f64]) -> MarkowitzResult<f64> {
        Ok(-self.evaluator.evaluate(x, self.stats)?.sharpe_ratio)
    }

    /// d(-S)/dw_i = -mu_i / sigma_p + (ret - rf) * (Sigma w)_i / sigma_p^3
    fn gradient(&self, x: &[f64]) -> MarkowitzResult<Vec<f64>> {
        let mu = &self.stats.mean_returns;
        let sigma_w = mat_vec_multiply(&self.stats.covariance, x);
        let vol = vec_dot(x, &sigma_w).max(0.0).sqrt();

        if vol <= VOLATILITY_EPSILON {
            // Sharpe is pinned at 0 here; lean towards higher return.
            return Ok(mu.iter().map(|m| -m).collect());
        }

        let excess = vec_dot(x, mu) - self.evaluator.risk_free_rate();
        let vol_cubed = vol * vol * vol;
        Ok(mu
            .iter()
            .zip(&sigma_w)
            .map(|(m, sw)| -m / vol + excess * sw / vol_cubed)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Optimizer
// ---------------------------------------------------------------------------

/// Maximises the Sharpe ratio subject to full investment and a per-asset box.
///
/// Only local optimality is guaranteed; `restarts` adds runs from random
/// feasible points and keeps the best.
#[derive(Debug, Clone)]
pub struct SharpeOptimizer {
    config: OptimizerConfig,
    evaluator: PortfolioEvaluator,
}

impl SharpeOptimizer {
    pub fn new(config: &OptimizerConfig, evaluator: PortfolioEvaluator) -> Self {
        SharpeOptimizer {
            config: config.clone(),
            evaluator,
        }
    }

    pub fn optimize(&self, stats: &Statistics) -> MarkowitzResult<OptimizationResult> {
        let n = stats.num_assets();
        if n == 0 {
            return Err(MarkowitzError::InsufficientData(
                "At least one asset required".into(),
            ));
        }
        stats.validate()?;
        self.config.validate_for_assets(n)?;

        let constraints =
            LinearConstraints::simplex_box(n, self.config.min_weight, self.config.max_weight);
        let settings = SqpSettings {
            max_iterations: self.config.max_iterations,
            tolerance: self.config.tolerance,
            ftol: self.config.ftol,
        };
        let objective = NegativeSharpe {
            stats,
            evaluator: self.evaluator,
        };

        let starts = self.starting_points(n);
        let runs: Vec<MarkowitzResult<SqpOutcome>> = if starts.len() > 1 {
            starts
                .par_iter()
                .map(|x0| sqp::minimize(&objective, x0, &constraints, &settings))
                .collect()
        } else {
            starts
                .iter()
                .map(|x0| sqp::minimize(&objective, x0, &constraints, &settings))
                .collect()
        };
        let outcomes = surviving_runs(runs)?;

        let Some(mut best) = select_best(outcomes) else {
            return Err(MarkowitzError::Numerical(
                "Optimizer produced no candidate".into(),
            ));
        };
        let metrics = self.evaluator.evaluate(&best.x, stats)?;

        if let Some(message) = self.riskless_diagnostic(stats, &metrics) {
            warn!(volatility = metrics.volatility, "{}", message);
            best.converged = false;
            best.message = message;
        } else if best.converged {
            debug!(
                iterations = best.iterations,
                sharpe = metrics.sharpe_ratio,
                "sharpe optimization converged"
            );
        } else {
            warn!(
                iterations = best.iterations,
                message = %best.message,
                "sharpe optimization did not converge"
            );
        }

        Ok(OptimizationResult {
            weights: best.x,
            metrics,
            converged: best.converged,
            message: best.message,
            iterations: best.iterations,
            kkt_residual: best.kkt_residual,
            starts: starts.len(),
        })
    }

    /// Explains an optimum whose volatility has collapsed to (nearly) zero.
    ///
    /// The Sharpe ratio is unbounded there: either a zero-variance asset earns
    /// more than the risk-free rate, or the covariance admits a riskless
    /// combination. The reported ratio is then a rounding artifact.
    fn riskless_diagnostic(
        &self,
        stats: &Statistics,
        metrics: &PortfolioMetrics,
    ) -> Option<String> {
        let rf = self.evaluator.risk_free_rate();
        let smallest_risky = stats
            .asset_volatilities()
            .into_iter()
            .filter(|v| *v > VOLATILITY_EPSILON)
            .fold(f64::INFINITY, f64::min);
        let floor = if smallest_risky.is_finite() {
            RISKLESS_VOLATILITY.max(RELATIVE_RISKLESS_VOLATILITY * smallest_risky)
        } else {
            RISKLESS_VOLATILITY
        };
        if !metrics.degenerate && metrics.volatility >= floor {
            return None;
        }

        let riskless_asset = stats
            .mean_returns
            .iter()
            .zip(&stats.covariance)
            .enumerate()
            .find(|(i, (mean, row))| row[*i] <= VARIANCE_TOLERANCE && **mean > rf)
            .map(|(i, _)| i);
        Some(match riskless_asset {
            Some(i) => format!(
                "Sharpe ratio is unbounded: {} has zero variance and returns above the \
                 risk-free rate (optimal volatility {:.3e})",
                stats.tickers[i], metrics.volatility
            ),
            None => format!(
                "Optimal portfolio volatility {:.3e} is effectively zero; Sharpe ratio is not \
                 meaningful",
                metrics.volatility
            ),
        })
    }

    /// Equal weights first, then seeded random points inside the box.
    fn starting_points(&self, n: usize) -> Vec<Vec<f64>> {
        let equal = equal_weights(n);
        let mut starts = vec![equal.clone()];
        if self.config.restarts == 0 {
            return starts;
        }

        let mut rng = match self.config.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        for _ in 0..self.config.restarts {
            let mut stream = StdRng::seed_from_u64(rng.gen::<u64>());
            let raw = draw_weights(&mut stream, n);
            starts.push(pull_into_box(
                &raw,
                &equal,
                self.config.min_weight,
                self.config.max_weight,
            ));
        }
        starts
    }
}

/// Largest step from `anchor` towards `target` that stays inside the box.
///
/// Both points sum to one, so every point on the segment does too.
fn pull_into_box(target: &[f64], anchor: &[f64], lower: f64, upper: f64) -> Vec<f64> {
    let mut t: f64 = 1.0;
    for (x, a) in target.iter().zip(anchor) {
        let delta = x - a;
        if delta > 0.0 && a + delta > upper {
            t = t.min((upper - a) / delta);
        } else if delta < 0.0 && a + delta < lower {
            t = t.min((lower - a) / delta);
        }
    }
    let t = t.max(0.0);
    target
        .iter()
        .zip(anchor)
        .map(|(x, a)| a + t * (x - a))
        .collect()
}

/// Runs that finished; a failed start is dropped unless every start failed.
fn surviving_runs(runs: Vec<MarkowitzResult<SqpOutcome>>) -> MarkowitzResult<Vec<SqpOutcome>> {
    let mut outcomes = Vec::with_capacity(runs.len());
    let mut first_error = None;
    for (start, run) in runs.into_iter().enumerate() {
        match run {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                warn!(start, error = %e, "discarding failed optimizer start");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) if outcomes.is_empty() => Err(e),
        _ => Ok(outcomes),
    }
}

/// Lowest objective among converged runs, else lowest overall.
fn select_best(outcomes: Vec<SqpOutcome>) -> Option<SqpOutcome> {
    let any_converged = outcomes.iter().any(|o| o.converged);
    outcomes
        .into_iter()
        .filter(|o| o.converged || !any_converged)
        .min_by(|a, b| a.value.total_cmp(&b.value))
}
