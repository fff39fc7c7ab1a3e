use clap::Args;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

use markowitz_core::optimization::{OptimizationResult, SharpeOptimizer};
use markowitz_core::pipeline;
use markowitz_core::portfolio::PortfolioEvaluator;
use markowitz_core::with_metadata;

use super::data::{load_prices, EngineArgs, OptimizerArgs, PriceArgs, SamplerArgs};
use super::portfolio::{allocations, estimate, summarize, Allocation, SampleSummary};
use super::statistics::{asset_rows, AssetRow};

/// Arguments for maximum Sharpe ratio optimization
#[derive(Args)]
pub struct OptimizeArgs {
    #[command(flatten)]
    pub prices: PriceArgs,

    #[command(flatten)]
    pub engine: EngineArgs,

    #[command(flatten)]
    pub optimizer: OptimizerArgs,

    /// Seed for restart starting points
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Arguments for the full analysis pipeline
#[derive(Args)]
pub struct AnalyzeArgs {
    #[command(flatten)]
    pub prices: PriceArgs,

    #[command(flatten)]
    pub engine: EngineArgs,

    #[command(flatten)]
    pub sampler: SamplerArgs,

    #[command(flatten)]
    pub optimizer: OptimizerArgs,

    /// Include every sampled portfolio, not just the summary
    #[arg(long)]
    pub include_portfolios: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OptimizeOutput {
    sharpe_ratio: f64,
    expected_return: f64,
    volatility: f64,
    converged: bool,
    message: String,
    iterations: u32,
    kkt_residual: f64,
    starts: usize,
    allocations: Vec<Allocation>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnalyzeOutput {
    optimal: OptimizeOutput,
    sampling: SampleSummary,
    observations: Option<usize>,
    dropped_dates: usize,
    rejected_prices: usize,
    assets: Vec<AssetRow>,
    covariance: Vec<Vec<f64>>,
}

pub fn run_optimize(args: OptimizeArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let start = Instant::now();
    let mut config = args.engine.resolve()?;
    args.optimizer.apply(&mut config);
    if args.seed.is_some() {
        config.optimizer.seed = args.seed;
    }
    config.validate()?;
    let stats = estimate(&args.prices, &config)?;

    let evaluator = PortfolioEvaluator::new(config.risk_free_rate);
    let result = SharpeOptimizer::new(&config.optimizer, evaluator)
        .optimize(&stats)?;

    let mut warnings = stats.warnings.clone();
    if !result.converged {
        warnings.push(format!(
            "Optimizer did not converge after {} iterations: {}",
            result.iterations, result.message
        ));
    }

    let envelope = with_metadata(
        "Maximum Sharpe ratio portfolio (SQP with damped BFGS, box and budget constraints)",
        &serde_json::json!({
            "risk_free_rate": config.risk_free_rate,
            "min_weight": config.optimizer.min_weight,
            "max_weight": config.optimizer.max_weight,
            "restarts": config.optimizer.restarts,
            "max_iterations": config.optimizer.max_iterations,
        }),
        warnings,
        start.elapsed().as_micros() as u64,
        optimize_output(&result, &stats.tickers),
    );
    Ok(serde_json::to_value(envelope)?)
}

pub fn run_analyze(args: AnalyzeArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let mut config = args.engine.resolve()?;
    args.sampler.apply(&mut config);
    args.optimizer.apply(&mut config);
    let table = load_prices(&args.prices)?;

    let out = pipeline::analyze(&table, &config)?;
    let r = &out.result;
    let summary = AnalyzeOutput {
        optimal: optimize_output(&r.optimization, &r.tickers),
        sampling: summarize(&r.population, &r.tickers, args.include_portfolios),
        observations: r.statistics.observations,
        dropped_dates: r.dropped_dates,
        rejected_prices: r.rejected_prices.len(),
        assets: asset_rows(&r.statistics),
        covariance: r.statistics.covariance.clone(),
    };

    let envelope = with_metadata(
        &out.methodology,
        &out.assumptions,
        out.warnings.clone(),
        out.metadata.computation_time_us,
        summary,
    );
    Ok(serde_json::to_value(envelope)?)
}

fn optimize_output(result: &OptimizationResult, tickers: &[String]) -> OptimizeOutput {
    OptimizeOutput {
        sharpe_ratio: result.metrics.sharpe_ratio,
        expected_return: result.metrics.expected_return,
        volatility: result.metrics.volatility,
        converged: result.converged,
        message: result.message.clone(),
        iterations: result.iterations,
        kkt_residual: result.kkt_residual,
        starts: result.starts,
        allocations: allocations(tickers, &result.weights),
    }
}
