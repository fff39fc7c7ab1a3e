use clap::Args;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Instant;

use markowitz_core::monte_carlo::{MonteCarloSampler, PortfolioPopulation, SampledPortfolio};
use markowitz_core::portfolio::PortfolioEvaluator;
use markowitz_core::statistics::{ReturnCalculator, Statistics, StatisticsEstimator};
use markowitz_core::{with_metadata, EngineConfig};

use super::data::{load_prices, EngineArgs, PriceArgs, SamplerArgs};

/// Arguments for scoring one allocation
#[derive(Args)]
pub struct EvaluateArgs {
    #[command(flatten)]
    pub prices: PriceArgs,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Comma-separated weights in ticker order (must sum to 1)
    #[arg(long, value_delimiter = ',', required = true)]
    pub weights: Vec<f64>,
}

/// Arguments for random portfolio sampling
#[derive(Args)]
pub struct SampleArgs {
    #[command(flatten)]
    pub prices: PriceArgs,

    #[command(flatten)]
    pub engine: EngineArgs,

    #[command(flatten)]
    pub sampler: SamplerArgs,

    /// Include every sampled portfolio, not just the summary
    #[arg(long)]
    pub include_portfolios: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Allocation {
    pub ticker: String,
    pub weight: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct EvaluateOutput {
    expected_return: f64,
    volatility: f64,
    sharpe_ratio: f64,
    degenerate: bool,
    allocations: Vec<Allocation>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SampleSummary {
    pub requested: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub seed: Option<u64>,
    pub workers: usize,
    pub best_sharpe_ratio: Option<f64>,
    pub max_sharpe: Option<Value>,
    pub min_volatility: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portfolios: Option<Vec<Value>>,
}

pub fn run_evaluate(args: EvaluateArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let start = Instant::now();
    let config = args.engine.resolve()?;
    config.validate()?;
    let stats = estimate(&args.prices, &config)?;

    let metrics =
        PortfolioEvaluator::new(config.risk_free_rate).evaluate(&args.weights, &stats)?;

    let mut warnings = stats.warnings.clone();
    if metrics.degenerate {
        warnings.push("Portfolio volatility is effectively zero; Sharpe ratio set to 0".into());
    }

    let output = EvaluateOutput {
        expected_return: metrics.expected_return,
        volatility: metrics.volatility,
        sharpe_ratio: metrics.sharpe_ratio,
        degenerate: metrics.degenerate,
        allocations: allocations(&stats.tickers, &args.weights),
    };

    let envelope = with_metadata(
        "Portfolio expected return, volatility and Sharpe ratio",
        &serde_json::json!({ "risk_free_rate": config.risk_free_rate }),
        warnings,
        start.elapsed().as_micros() as u64,
        output,
    );
    Ok(serde_json::to_value(envelope)?)
}

pub fn run_sample(args: SampleArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let start = Instant::now();
    let mut config = args.engine.resolve()?;
    args.sampler.apply(&mut config);
    config.validate()?;
    let stats = estimate(&args.prices, &config)?;

    let evaluator = PortfolioEvaluator::new(config.risk_free_rate);
    let population = MonteCarloSampler::new(&config.sampler, evaluator)
        .sample(&stats, config.sampler.count)?;

    let mut warnings = stats.warnings.clone();
    if population.rejected > 0 {
        warnings.push(format!(
            "{} of {} sampled portfolios rejected during evaluation",
            population.rejected, population.requested
        ));
    }

    let output = summarize(&population, &stats.tickers, args.include_portfolios);
    let envelope = with_metadata(
        "Monte Carlo sampling of long-only, fully invested portfolios",
        &serde_json::json!({
            "samples": config.sampler.count,
            "seed": config.sampler.seed,
            "workers": config.sampler.workers,
            "risk_free_rate": config.risk_free_rate,
        }),
        warnings,
        start.elapsed().as_micros() as u64,
        output,
    );
    Ok(serde_json::to_value(envelope)?)
}

pub(crate) fn estimate(
    prices: &PriceArgs,
    config: &EngineConfig,
) -> Result<Statistics, Box<dyn std::error::Error>> {
    let table = load_prices(prices)?;
    let returns = ReturnCalculator::new().compute(&table)?;
    Ok(StatisticsEstimator::new(config.trading_days_per_year)
        .strict(config.strict_statistics)
        .estimate(&returns)?)
}

pub(crate) fn allocations(tickers: &[String], weights: &[f64]) -> Vec<Allocation> {
    tickers
        .iter()
        .zip(weights)
        .map(|(t, w)| Allocation {
            ticker: t.clone(),
            weight: *w,
        })
        .collect()
}

pub(crate) fn summarize(
    population: &PortfolioPopulation,
    tickers: &[String],
    include_portfolios: bool,
) -> SampleSummary {
    let row = |p: &SampledPortfolio| portfolio_row(p, tickers);
    let max_sharpe = population.max_sharpe();
    SampleSummary {
        requested: population.requested,
        accepted: population.len(),
        rejected: population.rejected,
        seed: population.seed,
        workers: population.workers,
        best_sharpe_ratio: max_sharpe.map(|p| p.metrics.sharpe_ratio),
        max_sharpe: max_sharpe.map(row),
        min_volatility: population.min_volatility().map(row),
        portfolios: include_portfolios.then(|| population.iter().map(row).collect()),
    }
}

/// One flat record per portfolio: metrics plus a weight column per ticker.
fn portfolio_row(p: &SampledPortfolio, tickers: &[String]) -> Value {
    let mut row = Map::new();
    row.insert("expected_return".into(), p.metrics.expected_return.into());
    row.insert("volatility".into(), p.metrics.volatility.into());
    row.insert("sharpe_ratio".into(), p.metrics.sharpe_ratio.into());
    for (t, w) in tickers.iter().zip(&p.weights) {
        row.insert(t.clone(), (*w).into());
    }
    Value::Object(row)
}
