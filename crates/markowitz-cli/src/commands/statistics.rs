use clap::Args;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

use markowitz_core::statistics::{ReturnCalculator, Statistics, StatisticsEstimator};
use markowitz_core::with_metadata;

use super::data::{load_prices, EngineArgs, PriceArgs};

/// Arguments for return statistics
#[derive(Args)]
pub struct StatsArgs {
    #[command(flatten)]
    pub prices: PriceArgs,

    #[command(flatten)]
    pub engine: EngineArgs,
}

/// Per-asset row, in the column order of the covariance matrix.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AssetRow {
    ticker: String,
    mean_return: f64,
    volatility: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct StatsOutput {
    observations: Option<usize>,
    dropped_dates: usize,
    rejected_prices: usize,
    condition_number: Option<f64>,
    singular: bool,
    assets: Vec<AssetRow>,
    covariance: Vec<Vec<f64>>,
}

pub fn run_stats(args: StatsArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let start = Instant::now();
    let config = args.engine.resolve()?;
    config.validate()?;
    let table = load_prices(&args.prices)?;

    let returns = ReturnCalculator::new().compute(&table)?;
    let stats = StatisticsEstimator::new(config.trading_days_per_year)
        .strict(config.strict_statistics)
        .estimate(&returns)?;

    let mut warnings = stats.warnings.clone();
    for r in &returns.rejected {
        warnings.push(format!(
            "Rejected price {} for {} on {}",
            r.price, r.ticker, r.date
        ));
    }

    let output = StatsOutput {
        observations: stats.observations,
        dropped_dates: table.dropped_dates(),
        rejected_prices: returns.rejected.len(),
        condition_number: stats.conditioning.condition_number,
        singular: stats.conditioning.singular,
        assets: asset_rows(&stats),
        covariance: stats.covariance.clone(),
    };

    let envelope = with_metadata(
        "Annualised log-return statistics (sample mean and covariance)",
        &serde_json::json!({
            "trading_days_per_year": config.trading_days_per_year,
            "strict": config.strict_statistics,
        }),
        warnings,
        start.elapsed().as_micros() as u64,
        output,
    );
    Ok(serde_json::to_value(envelope)?)
}

pub(crate) fn asset_rows(stats: &Statistics) -> Vec<AssetRow> {
    stats
        .tickers
        .iter()
        .zip(&stats.mean_returns)
        .zip(stats.asset_volatilities())
        .map(|((ticker, mean_return), volatility)| AssetRow {
            ticker: ticker.clone(),
            mean_return: *mean_return,
            volatility,
        })
        .collect()
}
