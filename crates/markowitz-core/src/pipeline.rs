use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::market_data::{MarketDataProvider, PriceRequest, PriceTable};
use crate::monte_carlo::{MonteCarloSampler, PortfolioPopulation};
use crate::optimization::{OptimizationResult, SharpeOptimizer};
use crate::portfolio::PortfolioEvaluator;
use crate::statistics::{RejectedPrice, ReturnCalculator, Statistics, StatisticsEstimator};
use crate::types::{with_metadata, ComputationOutput, Ticker};
use crate::MarkowitzResult;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Everything one analysis run produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub tickers: Vec<Ticker>,
    /// Price dates left after alignment.
    pub price_dates: usize,
    /// Dates dropped during alignment because some asset had no price.
    pub dropped_dates: usize,
    pub rejected_prices: Vec<RejectedPrice>,
    pub statistics: Statistics,
    pub population: PortfolioPopulation,
    pub optimization: OptimizationResult,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Returns, statistics, random sampling and Sharpe optimization over one
/// aligned price table.
///
/// Optimizer non-convergence is reported through the result flag and a
/// warning, never as an error.
pub fn analyze(
    prices: &PriceTable,
    config: &EngineConfig,
) -> MarkowitzResult<ComputationOutput<AnalysisOutput>> {
    let start = Instant::now();
    config.validate()?;
    let mut warnings: Vec<String> = Vec::new();

    let returns = ReturnCalculator::new().compute(prices)?;
    for r in &returns.rejected {
        warnings.push(format!(
            "Rejected price {} for {} on {}; date row dropped",
            r.price, r.ticker, r.date
        ));
    }
    if prices.dropped_dates() > 0 {
        warnings.push(format!(
            "{} date(s) dropped during alignment for missing prices",
            prices.dropped_dates()
        ));
    }

    let statistics = StatisticsEstimator::new(config.trading_days_per_year)
        .strict(config.strict_statistics)
        .estimate(&returns)?;
    warnings.extend(statistics.warnings.iter().cloned());
    debug!(
        assets = statistics.num_assets(),
        observations = returns.num_observations(),
        "statistics estimated"
    );

    let evaluator = PortfolioEvaluator::new(config.risk_free_rate);
    let population = MonteCarloSampler::new(&config.sampler, evaluator)
        .sample(&statistics, config.sampler.count)?;
    if population.rejected > 0 {
        warnings.push(format!(
            "{} of {} sampled portfolios rejected during evaluation",
            population.rejected, population.requested
        ));
    }

    let optimization = SharpeOptimizer::new(&config.optimizer, evaluator).optimize(&statistics)?;
    if !optimization.converged {
        warnings.push(format!(
            "Optimizer did not converge after {} iterations: {}",
            optimization.iterations, optimization.message
        ));
    }
    if let Some(best) = population.max_sharpe() {
        if best.metrics.sharpe_ratio > optimization.metrics.sharpe_ratio + 1e-9 {
            warnings.push(format!(
                "Best sampled Sharpe {:.6} exceeds optimized Sharpe {:.6}",
                best.metrics.sharpe_ratio, optimization.metrics.sharpe_ratio
            ));
        }
    }

    info!(
        sharpe = optimization.metrics.sharpe_ratio,
        converged = optimization.converged,
        samples = population.len(),
        "analysis complete"
    );

    let output = AnalysisOutput {
        tickers: prices.tickers().to_vec(),
        price_dates: prices.num_dates(),
        dropped_dates: prices.dropped_dates(),
        rejected_prices: returns.rejected,
        statistics,
        population,
        optimization,
    };

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Markowitz Mean-Variance Analysis (log-returns, Monte Carlo sampling, SQP max-Sharpe)",
        &serde_json::json!({
            "n_assets": output.tickers.len(),
            "trading_days_per_year": config.trading_days_per_year,
            "risk_free_rate": config.risk_free_rate,
            "samples": config.sampler.count,
            "seed": config.sampler.seed,
            "workers": config.sampler.workers,
            "min_weight": config.optimizer.min_weight,
            "max_weight": config.optimizer.max_weight,
            "restarts": config.optimizer.restarts,
        }),
        warnings,
        elapsed,
        output,
    ))
}

/// Fetch prices from `provider`, then [`analyze`] them.
pub fn analyze_from_provider(
    provider: &dyn MarketDataProvider,
    request: &PriceRequest,
    config: &EngineConfig,
) -> MarkowitzResult<ComputationOutput<AnalysisOutput>> {
    let prices = provider.fetch(request)?;
    analyze(&prices, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::{PriceSeries, StaticPriceProvider};
    use crate::MarkowitzError;
    use chrono::{Duration, NaiveDate};

    fn series(ticker: &str, closes: &[f64]) -> PriceSeries {
        let d0 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let points: Vec<(NaiveDate, f64)> = closes
            .iter()
            .enumerate()
            .map(|(i, p)| (d0 + Duration::days(i as i64), *p))
            .collect();
        PriceSeries::from_closes(ticker, &points)
    }

    const AAA: [f64; 8] = [10.0, 10.1, 10.05, 10.2, 10.3, 10.22, 10.4, 10.51];
    const BBB: [f64; 8] = [50.0, 49.5, 50.7, 51.0, 50.2, 51.5, 52.0, 51.8];

    fn table() -> PriceTable {
        PriceTable::align(vec![series("AAA", &AAA), series("BBB", &BBB)]).unwrap()
    }

    fn config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.sampler.count = 200;
        cfg.sampler.seed = Some(7);
        cfg
    }

    #[test]
    fn test_analyze_runs_every_stage() {
        let out = analyze(&table(), &config()).unwrap();
        let r = &out.result;
        assert_eq!(r.tickers, vec!["AAA".to_string(), "BBB".to_string()]);
        assert_eq!(r.price_dates, 8);
        assert_eq!(r.statistics.observations, Some(7));
        assert_eq!(r.population.len(), 200);
        assert!(r.optimization.converged, "{}", r.optimization.message);
        assert!(out.methodology.contains("Markowitz"));
    }

    #[test]
    fn test_analyze_is_reproducible_with_seed() {
        let a = analyze(&table(), &config()).unwrap().result;
        let b = analyze(&table(), &config()).unwrap().result;
        assert_eq!(a.population, b.population);
        assert_eq!(a.optimization.weights, b.optimization.weights);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = config();
        cfg.trading_days_per_year = 0;
        assert!(matches!(
            analyze(&table(), &cfg),
            Err(MarkowitzError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_provider_unknown_ticker() {
        let provider = StaticPriceProvider::from_table(table());
        let request = PriceRequest::new(vec!["AAA".into(), "ZZZ".into()]);
        let err = analyze_from_provider(&provider, &request, &config()).unwrap_err();
        match err {
            MarkowitzError::DataUnavailable { ticker, .. } => assert_eq!(ticker, "ZZZ"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
