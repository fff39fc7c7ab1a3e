use chrono::NaiveDate;
use clap::Args;
use tracing::debug;

use markowitz_core::market_data::{MarketDataProvider, PriceRequest, PriceTable};
use markowitz_core::EngineConfig;

use crate::input;
use crate::input::prices::CsvPriceProvider;

/// Where prices come from and which slice of them to use.
#[derive(Args, Debug, Clone)]
pub struct PriceArgs {
    /// CSV file of closing prices (`date,TICKER,...`); reads stdin if omitted
    #[arg(long)]
    pub prices: Option<String>,

    /// Comma-separated tickers to use (default: every column)
    #[arg(long, value_delimiter = ',')]
    pub tickers: Vec<String>,

    /// First date to include (YYYY-MM-DD)
    #[arg(long)]
    pub start: Option<NaiveDate>,

    /// Last date to include (YYYY-MM-DD)
    #[arg(long)]
    pub end: Option<NaiveDate>,
}

/// Engine configuration file plus per-field overrides.
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// JSON or YAML engine configuration
    #[arg(long)]
    pub config: Option<String>,

    /// Annual risk-free rate (e.g. 0.04 for 4%)
    #[arg(long, allow_hyphen_values = true)]
    pub risk_free_rate: Option<f64>,

    /// Trading days used to annualise daily statistics
    #[arg(long)]
    pub trading_days: Option<u32>,

    /// Fail when there are fewer return observations than assets
    #[arg(long)]
    pub strict: bool,
}

/// Random sampling overrides.
#[derive(Args, Debug, Clone)]
pub struct SamplerArgs {
    /// Number of random portfolios
    #[arg(long)]
    pub samples: Option<usize>,

    /// Seed for reproducible sampling and restarts
    #[arg(long)]
    pub seed: Option<u64>,

    /// Parallel sampling workers
    #[arg(long)]
    pub workers: Option<usize>,
}

/// Optimizer overrides.
#[derive(Args, Debug, Clone)]
pub struct OptimizerArgs {
    /// Additional solver runs from random starting points
    #[arg(long)]
    pub restarts: Option<usize>,

    /// Per-asset lower weight bound
    #[arg(long)]
    pub min_weight: Option<f64>,

    /// Per-asset upper weight bound
    #[arg(long)]
    pub max_weight: Option<f64>,

    /// Solver iteration limit
    #[arg(long)]
    pub max_iterations: Option<u32>,
}

impl EngineArgs {
    /// Load the configuration file, if any, then apply flag overrides.
    pub fn resolve(&self) -> Result<EngineConfig, Box<dyn std::error::Error>> {
        let mut config: EngineConfig = match self.config {
            Some(ref path) => input::file::read_config(path)?,
            None => EngineConfig::default(),
        };
        if let Some(rf) = self.risk_free_rate {
            config.risk_free_rate = rf;
        }
        if let Some(days) = self.trading_days {
            config.trading_days_per_year = days;
        }
        if self.strict {
            config.strict_statistics = true;
        }
        Ok(config)
    }
}

impl SamplerArgs {
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(count) = self.samples {
            config.sampler.count = count;
        }
        if let Some(seed) = self.seed {
            config.sampler.seed = Some(seed);
            config.optimizer.seed.get_or_insert(seed);
        }
        if let Some(workers) = self.workers {
            config.sampler.workers = workers;
        }
    }
}

impl OptimizerArgs {
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(restarts) = self.restarts {
            config.optimizer.restarts = restarts;
        }
        if let Some(lo) = self.min_weight {
            config.optimizer.min_weight = lo;
        }
        if let Some(hi) = self.max_weight {
            config.optimizer.max_weight = hi;
        }
        if let Some(iters) = self.max_iterations {
            config.optimizer.max_iterations = iters;
        }
    }
}

/// Build the price request and fetch the table it describes.
pub fn load_prices(args: &PriceArgs) -> Result<PriceTable, Box<dyn std::error::Error>> {
    let text = match args.prices {
        Some(ref path) => input::file::read_text(path)?,
        None => input::stdin::read_stdin()?
            .ok_or("Provide --prices <file.csv> or pipe CSV prices via stdin")?,
    };
    let provider = CsvPriceProvider::from_reader(text.as_bytes())?;

    let request = PriceRequest {
        tickers: args.tickers.clone(),
        start: args.start,
        end: args.end,
    };
    let table = provider.fetch(&request)?;
    debug!(
        assets = table.num_assets(),
        dates = table.num_dates(),
        "loaded prices"
    );
    Ok(table)
}
