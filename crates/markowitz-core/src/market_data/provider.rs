use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::price_table::{PriceSeries, PriceTable};
use crate::error::MarkowitzError;
use crate::types::Ticker;
use crate::MarkowitzResult;

/// What the driver asks a market data source for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRequest {
    pub tickers: Vec<Ticker>,
    #[serde(default)]
    pub start: Option<NaiveDate>,
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

/// Source of aligned closing prices.
///
/// Implementations return `DataUnavailable` when a ticker or date range
/// cannot be served; callers propagate it unchanged.
pub trait MarketDataProvider: Send + Sync {
    fn fetch(&self, request: &PriceRequest) -> MarkowitzResult<PriceTable>;
}

/// In-memory provider over pre-loaded series.
#[derive(Debug, Clone)]
pub struct StaticPriceProvider {
    table: PriceTable,
}

impl PriceRequest {
    pub fn new(tickers: Vec<Ticker>) -> Self {
        PriceRequest {
            tickers,
            start: None,
            end: None,
        }
    }

    pub fn between(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }
}

impl StaticPriceProvider {
    pub fn new(series: Vec<PriceSeries>) -> MarkowitzResult<Self> {
        Ok(StaticPriceProvider {
            table: PriceTable::align(series)?,
        })
    }

    pub fn from_table(table: PriceTable) -> Self {
        StaticPriceProvider { table }
    }
}

impl MarketDataProvider for StaticPriceProvider {
    fn fetch(&self, request: &PriceRequest) -> MarkowitzResult<PriceTable> {
        if request.tickers.is_empty() {
            return Err(MarkowitzError::InvalidInput {
                field: "tickers".into(),
                reason: "At least one ticker must be requested".into(),
            });
        }
        let table = self
            .table
            .select(&request.tickers, request.start, request.end)?;
        if table.num_dates() == 0 {
            return Err(MarkowitzError::DataUnavailable {
                ticker: request.tickers.join(","),
                reason: "no prices in the requested date range".into(),
            });
        }
        Ok(table)
    }
}
