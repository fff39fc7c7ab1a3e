use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::MarkowitzError;
use crate::market_data::PriceTable;
use crate::types::Ticker;
use crate::MarkowitzResult;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A price that could not enter a log-ratio (zero, negative or non-finite).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedPrice {
    pub date: NaiveDate,
    pub ticker: Ticker,
    pub price: f64,
}

/// Daily log-returns, one row per date after the first surviving date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnMatrix {
    pub tickers: Vec<Ticker>,
    /// End date of each return row.
    pub dates: Vec<NaiveDate>,
    /// `values[t][a]` = ln(p[a, t+1] / p[a, t]).
    pub values: Vec<Vec<f64>>,
    /// Price cells whose whole date row was rejected.
    pub rejected: Vec<RejectedPrice>,
}

impl ReturnMatrix {
    pub fn num_observations(&self) -> usize {
        self.values.len()
    }

    pub fn num_assets(&self) -> usize {
        self.tickers.len()
    }

    /// One date per row and one value per ticker in every row.
    pub fn check_dimensions(&self) -> MarkowitzResult<()> {
        if self.dates.len() != self.values.len() {
            return Err(MarkowitzError::InvalidInput {
                field: "dates".into(),
                reason: format!(
                    "{} dates for {} return rows",
                    self.dates.len(),
                    self.values.len()
                ),
            });
        }
        let n = self.num_assets();
        if let Some(t) = self.values.iter().position(|row| row.len() != n) {
            return Err(MarkowitzError::InvalidInput {
                field: "values".into(),
                reason: format!(
                    "Row {} has {} values, expected {}",
                    t,
                    self.values[t].len(),
                    n
                ),
            });
        }
        Ok(())
    }

    /// Returns of one asset. Rows must be `num_assets()` wide.
    pub fn column(&self, asset: usize) -> Vec<f64> {
        self.values.iter().map(|row| row[asset]).collect()
    }
}

// ---------------------------------------------------------------------------
// Calculator
// ---------------------------------------------------------------------------

/// Converts closing prices into log-returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReturnCalculator;

impl ReturnCalculator {
    pub fn new() -> Self {
        ReturnCalculator
    }

    /// Compute `ln(p_t / p_{t-1})` for every asset.
    ///
    /// Date rows holding a zero, negative or non-finite price are removed
    /// before differencing, so the affected return spans the gap between the
    /// neighbouring valid rows.
    pub fn compute(&self, prices: &PriceTable) -> MarkowitzResult<ReturnMatrix> {
        let tickers = prices.tickers().to_vec();
        let mut rejected = Vec::new();
        let mut valid: Vec<(NaiveDate, &Vec<f64>)> = Vec::with_capacity(prices.num_dates());

        for (date, row) in prices.dates().iter().zip(prices.rows()) {
            let bad: Vec<RejectedPrice> = row
                .iter()
                .enumerate()
                .filter(|(_, p)| !(p.is_finite() && **p > 0.0))
                .map(|(a, p)| RejectedPrice {
                    date: *date,
                    ticker: tickers[a].clone(),
                    price: *p,
                })
                .collect();
            if bad.is_empty() {
                valid.push((*date, row));
            } else {
                for r in &bad {
                    warn!(
                        ticker = %r.ticker,
                        date = %r.date,
                        price = r.price,
                        "rejecting price row"
                    );
                }
                rejected.extend(bad);
            }
        }

        if valid.len() < 2 {
            // Name the first asset that lost a row, otherwise the table is just short.
            let asset = rejected
                .first()
                .map(|r| r.ticker.as_str())
                .or_else(|| tickers.first().map(String::as_str))
                .unwrap_or_default();
            return Err(MarkowitzError::InsufficientData(format!(
                "{} has {} valid price observation(s); at least 2 are required",
                asset,
                valid.len()
            )));
        }

        let values: Vec<Vec<f64>> = valid
            .windows(2)
            .map(|pair| {
                let (_, prev) = pair[0];
                let (_, curr) = pair[1];
                curr.iter()
                    .zip(prev.iter())
                    .map(|(c, p)| (c / p).ln())
                    .collect()
            })
            .collect();
        let dates = valid.iter().skip(1).map(|(date, _)| *date).collect();

        debug!(
            observations = values.len(),
            assets = tickers.len(),
            rejected = rejected.len(),
            "computed log returns"
        );

        Ok(ReturnMatrix {
            tickers,
            dates,
            values,
            rejected,
        })
    }
}
