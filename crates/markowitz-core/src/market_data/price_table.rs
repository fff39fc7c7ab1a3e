use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

use crate::error::MarkowitzError;
use crate::types::Ticker;
use crate::MarkowitzResult;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A single closing price. `None` marks a missing value in the source data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub date: NaiveDate,
    pub close: Option<f64>,
}

/// Raw, possibly unaligned, closing prices of one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    pub ticker: Ticker,
    pub observations: Vec<PriceObservation>,
}

/// Closing prices of several assets on a shared, strictly increasing date index.
///
/// `rows[t][a]` is the close of `tickers[a]` on `dates[t]`. Every cell is
/// present; alignment has already dropped dates with a missing value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTable {
    tickers: Vec<Ticker>,
    dates: Vec<NaiveDate>,
    rows: Vec<Vec<f64>>,
    /// Dates removed during alignment because some asset had no price.
    #[serde(default)]
    dropped_dates: usize,
}

impl PriceSeries {
    pub fn new(ticker: impl Into<Ticker>, observations: Vec<PriceObservation>) -> Self {
        PriceSeries {
            ticker: ticker.into(),
            observations,
        }
    }

    /// Build a fully observed series from `(date, close)` pairs.
    pub fn from_closes(ticker: impl Into<Ticker>, closes: &[(NaiveDate, f64)]) -> Self {
        let observations = closes
            .iter()
            .map(|&(date, close)| PriceObservation {
                date,
                close: Some(close),
            })
            .collect();
        PriceSeries::new(ticker, observations)
    }
}

impl PriceTable {
    /// Validate an already aligned table.
    pub fn new(
        tickers: Vec<Ticker>,
        dates: Vec<NaiveDate>,
        rows: Vec<Vec<f64>>,
    ) -> MarkowitzResult<Self> {
        validate_tickers(&tickers)?;

        if rows.len() != dates.len() {
            return Err(MarkowitzError::InvalidInput {
                field: "rows".into(),
                reason: format!("Expected {} rows but got {}", dates.len(), rows.len()),
            });
        }
        for pair in dates.windows(2) {
            if pair[1] <= pair[0] {
                return Err(MarkowitzError::InvalidInput {
                    field: "dates".into(),
                    reason: format!(
                        "Dates must be strictly increasing ({} then {})",
                        pair[0], pair[1]
                    ),
                });
            }
        }
        for (t, row) in rows.iter().enumerate() {
            if row.len() != tickers.len() {
                return Err(MarkowitzError::InvalidInput {
                    field: "rows".into(),
                    reason: format!(
                        "Row for {} has {} prices, expected {}",
                        dates[t],
                        row.len(),
                        tickers.len()
                    ),
                });
            }
            if let Some(a) = row.iter().position(|p| p.is_nan()) {
                return Err(MarkowitzError::InvalidInput {
                    field: "rows".into(),
                    reason: format!("Missing price for {} on {}", tickers[a], dates[t]),
                });
            }
        }

        Ok(PriceTable {
            tickers,
            dates,
            rows,
            dropped_dates: 0,
        })
    }

    /// Inner-join several series on their dates.
    ///
    /// A date survives only if every series has a price on it. Duplicate
    /// dates within one series keep the last observation.
    pub fn align(series: Vec<PriceSeries>) -> MarkowitzResult<Self> {
        let tickers: Vec<Ticker> = series.iter().map(|s| s.ticker.clone()).collect();
        validate_tickers(&tickers)?;

        let by_date: Vec<BTreeMap<NaiveDate, Option<f64>>> = series
            .iter()
            .map(|s| s.observations.iter().map(|o| (o.date, o.close)).collect())
            .collect();

        let all_dates: BTreeSet<NaiveDate> = by_date
            .iter()
            .flat_map(|m| m.keys().copied())
            .collect();

        let mut dates = Vec::with_capacity(all_dates.len());
        let mut rows = Vec::with_capacity(all_dates.len());
        let mut dropped = 0usize;

        for date in all_dates {
            let row: Option<Vec<f64>> = by_date
                .iter()
                .map(|m| m.get(&date).copied().flatten().filter(|p| !p.is_nan()))
                .collect();
            match row {
                Some(prices) => {
                    dates.push(date);
                    rows.push(prices);
                }
                None => dropped += 1,
            }
        }

        debug!(
            assets = tickers.len(),
            rows = dates.len(),
            dropped,
            "aligned price series"
        );

        Ok(PriceTable {
            tickers,
            dates,
            rows,
            dropped_dates: dropped,
        })
    }

    pub fn tickers(&self) -> &[Ticker] {
        &self.tickers
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn num_assets(&self) -> usize {
        self.tickers.len()
    }

    pub fn num_dates(&self) -> usize {
        self.dates.len()
    }

    pub fn dropped_dates(&self) -> usize {
        self.dropped_dates
    }

    /// Closing prices of one asset in date order.
    pub fn column(&self, asset: usize) -> Vec<f64> {
        self.rows.iter().map(|row| row[asset]).collect()
    }

    /// Keep only the requested tickers (in request order) and dates within
    /// `[start, end]`.
    pub fn select(
        &self,
        tickers: &[Ticker],
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> MarkowitzResult<PriceTable> {
        let indices = tickers
            .iter()
            .map(|t| {
                self.tickers
                    .iter()
                    .position(|own| own == t)
                    .ok_or_else(|| MarkowitzError::DataUnavailable {
                        ticker: t.clone(),
                        reason: "ticker not present in price data".into(),
                    })
            })
            .collect::<MarkowitzResult<Vec<usize>>>()?;

        let mut dates = Vec::new();
        let mut rows = Vec::new();
        for (date, row) in self.dates.iter().zip(self.rows.iter()) {
            if start.is_some_and(|s| *date < s) || end.is_some_and(|e| *date > e) {
                continue;
            }
            dates.push(*date);
            rows.push(indices.iter().map(|&i| row[i]).collect());
        }

        let mut table = PriceTable::new(tickers.to_vec(), dates, rows)?;
        table.dropped_dates = self.dropped_dates;
        Ok(table)
    }
}

fn validate_tickers(tickers: &[Ticker]) -> MarkowitzResult<()> {
    if tickers.is_empty() {
        return Err(MarkowitzError::InsufficientData(
            "At least one asset required".into(),
        ));
    }
    let mut seen = HashSet::new();
    for t in tickers {
        if !seen.insert(t.as_str()) {
            return Err(MarkowitzError::InvalidInput {
                field: "tickers".into(),
                reason: format!("Duplicate ticker {}", t),
            });
        }
    }
    Ok(())
}
