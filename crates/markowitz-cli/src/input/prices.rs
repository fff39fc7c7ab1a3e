use chrono::NaiveDate;
use std::io::Read;

use markowitz_core::market_data::{
    MarketDataProvider, PriceObservation, PriceRequest, PriceSeries, PriceTable,
    StaticPriceProvider,
};
use markowitz_core::{MarkowitzError, MarkowitzResult};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Closing prices from a wide CSV file: `date,TICKER_1,TICKER_2,...`.
///
/// One row per date (`YYYY-MM-DD`). Empty cells are missing prices and drop
/// that date during alignment.
#[derive(Debug, Clone)]
pub struct CsvPriceProvider {
    inner: StaticPriceProvider,
    tickers: Vec<String>,
}

impl CsvPriceProvider {
    pub fn from_reader<R: Read>(reader: R) -> MarkowitzResult<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr.headers().map_err(csv_error)?.clone();
        if headers.len() < 2 {
            return Err(MarkowitzError::InvalidInput {
                field: "prices".into(),
                reason: "Header must be 'date' followed by at least one ticker".into(),
            });
        }
        let tickers: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();
        let mut series: Vec<PriceSeries> = tickers
            .iter()
            .map(|t| PriceSeries::new(t.clone(), Vec::new()))
            .collect();

        for (line, record) in rdr.records().enumerate() {
            let record = record.map_err(csv_error)?;
            let raw_date = record.get(0).unwrap_or_default();
            let date = NaiveDate::parse_from_str(raw_date, DATE_FORMAT).map_err(|e| {
                MarkowitzError::InvalidInput {
                    field: "prices".into(),
                    reason: format!("Row {}: bad date '{}': {}", line + 2, raw_date, e),
                }
            })?;

            for (a, s) in series.iter_mut().enumerate() {
                let cell = record.get(a + 1).unwrap_or_default();
                let close = if cell.is_empty() {
                    None
                } else {
                    Some(cell.parse::<f64>().map_err(|e| MarkowitzError::InvalidInput {
                        field: "prices".into(),
                        reason: format!(
                            "Row {}: bad price '{}' for {} on {}: {}",
                            line + 2,
                            cell,
                            s.ticker,
                            date,
                            e
                        ),
                    })?)
                };
                s.observations.push(PriceObservation { date, close });
            }
        }

        Ok(CsvPriceProvider {
            inner: StaticPriceProvider::new(series)?,
            tickers,
        })
    }

    pub fn tickers(&self) -> &[String] {
        &self.tickers
    }
}

impl MarketDataProvider for CsvPriceProvider {
    /// An empty ticker list selects every column of the file.
    fn fetch(&self, request: &PriceRequest) -> MarkowitzResult<PriceTable> {
        if request.tickers.is_empty() {
            let all = PriceRequest {
                tickers: self.tickers.clone(),
                ..request.clone()
            };
            return self.inner.fetch(&all);
        }
        self.inner.fetch(request)
    }
}

fn csv_error(e: csv::Error) -> MarkowitzError {
    MarkowitzError::InvalidInput {
        field: "prices".into(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
date,AAA,BBB
2024-01-02,100.0,50.0
2024-01-03,101.0,
2024-01-04,102.5,51.0
2024-01-05,101.0,50.5
";

    #[test]
    fn test_reads_wide_csv() {
        let provider = CsvPriceProvider::from_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(provider.tickers(), &["AAA".to_string(), "BBB".to_string()]);

        let table = provider.fetch(&PriceRequest::new(Vec::new())).unwrap();
        assert_eq!(table.num_assets(), 2);
        // 2024-01-03 has no BBB price.
        assert_eq!(table.num_dates(), 3);
        assert_eq!(table.dropped_dates(), 1);
    }

    #[test]
    fn test_selects_tickers_and_range() {
        let provider = CsvPriceProvider::from_reader(SAMPLE.as_bytes()).unwrap();
        let d = |day| NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
        let request = PriceRequest::new(vec!["BBB".into()]).between(d(4), d(5));
        let table = provider.fetch(&request).unwrap();
        assert_eq!(table.tickers(), &["BBB".to_string()]);
        assert_eq!(table.column(0), vec![51.0, 50.5]);
    }

    #[test]
    fn test_unknown_ticker() {
        let provider = CsvPriceProvider::from_reader(SAMPLE.as_bytes()).unwrap();
        let err = provider
            .fetch(&PriceRequest::new(vec!["ZZZ".into()]))
            .unwrap_err();
        assert!(matches!(
            err,
            MarkowitzError::DataUnavailable { ref ticker, .. } if ticker == "ZZZ"
        ));
    }

    #[test]
    fn test_bad_price_rejected() {
        let data = "date,AAA\n2024-01-02,abc\n";
        let err = CsvPriceProvider::from_reader(data.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn test_bad_date_rejected() {
        let data = "date,AAA\n02/01/2024,100\n";
        assert!(CsvPriceProvider::from_reader(data.as_bytes()).is_err());
    }
}
