pub mod price_table;
pub mod provider;

pub use price_table::{PriceObservation, PriceSeries, PriceTable};
pub use provider::{MarketDataProvider, PriceRequest, StaticPriceProvider};
