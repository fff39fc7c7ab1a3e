pub mod config;
pub mod error;
pub mod market_data;
pub mod portfolio;
pub mod statistics;
pub mod types;

#[cfg(feature = "monte_carlo")]
pub mod monte_carlo;

#[cfg(feature = "optimization")]
pub mod optimization;

#[cfg(all(feature = "monte_carlo", feature = "optimization"))]
pub mod pipeline;

pub use config::EngineConfig;
pub use error::MarkowitzError;
pub use types::*;

/// Standard result type for all markowitz operations
pub type MarkowitzResult<T> = Result<T, MarkowitzError>;
