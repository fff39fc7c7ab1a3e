pub mod estimator;
pub mod returns;

pub use estimator::{Conditioning, Statistics, StatisticsEstimator};
pub use returns::{RejectedPrice, ReturnCalculator, ReturnMatrix};
