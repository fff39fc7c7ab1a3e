pub mod evaluator;
pub mod weights;

pub use evaluator::{PortfolioEvaluator, PortfolioMetrics};
pub use weights::{equal_weights, validate_weights, WEIGHT_TOLERANCE};
