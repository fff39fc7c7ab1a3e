pub mod sharpe;
pub mod sqp;

pub use sharpe::{OptimizationResult, SharpeOptimizer};
pub use sqp::{LinearConstraints, Objective, SqpOutcome, SqpSettings};
