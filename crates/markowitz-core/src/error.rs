use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarkowitzError {
    #[error("Invalid input: {field} — {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("Constraint violation: {reason}")]
    ConstraintViolation { reason: String },

    #[error("Optimization did not converge after {iterations} iterations: {message}")]
    OptimizationNonConvergence { iterations: u32, message: String },

    #[error("Market data unavailable for {ticker}: {reason}")]
    DataUnavailable { ticker: String, reason: String },

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for MarkowitzError {
    fn from(e: serde_json::Error) -> Self {
        MarkowitzError::SerializationError(e.to_string())
    }
}
