use thiserror::Error;

/// Every failure the refinement library can report.
///
/// Setup problems (`Configuration`, `Definition`) surface before a run starts.
/// `NumericInstability` and `SelectionExhausted` abort a run that is already
/// in progress. Rejected moves are never errors.
#[derive(Debug, Error)]
pub enum RmcError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Definition error: {0}")]
    Definition(String),

    #[error("Numeric instability in {context}: {value}")]
    NumericInstability { context: String, value: f64 },

    #[error("No selectable group: {0}")]
    SelectionExhausted(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RmcError>;

/// Fails with `NumericInstability` when `value` is NaN or infinite.
#[inline]
pub fn ensure_finite(value: f64, context: &str) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(RmcError::NumericInstability {
            context: context.to_string(),
            value,
        })
    }
}
