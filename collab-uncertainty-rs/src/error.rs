//! Error types for the forecasting heads and losses.

use thiserror::Error;

/// Result type for forecasting operations.
pub type ForecastResult<T> = Result<T, ForecastError>;

/// Errors that can occur while building heads, running them, or scoring them.
///
/// A scene without any valid agent is deliberately *not* an error: the loss
/// skips it and reports it through `LossBreakdown::degenerate_scenes`.
#[derive(Debug, Error)]
pub enum ForecastError {
    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Agent, mode, time or axis dimensions disagree between tensors
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// A non-finite value survived a positivity/validity transform
    #[error("Numerical instability in {stage}: {detail}")]
    NumericalInstability { stage: String, detail: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed batch (ragged packing, scene ids, validity flags)
    #[error("Batch error: {0}")]
    Batch(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ForecastError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create a numerical instability error for the named stage
    pub fn numerical(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::NumericalInstability {
            stage: stage.into(),
            detail: detail.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a batch error
    pub fn batch(msg: impl Into<String>) -> Self {
        Self::Batch(msg.into())
    }
}

/// Check that `tensor` has exactly the dimensions in `expected`.
///
/// `what` names the tensor in the resulting error message.
pub fn expect_dims(what: &str, tensor: &candle_core::Tensor, expected: &[usize]) -> ForecastResult<()> {
    if tensor.dims() != expected {
        return Err(ForecastError::shape_mismatch(
            format!("{what} with dims {expected:?}"),
            format!("{:?}", tensor.dims()),
        ));
    }
    Ok(())
}
