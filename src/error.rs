//! Error types for the business physics engine.
//!
//! Only structural problems surface as errors. Sparse data is reported through
//! [`LearningStatus`](crate::learner::LearningStatus) and numeric hazards are
//! recovered where they happen.

use thiserror::Error;

/// Main error type for engine operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Node index outside the fixed 72-node space
    #[error("Node index out of range: {index} (expected 0..=71)")]
    NodeOutOfRange { index: usize },

    /// Symbolic node id that does not resolve
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// Coefficient key not of the form `<node>-><node>`
    #[error("Malformed coefficient key: {0}")]
    MalformedKey(String),

    /// No causal link between the two nodes
    #[error("Unknown causal link: {from} -> {to}")]
    UnknownLink { from: String, to: String },

    /// Snapshot periods not strictly increasing
    #[error("Period order violated: {next} does not follow {previous}")]
    PeriodOrder { previous: i64, next: i64 },

    /// Threshold key not configured in the hierarchy
    #[error("Unknown threshold: {0}")]
    UnknownThreshold(String),

    /// Prior range with min above max
    #[error("Invalid prior range: [{min}, {max}]")]
    InvalidRange { min: f64, max: f64 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Structural errors are fatal and never recovered locally.
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            EngineError::ConfigError(_) | EngineError::SerializationError(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::SerializationError(err.to_string())
    }
}

#[cfg(feature = "wasm")]
impl From<EngineError> for wasm_bindgen::JsValue {
    fn from(err: EngineError) -> Self {
        wasm_bindgen::JsValue::from_str(&err.to_string())
    }
}
