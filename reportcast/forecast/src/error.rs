use thiserror::Error;

/// Failures raised by a [`crate::model::Regressor`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    /// Training data or a sample did not satisfy the regressor's contract.
    #[error("invalid model input: {0}")]
    InvalidInput(String),
    /// Predict was called on a regressor that holds no fitted state.
    #[error("regressor has not been fitted")]
    Unfitted,
}

/// Failures raised by a [`crate::storage::ReportStore`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing store cannot be reached.
    #[error("store unreachable: {0}")]
    Unreachable(String),
    /// Filesystem I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A stored document could not be decoded.
    #[error("corrupt document in {collection} at line {line}: {source}")]
    Corrupt {
        /// Collection holding the document.
        collection: String,
        /// One-based line number.
        line: usize,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
    /// Encoding a document failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the forecast service operations.
#[derive(Debug, Error)]
pub enum ForecastError {
    /// The report store could not be reached or read.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    /// Nothing usable was left after preprocessing; training skipped.
    #[error("insufficient training data: {0}")]
    InsufficientData(String),
    /// The regressor rejected the training set; the previous model stays live.
    #[error("training failed: {0}")]
    TrainingFailed(String),
    /// Prediction requested before any successful training.
    #[error("model has not been trained yet")]
    NotTrained,
    /// Cached prediction requested before the first refresh cycle finished.
    #[error("daily prediction not available yet")]
    NotAvailable,
    /// The input carries numeric fields the live schema does not know.
    #[error("input does not match feature schema v{version}: unexpected fields {unexpected:?}")]
    SchemaMismatch {
        /// Live schema version.
        version: u64,
        /// Numeric fields present in the input but not in the schema.
        unexpected: Vec<String>,
    },
    /// A submitted record failed validation.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    /// A saved model artifact decoded but is not a usable model.
    #[error("corrupt model artifact: {0}")]
    CorruptArtifact(String),
    /// Filesystem I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding/decoding error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ForecastError {
    /// True for conditions caused by the caller rather than the service.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotAvailable | Self::SchemaMismatch { .. } | Self::InvalidRecord(_)
        )
    }
}

impl From<StorageError> for ForecastError {
    fn from(err: StorageError) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

impl From<ModelError> for ForecastError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Unfitted => Self::NotTrained,
            ModelError::InvalidInput(msg) => Self::TrainingFailed(msg),
        }
    }
}

/// Convenience alias used across the crate.
pub type ForecastResult<T> = Result<T, ForecastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_surface_as_unavailable() {
        let err: ForecastError = StorageError::Unreachable("connection refused".into()).into();
        assert!(matches!(err, ForecastError::StorageUnavailable(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn unfitted_model_maps_to_not_trained() {
        let err: ForecastError = ModelError::Unfitted.into();
        assert!(matches!(err, ForecastError::NotTrained));
        assert!(!err.is_client_error());
        assert!(ForecastError::NotAvailable.is_client_error());
    }
}
