#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Reportcast forecasting core: test-report preprocessing, forest regression,
//! retraining, on-demand prediction and the periodic daily refresh.

/// Trained-model persistence.
pub mod artifact;
/// TOML configuration.
pub mod config;
/// Error types shared across the crate.
pub mod error;
/// Holdout evaluation and error metrics.
pub mod evaluate;
/// Random-forest regressor.
pub mod forest;
/// Regressor contract and the live-model wrapper.
pub mod model;
/// Single-record prediction.
pub mod predictor;
/// Feature normalization, schema alignment and standardization.
pub mod preprocess;
/// Test-report records.
pub mod record;
/// Periodic prediction refresh.
pub mod refresh;
/// Service lifecycle.
pub mod service;
/// Report storage gateway.
pub mod storage;
/// Telemetry helpers for logging/event emission.
pub mod telemetry;
/// Retraining orchestration.
pub mod trainer;

pub use config::ServiceConfig;
pub use error::{ForecastError, ForecastResult, ModelError, StorageError};
pub use evaluate::{evaluate, EvaluationOptions, EvaluationReport};
pub use forest::{ForestConfig, RegressionForest};
pub use model::{ModelWrapper, Regressor, TrainedModel};
pub use predictor::{PredictionResult, PredictionService};
pub use preprocess::{FeatureMap, FeaturePreprocessor, FeatureSchema, Standardizer};
pub use record::{example_record, Document, TestReport};
pub use refresh::{CachedPrediction, Clock, PredictionCache, RefreshHandle, RefreshLoop};
pub use service::{ForecastService, ServiceStatus};
pub use storage::{JsonlReportStore, MemoryReportStore, ReportStore};
pub use telemetry::ForecastTelemetry;
pub use trainer::{TrainingOrchestrator, TrainingSummary};
