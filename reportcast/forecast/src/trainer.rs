//! Retraining workflow: fetch reports, build the training set, fit, persist.

use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    artifact::ModelArtifact,
    error::{ForecastError, ForecastResult},
    model::{ModelWrapper, Regressor},
    preprocess::FeaturePreprocessor,
    record::example_record,
    storage::ReportStore,
    telemetry::ForecastTelemetry,
};

/// Outcome of a successful retrain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    /// Rows the model was fitted on.
    pub rows: usize,
    /// Feature columns.
    pub features: usize,
    /// Version of the schema the new model carries.
    pub schema_version: u64,
    /// True when the store was empty and the example record was used.
    pub used_example: bool,
    /// In-sample mean squared error.
    pub training_mse: f64,
    /// Completion time of the fit.
    pub trained_at: DateTime<Utc>,
    /// Wall-clock duration of the whole retrain.
    pub duration_ms: u64,
    /// Human-readable outcome.
    pub message: String,
}

/// Runs retrains against a report store and swaps the live model.
#[derive(Debug)]
pub struct TrainingOrchestrator {
    store: Arc<dyn ReportStore>,
    collection: String,
    preprocessor: FeaturePreprocessor,
    model: Arc<ModelWrapper>,
    artifact: Option<ModelArtifact>,
    telemetry: ForecastTelemetry,
    retrain_lock: AsyncMutex<()>,
}

impl TrainingOrchestrator {
    /// Creates an orchestrator reading `collection` from `store`.
    #[must_use]
    pub fn new(
        store: Arc<dyn ReportStore>,
        collection: impl Into<String>,
        preprocessor: FeaturePreprocessor,
        model: Arc<ModelWrapper>,
        telemetry: ForecastTelemetry,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            preprocessor,
            model,
            artifact: None,
            telemetry,
            retrain_lock: AsyncMutex::new(()),
        }
    }

    /// Persists every successfully trained model to `artifact`.
    #[must_use]
    pub fn with_artifact(mut self, artifact: ModelArtifact) -> Self {
        self.artifact = Some(artifact);
        self
    }

    /// Collection the orchestrator trains from.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Rebuilds the model from every stored report.
    ///
    /// An empty collection trains on the example record. Retrains never
    /// overlap; a second caller waits for the first to finish.
    pub async fn retrain(&self) -> ForecastResult<TrainingSummary> {
        let _guard = self.retrain_lock.lock().await;
        let started = Instant::now();
        self.telemetry.note(
            LogLevel::Info,
            "forecast.retrain.started",
            json!({ "collection": self.collection }),
        );
        match self.run(started).await {
            Ok(summary) => {
                self.telemetry.note(
                    LogLevel::Info,
                    "forecast.retrain.completed",
                    json!({
                        "rows": summary.rows,
                        "features": summary.features,
                        "schema_version": summary.schema_version,
                        "used_example": summary.used_example,
                        "training_mse": summary.training_mse,
                        "duration_ms": summary.duration_ms,
                    }),
                );
                self.telemetry.announce(
                    "forecast.retrain.completed",
                    json!({
                        "rows": summary.rows,
                        "schema_version": summary.schema_version,
                    }),
                );
                Ok(summary)
            }
            Err(err) => {
                self.telemetry.note(
                    LogLevel::Error,
                    "forecast.retrain.failed",
                    json!({ "collection": self.collection, "error": err.to_string() }),
                );
                self.telemetry.announce(
                    "forecast.retrain.failed",
                    json!({ "error": err.to_string() }),
                );
                Err(err)
            }
        }
    }

    async fn run(&self, started: Instant) -> ForecastResult<TrainingSummary> {
        self.store.ping().await?;
        let mut records = self.store.find_all(&self.collection).await?;
        let used_example = records.is_empty();
        if used_example {
            self.telemetry.note(
                LogLevel::Warn,
                "forecast.retrain.example_fallback",
                json!({ "collection": self.collection }),
            );
            records.push(example_record());
        }

        let set = self.preprocessor.training_set(&records)?;
        if set.rows() == 0 {
            return Err(ForecastError::InsufficientData(
                "no rows left after preprocessing".into(),
            ));
        }
        let rows = set.rows();
        let features = set.fields.len();
        let trained = self.model.fit(set).await?;

        if let Some(artifact) = &self.artifact {
            if let Err(err) = artifact.save(&trained).await {
                self.telemetry.note(
                    LogLevel::Warn,
                    "forecast.artifact.save_failed",
                    json!({ "path": artifact.path(), "error": err.to_string() }),
                );
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;
        Ok(TrainingSummary {
            rows,
            features,
            schema_version: trained.schema.version,
            used_example,
            training_mse: trained.training_mse,
            trained_at: trained.trained_at,
            duration_ms,
            message: format!(
                "{} trained on {rows} rows with {features} features (schema v{})",
                trained.regressor.name(),
                trained.schema.version
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{forest::ForestConfig, storage::MemoryReportStore};
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    fn model() -> Arc<ModelWrapper> {
        Arc::new(ModelWrapper::new(ForestConfig {
            trees: 5,
            seed: Some(9),
            ..ForestConfig::default()
        }))
    }

    fn orchestrator(store: Arc<MemoryReportStore>, model: Arc<ModelWrapper>) -> TrainingOrchestrator {
        TrainingOrchestrator::new(
            store,
            "test_reports",
            FeaturePreprocessor::default(),
            model,
            ForecastTelemetry::tracing_only("forecast.trainer"),
        )
    }

    #[tokio::test]
    async fn empty_store_trains_on_example() {
        let store = Arc::new(MemoryReportStore::new());
        let model = model();
        let summary = orchestrator(store, model.clone()).retrain().await.unwrap();
        assert!(summary.used_example);
        assert_eq!(summary.rows, 1);
        assert_eq!(summary.features, 30);
        assert_eq!(summary.schema_version, 1);
        assert!(model.is_trained());
    }

    #[tokio::test]
    async fn stored_reports_drive_the_schema() {
        let store = Arc::new(MemoryReportStore::new());
        for i in 0..4 {
            let doc = json!({ "projectName": "P", "storyTests": 10 + i, "storyPassed": 5 + i });
            store
                .insert("test_reports", doc.as_object().cloned().unwrap())
                .await
                .unwrap();
        }
        let model = model();
        let summary = orchestrator(store, model.clone()).retrain().await.unwrap();
        assert!(!summary.used_example);
        assert_eq!(summary.rows, 4);
        assert_eq!(model.live().unwrap().schema.fields, vec!["storyTests"]);
    }

    #[tokio::test]
    async fn offline_store_is_unavailable() {
        let store = Arc::new(MemoryReportStore::new());
        store.set_offline(true);
        let model = model();
        let err = orchestrator(store, model.clone()).retrain().await.unwrap_err();
        assert!(matches!(err, ForecastError::StorageUnavailable(_)));
        assert!(!model.is_trained());
    }

    #[tokio::test]
    async fn unusable_target_skips_fit_and_keeps_model() {
        let store = Arc::new(MemoryReportStore::new());
        let model = model();
        let trainer = orchestrator(store.clone(), model.clone());
        trainer.retrain().await.unwrap();
        let before = model.live().unwrap();

        let doc = json!({ "storyTests": 3, "storyPassed": "many" });
        store
            .insert("test_reports", doc.as_object().cloned().unwrap())
            .await
            .unwrap();
        let err = trainer.retrain().await.unwrap_err();
        assert!(matches!(err, ForecastError::InsufficientData(_)));
        assert!(Arc::ptr_eq(&model.live().unwrap(), &before));
    }

    #[tokio::test]
    async fn successful_retrain_writes_artifact_and_event() {
        let dir = tempdir().unwrap();
        let artifact = ModelArtifact::new(dir.path().join("model.json"));
        let bus = Arc::new(MemoryEventBus::new(8));
        let telemetry = ForecastTelemetry::builder("forecast.trainer")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let trainer = TrainingOrchestrator::new(
            Arc::new(MemoryReportStore::new()),
            "test_reports",
            FeaturePreprocessor::default(),
            model(),
            telemetry,
        )
        .with_artifact(artifact.clone());
        trainer.retrain().await.unwrap();
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert!(artifact.load().await.unwrap().is_some());
        assert_eq!(bus.events_of("forecast.retrain.completed").len(), 1);
    }
}
