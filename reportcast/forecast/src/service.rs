//! Service lifecycle: wires store, model, trainer, predictor and refresh loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use shared_event_bus::FileEventPublisher;
use shared_logging::LogLevel;

use crate::{
    artifact::ModelArtifact,
    config::{ServiceConfig, StorageKind},
    error::ForecastResult,
    model::ModelWrapper,
    predictor::{PredictionResult, PredictionService},
    preprocess::FeaturePreprocessor,
    record::{example_record, Document, TestReport},
    refresh::{CachedPrediction, Clock, PredictionCache, RefreshHandle, RefreshLoop, SystemClock},
    storage::{JsonlReportStore, MemoryReportStore, ReportStore},
    telemetry::ForecastTelemetry,
    trainer::{TrainingOrchestrator, TrainingSummary},
};

/// Banner returned by the status endpoint.
pub const BANNER: &str = "Reportcast forecasting service is running";

/// Snapshot served by `GET /`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    /// Banner.
    pub message: String,
    /// Latest cached prediction, if any.
    pub latest_prediction: Option<CachedPrediction>,
    /// Usage hint.
    pub instructions: String,
    /// The example record.
    pub sample_input: Document,
    /// Live schema version, if a model is trained.
    pub schema_version: Option<u64>,
    /// Ready-made requests against this instance.
    pub links: Value,
}

/// The running forecasting service.
#[derive(Debug)]
pub struct ForecastService {
    config: ServiceConfig,
    store: Arc<dyn ReportStore>,
    model: Arc<ModelWrapper>,
    trainer: TrainingOrchestrator,
    predictor: PredictionService,
    cache: Arc<PredictionCache>,
    refresh: Mutex<Option<RefreshHandle>>,
    telemetry: ForecastTelemetry,
}

impl ForecastService {
    /// Builds the service from configuration, restores or trains the model and
    /// starts the refresh loop.
    ///
    /// A failed startup retrain is logged; the service still comes up and
    /// `/predict` reports the model as untrained until a retrain succeeds.
    pub async fn init(config: ServiceConfig) -> Result<Self> {
        let service = Self::open(config).await?;
        service.restore().await;
        if let Err(err) = service.retrain().await {
            service.telemetry.note(
                LogLevel::Warn,
                "forecast.service.startup_retrain_failed",
                json!({ "error": err.to_string() }),
            );
        }
        service.start_refresh(Arc::new(SystemClock));
        Ok(service)
    }

    /// Opens the configured store and telemetry sinks without training or
    /// starting the refresh loop.
    pub async fn open(config: ServiceConfig) -> Result<Self> {
        let telemetry = build_telemetry(&config)?;
        let store = open_store(&config).await?;
        Ok(Self::new(config, store, telemetry))
    }

    /// Wires components around `store` without doing any work.
    #[must_use]
    pub fn new(config: ServiceConfig, store: Arc<dyn ReportStore>, telemetry: ForecastTelemetry) -> Self {
        let preprocessor = FeaturePreprocessor::default();
        let model = Arc::new(ModelWrapper::new(config.model.forest()));
        let mut trainer = TrainingOrchestrator::new(
            Arc::clone(&store),
            config.storage.collection.clone(),
            preprocessor.clone(),
            Arc::clone(&model),
            telemetry.clone(),
        );
        if let Some(path) = &config.model.artifact_path {
            trainer = trainer.with_artifact(ModelArtifact::new(path));
        }
        let predictor = PredictionService::new(preprocessor, Arc::clone(&model), telemetry.clone());
        Self {
            config,
            store,
            model,
            trainer,
            predictor,
            cache: Arc::new(PredictionCache::new()),
            refresh: Mutex::new(None),
            telemetry,
        }
    }

    /// Installs the saved model artifact, if configured and present.
    pub async fn restore(&self) -> bool {
        let Some(path) = &self.config.model.artifact_path else {
            return false;
        };
        match ModelArtifact::new(path).load().await {
            Ok(Some(model)) => {
                let model = self.model.install(model);
                self.telemetry.note(
                    LogLevel::Info,
                    "forecast.artifact.loaded",
                    json!({ "path": path, "schema_version": model.schema.version }),
                );
                true
            }
            Ok(None) => false,
            Err(err) => {
                self.telemetry.note(
                    LogLevel::Warn,
                    "forecast.artifact.load_failed",
                    json!({ "path": path, "error": err.to_string() }),
                );
                false
            }
        }
    }

    /// Starts the refresh loop unless it is already running.
    pub fn start_refresh(&self, clock: Arc<dyn Clock>) {
        let mut slot = self.refresh.lock();
        if slot.is_some() {
            return;
        }
        let handle = RefreshLoop::new(
            Arc::clone(&self.model),
            Arc::clone(&self.cache),
            self.config.refresh.interval(),
        )
        .clock(clock)
        .telemetry(self.telemetry.clone())
        .spawn();
        *slot = Some(handle);
    }

    /// Stops the refresh loop.
    pub async fn shutdown(&self) {
        let handle = self.refresh.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
            self.telemetry
                .note(LogLevel::Info, "forecast.service.stopped", json!({}));
        }
    }

    /// Retrains from the report store.
    pub async fn retrain(&self) -> ForecastResult<TrainingSummary> {
        self.trainer.retrain().await
    }

    /// Predicts `record`, or the example record when `None`.
    pub fn predict(&self, record: Option<&Document>) -> ForecastResult<PredictionResult> {
        self.predictor.predict_one(record)
    }

    /// Latest cached daily prediction.
    pub fn daily_prediction(&self) -> ForecastResult<CachedPrediction> {
        self.cache.require()
    }

    /// Every stored report in the configured collection.
    pub async fn reports(&self) -> ForecastResult<Vec<Document>> {
        Ok(self.store.find_all(&self.config.storage.collection).await?)
    }

    /// Validates `document` as a test report and stores it. Returns the new id.
    pub async fn submit(&self, document: &Document) -> ForecastResult<String> {
        let report = TestReport::from_document(document)?;
        let id = self
            .store
            .insert(&self.config.storage.collection, report.to_document()?)
            .await?;
        self.telemetry.note(
            LogLevel::Info,
            "forecast.report.submitted",
            json!({ "id": id, "project": report.project_name }),
        );
        Ok(id)
    }

    /// Status snapshot for the root endpoint.
    #[must_use]
    pub fn status(&self) -> ServiceStatus {
        let base = format!("http://{}", self.config.server.bind);
        ServiceStatus {
            message: BANNER.into(),
            latest_prediction: self.cache.latest(),
            instructions: "POST a test report to /predict for a forecast; POST /train after new reports arrive."
                .into(),
            sample_input: example_record(),
            schema_version: self.model.live().map(|m| m.schema.version),
            links: json!({
                "train_endpoint": format!("curl -X POST {base}/train"),
                "predict_endpoint": format!("curl -X POST {base}/predict -H 'content-type: application/json' -d @report.json"),
                "daily_prediction_endpoint": format!("curl {base}/daily_prediction"),
            }),
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Prediction cache shared with the refresh loop.
    #[must_use]
    pub fn cache(&self) -> Arc<PredictionCache> {
        Arc::clone(&self.cache)
    }

    /// Model wrapper holding the live model.
    #[must_use]
    pub fn model(&self) -> Arc<ModelWrapper> {
        Arc::clone(&self.model)
    }
}

fn build_telemetry(config: &ServiceConfig) -> Result<ForecastTelemetry> {
    let settings = &config.telemetry;
    let mut builder = ForecastTelemetry::builder("forecast").log_level(settings.log_level);
    if let Some(path) = &settings.log_path {
        builder = builder.log_path(path);
    }
    if let Some(path) = &settings.event_log {
        let publisher = FileEventPublisher::new(path)
            .with_context(|| format!("opening event log {}", path.display()))?;
        builder = builder.event_publisher(Arc::new(publisher));
    }
    builder.build().context("building forecast telemetry")
}

async fn open_store(config: &ServiceConfig) -> Result<Arc<dyn ReportStore>> {
    Ok(match config.storage.kind {
        StorageKind::Memory => Arc::new(MemoryReportStore::new()),
        StorageKind::Jsonl => {
            let root = &config.storage.path;
            tokio::fs::create_dir_all(root)
                .await
                .with_context(|| format!("creating report store {}", root.display()))?;
            Arc::new(JsonlReportStore::new(root))
        }
    })
}
