//! Periodic refresh of the cached daily prediction.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

use crate::{
    error::{ForecastError, ForecastResult},
    model::ModelWrapper,
    preprocess::{FeatureMap, FeaturePreprocessor},
    record::example_record,
    telemetry::ForecastTelemetry,
};

/// Timestamp source for cached predictions.
pub trait Clock: fmt::Debug + Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// The latest periodic prediction, as served by `GET /daily_prediction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPrediction {
    /// When the cycle produced the value.
    pub timestamp: DateTime<Utc>,
    /// Single-element list holding the predicted value.
    pub predicted_output: Vec<f64>,
}

impl CachedPrediction {
    /// The predicted value.
    #[must_use]
    pub fn value(&self) -> Option<f64> {
        self.predicted_output.first().copied()
    }
}

/// Holds the most recent [`CachedPrediction`]; replaced whole on each update.
#[derive(Debug)]
pub struct PredictionCache {
    tx: watch::Sender<Option<CachedPrediction>>,
}

impl Default for PredictionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PredictionCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Latest prediction, if any cycle has succeeded.
    #[must_use]
    pub fn latest(&self) -> Option<CachedPrediction> {
        self.tx.borrow().clone()
    }

    /// Latest prediction or [`ForecastError::NotAvailable`].
    pub fn require(&self) -> ForecastResult<CachedPrediction> {
        self.latest().ok_or(ForecastError::NotAvailable)
    }

    /// Receiver notified on every replacement.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<CachedPrediction>> {
        self.tx.subscribe()
    }

    /// Replaces the cached prediction.
    pub fn store(&self, prediction: CachedPrediction) {
        self.tx.send_replace(Some(prediction));
    }
}

/// Recomputes the example-record prediction on a fixed interval.
#[derive(Debug)]
pub struct RefreshLoop {
    model: Arc<ModelWrapper>,
    cache: Arc<PredictionCache>,
    preprocessor: FeaturePreprocessor,
    clock: Arc<dyn Clock>,
    period: Duration,
    telemetry: ForecastTelemetry,
}

impl RefreshLoop {
    /// Loop refreshing `cache` from `model` every `period`.
    #[must_use]
    pub fn new(model: Arc<ModelWrapper>, cache: Arc<PredictionCache>, period: Duration) -> Self {
        Self {
            model,
            cache,
            preprocessor: FeaturePreprocessor::default(),
            clock: Arc::new(SystemClock),
            period,
            telemetry: ForecastTelemetry::tracing_only("forecast.refresh"),
        }
    }

    /// Overrides the preprocessor.
    #[must_use]
    pub fn preprocessor(mut self, preprocessor: FeaturePreprocessor) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    /// Overrides the timestamp source.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn telemetry(mut self, telemetry: ForecastTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Runs one cycle against `features` and stores the result.
    ///
    /// On failure the cache keeps its previous value.
    pub fn cycle(&self, features: &FeatureMap) -> ForecastResult<CachedPrediction> {
        let model = self.model.live().ok_or(ForecastError::NotTrained)?;
        let vector = self.preprocessor.align(features, &model.schema)?;
        let value = model.predict(&vector)?;
        let prediction = CachedPrediction {
            timestamp: self.clock.now(),
            predicted_output: vec![value],
        };
        self.cache.store(prediction.clone());
        Ok(prediction)
    }

    /// Starts the loop. The first cycle runs immediately.
    #[must_use]
    pub fn spawn(self) -> RefreshHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let features = self.preprocessor.normalize(&example_record());
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.telemetry.note(
                LogLevel::Info,
                "forecast.refresh.started",
                json!({ "interval_secs": self.period.as_secs() }),
            );
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => self.report(self.cycle(&features)),
                }
            }
            self.telemetry
                .note(LogLevel::Info, "forecast.refresh.stopped", json!({}));
        });
        RefreshHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    fn report(&self, outcome: ForecastResult<CachedPrediction>) {
        match outcome {
            Ok(prediction) => {
                let payload = json!({
                    "timestamp": prediction.timestamp,
                    "value": prediction.value(),
                });
                self.telemetry
                    .note(LogLevel::Info, "forecast.refresh.completed", payload.clone());
                self.telemetry.announce("forecast.refresh.completed", payload);
            }
            Err(err) => self.telemetry.note(
                LogLevel::Warn,
                "forecast.refresh.failed",
                json!({ "error": err.to_string() }),
            ),
        }
    }
}

/// Handle to a running [`RefreshLoop`].
#[derive(Debug)]
pub struct RefreshHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    /// True until the loop task has exited.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(err) = self.task.await {
            tracing::warn!("refresh loop ended abnormally: {err}");
        }
    }
}
