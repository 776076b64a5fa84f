//! Model wrapper owning the live trained regressor.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ForecastError, ForecastResult, ModelError},
    evaluate::mean_squared_error,
    forest::{ForestConfig, RegressionForest},
    preprocess::{FeatureSchema, TrainingSet},
};

/// Supervised regressor contract: any algorithm with `fit`/`predict` satisfies it.
pub trait Regressor: fmt::Debug + Send + Sync {
    /// Short algorithm name for summaries and logs.
    fn name(&self) -> &'static str;

    /// Replaces any fitted state. Requires `features.len() == targets.len() >= 1`.
    fn fit(&mut self, features: &[Vec<f64>], targets: &[f64]) -> Result<(), ModelError>;

    /// Predicts one sample; fails with [`ModelError::Unfitted`] before `fit`.
    fn predict(&self, sample: &[f64]) -> Result<f64, ModelError>;
}

/// A fitted regressor bound to the schema it was trained on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedModel<R = RegressionForest> {
    /// Feature schema of the training matrix.
    pub schema: FeatureSchema,
    /// Fitted regressor.
    pub regressor: R,
    /// Completion time of the fit.
    pub trained_at: DateTime<Utc>,
    /// Rows used for fitting.
    pub samples: usize,
    /// In-sample mean squared error.
    pub training_mse: f64,
}

impl<R: Regressor> TrainedModel<R> {
    /// Predicts a vector already aligned to [`Self::schema`].
    pub fn predict(&self, vector: &[f64]) -> ForecastResult<f64> {
        if vector.len() != self.schema.len() {
            return Err(ForecastError::SchemaMismatch {
                version: self.schema.version,
                unexpected: Vec::new(),
            });
        }
        self.regressor
            .predict(vector)
            .map_err(|err| match err {
                ModelError::Unfitted => ForecastError::NotTrained,
                ModelError::InvalidInput(msg) => ForecastError::InvalidRecord(msg),
            })
    }
}

/// Owns the live model. Readers never observe a partially replaced model.
///
/// Each fit clones the unfitted `prototype`, so any [`Regressor`] that is
/// `Clone` can back the wrapper.
#[derive(Debug)]
pub struct ModelWrapper<R = RegressionForest> {
    prototype: R,
    live: RwLock<Option<Arc<TrainedModel<R>>>>,
}

impl ModelWrapper {
    /// Creates an untrained wrapper fitting a [`RegressionForest`] per retrain.
    #[must_use]
    pub fn new(config: ForestConfig) -> Self {
        Self::with_regressor(RegressionForest::new(config))
    }

    /// Forest hyperparameters used for each fit.
    #[must_use]
    pub const fn config(&self) -> &ForestConfig {
        self.prototype.config()
    }
}

impl<R: Regressor + Clone + 'static> ModelWrapper<R> {
    /// Creates an untrained wrapper that fits copies of `prototype`.
    #[must_use]
    pub fn with_regressor(prototype: R) -> Self {
        Self {
            prototype,
            live: RwLock::new(None),
        }
    }

    /// Current trained model, if any.
    #[must_use]
    pub fn live(&self) -> Option<Arc<TrainedModel<R>>> {
        self.live.read().clone()
    }

    /// True once a fit succeeded or a model was installed.
    #[must_use]
    pub fn is_trained(&self) -> bool {
        self.live.read().is_some()
    }

    /// Fits a fresh regressor on a blocking worker and swaps it in on success.
    ///
    /// On failure the previously live model is kept.
    pub async fn fit(&self, set: TrainingSet) -> ForecastResult<Arc<TrainedModel<R>>> {
        let schema = FeatureSchema::succeed(self.live().as_deref().map(|m| &m.schema), set.fields);
        let mut regressor = self.prototype.clone();
        let handle = tokio::task::spawn_blocking(move || -> Result<TrainedModel<R>, ModelError> {
            regressor.fit(&set.features, &set.targets)?;
            let predictions = set
                .features
                .iter()
                .map(|row| regressor.predict(row))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(TrainedModel {
                schema,
                regressor,
                trained_at: Utc::now(),
                samples: set.targets.len(),
                training_mse: mean_squared_error(&predictions, &set.targets),
            })
        });
        let trained = handle
            .await
            .map_err(|err| ForecastError::TrainingFailed(format!("fit worker failed: {err}")))?
            .map_err(|err| ForecastError::TrainingFailed(err.to_string()))?;
        let trained = Arc::new(trained);
        *self.live.write() = Some(Arc::clone(&trained));
        Ok(trained)
    }

    /// Installs a previously trained model (e.g. loaded from an artifact).
    pub fn install(&self, model: TrainedModel<R>) -> Arc<TrainedModel<R>> {
        let model = Arc::new(model);
        *self.live.write() = Some(Arc::clone(&model));
        model
    }

    /// Predicts with the live model. Fails with [`ForecastError::NotTrained`] before any fit.
    pub fn predict(&self, vector: &[f64]) -> ForecastResult<f64> {
        let model = self.live().ok_or(ForecastError::NotTrained)?;
        model.predict(vector)
    }
}
