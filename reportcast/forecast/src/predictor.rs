//! On-demand single-record prediction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    error::{ForecastError, ForecastResult},
    model::ModelWrapper,
    preprocess::FeaturePreprocessor,
    record::{example_record, Document},
    telemetry::ForecastTelemetry,
};

/// One prediction with the schema it was aligned to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    /// When the prediction was made.
    pub timestamp: DateTime<Utc>,
    /// Predicted target value.
    pub value: f64,
    /// Schema version the input was aligned to.
    pub schema_version: u64,
}

/// Predicts from a single record using the live model.
#[derive(Debug, Clone)]
pub struct PredictionService {
    preprocessor: FeaturePreprocessor,
    model: Arc<ModelWrapper>,
    telemetry: ForecastTelemetry,
}

impl PredictionService {
    /// Creates the service.
    #[must_use]
    pub const fn new(
        preprocessor: FeaturePreprocessor,
        model: Arc<ModelWrapper>,
        telemetry: ForecastTelemetry,
    ) -> Self {
        Self {
            preprocessor,
            model,
            telemetry,
        }
    }

    /// Predicts `record`, or the example record when `None`.
    pub fn predict_one(&self, record: Option<&Document>) -> ForecastResult<PredictionResult> {
        let example;
        let record = if let Some(record) = record {
            record
        } else {
            example = example_record();
            &example
        };
        let result = self.predict_with_live(record);
        match &result {
            Ok(prediction) => self.telemetry.note(
                LogLevel::Debug,
                "forecast.predict.completed",
                json!({
                    "value": prediction.value,
                    "schema_version": prediction.schema_version,
                }),
            ),
            Err(err) => self.telemetry.note(
                LogLevel::Warn,
                "forecast.predict.rejected",
                json!({ "error": err.to_string() }),
            ),
        }
        result
    }

    fn predict_with_live(&self, record: &Document) -> ForecastResult<PredictionResult> {
        // Schema and regressor must come from the same snapshot.
        let model = self.model.live().ok_or(ForecastError::NotTrained)?;
        let features = self.preprocessor.normalize(record);
        let vector = self.preprocessor.align(&features, &model.schema)?;
        Ok(PredictionResult {
            timestamp: Utc::now(),
            value: model.predict(&vector)?,
            schema_version: model.schema.version,
        })
    }
}
