//! Offline evaluation: holdout split, optional standardization, error metrics.

use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ForecastError, ForecastResult},
    forest::{ForestConfig, RegressionForest},
    model::Regressor,
    preprocess::{FeaturePreprocessor, Standardizer, TrainingSet},
    record::Document,
};

/// Mean squared error; 0 for empty or mismatched inputs.
#[must_use]
pub fn mean_squared_error(predictions: &[f64], targets: &[f64]) -> f64 {
    if predictions.is_empty() || predictions.len() != targets.len() {
        return 0.0;
    }
    predictions
        .iter()
        .zip(targets)
        .map(|(pred, target)| (pred - target).powi(2))
        .sum::<f64>()
        / predictions.len() as f64
}

/// Evaluation knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationOptions {
    /// Fraction of rows held out for testing.
    pub test_ratio: f64,
    /// Standardize features with statistics from the training part.
    pub standardize: bool,
    /// Shuffle seed.
    pub seed: u64,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self {
            test_ratio: 0.2,
            standardize: false,
            seed: 42,
        }
    }
}

/// Outcome of an evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Mean squared error on the test rows.
    pub mse: f64,
    /// Root mean squared error.
    pub rmse: f64,
    /// Rows used for fitting.
    pub train_rows: usize,
    /// Rows scored.
    pub test_rows: usize,
    /// Feature columns.
    pub features: usize,
    /// True when too few rows forced scoring on the training rows.
    pub in_sample: bool,
}

impl EvaluationReport {
    /// One-line summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "[eval] mse={:.4} rmse={:.4} train={} test={} features={}{}",
            self.mse,
            self.rmse,
            self.train_rows,
            self.test_rows,
            self.features,
            if self.in_sample { " (in-sample)" } else { "" }
        )
    }
}

/// Shuffled train/test index split. With fewer than two rows everything is training data.
#[must_use]
pub fn holdout_split(rows: usize, test_ratio: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut order: Vec<usize> = (0..rows).collect();
    if rows < 2 {
        return (order, Vec::new());
    }
    order.shuffle(&mut SmallRng::seed_from_u64(seed));
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let test = ((rows as f64) * test_ratio.clamp(0.0, 1.0)).ceil() as usize;
    let test = test.clamp(1, rows - 1);
    let train = order.split_off(test);
    (train, order)
}

/// Fits a fresh forest on a holdout split of `records` and scores it.
pub fn evaluate(
    records: &[Document],
    preprocessor: &FeaturePreprocessor,
    config: ForestConfig,
    options: EvaluationOptions,
) -> ForecastResult<EvaluationReport> {
    let TrainingSet {
        fields,
        features,
        targets,
    } = preprocessor.training_set(records)?;
    let (train_idx, test_idx) = holdout_split(features.len(), options.test_ratio, options.seed);
    let in_sample = test_idx.is_empty();
    let test_idx = if in_sample { train_idx.clone() } else { test_idx };

    let pick = |idx: &[usize]| -> (Vec<Vec<f64>>, Vec<f64>) {
        idx.iter()
            .map(|&i| (features[i].clone(), targets[i]))
            .unzip()
    };
    let (mut train_x, train_y) = pick(&train_idx);
    let (mut test_x, test_y) = pick(&test_idx);
    if options.standardize {
        let standardizer = Standardizer::fit(&train_x);
        train_x = standardizer.transform_all(&train_x);
        test_x = standardizer.transform_all(&test_x);
    }

    let mut forest = RegressionForest::new(config);
    forest
        .fit(&train_x, &train_y)
        .map_err(|err| ForecastError::TrainingFailed(err.to_string()))?;
    let predictions = test_x
        .iter()
        .map(|row| forest.predict(row))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ForecastError::TrainingFailed(err.to_string()))?;
    let mse = mean_squared_error(&predictions, &test_y);
    Ok(EvaluationReport {
        mse,
        rmse: mse.sqrt(),
        train_rows: train_x.len(),
        test_rows: test_x.len(),
        features: fields.len(),
        in_sample,
    })
}
