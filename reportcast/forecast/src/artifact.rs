//! JSON artifact holding the last trained model.

use std::path::{Path, PathBuf};

use crate::{
    error::{ForecastError, ForecastResult},
    model::TrainedModel,
};

/// Saves and reloads a [`TrainedModel`] so a restart can serve predictions
/// before its first retrain completes.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    path: PathBuf,
}

impl ModelArtifact {
    /// Artifact stored at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Artifact location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the model, replacing any previous artifact via rename.
    pub async fn save(&self, model: &TrainedModel) -> ForecastResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(model)?;
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, data).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }

    /// Loads the model, or `None` when no artifact exists yet.
    ///
    /// Fails with [`ForecastError::CorruptArtifact`] when the decoded model is
    /// unfitted, disagrees with its schema width or has malformed trees.
    pub async fn load(&self) -> ForecastResult<Option<TrainedModel>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let model: TrainedModel = serde_json::from_slice(&data)?;
        self.check(&model)?;
        Ok(Some(model))
    }

    fn check(&self, model: &TrainedModel) -> ForecastResult<()> {
        let corrupt = |reason: String| {
            ForecastError::CorruptArtifact(format!("{}: {reason}", self.path.display()))
        };
        let width = model.schema.len();
        if model.regressor.width() != Some(width) {
            return Err(corrupt(format!(
                "regressor width {:?} does not match schema width {width}",
                model.regressor.width()
            )));
        }
        model
            .regressor
            .check_integrity()
            .map_err(|err| corrupt(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        forest::{ForestConfig, RegressionForest},
        model::Regressor,
        preprocess::FeatureSchema,
    };
    use chrono::Utc;
    use tempfile::tempdir;

    fn fitted_model() -> TrainedModel {
        let mut regressor = RegressionForest::new(ForestConfig {
            trees: 3,
            seed: Some(1),
            ..ForestConfig::default()
        });
        regressor
            .fit(&[vec![1.0, 2.0], vec![3.0, 4.0]], &[10.0, 30.0])
            .unwrap();
        TrainedModel {
            schema: FeatureSchema::initial(vec!["a".into(), "b".into()]),
            regressor,
            trained_at: Utc::now(),
            samples: 2,
            training_mse: 0.0,
        }
    }

    #[tokio::test]
    async fn saves_and_reloads_model() {
        let dir = tempdir().unwrap();
        let artifact = ModelArtifact::new(dir.path().join("models/forecast.json"));
        assert!(artifact.load().await.unwrap().is_none());

        let model = fitted_model();
        artifact.save(&model).await.unwrap();
        let loaded = artifact.load().await.unwrap().unwrap();
        assert_eq!(loaded.schema, model.schema);
        assert_eq!(loaded.regressor, model.regressor);
        assert_eq!(
            loaded.predict(&[1.0, 2.0]).unwrap(),
            model.predict(&[1.0, 2.0]).unwrap()
        );
    }

    #[tokio::test]
    async fn self_referencing_split_is_rejected_on_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("forecast.json");
        let mut doc = serde_json::to_value(fitted_model()).unwrap();
        doc["regressor"]["trees"][0]["nodes"][0] = serde_json::json!({
            "kind": "split",
            "feature": 0,
            "threshold": 2.0,
            "left": 0,
            "right": 0,
        });
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let err = ModelArtifact::new(&path).load().await.unwrap_err();
        assert!(matches!(err, ForecastError::CorruptArtifact(_)));
        assert!(err.to_string().contains("tree 0"));
    }

    #[tokio::test]
    async fn schema_width_must_match_regressor() {
        let dir = tempdir().unwrap();
        let artifact = ModelArtifact::new(dir.path().join("forecast.json"));
        let mut model = fitted_model();
        model.schema = FeatureSchema::initial(vec!["a".into()]);
        artifact.save(&model).await.unwrap();
        assert!(matches!(
            artifact.load().await,
            Err(ForecastError::CorruptArtifact(_))
        ));
    }

    #[tokio::test]
    async fn corrupt_artifact_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("forecast.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(ModelArtifact::new(path).load().await.is_err());
    }
}
