//! Record normalization shared by the training and inference paths.
//!
//! A raw [`Document`] becomes a [`FeatureMap`]: only JSON numbers survive, and the
//! identifier, creation timestamp and target are always removed. Training derives a
//! [`FeatureSchema`] from the data; inference aligns every input against that schema,
//! zero-filling absent fields and rejecting unknown ones.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{ForecastError, ForecastResult},
    record::{Document, CREATED_AT_FIELD, ID_FIELD, TARGET_FIELD},
};

/// Numeric features of one record, in field order.
pub type FeatureMap = IndexMap<String, f64>;

/// Ordered feature field list the live model was trained on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    /// Bumped whenever a retrain produces a different field list.
    pub version: u64,
    /// Feature fields in model column order.
    pub fields: Vec<String>,
}

impl FeatureSchema {
    /// First schema version.
    #[must_use]
    pub fn initial(fields: Vec<String>) -> Self {
        Self { version: 1, fields }
    }

    /// Successor schema: same version when the fields are unchanged.
    #[must_use]
    pub fn succeed(previous: Option<&Self>, fields: Vec<String>) -> Self {
        match previous {
            Some(prev) if prev.fields == fields => prev.clone(),
            Some(prev) => Self {
                version: prev.version + 1,
                fields,
            },
            None => Self::initial(fields),
        }
    }

    /// Number of feature columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when the schema has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Feature matrix and target column ready for fitting.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSet {
    /// Column names.
    pub fields: Vec<String>,
    /// One row per record, aligned to `fields`.
    pub features: Vec<Vec<f64>>,
    /// Target value per row.
    pub targets: Vec<f64>,
}

impl TrainingSet {
    /// Number of rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.features.len()
    }
}

/// Normalizes raw records into numeric features.
#[derive(Debug, Clone)]
pub struct FeaturePreprocessor {
    target: String,
    excluded: IndexSet<String>,
}

impl Default for FeaturePreprocessor {
    fn default() -> Self {
        Self::new(TARGET_FIELD)
    }
}

impl FeaturePreprocessor {
    /// Preprocessor predicting `target`; identifier and timestamp are always excluded.
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        let target = target.into();
        let excluded = [ID_FIELD, CREATED_AT_FIELD, target.as_str()]
            .into_iter()
            .map(str::to_string)
            .collect();
        Self { target, excluded }
    }

    /// Name of the target field.
    #[must_use]
    pub fn target_field(&self) -> &str {
        &self.target
    }

    /// Keeps numeric, non-excluded fields in record order.
    #[must_use]
    pub fn normalize(&self, record: &Document) -> FeatureMap {
        record
            .iter()
            .filter(|(field, _)| !self.excluded.contains(field.as_str()))
            .filter_map(|(field, value)| numeric(value).map(|v| (field.clone(), v)))
            .collect()
    }

    /// Aligns features to `schema`. Absent fields become 0; unknown fields are an error.
    pub fn align(&self, features: &FeatureMap, schema: &FeatureSchema) -> ForecastResult<Vec<f64>> {
        let unexpected: Vec<String> = features
            .keys()
            .filter(|field| !schema.fields.contains(field))
            .cloned()
            .collect();
        if !unexpected.is_empty() {
            return Err(ForecastError::SchemaMismatch {
                version: schema.version,
                unexpected,
            });
        }
        Ok(project(features, &schema.fields))
    }

    /// Normalizes `record` and returns it keyed and ordered by `schema`.
    pub fn normalize_against(
        &self,
        record: &Document,
        schema: &FeatureSchema,
    ) -> ForecastResult<FeatureMap> {
        let values = self.align(&self.normalize(record), schema)?;
        Ok(schema.fields.iter().cloned().zip(values).collect())
    }

    /// Target value: absent or null is 0, a non-numeric value cannot form a target.
    #[must_use]
    pub fn target(&self, record: &Document) -> Option<f64> {
        match record.get(&self.target) {
            None | Some(Value::Null) => Some(0.0),
            Some(value) => numeric(value),
        }
    }

    /// Feature columns across `records`, in first-appearance order.
    ///
    /// A field holding a non-numeric, non-null value in any record is not a
    /// numeric column and is left out.
    #[must_use]
    pub fn derive_fields(&self, records: &[Document]) -> Vec<String> {
        let mut seen = IndexSet::new();
        let mut mixed = IndexSet::new();
        for record in records {
            for (field, value) in record {
                if self.excluded.contains(field.as_str()) {
                    continue;
                }
                if numeric(value).is_some() {
                    seen.insert(field.clone());
                } else if !value.is_null() {
                    mixed.insert(field.clone());
                }
            }
        }
        seen.into_iter().filter(|f| !mixed.contains(f)).collect()
    }

    /// Builds the feature matrix and target column for `records`.
    pub fn training_set(&self, records: &[Document]) -> ForecastResult<TrainingSet> {
        if records.is_empty() {
            return Err(ForecastError::InsufficientData(
                "no records to train on".into(),
            ));
        }
        let fields = self.derive_fields(records);
        if fields.is_empty() {
            return Err(ForecastError::InsufficientData(
                "records carry no numeric feature fields".into(),
            ));
        }
        let mut features = Vec::with_capacity(records.len());
        let mut targets = Vec::with_capacity(records.len());
        for (idx, record) in records.iter().enumerate() {
            let target = self.target(record).ok_or_else(|| {
                ForecastError::InsufficientData(format!(
                    "{} is not numeric in record {idx}",
                    self.target
                ))
            })?;
            features.push(project(&self.normalize(record), &fields));
            targets.push(target);
        }
        Ok(TrainingSet {
            fields,
            features,
            targets,
        })
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        _ => None,
    }
}

fn project(features: &FeatureMap, fields: &[String]) -> Vec<f64> {
    fields
        .iter()
        .map(|field| features.get(field).copied().unwrap_or_default())
        .collect()
}

/// Column standardization for evaluation and analysis.
///
/// Uses the sample standard deviation. Columns with zero (or undefined)
/// spread map to 0 instead of dividing by zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    /// Column means.
    pub means: Vec<f64>,
    /// Column sample standard deviations; 0 when fewer than two rows.
    pub stds: Vec<f64>,
}

impl Standardizer {
    /// Learns per-column statistics from `rows`.
    #[must_use]
    pub fn fit(rows: &[Vec<f64>]) -> Self {
        let width = rows.first().map_or(0, Vec::len);
        let n = rows.len() as f64;
        let mut means = vec![0.0; width];
        for row in rows {
            for (mean, value) in means.iter_mut().zip(row) {
                *mean += value;
            }
        }
        if !rows.is_empty() {
            means.iter_mut().for_each(|mean| *mean /= n);
        }
        let mut stds = vec![0.0; width];
        if rows.len() > 1 {
            for row in rows {
                for ((acc, value), mean) in stds.iter_mut().zip(row).zip(&means) {
                    *acc += (value - mean).powi(2);
                }
            }
            stds.iter_mut().for_each(|acc| *acc = (*acc / (n - 1.0)).sqrt());
        }
        Self { means, stds }
    }

    /// Standardizes one row.
    #[must_use]
    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.means.iter().zip(&self.stds))
            .map(|(value, (mean, std))| {
                if *std > 0.0 && std.is_finite() {
                    (value - mean) / std
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Standardizes every row.
    #[must_use]
    pub fn transform_all(&self, rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
        rows.iter().map(|row| self.transform(row)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{example_record, numeric_fields};
    use serde_json::json;

    fn reference_schema() -> FeatureSchema {
        let fields = numeric_fields()
            .into_iter()
            .filter(|f| f != TARGET_FIELD)
            .collect();
        FeatureSchema::initial(fields)
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn normalize_is_deterministic() {
        let pre = FeaturePreprocessor::default();
        let record = example_record();
        assert_eq!(pre.normalize(&record), pre.normalize(&record));
    }

    #[test]
    fn normalize_drops_identity_timestamp_target_and_text() {
        let pre = FeaturePreprocessor::default();
        let mut record = example_record();
        record.insert(ID_FIELD.into(), json!(42));
        record.insert(CREATED_AT_FIELD.into(), json!(1_700_000_000));
        let features = pre.normalize(&record);
        for excluded in [ID_FIELD, CREATED_AT_FIELD, TARGET_FIELD, "projectName", "authors"] {
            assert!(!features.contains_key(excluded), "{excluded} leaked");
        }
        assert_eq!(features.len(), 30);
        assert_eq!(features.keys().cloned().collect::<Vec<_>>(), reference_schema().fields);
    }

    #[test]
    fn booleans_and_nulls_are_not_numeric() {
        let pre = FeaturePreprocessor::default();
        let features = pre.normalize(&doc(json!({ "flag": true, "gone": null, "n": 2.5 })));
        assert_eq!(features.len(), 1);
        assert_eq!(features["n"], 2.5);
    }

    #[test]
    fn missing_schema_field_is_zero_filled() {
        let pre = FeaturePreprocessor::default();
        let mut record = example_record();
        record.remove("arFailed");
        record.remove("authors");
        let aligned = pre.normalize_against(&record, &reference_schema()).unwrap();
        assert_eq!(aligned["arFailed"], 0.0);
        assert_eq!(aligned.len(), 30);
        assert_eq!(aligned["arPassed"], 70.0);
    }

    #[test]
    fn unknown_numeric_field_is_rejected() {
        let pre = FeaturePreprocessor::default();
        let mut record = example_record();
        record.insert("coverage".into(), json!(0.8));
        let err = pre
            .normalize_against(&record, &reference_schema())
            .unwrap_err();
        match err {
            ForecastError::SchemaMismatch {
                version,
                unexpected,
            } => {
                assert_eq!(version, 1);
                assert_eq!(unexpected, vec!["coverage".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn target_defaults_to_zero_when_absent() {
        let pre = FeaturePreprocessor::default();
        let mut record = example_record();
        assert_eq!(pre.target(&record), Some(90.0));
        record.remove(TARGET_FIELD);
        assert_eq!(pre.target(&record), Some(0.0));
        record.insert(TARGET_FIELD.into(), json!("ninety"));
        assert_eq!(pre.target(&record), None);
    }

    #[test]
    fn derive_fields_unions_and_skips_mixed_columns() {
        let pre = FeaturePreprocessor::default();
        let records = vec![
            doc(json!({ "a": 1, "b": 2, "storyPassed": 3 })),
            doc(json!({ "c": 4, "b": "n/a", "a": null })),
        ];
        assert_eq!(pre.derive_fields(&records), vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn training_set_zero_fills_partial_rows() {
        let pre = FeaturePreprocessor::default();
        let records = vec![
            doc(json!({ "a": 1, "b": 2, "storyPassed": 3 })),
            doc(json!({ "b": 5 })),
        ];
        let set = pre.training_set(&records).unwrap();
        assert_eq!(set.fields, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(set.features, vec![vec![1.0, 2.0], vec![0.0, 5.0]]);
        assert_eq!(set.targets, vec![3.0, 0.0]);
    }

    #[test]
    fn training_set_rejects_unusable_data() {
        let pre = FeaturePreprocessor::default();
        assert!(matches!(
            pre.training_set(&[]),
            Err(ForecastError::InsufficientData(_))
        ));
        let text_only = vec![doc(json!({ "projectName": "x", "storyPassed": 1 }))];
        assert!(matches!(
            pre.training_set(&text_only),
            Err(ForecastError::InsufficientData(_))
        ));
        let bad_target = vec![doc(json!({ "a": 1, "storyPassed": "many" }))];
        assert!(matches!(
            pre.training_set(&bad_target),
            Err(ForecastError::InsufficientData(_))
        ));
    }

    #[test]
    fn schema_version_bumps_only_on_change() {
        let first = FeatureSchema::succeed(None, vec!["a".into()]);
        assert_eq!(first.version, 1);
        let same = FeatureSchema::succeed(Some(&first), vec!["a".into()]);
        assert_eq!(same.version, 1);
        let changed = FeatureSchema::succeed(Some(&same), vec!["a".into(), "b".into()]);
        assert_eq!(changed.version, 2);
    }

    #[test]
    fn standardizer_guards_zero_variance() {
        let rows = vec![vec![1.0, 5.0], vec![3.0, 5.0]];
        let standardizer = Standardizer::fit(&rows);
        assert_eq!(standardizer.means, vec![2.0, 5.0]);
        let out = standardizer.transform_all(&rows);
        assert!((out[0][0] + std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-9);
        assert_eq!(out[0][1], 0.0);
        assert_eq!(out[1][1], 0.0);
    }

    #[test]
    fn standardizer_single_row_is_all_zero() {
        let standardizer = Standardizer::fit(&[vec![90.0, 3.0]]);
        assert_eq!(standardizer.transform(&[90.0, 3.0]), vec![0.0, 0.0]);
        assert!(standardizer.transform(&[1.0, 2.0]).iter().all(|v| v.is_finite()));
    }
}
