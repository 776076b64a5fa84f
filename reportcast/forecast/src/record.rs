//! Weekly test-report records and the built-in example.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, ForecastResult};

/// Raw stored document: a JSON object keyed by field name.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Storage-assigned identifier field.
pub const ID_FIELD: &str = "_id";
/// Storage-assigned creation timestamp field.
pub const CREATED_AT_FIELD: &str = "createdAt";
/// Field the model predicts.
pub const TARGET_FIELD: &str = "storyPassed";
/// Default collection holding test reports.
pub const REPORT_COLLECTION: &str = "test_reports";

/// Test categories: story, automated regression, manual regression.
pub const CATEGORY_PREFIXES: [&str; 3] = ["story", "ar", "mr"];
/// Outcome counters tracked for every category.
pub const OUTCOMES: [&str; 9] = [
    "Passed",
    "Failed",
    "Unexecuted",
    "Blocked",
    "Skipped",
    "Critical",
    "New",
    "Unused",
    "Bugs",
];

const VOLUME_FIELDS: [&str; 4] = [
    "storyTests",
    "regressionTestsAutomated",
    "regressionTestsManual",
    "totalTestsByApplication",
];

/// Every numeric field of a [`TestReport`], in declaration order (target included).
#[must_use]
pub fn numeric_fields() -> Vec<String> {
    let mut fields: Vec<String> = VOLUME_FIELDS.iter().map(|f| (*f).to_string()).collect();
    for prefix in CATEGORY_PREFIXES {
        fields.extend(OUTCOMES.iter().map(|outcome| format!("{prefix}{outcome}")));
    }
    fields
}

/// One submitted record of weekly test execution counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct TestReport {
    /// Assigned by the store on insert.
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub project_name: String,
    #[serde(default)]
    pub authors: Option<String>,
    pub story_tests: u32,
    pub regression_tests_automated: u32,
    pub regression_tests_manual: u32,
    pub total_tests_by_application: u32,

    pub story_passed: u32,
    pub story_failed: u32,
    pub story_unexecuted: u32,
    pub story_blocked: u32,
    pub story_skipped: u32,
    pub story_critical: u32,
    pub story_new: u32,
    pub story_unused: u32,
    pub story_bugs: u32,

    pub ar_passed: u32,
    pub ar_failed: u32,
    pub ar_unexecuted: u32,
    pub ar_blocked: u32,
    pub ar_skipped: u32,
    pub ar_critical: u32,
    pub ar_new: u32,
    pub ar_unused: u32,
    pub ar_bugs: u32,

    pub mr_passed: u32,
    pub mr_failed: u32,
    pub mr_unexecuted: u32,
    pub mr_blocked: u32,
    pub mr_skipped: u32,
    pub mr_critical: u32,
    pub mr_new: u32,
    pub mr_unused: u32,
    pub mr_bugs: u32,

    /// ISO-8601 timestamp, with or without an offset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl TestReport {
    /// The built-in example used when storage is empty and as default predict input.
    #[must_use]
    pub fn example() -> Self {
        Self {
            id: None,
            project_name: "Project Alpha".into(),
            authors: Some("John Doe".into()),
            story_tests: 100,
            regression_tests_automated: 80,
            regression_tests_manual: 20,
            total_tests_by_application: 120,
            story_passed: 90,
            story_failed: 5,
            story_unexecuted: 5,
            story_blocked: 0,
            story_skipped: 0,
            story_critical: 2,
            story_new: 3,
            story_unused: 0,
            story_bugs: 1,
            ar_passed: 70,
            ar_failed: 10,
            ar_unexecuted: 0,
            ar_blocked: 0,
            ar_skipped: 0,
            ar_critical: 1,
            ar_new: 2,
            ar_unused: 0,
            ar_bugs: 1,
            mr_passed: 15,
            mr_failed: 5,
            mr_unexecuted: 0,
            mr_blocked: 0,
            mr_skipped: 0,
            mr_critical: 0,
            mr_new: 1,
            mr_unused: 0,
            mr_bugs: 0,
            created_at: Some("2025-02-21T00:00:00".into()),
        }
    }

    /// Parses and validates a raw document.
    pub fn from_document(document: &Document) -> ForecastResult<Self> {
        let report: Self = serde_json::from_value(serde_json::Value::Object(document.clone()))
            .map_err(|err| ForecastError::InvalidRecord(err.to_string()))?;
        report.validate()?;
        Ok(report)
    }

    /// Checks constraints the types alone do not carry.
    pub fn validate(&self) -> ForecastResult<()> {
        if self.project_name.trim().is_empty() {
            return Err(ForecastError::InvalidRecord(
                "projectName must not be empty".into(),
            ));
        }
        if let Some(created_at) = &self.created_at {
            if !is_timestamp(created_at) {
                return Err(ForecastError::InvalidRecord(format!(
                    "createdAt `{created_at}` is not an ISO-8601 timestamp"
                )));
            }
        }
        Ok(())
    }

    /// Serializes into a storable document. Field order follows the struct.
    pub fn to_document(&self) -> ForecastResult<Document> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(ForecastError::InvalidRecord(format!(
                "report serialized to non-object {other}"
            ))),
        }
    }
}

/// The example record as a raw document, in submission field order.
#[must_use]
pub fn example_record() -> Document {
    let serde_json::Value::Object(doc) = serde_json::json!({
        "projectName": "Project Alpha",
        "authors": "John Doe",
        "storyTests": 100,
        "regressionTestsAutomated": 80,
        "regressionTestsManual": 20,
        "totalTestsByApplication": 120,
        "storyPassed": 90,
        "storyFailed": 5,
        "storyUnexecuted": 5,
        "storyBlocked": 0,
        "storySkipped": 0,
        "storyCritical": 2,
        "storyNew": 3,
        "storyUnused": 0,
        "storyBugs": 1,
        "arPassed": 70,
        "arFailed": 10,
        "arUnexecuted": 0,
        "arBlocked": 0,
        "arSkipped": 0,
        "arCritical": 1,
        "arNew": 2,
        "arUnused": 0,
        "arBugs": 1,
        "mrPassed": 15,
        "mrFailed": 5,
        "mrUnexecuted": 0,
        "mrBlocked": 0,
        "mrSkipped": 0,
        "mrCritical": 0,
        "mrNew": 1,
        "mrUnused": 0,
        "mrBugs": 0,
        "createdAt": "2025-02-21T00:00:00"
    }) else {
        unreachable!("object literal")
    };
    doc
}

fn is_timestamp(raw: &str) -> bool {
    DateTime::parse_from_rfc3339(raw).is_ok()
        || NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_fields_cover_volumes_and_counters() {
        let fields = numeric_fields();
        assert_eq!(fields.len(), 4 + 27);
        assert_eq!(fields[4], "storyPassed");
        assert_eq!(fields.last().map(String::as_str), Some("mrBugs"));
    }

    #[test]
    fn example_document_matches_typed_example() {
        let doc = example_record();
        assert_eq!(doc[TARGET_FIELD], 90);
        assert_eq!(doc["arFailed"], 10);
        assert_eq!(doc["authors"], "John Doe");
        let parsed = TestReport::from_document(&doc).unwrap();
        assert_eq!(parsed, TestReport::example());
        assert_eq!(parsed.to_document().unwrap()["mrNew"], 1);
    }

    #[test]
    fn authors_is_optional() {
        let mut doc = example_record();
        doc.remove("authors");
        let parsed = TestReport::from_document(&doc).unwrap();
        assert_eq!(parsed.authors, None);
    }

    #[test]
    fn rejects_negative_counters_and_bad_timestamps() {
        let mut doc = example_record();
        doc.insert("storyFailed".into(), serde_json::json!(-1));
        assert!(matches!(
            TestReport::from_document(&doc),
            Err(ForecastError::InvalidRecord(_))
        ));

        let mut doc = example_record();
        doc.insert(CREATED_AT_FIELD.into(), "last tuesday".into());
        assert!(TestReport::from_document(&doc).is_err());

        let mut doc = example_record();
        doc.insert(CREATED_AT_FIELD.into(), "2025-02-21T00:00:00Z".into());
        assert!(TestReport::from_document(&doc).is_ok());
    }
}
