//! Provisioning HTTP bodies.

use crate::control::null_as_default;
use crate::records::{
    CheckpointRef, CheckpointResult, RawCheckpointResult, lenient, normalize_keyed,
};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const FILE_SYSTEM_SERVICE: &str = "file_system";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLog {
    #[serde(rename = "ServiceName", alias = "serviceName")]
    pub service_name: String,
    #[serde(rename = "Status", alias = "status")]
    pub status: String,
}

impl ServiceLog {
    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case("active")
    }
}

/// Test history arrives as an array or, from older services, as an object
/// keyed by checkpoint. Entries that are not result objects are skipped.
#[derive(Debug, Clone)]
pub enum TestResultsField {
    List(Vec<RawCheckpointResult>),
    Keyed(BTreeMap<String, RawCheckpointResult>),
}

impl<'de> Deserialize<'de> for TestResultsField {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entry = |raw: Value| serde_json::from_value::<RawCheckpointResult>(raw).ok();
        match Value::deserialize(deserializer)? {
            Value::Array(items) => Ok(TestResultsField::List(
                items.into_iter().filter_map(entry).collect(),
            )),
            Value::Object(map) => Ok(TestResultsField::Keyed(
                map.into_iter()
                    .filter_map(|(key, raw)| entry(raw).map(|result| (key, result)))
                    .collect(),
            )),
            other => Err(D::Error::custom(format!(
                "test results must be an array or an object, got {other}"
            ))),
        }
    }
}

impl TestResultsField {
    pub fn normalize(self) -> Vec<CheckpointResult> {
        match self {
            TestResultsField::List(list) => list
                .into_iter()
                .filter_map(RawCheckpointResult::normalize)
                .collect(),
            TestResultsField::Keyed(map) => normalize_keyed(map),
        }
    }
}

pub type ActiveCheckpoint = CheckpointRef;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub progress_logs: Vec<ServiceLog>,
    #[serde(default, deserialize_with = "lenient")]
    pub test_results: Option<TestResultsField>,
    #[serde(default, deserialize_with = "lenient")]
    pub active_checkpoint: Option<ActiveCheckpoint>,
}

impl ProgressReport {
    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case("active")
    }

    pub fn service(&self, name: &str) -> Option<&ServiceLog> {
        self.progress_logs
            .iter()
            .find(|log| log.service_name == name)
    }

    /// True once the file-system service itself reports active.
    pub fn file_system_active(&self) -> bool {
        self.service(FILE_SYSTEM_SERVICE)
            .is_some_and(ServiceLog::is_active)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultsReport {
    #[serde(default, deserialize_with = "lenient")]
    pub test_results: Option<TestResultsField>,
    #[serde(default, deserialize_with = "lenient")]
    pub active_checkpoint: Option<ActiveCheckpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProjectRequest {
    pub lab_id: String,
    pub language: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn progress_report_detects_file_system_service() {
        let report: ProgressReport = serde_json::from_value(json!({
            "status": "active",
            "progressLogs": [
                {"ServiceName": "pty", "Status": "booting"},
                {"ServiceName": "file_system", "Status": "active"}
            ]
        }))
        .unwrap();
        assert!(report.is_active());
        assert!(report.file_system_active());
        assert!(report.test_results.is_none());
    }

    #[test]
    fn progress_report_tolerates_nulls_and_string_checkpoint() {
        let report: ProgressReport = serde_json::from_value(json!({
            "status": "booting",
            "progressLogs": null,
            "activeCheckpoint": "checkpoint_3",
            "testResults": {"checkpoint_1": {"status": "passed"}}
        }))
        .unwrap();
        assert!(!report.file_system_active());
        assert_eq!(report.active_checkpoint.unwrap().number(), Some(3));
        let results = report.test_results.unwrap().normalize();
        assert_eq!(results.len(), 1);
        assert!(results[0].passed);
    }

    #[test]
    fn bad_history_never_fails_the_report() {
        let report: ProgressReport = serde_json::from_str(
            r#"{"status":"active","progressLogs":[],"testResults":[{"checkpoint":1,"status":"passed","durationMs":12.5},"junk",{"checkpoint":2,"status":"failed","durationMs":{"ms":3}}]}"#,
        )
        .unwrap();
        assert!(report.is_active());
        let results = report.test_results.unwrap().normalize();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].duration_ms, Some(13));
        assert_eq!(results[1].duration_ms, None);
        assert!(!results[1].passed);

        let report: ProgressReport = serde_json::from_value(json!({
            "status": "active",
            "testResults": "unavailable",
            "activeCheckpoint": [2]
        }))
        .unwrap();
        assert!(report.test_results.is_none());
        assert!(report.active_checkpoint.is_none());
    }

    #[test]
    fn test_results_report_reads_keyed_history() {
        let report: TestResultsReport = serde_json::from_value(json!({
            "testResults": {"checkpoint_2": {"status": "passed", "durationMs": 7.9}},
            "activeCheckpoint": 3
        }))
        .unwrap();
        let results = report.test_results.unwrap().normalize();
        assert_eq!(results[0].checkpoint_id, "2");
        assert_eq!(results[0].duration_ms, Some(8));
        assert_eq!(report.active_checkpoint.unwrap().number(), Some(3));
    }

    #[test]
    fn start_request_is_camel_case() {
        let body = serde_json::to_value(StartProjectRequest {
            lab_id: "lab-1".into(),
            language: "react".into(),
        })
        .unwrap();
        assert_eq!(body, json!({"labId": "lab-1", "language": "react"}));
    }
}
