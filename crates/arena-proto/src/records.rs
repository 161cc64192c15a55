use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One entry of a remote listing. `path` is the identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub path: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<String>,
}

impl FileRecord {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            name: None,
            path: path.into(),
            is_dir: false,
            size: None,
            mod_time: None,
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            is_dir: true,
            ..Self::file(path)
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_mod_time(mut self, mod_time: impl Into<String>) -> Self {
        self.mod_time = Some(mod_time.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Normalized outcome of one checkpoint run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointResult {
    pub checkpoint_id: String,
    pub passed: bool,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Checkpoints arrive as bare numbers or as `checkpoint_<n>` labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckpointRef {
    Number(u32),
    Label(String),
}

impl CheckpointRef {
    pub fn number(&self) -> Option<u32> {
        match self {
            CheckpointRef::Number(n) => Some(*n),
            CheckpointRef::Label(label) => {
                let trimmed = label.trim();
                trimmed
                    .strip_prefix("checkpoint_")
                    .unwrap_or(trimmed)
                    .parse()
                    .ok()
            }
        }
    }

    pub fn id(&self) -> String {
        match self {
            CheckpointRef::Number(n) => n.to_string(),
            CheckpointRef::Label(label) => label.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawErrorDetail {
    #[serde(default, alias = "Scenario")]
    scenario: Option<String>,
    #[serde(default, alias = "Expected")]
    expected: Option<String>,
    #[serde(default, alias = "Received")]
    received: Option<String>,
    #[serde(default, alias = "Hint")]
    hint: Option<String>,
    #[serde(default, alias = "Message")]
    message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawError {
    Text(String),
    Detail(RawErrorDetail),
}

/// Result as the test runner emits it; field casing varies by runner image.
/// A field with an unexpected JSON type reads as absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCheckpointResult {
    #[serde(default, alias = "Checkpoint", alias = "checkpointId", deserialize_with = "lenient")]
    checkpoint: Option<CheckpointRef>,
    #[serde(default, alias = "Status", deserialize_with = "lenient")]
    status: Option<String>,
    #[serde(default, alias = "Passed", deserialize_with = "lenient")]
    passed: Option<bool>,
    #[serde(default, rename = "durationMs", alias = "DurationMs", deserialize_with = "lenient_millis")]
    duration_ms: Option<u64>,
    #[serde(default, alias = "Error", deserialize_with = "lenient")]
    error: Option<RawError>,
    #[serde(default, alias = "Output", deserialize_with = "lenient")]
    output: Option<String>,
}

/// Optional field that decodes to `None` instead of failing the record.
pub(crate) fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(raw).ok())
}

fn lenient_millis<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(millis(&Value::deserialize(deserializer)?))
}

/// Any non-negative JSON number or numeric string, rounded to whole ms.
fn millis(raw: &Value) -> Option<u64> {
    let value = match raw {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => text.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (value.is_finite() && value >= 0.0).then(|| value.round() as u64)
}

impl RawCheckpointResult {
    pub fn checkpoint(&self) -> Option<&CheckpointRef> {
        self.checkpoint.as_ref()
    }

    /// Returns `None` when the entry names no checkpoint at all.
    pub fn normalize(self) -> Option<CheckpointResult> {
        let checkpoint = self.checkpoint?;
        let checkpoint_id = checkpoint.id();
        let status = self.status.unwrap_or_default();
        let passed = self.passed.unwrap_or_else(|| {
            matches!(status.to_ascii_lowercase().as_str(), "passed" | "success")
        });
        let error = self.error.map(|raw| match raw {
            RawError::Text(message) => ErrorDetail {
                message: Some(message),
                ..ErrorDetail::default()
            },
            RawError::Detail(detail) => ErrorDetail {
                scenario: detail.scenario,
                expected: detail.expected,
                received: detail.received,
                hint: detail.hint,
                message: detail.message,
            },
        });
        let output = if passed {
            Some(format!("Checkpoint {checkpoint_id} passed successfully!"))
        } else {
            self.output
        };
        Some(CheckpointResult {
            checkpoint_id,
            passed,
            status,
            duration_ms: self.duration_ms,
            error,
            output,
        })
    }
}

/// Normalizes a legacy object map keyed by checkpoint. Entries without their
/// own checkpoint field inherit the key (`checkpoint_2` becomes `2`); output
/// is ordered by checkpoint.
pub fn normalize_keyed(entries: BTreeMap<String, RawCheckpointResult>) -> Vec<CheckpointResult> {
    let mut keyed: Vec<(Option<u32>, CheckpointResult)> = entries
        .into_iter()
        .filter_map(|(key, mut raw)| {
            if raw.checkpoint.is_none() {
                let label = CheckpointRef::Label(key);
                raw.checkpoint = Some(match label.number() {
                    Some(number) => CheckpointRef::Number(number),
                    None => label,
                });
            }
            let order = raw.checkpoint.as_ref().and_then(CheckpointRef::number);
            raw.normalize().map(|result| (order, result))
        })
        .collect();
    keyed.sort_by_key(|(order, _)| order.unwrap_or(u32::MAX));
    keyed.into_iter().map(|(_, result)| result).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawCheckpointResult {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn file_record_uses_camel_case() {
        let record: FileRecord = serde_json::from_value(json!({
            "name": "App.jsx",
            "path": "src/App.jsx",
            "isDir": false,
            "size": 120,
            "modTime": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(record.path, "src/App.jsx");
        assert_eq!(record.size, Some(120));
        assert_eq!(record.mod_time.as_deref(), Some("2024-01-01T00:00:00Z"));
        let back = serde_json::to_value(FileRecord::dir("src")).unwrap();
        assert_eq!(back, json!({"path": "src", "isDir": true}));
    }

    #[test]
    fn status_decides_pass_when_flag_absent() {
        let result = raw(json!({"checkpoint": 2, "status": "SUCCESS", "durationMs": 31}))
            .normalize()
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.checkpoint_id, "2");
        assert_eq!(result.duration_ms, Some(31));
        assert_eq!(result.output.as_deref(), Some("Checkpoint 2 passed successfully!"));
    }

    #[test]
    fn pascal_case_runner_fields_are_accepted() {
        let result = raw(json!({
            "Checkpoint": 3,
            "Status": "FAILED_ASSERTION",
            "DurationMs": 12,
            "Error": {"Scenario": "adds", "Expected": "2", "Received": "3", "Hint": "check +"}
        }))
        .normalize()
        .unwrap();
        assert!(!result.passed);
        assert_eq!(result.status, "FAILED_ASSERTION");
        let error = result.error.unwrap();
        assert_eq!(error.scenario.as_deref(), Some("adds"));
        assert_eq!(error.received.as_deref(), Some("3"));
        assert_eq!(result.output, None);
    }

    #[test]
    fn explicit_passed_flag_wins_over_status() {
        let result = raw(json!({"checkpoint": "checkpoint_4", "status": "passed", "passed": false, "error": "timeout"}))
            .normalize()
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.checkpoint_id, "checkpoint_4");
        assert_eq!(result.error.unwrap().message.as_deref(), Some("timeout"));
    }

    #[test]
    fn result_without_checkpoint_is_dropped() {
        assert!(raw(json!({"status": "passed"})).normalize().is_none());
    }

    #[test]
    fn keyed_results_sort_numerically() {
        let mut map = BTreeMap::new();
        map.insert("checkpoint_10".to_string(), raw(json!({"status": "failed"})));
        map.insert("checkpoint_2".to_string(), raw(json!({"status": "passed"})));
        let results = normalize_keyed(map);
        let ids: Vec<_> = results.iter().map(|r| r.checkpoint_id.as_str()).collect();
        assert_eq!(ids, vec!["2", "10"]);
    }

    #[test]
    fn keyed_labels_that_do_not_parse_stay_verbatim() {
        let mut map = BTreeMap::new();
        map.insert("intro".to_string(), raw(json!({"status": "passed"})));
        map.insert("checkpoint_1".to_string(), raw(json!({"status": "passed"})));
        let ids: Vec<_> = normalize_keyed(map).into_iter().map(|r| r.checkpoint_id).collect();
        assert_eq!(ids, vec!["1", "intro"]);
    }

    #[test]
    fn fractional_duration_is_rounded() {
        let result = raw(json!({"checkpoint": 1, "status": "passed", "durationMs": 12.5}))
            .normalize()
            .unwrap();
        assert_eq!(result.duration_ms, Some(13));
        let result = raw(json!({"checkpoint": 1, "status": "passed", "durationMs": "41.2"}))
            .normalize()
            .unwrap();
        assert_eq!(result.duration_ms, Some(41));
    }

    #[test]
    fn wrongly_typed_fields_read_as_absent() {
        let result = raw(json!({
            "checkpoint": 5,
            "status": 3,
            "passed": "yes",
            "durationMs": -4,
            "error": 7,
            "output": {"text": "x"}
        }))
        .normalize()
        .unwrap();
        assert_eq!(result.checkpoint_id, "5");
        assert_eq!(result.status, "");
        assert!(!result.passed);
        assert_eq!(result.duration_ms, None);
        assert_eq!(result.error, None);
        assert_eq!(result.output, None);
        assert!(raw(json!({"checkpoint": 2.5, "status": "passed"})).normalize().is_none());
    }

    #[test]
    fn checkpoint_ref_numbers() {
        assert_eq!(CheckpointRef::Label("checkpoint_7".into()).number(), Some(7));
        assert_eq!(CheckpointRef::Label("5".into()).number(), Some(5));
        assert_eq!(CheckpointRef::Label("intro".into()).number(), None);
    }
}
