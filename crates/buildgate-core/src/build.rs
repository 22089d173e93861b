//! Build requests, build configuration records and lifecycle statuses.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::{BuildId, JobId};

/// Arguments the queue runtime delivers for a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub build_id: BuildId,
    pub job_id: JobId,
    /// Jobs whose running builds block this one.
    #[serde(default, deserialize_with = "job_id_list")]
    pub blocked_by: Vec<JobId>,
}

impl BuildRequest {
    pub fn new(build_id: impl Into<BuildId>, job_id: impl Into<JobId>) -> Self {
        Self {
            build_id: build_id.into(),
            job_id: job_id.into(),
            blocked_by: Vec::new(),
        }
    }

    pub fn blocked_by(mut self, jobs: impl IntoIterator<Item = impl Into<JobId>>) -> Self {
        self.blocked_by = jobs.into_iter().map(Into::into).collect();
        self
    }
}

/// Full configuration of a queued build, persisted in the build config table.
///
/// Unknown fields are carried through untouched so the record can be handed
/// to the executor as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    pub build_id: BuildId,
    pub job_id: JobId,
    /// Base URL of the build API that owns this build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_uri: Option<Url>,
    /// Bearer token used to report status for this build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, deserialize_with = "job_id_list")]
    pub blocked_by: Vec<JobId>,
    #[serde(default)]
    pub annotations: Annotations,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueue_time: Option<DateTime<Utc>>,
    /// Cluster this build is routed to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_cluster_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BuildConfig {
    pub fn new(build_id: impl Into<BuildId>, job_id: impl Into<JobId>) -> Self {
        Self {
            build_id: build_id.into(),
            job_id: job_id.into(),
            api_uri: None,
            token: None,
            blocked_by: Vec::new(),
            annotations: Annotations::default(),
            enqueue_time: None,
            build_cluster_name: None,
            extra: Map::new(),
        }
    }

    /// The queue arguments that correspond to this record.
    pub fn request(&self) -> BuildRequest {
        BuildRequest {
            build_id: self.build_id,
            job_id: self.job_id,
            blocked_by: self.blocked_by.clone(),
        }
    }
}

/// Free-form per-build annotations.
///
/// Values arrive from user pipeline files, so numbers and booleans are
/// accepted both natively and as strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Annotations(Map<String, Value>);

impl Annotations {
    pub const TIMEOUT: &'static str = "timeout";
    pub const COLLAPSE: &'static str = "collapse";

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build timeout in whole minutes, if one is set and parses.
    ///
    /// Fractions are truncated and a string only needs to start with a
    /// number, so `50.5` and `"50min"` both mean 50.
    pub fn timeout_minutes(&self) -> Option<u64> {
        match self.0.get(Self::TIMEOUT)? {
            Value::Number(n) => n.as_u64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| f.trunc() as u64)
            }),
            Value::String(s) => {
                let s = s.trim_start();
                let digits = s.len() - s.trim_start_matches(|c: char| c.is_ascii_digit()).len();
                s[..digits].parse().ok()
            }
            _ => None,
        }
    }

    /// Per-build override of the collapse policy.
    pub fn collapse(&self) -> Option<bool> {
        match self.0.get(Self::COLLAPSE)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl FromIterator<(String, Value)> for Annotations {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Lifecycle status reported back to the build API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    #[display("QUEUED")]
    Queued,
    #[display("BLOCKED")]
    Blocked,
    #[display("COLLAPSED")]
    Collapsed,
    #[display("RUNNING")]
    Running,
    #[display("SUCCESS")]
    Success,
    #[display("FAILURE")]
    Failure,
    #[display("ABORTED")]
    Aborted,
}

/// Accepts `[1, "2"]`, `"1,2"` or `null`.
fn job_id_list<'de, D>(deserializer: D) -> Result<Vec<JobId>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        List(Vec<JobId>),
        Joined(String),
        Single(JobId),
    }

    match Option::<Repr>::deserialize(deserializer)? {
        None => Ok(Vec::new()),
        Some(Repr::List(ids)) => Ok(ids),
        Some(Repr::Single(id)) => Ok(vec![id]),
        Some(Repr::Joined(joined)) => joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse().map_err(serde::de::Error::custom))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_accepts_joined_blocked_by() {
        let request: BuildRequest = serde_json::from_value(json!({
            "buildId": 3,
            "jobId": 777,
            "blockedBy": "111,222"
        }))
        .unwrap();
        assert_eq!(request.blocked_by, vec![JobId::new(111), JobId::new(222)]);
    }

    #[test]
    fn test_request_blocked_by_defaults_to_empty() {
        let request: BuildRequest =
            serde_json::from_value(json!({ "buildId": "3", "jobId": "777" })).unwrap();
        assert_eq!(request.build_id, BuildId::new(3));
        assert!(request.blocked_by.is_empty());
    }

    #[test]
    fn test_config_keeps_unknown_fields() {
        let raw = json!({
            "buildId": 5,
            "jobId": 2,
            "apiUri": "http://api.local",
            "token": "secret",
            "blockedBy": [2, 3],
            "annotations": { "timeout": "50", "collapse": "true" },
            "enqueueTime": "2026-01-01T00:00:00Z",
            "container": "node:20"
        });
        let config: BuildConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.annotations.timeout_minutes(), Some(50));
        assert_eq!(config.annotations.collapse(), Some(true));
        assert_eq!(config.extra.get("container"), Some(&json!("node:20")));

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["container"], json!("node:20"));
        assert_eq!(back["buildId"], json!(5));
    }

    #[test]
    fn test_annotations_ignore_unparseable_values() {
        let annotations: Annotations = [
            ("timeout".to_string(), json!("soon")),
            ("collapse".to_string(), json!(1)),
        ]
        .into_iter()
        .collect();
        assert_eq!(annotations.timeout_minutes(), None);
        assert_eq!(annotations.collapse(), None);
    }

    #[test]
    fn test_timeout_takes_leading_whole_minutes() {
        let timeout = |v: Value| {
            [("timeout".to_string(), v)]
                .into_iter()
                .collect::<Annotations>()
                .timeout_minutes()
        };
        assert_eq!(timeout(json!(50)), Some(50));
        assert_eq!(timeout(json!(50.9)), Some(50));
        assert_eq!(timeout(json!("50.5")), Some(50));
        assert_eq!(timeout(json!(" 45min")), Some(45));
        assert_eq!(timeout(json!(-5)), None);
        assert_eq!(timeout(json!("-5")), None);
        assert_eq!(timeout(json!("")), None);
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&BuildStatus::Collapsed).unwrap(),
            "\"COLLAPSED\""
        );
        assert_eq!(BuildStatus::Blocked.to_string(), "BLOCKED");
    }
}
