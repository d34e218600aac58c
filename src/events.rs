//! Events emitted by evaluation. They need to be logged to analytics storage to analyze
//! experiments.
use std::collections::HashMap;

use serde::Serialize;

use crate::{ufc::Timestamp, Attributes, SdkMetadata};

/// Represents an event capturing the assignment of a feature flag to a subject and its logging
/// details.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentEvent {
    /// The key of the feature flag being assigned.
    pub feature_flag: String,
    /// The key of the allocation that the subject was assigned to.
    pub allocation: String,
    /// The key of the experiment associated with the assignment (`{flag}-{allocation}`).
    pub experiment: String,
    /// Key of the variation assigned to the subject.
    pub variation: String,
    /// The key identifying the subject receiving the assignment.
    pub subject: String,
    /// Attributes of the subject as supplied by the caller.
    pub subject_attributes: Attributes,
    /// The timestamp indicating when the assignment event occurred.
    pub timestamp: Timestamp,
    /// Additional metadata such as SDK language and version.
    pub meta_data: EventMetaData,
    /// Additional user-defined logging fields for capturing extra information related to the
    /// assignment.
    #[serde(flatten)]
    pub extra_logging: HashMap<String, String>,
}

/// Bandit evaluation event that needs to be logged to analytics storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct BanditEvent {
    pub flag_key: String,
    pub bandit_key: String,
    pub subject: String,
    pub action: String,
    pub action_probability: f64,
    pub optimality_gap: f64,
    pub model_version: String,
    pub timestamp: Timestamp,
    pub subject_numeric_attributes: HashMap<String, f64>,
    pub subject_categorical_attributes: HashMap<String, String>,
    pub action_numeric_attributes: HashMap<String, f64>,
    pub action_categorical_attributes: HashMap<String, String>,
    pub meta_data: EventMetaData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct EventMetaData {
    pub sdk_name: &'static str,
    pub sdk_version: &'static str,
}

impl From<SdkMetadata> for EventMetaData {
    fn from(sdk: SdkMetadata) -> EventMetaData {
        (&sdk).into()
    }
}

impl From<&SdkMetadata> for EventMetaData {
    fn from(sdk: &SdkMetadata) -> EventMetaData {
        EventMetaData {
            sdk_name: sdk.name,
            sdk_version: sdk.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::{AssignmentEvent, EventMetaData};

    #[test]
    fn assignment_event_flattens_extra_logging() {
        let event = AssignmentEvent {
            feature_flag: "flag".to_owned(),
            allocation: "rollout".to_owned(),
            experiment: "flag-rollout".to_owned(),
            variation: "on".to_owned(),
            subject: "alice".to_owned(),
            subject_attributes: HashMap::from([("country".to_owned(), "UK".into())]),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            meta_data: EventMetaData {
                sdk_name: "rust",
                sdk_version: "0.1.0",
            },
            extra_logging: HashMap::from([("holdout".to_owned(), "winter".to_owned())]),
        };

        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "featureFlag": "flag",
                "allocation": "rollout",
                "experiment": "flag-rollout",
                "variation": "on",
                "subject": "alice",
                "subjectAttributes": {"country": "UK"},
                "timestamp": "2024-05-01T12:00:00Z",
                "metaData": {"sdkName": "rust", "sdkVersion": "0.1.0"},
                "holdout": "winter",
            })
        );
    }
}
