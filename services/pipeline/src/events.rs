//! Wire shapes exchanged with the external processing worker.
//!
//! - job queue: [`JobDescriptor`], published by the upload service
//! - update queue: [`UpdateEvent`], stage progress from the worker
//! - result queue: [`ResultEvent`], the terminal outcome of a job

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Storage backend kind for job inputs and outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Aws,
}

/// Where the worker downloads the raw upload from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDetails {
    pub bucket: String,
    pub key: String,
}

/// Where the worker writes processed outputs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerDetails {
    pub bucket: String,
    pub key_prefix: String,
}

/// Job published to the job queue. `id` is the emote id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: String,
    pub provider_kind: StorageKind,
    pub provider_details: ProviderDetails,
    pub consumer_kind: StorageKind,
    pub consumer_details: ConsumerDetails,
}

/// Processing stage reported on the update queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UpdateStage {
    Started,
    Downloaded,
    StageOne,
    StageOneComplete,
    StageTwo,
    StageTwoComplete,
    StageThree,
    StageThreeComplete,
    Completed,
    Cleaned,
    /// A tag this build does not know about
    Unknown(String),
}

impl UpdateStage {
    pub fn as_str(&self) -> &str {
        match self {
            UpdateStage::Started => "started",
            UpdateStage::Downloaded => "downloaded",
            UpdateStage::StageOne => "stage-one",
            UpdateStage::StageOneComplete => "stage-one-complete",
            UpdateStage::StageTwo => "stage-two",
            UpdateStage::StageTwoComplete => "stage-two-complete",
            UpdateStage::StageThree => "stage-three",
            UpdateStage::StageThreeComplete => "stage-three-complete",
            UpdateStage::Completed => "completed",
            UpdateStage::Cleaned => "cleaned",
            UpdateStage::Unknown(tag) => tag,
        }
    }
}

impl From<String> for UpdateStage {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "started" => UpdateStage::Started,
            "downloaded" => UpdateStage::Downloaded,
            "stage-one" => UpdateStage::StageOne,
            "stage-one-complete" => UpdateStage::StageOneComplete,
            "stage-two" => UpdateStage::StageTwo,
            "stage-two-complete" => UpdateStage::StageTwoComplete,
            "stage-three" => UpdateStage::StageThree,
            "stage-three-complete" => UpdateStage::StageThreeComplete,
            "completed" => UpdateStage::Completed,
            "cleaned" => UpdateStage::Cleaned,
            _ => UpdateStage::Unknown(tag),
        }
    }
}

impl From<UpdateStage> for String {
    fn from(stage: UpdateStage) -> Self {
        match stage {
            UpdateStage::Unknown(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for UpdateStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress event from the update queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub job_id: String,
    #[serde(rename = "type")]
    pub stage: UpdateStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// One processed output file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultFile {
    /// Scale label, e.g. `1x`
    pub name: String,
    /// Size in bytes
    pub size: i64,
    pub content_type: String,
    pub animated: bool,
    /// Time the worker spent producing this file
    pub time_taken: i64,
    pub width: i32,
    pub height: i32,
}

/// Terminal event from the result queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEvent {
    pub job_id: String,
    pub success: bool,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub files: Vec<ResultFile>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub error: String,
}

/// Outcome of a job, as carried by a [`ResultEvent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded { files: Vec<ResultFile> },
    Failed { error: String },
}

impl ResultEvent {
    /// Split the event into its job id and outcome
    pub fn into_outcome(self) -> (String, JobOutcome) {
        let outcome = if self.success {
            JobOutcome::Succeeded { files: self.files }
        } else {
            JobOutcome::Failed { error: self.error }
        };
        (self.job_id, outcome)
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_descriptor_wire_shape() {
        let job = JobDescriptor {
            id: "abc".to_string(),
            provider_kind: StorageKind::Aws,
            provider_details: ProviderDetails {
                bucket: "private".to_string(),
                key: "abc.webp".to_string(),
            },
            consumer_kind: StorageKind::Aws,
            consumer_details: ConsumerDetails {
                bucket: "public".to_string(),
                key_prefix: "emote/abc".to_string(),
            },
        };

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["provider_kind"], "aws");
        assert_eq!(value["provider_details"]["key"], "abc.webp");
        assert_eq!(value["consumer_details"]["key_prefix"], "emote/abc");
    }

    #[test]
    fn test_deserialize_update_event() {
        let json = r#"{
            "job_id": "550e8400-e29b-41d4-a716-446655440000",
            "type": "stage-two-complete",
            "timestamp": "2024-01-15T10:30:00Z"
        }"#;

        let event: UpdateEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.stage, UpdateStage::StageTwoComplete);
        assert!(event.timestamp.is_some());
    }

    #[test]
    fn test_unknown_stage_is_preserved() {
        let event: UpdateEvent =
            serde_json::from_str(r#"{"job_id": "x", "type": "stage-four"}"#).unwrap();
        assert_eq!(event.stage, UpdateStage::Unknown("stage-four".to_string()));
        assert_eq!(event.stage.to_string(), "stage-four");
    }

    #[test]
    fn test_stage_serialization() {
        assert_eq!(
            serde_json::to_string(&UpdateStage::StageOneComplete).unwrap(),
            "\"stage-one-complete\""
        );
        assert_eq!(
            serde_json::to_string(&UpdateStage::Completed).unwrap(),
            "\"completed\""
        );
    }

    #[test]
    fn test_result_event_outcomes() {
        let json = r#"{
            "job_id": "x",
            "success": true,
            "files": [{
                "name": "1x",
                "size": 1024,
                "content_type": "image/webp",
                "animated": false,
                "time_taken": 12,
                "width": 32,
                "height": 32
            }],
            "error": ""
        }"#;
        let event: ResultEvent = serde_json::from_str(json).unwrap();
        let (job_id, outcome) = event.into_outcome();
        assert_eq!(job_id, "x");
        match outcome {
            JobOutcome::Succeeded { files } => {
                assert_eq!(files.len(), 1);
                assert_eq!(files[0].width, 32);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let failed: ResultEvent = serde_json::from_str(
            r#"{"job_id": "y", "success": false, "files": null, "error": "ffmpeg exited 1"}"#,
        )
        .unwrap();
        assert_eq!(
            failed.into_outcome().1,
            JobOutcome::Failed {
                error: "ffmpeg exited 1".to_string()
            }
        );
    }

    #[test]
    fn test_result_event_requires_job_id() {
        let decoded: Result<ResultEvent, _> = serde_json::from_str(r#"{"success": true}"#);
        assert!(decoded.is_err());
    }
}
