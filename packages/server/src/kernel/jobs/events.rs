//! Job lifecycle types shared between the worker and SSE followers.
//!
//! Events are facts appended to a per-job log; the frame shapes here are the
//! wire contract for both the SSE stream and the polling endpoint. Exactly one
//! terminal event (`complete` or `error`) ends every job.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coarse job state kept alongside the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Complete,
    Error,
    /// State key missing or expired.
    Unknown,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Complete => "complete",
            JobState::Error => "error",
            JobState::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> JobState {
        match raw {
            "pending" => JobState::Pending,
            "running" => JobState::Running,
            "complete" => JobState::Complete,
            "error" => JobState::Error,
            _ => JobState::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Info,
    Complete,
    Error,
}

/// One frame in a job's event log.
///
/// Serialized as-is onto the SSE stream, one JSON object per `data:` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub status: EventStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_status: Option<String>,
}

impl JobEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            status: EventStatus::Info,
            message: message.into(),
            instance_id: None,
            url: None,
            location: None,
            container_status: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: EventStatus::Error,
            message: message.into(),
            instance_id: None,
            url: None,
            location: None,
            container_status: None,
        }
    }

    pub fn complete(
        message: impl Into<String>,
        instance_id: impl Into<String>,
        url: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            status: EventStatus::Complete,
            message: message.into(),
            instance_id: Some(instance_id.into()),
            url: Some(url.into()),
            location: Some(location.into()),
            container_status: Some("running".to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, EventStatus::Complete | EventStatus::Error)
    }
}

/// Immutable payload published once per provisioning job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub job_id: Uuid,
    pub name: String,
    pub version: String,
    #[serde(default = "default_location")]
    pub location: String,
}

pub fn default_location() -> String {
    "vinhedo".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_frame_omits_instance_fields() {
        let json = serde_json::to_value(JobEvent::info("Aguardando...")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "info", "message": "Aguardando..."})
        );
    }

    #[test]
    fn complete_frame_carries_instance_fields() {
        let event = JobEvent::complete(
            "Instance created successfully",
            "alice",
            "https://alice.n8n.example.com",
            "vinhedo",
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "complete");
        assert_eq!(json["instance_id"], "alice");
        assert_eq!(json["url"], "https://alice.n8n.example.com");
        assert_eq!(json["container_status"], "running");
        assert!(event.is_terminal());
    }

    #[test]
    fn error_frame_is_terminal() {
        let event = JobEvent::error("Instância 'alice' já existe");
        assert!(event.is_terminal());
        assert!(!JobEvent::info("x").is_terminal());
    }

    #[test]
    fn state_round_trips_through_strings() {
        for state in [
            JobState::Pending,
            JobState::Running,
            JobState::Complete,
            JobState::Error,
        ] {
            assert_eq!(JobState::parse(state.as_str()), state);
        }
        assert_eq!(JobState::parse("gone"), JobState::Unknown);
        assert!(JobState::Complete.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn payload_defaults_location() {
        let payload: JobPayload = serde_json::from_str(
            r#"{"job_id":"550e8400-e29b-41d4-a716-446655440000","name":"alice","version":"latest"}"#,
        )
        .unwrap();
        assert_eq!(payload.location, "vinhedo");
    }
}
