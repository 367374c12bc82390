use serde::{Deserialize, Serialize};

use crate::state_machine::TranscriptSegment;

/// Body sent to the worker for both dispatch modes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub job_id: String,
    /// Storage reference of the audio.
    #[serde(rename = "s3_url")]
    pub source_ref: String,
    #[serde(rename = "callback_url")]
    pub callback_ref: String,
    #[serde(rename = "enable_diarization")]
    pub diarization: bool,
    #[serde(rename = "enable_alignment")]
    pub alignment: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Completed,
    Failed,
}

/// Result shape shared by the synchronous response and the callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub status: WorkerStatus,
    #[serde(default)]
    pub transcript_text: Option<String>,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub processing_duration_ms: Option<u64>,
    #[serde(default, rename = "audio_duration_s")]
    pub audio_duration_seconds: Option<f64>,
}

impl WorkerResult {
    pub fn completed(transcript: impl Into<String>) -> Self {
        Self {
            status: WorkerStatus::Completed,
            transcript_text: Some(transcript.into()),
            segments: Vec::new(),
            error_message: None,
            processing_duration_ms: None,
            audio_duration_seconds: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: WorkerStatus::Failed,
            transcript_text: None,
            segments: Vec::new(),
            error_message: Some(message.into()),
            processing_duration_ms: None,
            audio_duration_seconds: None,
        }
    }
}

/// Acknowledgement of an asynchronous dispatch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchAck {
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_worker_field_names() {
        let req = DispatchRequest {
            job_id: "j1".into(),
            source_ref: "uploads/a.wav".into(),
            callback_ref: "http://api/internal/v1/transcriptions/j1/callback".into(),
            diarization: true,
            alignment: true,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["s3_url"], "uploads/a.wav");
        assert_eq!(json["enable_diarization"], true);
        assert_eq!(json["enable_alignment"], true);
        assert!(json.get("source_ref").is_none());
    }

    #[test]
    fn callback_body_parses_with_extra_fields() {
        let body = r#"{
            "status": "completed",
            "transcript_text": "hello world",
            "processing_duration_ms": 5000,
            "segments": [{"start": 0.0, "end": 1.2, "text": "hello world", "words": []}],
            "speaker_segments": [],
            "metadata": {"device": "cuda"}
        }"#;
        let result: WorkerResult = serde_json::from_str(body).unwrap();
        assert_eq!(result.status, WorkerStatus::Completed);
        assert_eq!(result.transcript_text.as_deref(), Some("hello world"));
        assert_eq!(result.segments.len(), 1);
        assert_eq!(result.processing_duration_ms, Some(5000));
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(serde_json::from_str::<WorkerResult>(r#"{"status":"running"}"#).is_err());
    }
}
