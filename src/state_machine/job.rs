use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::JobStatus;
use crate::router::{ModelTier, QualityPreference};

/// How the worker is asked to process a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Block the request until the worker returns a result.
    Sync,
    /// Return after the worker acknowledges; the result arrives by callback.
    Async,
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchMode::Sync => write!(f, "sync"),
            DispatchMode::Async => write!(f, "async"),
        }
    }
}

/// Distinguishes a transcription the worker could not do from a job that never
/// got a verdict from the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The worker processed the audio and reported failure.
    Business,
    /// Dispatch, transport or supervision failure.
    System,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Business => write!(f, "Business"),
            FailureKind::System => write!(f, "System"),
        }
    }
}

/// Why a job ended in FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    WorkerFailed,
    DispatchRejected,
    ServiceUnavailable,
    Timeout,
    Stale,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::WorkerFailed => "worker_failed",
            FailureReason::DispatchRejected => "dispatch_rejected",
            FailureReason::ServiceUnavailable => "service_unavailable",
            FailureReason::Timeout => "timeout",
            FailureReason::Stale => "stale",
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            FailureReason::WorkerFailed => FailureKind::Business,
            _ => FailureKind::System,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timed span of transcript returned by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

/// Validated inputs for a job about to be created.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub original_name: String,
    pub storage_ref: String,
    pub model: ModelTier,
    pub language: Option<String>,
    pub quality: QualityPreference,
    pub diarization: bool,
    pub mode: DispatchMode,
    pub file_size_bytes: u64,
    pub estimated_duration_seconds: f64,
    pub correlation_id: String,
}

/// A transcription job, the aggregate root of the audit log.
///
/// Only [`StateMachine`](super::StateMachine) changes `status`, `transcript_text`,
/// `error_message` and the timestamps; jobs are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub original_name: String,
    pub storage_ref: String,
    pub status: JobStatus,
    pub model: ModelTier,
    pub language: Option<String>,
    pub quality: QualityPreference,
    pub diarization: bool,
    pub mode: DispatchMode,
    pub transcript_text: Option<String>,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
    pub error_message: Option<String>,
    pub failure_reason: Option<FailureReason>,
    /// Worker-side processing time reported with the result.
    #[serde(default)]
    pub worker_processing_ms: Option<u64>,
    /// Audio length as measured by the worker.
    #[serde(default)]
    pub audio_duration_seconds: Option<f64>,
    pub file_size_bytes: u64,
    pub estimated_duration_seconds: f64,
    /// Correlation id of the request that created the job; every lifecycle
    /// event of the job carries it.
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(draft: NewJob) -> Self {
        Self::new_at(draft, Utc::now())
    }

    pub fn new_at(draft: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            original_name: draft.original_name,
            storage_ref: draft.storage_ref,
            status: JobStatus::Pending,
            model: draft.model,
            language: draft.language,
            quality: draft.quality,
            diarization: draft.diarization,
            mode: draft.mode,
            transcript_text: None,
            segments: Vec::new(),
            error_message: None,
            failure_reason: None,
            worker_processing_ms: None,
            audio_duration_seconds: None,
            file_size_bytes: draft.file_size_bytes,
            estimated_duration_seconds: draft.estimated_duration_seconds,
            correlation_id: draft.correlation_id,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Milliseconds between dispatch and the terminal transition, when both
    /// happened.
    pub fn processing_time_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}
