use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::resilience::{BreakerMetrics, CircuitState};
use crate::state_machine::{FailureKind, Job, JobStatus, Transition};

pub const EVENT_VERSION: u32 = 1;
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    JobCreated,
    JobStatusChanged,
    JobCompleted,
    CircuitBreakerStateChanged,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::JobCreated => "JobCreated",
            EventType::JobStatusChanged => "JobStatusChanged",
            EventType::JobCompleted => "JobCompleted",
            EventType::CircuitBreakerStateChanged => "CircuitBreakerStateChanged",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateType {
    Job,
    CircuitBreaker,
}

/// Event body, one variant per [`EventType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EventPayload {
    #[serde(rename_all = "camelCase")]
    JobCreated {
        original_name: String,
        storage_ref: String,
        model: String,
        language: Option<String>,
        quality: String,
        diarization: bool,
        mode: String,
        file_size_bytes: u64,
        estimated_duration_seconds: f64,
    },
    #[serde(rename_all = "camelCase")]
    JobStatusChanged {
        previous_status: JobStatus,
        new_status: JobStatus,
        reason: String,
        error_message: Option<String>,
        /// Set on entry to FAILED.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_kind: Option<FailureKind>,
        processing_time_ms: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    JobCompleted {
        transcript_text: String,
        model: String,
        language: Option<String>,
        processing_time_ms: Option<i64>,
        #[serde(default)]
        worker_processing_ms: Option<u64>,
        #[serde(default)]
        audio_duration_seconds: Option<f64>,
        segment_count: usize,
        word_count: usize,
        diarization: bool,
    },
    #[serde(rename_all = "camelCase")]
    CircuitBreakerStateChanged {
        dependency: String,
        previous_state: CircuitState,
        new_state: CircuitState,
        failure_rate: f32,
        slow_call_rate: f32,
        buffered_calls: u32,
        failed_calls: u32,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::JobCreated { .. } => EventType::JobCreated,
            EventPayload::JobStatusChanged { .. } => EventType::JobStatusChanged,
            EventPayload::JobCompleted { .. } => EventType::JobCompleted,
            EventPayload::CircuitBreakerStateChanged { .. } => {
                EventType::CircuitBreakerStateChanged
            }
        }
    }
}

/// Who is acting, on behalf of which request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub correlation_id: String,
    pub request_id: Option<String>,
    pub initiated_by: String,
}

impl RequestContext {
    /// A fresh context with a new correlation id.
    pub fn new(initiated_by: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            request_id: None,
            initiated_by: initiated_by.into(),
        }
    }

    pub fn system() -> Self {
        Self::new(SYSTEM_ACTOR)
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// An event that has been validated but not yet given a sequence number.
///
/// Built only through the constructors below.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    aggregate_id: String,
    aggregate_type: AggregateType,
    correlation_id: String,
    initiated_by: String,
    occurred_at: DateTime<Utc>,
    payload: EventPayload,
    metadata: BTreeMap<String, String>,
}

impl NewEvent {
    fn build(
        aggregate_id: &str,
        aggregate_type: AggregateType,
        correlation_id: &str,
        ctx: &RequestContext,
        occurred_at: DateTime<Utc>,
        payload: EventPayload,
    ) -> Result<Self> {
        if aggregate_id.trim().is_empty() {
            return Err(OrchestratorError::validation("event aggregate id is empty"));
        }
        if correlation_id.trim().is_empty() {
            return Err(OrchestratorError::validation("event correlation id is empty"));
        }
        let mut metadata = BTreeMap::new();
        if let Some(request_id) = &ctx.request_id {
            metadata.insert("requestId".to_string(), request_id.clone());
        }
        let initiated_by = if ctx.initiated_by.trim().is_empty() {
            SYSTEM_ACTOR.to_string()
        } else {
            ctx.initiated_by.clone()
        };
        Ok(Self {
            aggregate_id: aggregate_id.to_string(),
            aggregate_type,
            correlation_id: correlation_id.to_string(),
            initiated_by,
            occurred_at,
            payload,
            metadata,
        })
    }

    pub fn job_created(job: &Job, ctx: &RequestContext) -> Result<Self> {
        let payload = EventPayload::JobCreated {
            original_name: job.original_name.clone(),
            storage_ref: job.storage_ref.clone(),
            model: job.model.to_string(),
            language: job.language.clone(),
            quality: job.quality.as_str().to_string(),
            diarization: job.diarization,
            mode: job.mode.to_string(),
            file_size_bytes: job.file_size_bytes,
            estimated_duration_seconds: job.estimated_duration_seconds,
        };
        Self::build(
            &job.id,
            AggregateType::Job,
            &job.correlation_id,
            ctx,
            job.created_at,
            payload,
        )
    }

    /// `job` is the state after `transition` was applied.
    pub fn job_status_changed(
        job: &Job,
        transition: &Transition,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let payload = EventPayload::JobStatusChanged {
            previous_status: transition.from,
            new_status: transition.to,
            reason: transition.reason.clone(),
            error_message: transition.error_message.clone(),
            failure_kind: match transition.to {
                JobStatus::Failed => job.failure_reason.map(|r| r.kind()),
                _ => None,
            },
            processing_time_ms: if transition.to.is_terminal() {
                job.processing_time_ms()
            } else {
                None
            },
        };
        Self::build(&job.id, AggregateType::Job, &job.correlation_id, ctx, now, payload)
    }

    pub fn job_completed(job: &Job, ctx: &RequestContext, now: DateTime<Utc>) -> Result<Self> {
        let Some(transcript) = job.transcript_text.as_deref() else {
            return Err(OrchestratorError::validation(format!(
                "job {} has no transcript",
                job.id
            )));
        };
        let payload = EventPayload::JobCompleted {
            transcript_text: transcript.to_string(),
            model: job.model.to_string(),
            language: job.language.clone(),
            processing_time_ms: job.processing_time_ms(),
            worker_processing_ms: job.worker_processing_ms,
            audio_duration_seconds: job.audio_duration_seconds,
            segment_count: job.segments.len(),
            word_count: transcript.split_whitespace().count(),
            diarization: job.diarization,
        };
        Self::build(&job.id, AggregateType::Job, &job.correlation_id, ctx, now, payload)
    }

    pub fn circuit_breaker_state_changed(
        dependency: &str,
        from: CircuitState,
        to: CircuitState,
        metrics: &BreakerMetrics,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let payload = EventPayload::CircuitBreakerStateChanged {
            dependency: dependency.to_string(),
            previous_state: from,
            new_state: to,
            failure_rate: metrics.failure_rate,
            slow_call_rate: metrics.slow_call_rate,
            buffered_calls: metrics.buffered_calls,
            failed_calls: metrics.failed_calls,
        };
        Self::build(
            dependency,
            AggregateType::CircuitBreaker,
            &ctx.correlation_id,
            ctx,
            now,
            payload,
        )
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub(crate) fn into_domain(self, sequence_number: u64) -> DomainEvent {
        DomainEvent {
            event_id: Uuid::new_v4(),
            event_type: self.payload.event_type(),
            event_version: EVENT_VERSION,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            sequence_number,
            correlation_id: self.correlation_id,
            initiated_by: self.initiated_by,
            occurred_at: self.occurred_at,
            payload: self.payload,
            metadata: self.metadata,
        }
    }
}

/// An appended, immutable audit record, unique by `(aggregate_id, sequence_number)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub event_version: u32,
    pub aggregate_id: String,
    pub aggregate_type: AggregateType,
    pub sequence_number: u64,
    pub correlation_id: String,
    pub initiated_by: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: EventPayload,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::job::tests::new_job;
    use crate::state_machine::{FailureReason, JobInput, StateMachine};

    #[test]
    fn job_created_uses_job_correlation_and_request_id() {
        let job = Job::new(new_job());
        let ctx = RequestContext::new("api").with_request_id("req-9");
        let event = NewEvent::job_created(&job, &ctx).unwrap().into_domain(1);

        assert_eq!(event.event_type, EventType::JobCreated);
        assert_eq!(event.aggregate_id, job.id);
        assert_eq!(event.correlation_id, "corr-1");
        assert_eq!(event.initiated_by, "api");
        assert_eq!(event.metadata.get("requestId").map(String::as_str), Some("req-9"));
        assert_eq!(event.event_version, EVENT_VERSION);
    }

    #[test]
    fn empty_correlation_is_rejected() {
        let mut job = Job::new(new_job());
        job.correlation_id = "  ".into();
        let err = NewEvent::job_created(&job, &RequestContext::system()).unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn completed_requires_transcript() {
        let job = Job::new(new_job());
        assert!(NewEvent::job_completed(&job, &RequestContext::system(), Utc::now()).is_err());
    }

    #[test]
    fn status_changed_carries_failure_message() {
        let mut job = Job::new(new_job());
        let now = Utc::now();
        let t = StateMachine::advance(
            &mut job,
            JobInput::Failed {
                reason: FailureReason::Stale,
                message: "no result in 30m".into(),
            },
            now,
        )
        .unwrap();
        let event = NewEvent::job_status_changed(&job, &t, &RequestContext::system(), now).unwrap();
        match event.payload {
            EventPayload::JobStatusChanged {
                previous_status,
                new_status,
                reason,
                error_message,
                failure_kind,
                ..
            } => {
                assert_eq!(previous_status, JobStatus::Pending);
                assert_eq!(new_status, JobStatus::Failed);
                assert_eq!(reason, "stale");
                assert_eq!(error_message.as_deref(), Some("no result in 30m"));
                assert_eq!(failure_kind, Some(FailureKind::System));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn domain_event_json_shape() {
        let mut job = Job::new(new_job());
        let now = Utc::now();
        StateMachine::advance(&mut job, JobInput::DispatchAccepted, now).unwrap();
        StateMachine::advance(
            &mut job,
            JobInput::Completed {
                transcript_text: "hello big world".into(),
                segments: vec![],
            },
            now,
        )
        .unwrap();
        let event = NewEvent::job_completed(&job, &RequestContext::system(), now)
            .unwrap()
            .into_domain(3);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["eventType"], "JobCompleted");
        assert_eq!(json["sequenceNumber"], 3);
        assert_eq!(json["payload"]["kind"], "jobCompleted");
        assert_eq!(json["payload"]["wordCount"], 3);
        assert!(json["payload"].get("failureKind").is_none());

        let back: DomainEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
