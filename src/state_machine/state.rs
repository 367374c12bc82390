use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{FailureReason, Job, TranscriptSegment};
use crate::error::ConflictKind;

/// Lifecycle status of a job.
///
/// PENDING → PROCESSING → COMPLETED | FAILED, with PENDING → FAILED for jobs that
/// never reached the worker. COMPLETED and FAILED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Edges of the job state graph.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            _ => Err(format!("invalid job status: {s}")),
        }
    }
}

/// Something that happened to a job and may move it along the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum JobInput {
    /// The worker accepted the job (sync call started or async ack received).
    DispatchAccepted,
    /// The worker produced a transcript.
    Completed {
        transcript_text: String,
        segments: Vec<TranscriptSegment>,
    },
    /// The job failed, either by worker verdict or by supervision.
    Failed {
        reason: FailureReason,
        message: String,
    },
}

impl JobInput {
    pub fn target(&self) -> JobStatus {
        match self {
            JobInput::DispatchAccepted => JobStatus::Processing,
            JobInput::Completed { .. } => JobStatus::Completed,
            JobInput::Failed { .. } => JobStatus::Failed,
        }
    }
}

/// A status change applied to a job, the raw material for a
/// `JobStatusChanged` event.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub reason: String,
    pub error_message: Option<String>,
}

/// Applies [`JobInput`]s to a [`Job`] under the state graph.
pub struct StateMachine;

impl StateMachine {
    /// Apply `input` to `job` at time `now`.
    ///
    /// The job is left untouched when the edge does not exist. Transcript and
    /// error message are written only here, on entry to the matching terminal
    /// state, so they are write-once.
    pub fn advance(
        job: &mut Job,
        input: JobInput,
        now: DateTime<Utc>,
    ) -> Result<Transition, ConflictKind> {
        let from = job.status;
        let to = input.target();
        if !from.can_transition_to(to) {
            return Err(ConflictKind::InvalidTransition { from, to });
        }

        let transition = match input {
            JobInput::DispatchAccepted => {
                job.started_at.get_or_insert(now);
                Transition {
                    from,
                    to,
                    reason: format!("dispatched ({})", job.mode),
                    error_message: None,
                }
            }
            JobInput::Completed {
                transcript_text,
                segments,
            } => {
                job.transcript_text = Some(transcript_text);
                job.segments = segments;
                job.finished_at = Some(now);
                Transition {
                    from,
                    to,
                    reason: "transcription completed".to_string(),
                    error_message: None,
                }
            }
            JobInput::Failed { reason, message } => {
                job.error_message = Some(message.clone());
                job.failure_reason = Some(reason);
                job.finished_at = Some(now);
                Transition {
                    from,
                    to,
                    reason: reason.as_str().to_string(),
                    error_message: Some(message),
                }
            }
        };
        job.status = to;
        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::job::tests::new_job;

    fn failed(reason: FailureReason) -> JobInput {
        JobInput::Failed {
            reason,
            message: format!("{reason}"),
        }
    }

    #[test]
    fn happy_path_walks_the_graph() {
        let mut job = Job::new(new_job());
        let now = Utc::now();

        let t = StateMachine::advance(&mut job, JobInput::DispatchAccepted, now).unwrap();
        assert_eq!((t.from, t.to), (JobStatus::Pending, JobStatus::Processing));
        assert_eq!(job.started_at, Some(now));

        let t = StateMachine::advance(
            &mut job,
            JobInput::Completed {
                transcript_text: "hello world".into(),
                segments: vec![],
            },
            now,
        )
        .unwrap();
        assert_eq!((t.from, t.to), (JobStatus::Processing, JobStatus::Completed));
        assert_eq!(job.transcript_text.as_deref(), Some("hello world"));
        assert_eq!(job.finished_at, Some(now));
        assert!(job.error_message.is_none());
    }

    #[test]
    fn pending_can_fail_directly() {
        let mut job = Job::new(new_job());
        let t = StateMachine::advance(&mut job, failed(FailureReason::ServiceUnavailable), Utc::now())
            .unwrap();
        assert_eq!(t.from, JobStatus::Pending);
        assert_eq!(t.reason, "service_unavailable");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure_reason, Some(FailureReason::ServiceUnavailable));
    }

    #[test]
    fn pending_cannot_complete() {
        let mut job = Job::new(new_job());
        let before = job.clone();
        let err = StateMachine::advance(
            &mut job,
            JobInput::Completed {
                transcript_text: "x".into(),
                segments: vec![],
            },
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConflictKind::InvalidTransition {
                from: JobStatus::Pending,
                to: JobStatus::Completed
            }
        );
        assert_eq!(job, before);
    }

    #[test]
    fn terminal_states_never_move() {
        let now = Utc::now();
        let mut job = Job::new(new_job());
        StateMachine::advance(&mut job, JobInput::DispatchAccepted, now).unwrap();
        StateMachine::advance(&mut job, failed(FailureReason::WorkerFailed), now).unwrap();
        let frozen = job.clone();

        for input in [
            JobInput::DispatchAccepted,
            JobInput::Completed {
                transcript_text: "late".into(),
                segments: vec![],
            },
            failed(FailureReason::Stale),
        ] {
            assert!(StateMachine::advance(&mut job, input, now).is_err());
        }
        assert_eq!(job, frozen);
    }

    #[test]
    fn graph_edges() {
        use JobStatus::*;
        let all = [Pending, Processing, Completed, Failed];
        let allowed = [
            (Pending, Processing),
            (Pending, Failed),
            (Processing, Completed),
            (Processing, Failed),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn status_display_and_parse() {
        assert_eq!(JobStatus::Processing.to_string(), "PROCESSING");
        assert_eq!("completed".parse::<JobStatus>().unwrap(), JobStatus::Completed);
        assert!("DONE".parse::<JobStatus>().is_err());
    }
}
