use std::time::Duration;

use thiserror::Error;

use crate::state_machine::JobStatus;

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

/// Error kinds surfaced by the orchestration core.
///
/// Validation and conflict errors are returned before anything is written.
/// `ServiceUnavailable` and `Timeout` are raised after the affected job has
/// been durably moved to FAILED, so `job_id` always points at a queryable job.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(ConflictKind),

    #[error("{dependency} unavailable: {reason}{}", job_suffix(.job_id))]
    ServiceUnavailable {
        dependency: String,
        reason: String,
        job_id: Option<String>,
    },

    #[error("{dependency} timed out after {}ms{}", .after.as_millis(), job_suffix(.job_id))]
    Timeout {
        dependency: String,
        after: Duration,
        job_id: Option<String>,
    },

    #[error("durable storage unavailable: {0}")]
    Resource(String),
}

fn job_suffix(job_id: &Option<String>) -> String {
    match job_id {
        Some(id) => format!(" [job {id}]"),
        None => String::new(),
    }
}

/// Why a write was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictKind {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("job {job_id} already {stored}, refusing {incoming}")]
    TerminalMismatch {
        job_id: String,
        stored: JobStatus,
        incoming: JobStatus,
    },

    #[error("sequence {attempted} for aggregate {aggregate_id} is taken (next is {expected})")]
    SequenceTaken {
        aggregate_id: String,
        attempted: u64,
        expected: u64,
    },

    #[error("job {job_id} changed concurrently (expected {expected}, found {found})")]
    StaleStatus {
        job_id: String,
        expected: JobStatus,
        found: JobStatus,
    },

    #[error("job {0} already exists")]
    DuplicateJob(String),
}

impl OrchestratorError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn job_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "job",
            id: id.into(),
        }
    }

    /// Attach the affected job to a dependency failure.
    pub fn for_job(self, id: &str) -> Self {
        match self {
            Self::ServiceUnavailable {
                dependency, reason, ..
            } => Self::ServiceUnavailable {
                dependency,
                reason,
                job_id: Some(id.to_string()),
            },
            Self::Timeout {
                dependency, after, ..
            } => Self::Timeout {
                dependency,
                after,
                job_id: Some(id.to_string()),
            },
            other => other,
        }
    }
}

impl From<ConflictKind> for OrchestratorError {
    fn from(kind: ConflictKind) -> Self {
        Self::Conflict(kind)
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(e: std::io::Error) -> Self {
        Self::Resource(e.to_string())
    }
}

/// Errors loading `transcriber.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for '{key}': {message}")]
    Invalid { key: &'static str, message: String },
}
