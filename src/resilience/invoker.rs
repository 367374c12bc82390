use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use super::circuit_breaker::CircuitBreaker;
use crate::config::TimeoutConfig;
use crate::error::OrchestratorError;
use crate::state_machine::FailureReason;
use crate::worker::{DispatchAck, DispatchRequest, TranscriptionWorker, WorkerError, WorkerResult};

/// Why a dispatch did not produce a worker answer.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("circuit breaker for {dependency} is open")]
    CircuitOpen { dependency: String },

    #[error("{dependency} did not answer within {}ms", .after.as_millis())]
    Timeout { dependency: String, after: Duration },

    #[error("{dependency} rejected the dispatch: {source}")]
    Rejected {
        dependency: String,
        #[source]
        source: WorkerError,
    },
}

impl DispatchError {
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            DispatchError::CircuitOpen { .. } => FailureReason::ServiceUnavailable,
            DispatchError::Timeout { .. } => FailureReason::Timeout,
            DispatchError::Rejected { .. } => FailureReason::DispatchRejected,
        }
    }
}

impl From<DispatchError> for OrchestratorError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::CircuitOpen { dependency } => OrchestratorError::ServiceUnavailable {
                dependency,
                reason: "circuit open".to_string(),
                job_id: None,
            },
            DispatchError::Timeout { dependency, after } => OrchestratorError::Timeout {
                dependency,
                after,
                job_id: None,
            },
            DispatchError::Rejected { dependency, source } => {
                OrchestratorError::ServiceUnavailable {
                    dependency,
                    reason: source.to_string(),
                    job_id: None,
                }
            }
        }
    }
}

/// Circuit breaker and deadline around every call to one worker.
pub struct ResilientInvoker<W> {
    worker: W,
    breaker: Arc<CircuitBreaker>,
    transport_timeout: Duration,
    ack_timeout: Duration,
}

impl<W: TranscriptionWorker> ResilientInvoker<W> {
    pub fn new(worker: W, breaker: Arc<CircuitBreaker>, timeouts: &TimeoutConfig) -> Self {
        Self {
            worker,
            breaker,
            transport_timeout: timeouts.transport(),
            ack_timeout: timeouts.async_ack(),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn dependency(&self) -> &str {
        self.breaker.name()
    }

    /// Synchronous transcription bounded by the shorter of the transport
    /// timeout and `deadline`.
    pub async fn dispatch_sync(
        &self,
        req: &DispatchRequest,
        deadline: Duration,
    ) -> Result<WorkerResult, DispatchError> {
        let limit = self.transport_timeout.min(deadline);
        self.guarded(req, limit, self.worker.transcribe(req)).await
    }

    /// Asynchronous hand-over bounded by the acknowledgement timeout.
    pub async fn dispatch_async(&self, req: &DispatchRequest) -> Result<DispatchAck, DispatchError> {
        self.guarded(req, self.ack_timeout, self.worker.submit(req))
            .await
    }

    async fn guarded<T>(
        &self,
        req: &DispatchRequest,
        limit: Duration,
        call: impl Future<Output = Result<T, WorkerError>>,
    ) -> Result<T, DispatchError> {
        let dependency = self.breaker.name().to_string();
        if !self.breaker.try_acquire() {
            warn!(job_id = %req.job_id, %dependency, "call not permitted, circuit open");
            return Err(DispatchError::CircuitOpen { dependency });
        }

        let started = Instant::now();
        // Dropping the future on expiry cancels the in-flight request.
        let outcome = timeout(limit, call).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(value)) => {
                self.breaker.record(false, elapsed);
                debug!(job_id = %req.job_id, %dependency, elapsed_ms = elapsed.as_millis() as u64, "worker call succeeded");
                Ok(value)
            }
            Ok(Err(source)) => {
                self.breaker.record(true, elapsed);
                warn!(job_id = %req.job_id, %dependency, error = %source, "worker call failed");
                Err(DispatchError::Rejected { dependency, source })
            }
            Err(_) => {
                self.breaker.record(true, elapsed);
                warn!(job_id = %req.job_id, %dependency, timeout_ms = limit.as_millis() as u64, "worker call timed out");
                Err(DispatchError::Timeout {
                    dependency,
                    after: limit,
                })
            }
        }
    }
}
