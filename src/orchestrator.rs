use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{AppConfig, OrchestratorConfig};
use crate::error::{ConflictKind, OrchestratorError, Result};
use crate::events::{NewEvent, RequestContext};
use crate::resilience::{CircuitBreaker, ResilientInvoker};
use crate::router::{
    AudioMetadata, ModelSelectionPolicy, ModelTier, QualityPreference, estimate_duration_seconds,
};
use crate::state_machine::{
    DispatchMode, FailureReason, Job, JobInput, JobStatus, NewJob, StateMachine,
};
use crate::store::Ledger;
use crate::worker::{DispatchRequest, TranscriptionWorker, WorkerResult, WorkerStatus};

/// Files below this size go synchronously unless the caller chose a mode.
const SYNC_SIZE_LIMIT_BYTES: u64 = 1_000_000;
const DEFAULT_FAILURE_MESSAGE: &str = "transcription failed";

const ALLOWED_MIME_TYPES: &[&str] = &[
    "audio/wav",
    "audio/wave",
    "audio/x-wav",
    "audio/mpeg",
    "audio/mp3",
    "audio/mp4",
    "audio/m4a",
    "audio/x-m4a",
    "audio/flac",
    "audio/x-flac",
];

/// What is known about an uploaded file.
#[derive(Debug, Clone)]
pub struct UploadMeta {
    pub original_name: String,
    pub storage_ref: String,
    pub file_size_bytes: u64,
    pub mime_type: Option<String>,
    /// Estimated from size and type when absent or zero.
    pub duration_seconds: Option<f64>,
}

/// Caller choices for a job.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub language: Option<String>,
    pub quality: QualityPreference,
    /// Bypasses model selection.
    pub model: Option<ModelTier>,
    pub diarization: bool,
    /// `None` lets size and duration decide.
    pub mode: Option<DispatchMode>,
}

/// Drives jobs from creation to a terminal state.
pub struct JobOrchestrator<W> {
    ledger: Arc<Ledger>,
    invoker: ResilientInvoker<W>,
    policy: ModelSelectionPolicy,
    config: OrchestratorConfig,
}

impl<W: TranscriptionWorker> JobOrchestrator<W> {
    pub fn new(config: &AppConfig, ledger: Arc<Ledger>, invoker: ResilientInvoker<W>) -> Self {
        Self {
            ledger,
            invoker,
            policy: ModelSelectionPolicy::new(&config.model_selection),
            config: config.orchestrator.clone(),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.invoker.breaker()
    }

    pub fn policy(&self) -> &ModelSelectionPolicy {
        &self.policy
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        self.ledger
            .get_job(job_id)
            .await
            .ok_or_else(|| OrchestratorError::job_not_found(job_id))
    }

    /// Validate, select a model, persist the job as PENDING and dispatch it.
    ///
    /// Sync jobs come back terminal. Async jobs come back PROCESSING once the
    /// worker acknowledged. A dispatch failure leaves the job FAILED and the
    /// returned error names it.
    #[instrument(skip_all, fields(correlation_id = %ctx.correlation_id))]
    pub async fn create_job(
        &self,
        upload: UploadMeta,
        options: JobOptions,
        ctx: &RequestContext,
    ) -> Result<Job> {
        let draft = self.prepare(upload, options, ctx)?;
        let job = Job::new(draft);
        let created = NewEvent::job_created(&job, ctx)?;
        self.ledger.create_job(job.clone(), vec![created]).await?;
        info!(
            job_id = %job.id,
            model = %job.model,
            mode = %job.mode,
            size = job.file_size_bytes,
            "job created"
        );

        let req = self.dispatch_request(&job);
        match job.mode {
            DispatchMode::Sync => self.run_sync(job, &req, ctx).await,
            DispatchMode::Async => self.run_async(job, &req, ctx).await,
        }
    }

    /// Apply a worker result delivered by callback. Redelivery of the stored
    /// terminal status is a no-op; a different terminal status is a conflict.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn handle_callback(
        &self,
        job_id: &str,
        result: WorkerResult,
        ctx: &RequestContext,
    ) -> Result<Job> {
        self.apply_result(job_id, &result, ctx).await
    }

    /// Fail every non-terminal job older than the processing budget.
    pub async fn sweep_stale(&self) -> Result<usize> {
        self.sweep_stale_at(Utc::now()).await
    }

    pub async fn sweep_stale_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let budget = self.config.max_processing_time();
        let horizon = chrono::Duration::from_std(budget)
            .map_err(|e| OrchestratorError::validation(format!("max processing time: {e}")))?;
        let cutoff = now
            .checked_sub_signed(horizon)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let ctx = RequestContext::system();
        let message = format!(
            "no result within {} minutes",
            self.config.max_processing_time_minutes
        );
        let mut swept = 0;
        for job in self.ledger.stale_jobs(cutoff).await {
            if self
                .fail_job(&job.id, FailureReason::Stale, &message, &ctx)
                .await?
            {
                warn!(job_id = %job.id, created_at = %job.created_at, "stale job failed");
                swept += 1;
            }
        }
        if swept > 0 {
            info!(swept, "stale sweep finished");
        }
        Ok(swept)
    }

    /// Record every breaker transition as a `CircuitBreakerStateChanged` event.
    pub fn spawn_breaker_audit(&self) -> JoinHandle<()> {
        let ledger = self.ledger.clone();
        let mut rx = self.breaker().subscribe();
        tokio::spawn(async move {
            loop {
                let t = match rx.recv().await {
                    Ok(t) => t,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "breaker audit lagged, transitions dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let ctx = RequestContext::system();
                let recorded = NewEvent::circuit_breaker_state_changed(
                    &t.dependency,
                    t.from,
                    t.to,
                    &t.metrics,
                    &ctx,
                    Utc::now(),
                );
                let appended = match recorded {
                    Ok(event) => ledger.append_event(event).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = appended {
                    error!(dependency = %t.dependency, error = %e, "failed to record breaker transition");
                }
            }
        })
    }

    fn prepare(&self, upload: UploadMeta, options: JobOptions, ctx: &RequestContext) -> Result<NewJob> {
        if upload.original_name.trim().is_empty() {
            return Err(OrchestratorError::validation("original name is empty"));
        }
        if upload.storage_ref.trim().is_empty() {
            return Err(OrchestratorError::validation("storage ref is empty"));
        }
        if upload.file_size_bytes == 0 {
            return Err(OrchestratorError::validation("file is empty"));
        }
        if upload.file_size_bytes > self.config.max_file_size_bytes {
            return Err(OrchestratorError::validation(format!(
                "file size {} exceeds limit {}",
                upload.file_size_bytes, self.config.max_file_size_bytes
            )));
        }
        let mime = upload
            .mime_type
            .as_deref()
            .map(|m| m.split(';').next().unwrap_or(m).trim().to_ascii_lowercase());
        if let Some(mime) = &mime {
            if !ALLOWED_MIME_TYPES.contains(&mime.as_str()) {
                return Err(OrchestratorError::validation(format!(
                    "unsupported content type {mime}"
                )));
            }
        }
        let duration = match upload.duration_seconds {
            Some(d) if !d.is_finite() || d < 0.0 => {
                return Err(OrchestratorError::validation(format!("invalid duration {d}")));
            }
            Some(d) if d > 0.0 => d,
            _ => estimate_duration_seconds(upload.file_size_bytes, mime.as_deref()),
        };
        let language = options
            .language
            .map(|l| l.trim().to_ascii_lowercase())
            .filter(|l| !l.is_empty());

        let model = match options.model {
            Some(model) => model,
            None => {
                let meta = AudioMetadata::new(upload.file_size_bytes, duration, language.as_deref());
                self.policy.select(&meta, options.quality)
            }
        };
        let mode = options.mode.unwrap_or(
            if upload.file_size_bytes < SYNC_SIZE_LIMIT_BYTES
                || duration <= self.config.sync_threshold_seconds as f64
            {
                DispatchMode::Sync
            } else {
                DispatchMode::Async
            },
        );

        Ok(NewJob {
            original_name: upload.original_name,
            storage_ref: upload.storage_ref,
            model,
            language,
            quality: options.quality,
            diarization: options.diarization,
            mode,
            file_size_bytes: upload.file_size_bytes,
            estimated_duration_seconds: duration,
            correlation_id: ctx.correlation_id.clone(),
        })
    }

    fn dispatch_request(&self, job: &Job) -> DispatchRequest {
        DispatchRequest {
            job_id: job.id.clone(),
            source_ref: job.storage_ref.clone(),
            callback_ref: format!(
                "{}/internal/v1/transcriptions/{}/callback",
                self.config.callback_base_url.trim_end_matches('/'),
                job.id
            ),
            diarization: job.diarization,
            alignment: true,
        }
    }

    async fn run_sync(&self, job: Job, req: &DispatchRequest, ctx: &RequestContext) -> Result<Job> {
        // PROCESSING before the call, so a crash mid-call leaves a job the
        // stale sweep will find.
        self.accept_dispatch(&job.id, ctx).await?;

        match self
            .invoker
            .dispatch_sync(req, self.config.sync_timeout())
            .await
        {
            Ok(result) => match self.apply_result(&job.id, &result, ctx).await {
                Err(OrchestratorError::Validation(msg)) => {
                    let message = format!("invalid worker result: {msg}");
                    self.fail_job(&job.id, FailureReason::DispatchRejected, &message, ctx)
                        .await?;
                    self.get_job(&job.id).await
                }
                other => other,
            },
            Err(e) => {
                self.fail_job(&job.id, e.failure_reason(), &e.to_string(), ctx)
                    .await?;
                Err(OrchestratorError::from(e).for_job(&job.id))
            }
        }
    }

    async fn run_async(&self, job: Job, req: &DispatchRequest, ctx: &RequestContext) -> Result<Job> {
        match self.invoker.dispatch_async(req).await {
            Ok(ack) => {
                debug!(
                    job_id = %job.id,
                    dependency = self.invoker.dependency(),
                    ack = ?ack.message,
                    "worker acknowledged"
                );
                self.accept_dispatch(&job.id, ctx).await
            }
            Err(e) => {
                self.fail_job(&job.id, e.failure_reason(), &e.to_string(), ctx)
                    .await?;
                Err(OrchestratorError::from(e).for_job(&job.id))
            }
        }
    }

    /// PENDING -> PROCESSING. A job that already moved on (its callback beat
    /// the acknowledgement) is returned as it is.
    async fn accept_dispatch(&self, job_id: &str, ctx: &RequestContext) -> Result<Job> {
        loop {
            let job = self.get_job(job_id).await?;
            if job.status != JobStatus::Pending {
                return Ok(job);
            }
            let now = Utc::now();
            let mut next = job.clone();
            let t = StateMachine::advance(&mut next, JobInput::DispatchAccepted, now)?;
            let event = NewEvent::job_status_changed(&next, &t, ctx, now)?;
            match self
                .ledger
                .compare_and_set(JobStatus::Pending, next.clone(), vec![event])
                .await
            {
                Ok(_) => {
                    info!(job_id, from = %t.from, to = %t.to, "job dispatched");
                    return Ok(next);
                }
                Err(OrchestratorError::Conflict(ConflictKind::StaleStatus { .. })) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Move a non-terminal job to FAILED. Returns false when the job was
    /// already terminal.
    async fn fail_job(
        &self,
        job_id: &str,
        reason: FailureReason,
        message: &str,
        ctx: &RequestContext,
    ) -> Result<bool> {
        loop {
            let job = self.get_job(job_id).await?;
            if job.is_terminal() {
                return Ok(false);
            }
            let expected = job.status;
            let now = Utc::now();
            let mut next = job;
            let t = StateMachine::advance(
                &mut next,
                JobInput::Failed {
                    reason,
                    message: message.to_string(),
                },
                now,
            )?;
            let event = NewEvent::job_status_changed(&next, &t, ctx, now)?;
            match self
                .ledger
                .compare_and_set(expected, next, vec![event])
                .await
            {
                Ok(_) => {
                    warn!(
                        job_id,
                        from = %t.from,
                        to = %t.to,
                        %reason,
                        kind = %reason.kind(),
                        error = message,
                        "job failed"
                    );
                    return Ok(true);
                }
                Err(OrchestratorError::Conflict(ConflictKind::StaleStatus { .. })) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn apply_result(
        &self,
        job_id: &str,
        result: &WorkerResult,
        ctx: &RequestContext,
    ) -> Result<Job> {
        let target = match result.status {
            WorkerStatus::Completed => JobStatus::Completed,
            WorkerStatus::Failed => JobStatus::Failed,
        };
        loop {
            let job = self.get_job(job_id).await?;
            if job.is_terminal() {
                if job.status == target {
                    debug!(job_id, status = %job.status, "duplicate callback ignored");
                    return Ok(job);
                }
                return Err(ConflictKind::TerminalMismatch {
                    job_id: job.id,
                    stored: job.status,
                    incoming: target,
                }
                .into());
            }

            let input = result_input(result)?;
            let expected = job.status;
            let now = Utc::now();
            let mut next = job;
            next.worker_processing_ms = result.processing_duration_ms;
            next.audio_duration_seconds = result.audio_duration_seconds;
            let mut events = Vec::with_capacity(3);
            if next.status == JobStatus::Pending {
                let t = StateMachine::advance(&mut next, JobInput::DispatchAccepted, now)?;
                events.push(NewEvent::job_status_changed(&next, &t, ctx, now)?);
            }
            let t = StateMachine::advance(&mut next, input, now)?;
            events.push(NewEvent::job_status_changed(&next, &t, ctx, now)?);
            if t.to == JobStatus::Completed {
                events.push(NewEvent::job_completed(&next, ctx, now)?);
            }

            match self
                .ledger
                .compare_and_set(expected, next.clone(), events)
                .await
            {
                Ok(_) => {
                    info!(
                        job_id,
                        from = %expected,
                        to = %t.to,
                        processing_ms = next.processing_time_ms(),
                        "job result applied"
                    );
                    return Ok(next);
                }
                Err(OrchestratorError::Conflict(ConflictKind::StaleStatus { .. })) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<W: TranscriptionWorker + 'static> JobOrchestrator<W> {
    /// Run [`sweep_stale`](Self::sweep_stale) every `sweep_interval`.
    pub fn spawn_stale_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_stale().await {
                    error!(error = %e, "stale sweep failed");
                }
            }
        })
    }
}

fn result_input(result: &WorkerResult) -> Result<JobInput> {
    match result.status {
        WorkerStatus::Completed => {
            let transcript = result
                .transcript_text
                .clone()
                .ok_or_else(|| OrchestratorError::validation("completed result has no transcript"))?;
            Ok(JobInput::Completed {
                transcript_text: transcript,
                segments: result.segments.clone(),
            })
        }
        WorkerStatus::Failed => Ok(JobInput::Failed {
            reason: FailureReason::WorkerFailed,
            message: result
                .error_message
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string()),
        }),
    }
}
