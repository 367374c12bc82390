//! Durable home of jobs and their audit events.
//!
//! A [`Ledger`] commits a job mutation and the events describing it as one
//! unit: the unit is written to the journal (when configured) before memory
//! changes, so a crash never leaves a job without its events or the reverse.

mod journal;

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{ConflictKind, OrchestratorError, Result};
use crate::events::{DomainEvent, EventStore, NewEvent};
use crate::state_machine::{Job, JobStatus};
use journal::Journal;

#[derive(Default)]
struct LedgerState {
    jobs: HashMap<String, Job>,
    events: EventStore,
    journal: Option<Journal>,
}

impl LedgerState {
    async fn commit(&mut self, job: Option<Job>, events: Vec<DomainEvent>) -> Result<()> {
        if let Some(journal) = self.journal.as_mut() {
            journal.append(job.as_ref(), &events).await?;
        }
        if let Some(job) = job {
            self.jobs.insert(job.id.clone(), job);
        }
        for event in events {
            self.events.insert(event)?;
        }
        Ok(())
    }
}

/// Jobs plus the event store behind one lock.
pub struct Ledger {
    state: Mutex<LedgerState>,
}

impl Ledger {
    /// A ledger that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// A ledger backed by a JSONL journal at `path`, replaying what is there.
    pub async fn open(path: &Path) -> Result<Self> {
        let (journal, entries) = Journal::open(path).await?;
        let mut state = LedgerState::default();
        let units = entries.len();
        let mut skipped = 0;
        for entry in entries {
            // A unit applies whole or not at all.
            if let Err(e) = state.events.check_continues(&entry.events) {
                skipped += 1;
                warn!(
                    job_id = entry.job.as_ref().map(|j| j.id.as_str()),
                    events = entry.events.len(),
                    error = %e,
                    "skipping journal unit that does not continue its event streams"
                );
                continue;
            }
            if let Some(job) = entry.job {
                state.jobs.insert(job.id.clone(), job);
            }
            for event in entry.events {
                state.events.insert(event)?;
            }
        }
        info!(
            path = %journal.path().display(),
            units,
            skipped,
            jobs = state.jobs.len(),
            events = state.events.len(),
            "ledger replayed"
        );
        state.journal = Some(journal);
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Store a new job with its creation events.
    pub async fn create_job(&self, job: Job, events: Vec<NewEvent>) -> Result<Vec<DomainEvent>> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Err(ConflictKind::DuplicateJob(job.id).into());
        }
        let events = state.events.sequence(events);
        state.commit(Some(job), events.clone()).await?;
        Ok(events)
    }

    /// Replace a job only if its stored status is still `expected`.
    pub async fn compare_and_set(
        &self,
        expected: JobStatus,
        job: Job,
        events: Vec<NewEvent>,
    ) -> Result<Vec<DomainEvent>> {
        let mut state = self.state.lock().await;
        let found = state
            .jobs
            .get(&job.id)
            .map(|j| j.status)
            .ok_or_else(|| OrchestratorError::job_not_found(&job.id))?;
        if found != expected {
            return Err(ConflictKind::StaleStatus {
                job_id: job.id,
                expected,
                found,
            }
            .into());
        }
        let events = state.events.sequence(events);
        state.commit(Some(job), events.clone()).await?;
        Ok(events)
    }

    /// Append one event at the next free sequence number.
    pub async fn append_event(&self, event: NewEvent) -> Result<DomainEvent> {
        let mut state = self.state.lock().await;
        let seq = state.events.next_sequence(event.aggregate_id());
        let event = event.into_domain(seq);
        state.commit(None, vec![event.clone()]).await?;
        Ok(event)
    }

    /// Append one event only if `sequence_number` is the next free one.
    pub async fn append_event_expected(
        &self,
        event: NewEvent,
        sequence_number: u64,
    ) -> Result<DomainEvent> {
        let mut state = self.state.lock().await;
        state
            .events
            .check_next(event.aggregate_id(), sequence_number)?;
        let event = event.into_domain(sequence_number);
        state.commit(None, vec![event.clone()]).await?;
        Ok(event)
    }

    pub async fn get_job(&self, id: &str) -> Option<Job> {
        self.state.lock().await.jobs.get(id).cloned()
    }

    /// Non-terminal jobs created at or before `cutoff`, oldest first.
    pub async fn stale_jobs(&self, cutoff: DateTime<Utc>) -> Vec<Job> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| !j.is_terminal() && j.created_at <= cutoff)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub async fn next_sequence(&self, aggregate_id: &str) -> u64 {
        self.state.lock().await.events.next_sequence(aggregate_id)
    }

    pub async fn query_by_aggregate(&self, aggregate_id: &str) -> Vec<DomainEvent> {
        self.state.lock().await.events.query_by_aggregate(aggregate_id)
    }

    pub async fn query_after(&self, aggregate_id: &str, after: u64) -> Vec<DomainEvent> {
        self.state.lock().await.events.query_after(aggregate_id, after)
    }

    pub async fn query_by_correlation(&self, correlation_id: &str) -> Vec<DomainEvent> {
        self.state
            .lock()
            .await
            .events
            .query_by_correlation(correlation_id)
    }

    pub async fn query_recent(&self, limit: usize) -> Vec<DomainEvent> {
        self.state.lock().await.events.query_recent(limit)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::events::{EventPayload, EventType, RequestContext};
    use crate::state_machine::job::tests::new_job;
    use crate::state_machine::{FailureReason, JobInput, StateMachine};

    fn created(job: &Job) -> NewEvent {
        NewEvent::job_created(job, &RequestContext::system()).unwrap()
    }

    fn advanced(job: &Job, input: JobInput) -> (Job, NewEvent) {
        let now = Utc::now();
        let mut next = job.clone();
        let t = StateMachine::advance(&mut next, input, now).unwrap();
        let event = NewEvent::job_status_changed(&next, &t, &RequestContext::system(), now).unwrap();
        (next, event)
    }

    /// The stored job's status matches the last status change in its stream.
    async fn assert_job_matches_events(ledger: &Ledger, job_id: &str) {
        let job = ledger.get_job(job_id).await.unwrap();
        let last = ledger
            .query_by_aggregate(job_id)
            .await
            .iter()
            .rev()
            .find_map(|e| match &e.payload {
                EventPayload::JobStatusChanged { new_status, .. } => Some(*new_status),
                _ => None,
            })
            .unwrap_or(JobStatus::Pending);
        assert_eq!(job.status, last, "job snapshot and event stream disagree");
    }

    #[tokio::test]
    async fn create_then_duplicate_is_conflict() {
        let ledger = Ledger::in_memory();
        let job = Job::new(new_job());
        let events = ledger.create_job(job.clone(), vec![created(&job)]).await.unwrap();
        assert_eq!(events[0].sequence_number, 1);

        let err = ledger
            .create_job(job.clone(), vec![created(&job)])
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Conflict(ConflictKind::DuplicateJob(_))));
        assert_eq!(ledger.query_by_aggregate(&job.id).await.len(), 1);
    }

    #[tokio::test]
    async fn compare_and_set_refuses_stale_status() {
        let ledger = Ledger::in_memory();
        let job = Job::new(new_job());
        ledger.create_job(job.clone(), vec![created(&job)]).await.unwrap();

        let mut next = job.clone();
        let t = StateMachine::advance(&mut next, JobInput::DispatchAccepted, Utc::now()).unwrap();
        let event = NewEvent::job_status_changed(&next, &t, &RequestContext::system(), Utc::now())
            .unwrap();
        ledger
            .compare_and_set(JobStatus::Pending, next.clone(), vec![event.clone()])
            .await
            .unwrap();

        let err = ledger
            .compare_and_set(JobStatus::Pending, next, vec![event])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Conflict(ConflictKind::StaleStatus {
                found: JobStatus::Processing,
                ..
            })
        ));
        let stored = ledger.get_job(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(ledger.next_sequence(&job.id).await, 3);
    }

    #[tokio::test]
    async fn compare_and_set_unknown_job_is_not_found() {
        let ledger = Ledger::in_memory();
        let job = Job::new(new_job());
        let err = ledger
            .compare_and_set(JobStatus::Pending, job, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_are_gap_free() {
        let ledger = Arc::new(Ledger::in_memory());
        let job = Job::new(new_job());
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let ledger = ledger.clone();
                let event = created(&job);
                tokio::spawn(async move { ledger.append_event(event).await.unwrap() })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        let seqs: Vec<u64> = ledger
            .query_by_aggregate(&job.id)
            .await
            .iter()
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(seqs, (1..=32).collect::<Vec<u64>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_expected_appends_one_wins_per_number() {
        let ledger = Arc::new(Ledger::in_memory());
        let job = Job::new(new_job());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                let event = created(&job);
                tokio::spawn(async move { ledger.append_event_expected(event, 1).await })
            })
            .collect();
        let mut won = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => won += 1,
                Err(e) => assert!(matches!(
                    e,
                    OrchestratorError::Conflict(ConflictKind::SequenceTaken { expected: 2, .. })
                )),
            }
        }
        assert_eq!(won, 1);
    }

    #[tokio::test]
    async fn stale_jobs_skip_terminal_and_recent() {
        let ledger = Ledger::in_memory();
        let now = Utc::now();
        let old = Job::new_at(new_job(), now - chrono::Duration::minutes(45));
        let fresh = Job::new_at(new_job(), now);
        let mut done = Job::new_at(new_job(), now - chrono::Duration::minutes(50));
        StateMachine::advance(&mut done, JobInput::DispatchAccepted, now).unwrap();
        StateMachine::advance(
            &mut done,
            JobInput::Completed {
                transcript_text: "x".into(),
                segments: vec![],
            },
            now,
        )
        .unwrap();
        for job in [&old, &fresh, &done] {
            ledger.create_job(job.clone(), vec![]).await.unwrap();
        }

        let stale = ledger.stale_jobs(now - chrono::Duration::minutes(30)).await;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);
    }

    #[tokio::test]
    async fn journal_replays_jobs_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let job = Job::new(new_job());
        {
            let ledger = Ledger::open(&path).await.unwrap();
            ledger.create_job(job.clone(), vec![created(&job)]).await.unwrap();
            ledger.append_event(created(&job)).await.unwrap();
        }

        let ledger = Ledger::open(&path).await.unwrap();
        assert_eq!(ledger.get_job(&job.id).await, Some(job.clone()));
        let events = ledger.query_by_aggregate(&job.id).await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event_type == EventType::JobCreated));
        assert_eq!(ledger.query_by_correlation("corr-1").await.len(), 2);

        let next = ledger.append_event(created(&job)).await.unwrap();
        assert_eq!(next.sequence_number, 3);
    }

    #[tokio::test]
    async fn replay_skips_units_that_reuse_sequence_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let job = Job::new(new_job());
        let ledger = Ledger::open(&path).await.unwrap();
        ledger.create_job(job.clone(), vec![created(&job)]).await.unwrap();

        // A unit that reached disk while memory never saw it.
        let (failed, event) = advanced(
            &job,
            JobInput::Failed {
                reason: FailureReason::Stale,
                message: "lost".into(),
            },
        );
        let (mut side, _) = Journal::open(&path).await.unwrap();
        side.append(Some(&failed), &[event.into_domain(2)]).await.unwrap();
        drop(side);

        // Memory still hands out sequence 2 to the next commit.
        let (processing, event) = advanced(&job, JobInput::DispatchAccepted);
        let events = ledger
            .compare_and_set(JobStatus::Pending, processing, vec![event])
            .await
            .unwrap();
        assert_eq!(events[0].sequence_number, 2);
        drop(ledger);

        let ledger = Ledger::open(&path).await.unwrap();
        assert_job_matches_events(&ledger, &job.id).await;
        assert_eq!(ledger.get_job(&job.id).await.unwrap().status, JobStatus::Failed);
        let seqs: Vec<u64> = ledger
            .query_by_aggregate(&job.id)
            .await
            .iter()
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn failed_commit_leaves_memory_and_replay_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let job = Job::new(new_job());
        let ledger = Ledger::open(&path).await.unwrap();
        ledger.create_job(job.clone(), vec![created(&job)]).await.unwrap();

        if let Some(journal) = ledger.state.lock().await.journal.as_mut() {
            journal.break_writes().await;
        }
        let (processing, event) = advanced(&job, JobInput::DispatchAccepted);
        let err = ledger
            .compare_and_set(JobStatus::Pending, processing.clone(), vec![event.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Resource(_)));
        assert!(ledger.append_event(created(&job)).await.is_err());

        assert_eq!(ledger.get_job(&job.id).await.unwrap().status, JobStatus::Pending);
        assert_eq!(ledger.next_sequence(&job.id).await, 2);
        assert_job_matches_events(&ledger, &job.id).await;
        drop(ledger);

        let ledger = Ledger::open(&path).await.unwrap();
        assert_eq!(ledger.get_job(&job.id).await, Some(job.clone()));
        assert_eq!(ledger.query_by_aggregate(&job.id).await.len(), 1);
        let events = ledger
            .compare_and_set(JobStatus::Pending, processing, vec![event])
            .await
            .unwrap();
        assert_eq!(events[0].sequence_number, 2);
        assert_job_matches_events(&ledger, &job.id).await;
    }

    #[tokio::test]
    async fn unwritable_journal_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let err = Ledger::open(dir.path()).await.err().unwrap();
        assert!(matches!(err, OrchestratorError::Resource(_)));
    }
}
