use std::collections::HashMap;

use super::event::{DomainEvent, NewEvent};
use crate::error::ConflictKind;

/// Append-only, per-aggregate ordered event log.
///
/// Not synchronized on its own; [`Ledger`](crate::store::Ledger) serializes
/// writers and commits events together with the job they describe.
#[derive(Debug, Default)]
pub struct EventStore {
    events: Vec<DomainEvent>,
    by_aggregate: HashMap<String, Vec<usize>>,
    by_correlation: HashMap<String, Vec<usize>>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The sequence number the next event of `aggregate_id` will get.
    pub fn next_sequence(&self, aggregate_id: &str) -> u64 {
        self.by_aggregate
            .get(aggregate_id)
            .map_or(1, |idx| idx.len() as u64 + 1)
    }

    /// Assign sequence numbers to a batch without storing it. Several events for
    /// the same aggregate are numbered consecutively in batch order.
    pub fn sequence(&self, batch: Vec<NewEvent>) -> Vec<DomainEvent> {
        let mut pending: HashMap<String, u64> = HashMap::new();
        batch
            .into_iter()
            .map(|event| {
                let next = pending
                    .entry(event.aggregate_id().to_string())
                    .or_insert_with(|| self.next_sequence(event.aggregate_id()));
                let seq = *next;
                *next += 1;
                event.into_domain(seq)
            })
            .collect()
    }

    /// Fails unless `sequence_number` is exactly the next one for `aggregate_id`.
    pub fn check_next(&self, aggregate_id: &str, sequence_number: u64) -> Result<(), ConflictKind> {
        let expected = self.next_sequence(aggregate_id);
        if sequence_number != expected {
            return Err(ConflictKind::SequenceTaken {
                aggregate_id: aggregate_id.to_string(),
                attempted: sequence_number,
                expected,
            });
        }
        Ok(())
    }

    /// Whether `batch`, inserted in order, would continue every aggregate's
    /// sequence without a gap or reuse. Nothing is stored.
    pub fn check_continues(&self, batch: &[DomainEvent]) -> Result<(), ConflictKind> {
        let mut pending: HashMap<&str, u64> = HashMap::new();
        for event in batch {
            let next = pending
                .entry(event.aggregate_id.as_str())
                .or_insert_with(|| self.next_sequence(&event.aggregate_id));
            if event.sequence_number != *next {
                return Err(ConflictKind::SequenceTaken {
                    aggregate_id: event.aggregate_id.clone(),
                    attempted: event.sequence_number,
                    expected: *next,
                });
            }
            *next += 1;
        }
        Ok(())
    }

    /// Store an already sequenced event. Fails unless its number is exactly the
    /// next one for its aggregate.
    pub fn insert(&mut self, event: DomainEvent) -> Result<(), ConflictKind> {
        self.check_next(&event.aggregate_id, event.sequence_number)?;
        self.push(event);
        Ok(())
    }

    fn push(&mut self, event: DomainEvent) {
        let idx = self.events.len();
        self.by_aggregate
            .entry(event.aggregate_id.clone())
            .or_default()
            .push(idx);
        self.by_correlation
            .entry(event.correlation_id.clone())
            .or_default()
            .push(idx);
        self.events.push(event);
    }

    /// Events of one aggregate by ascending sequence number.
    pub fn query_by_aggregate(&self, aggregate_id: &str) -> Vec<DomainEvent> {
        self.query_after(aggregate_id, 0)
    }

    /// Events of one aggregate with a sequence number greater than `after`.
    pub fn query_after(&self, aggregate_id: &str, after: u64) -> Vec<DomainEvent> {
        let mut out: Vec<DomainEvent> = self
            .by_aggregate
            .get(aggregate_id)
            .into_iter()
            .flatten()
            .map(|&i| &self.events[i])
            .filter(|e| e.sequence_number > after)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.sequence_number);
        out
    }

    /// All events of one request trace by `occurred_at`, ties in append order.
    pub fn query_by_correlation(&self, correlation_id: &str) -> Vec<DomainEvent> {
        let mut out: Vec<DomainEvent> = self
            .by_correlation
            .get(correlation_id)
            .into_iter()
            .flatten()
            .map(|&i| self.events[i].clone())
            .collect();
        out.sort_by_key(|e| e.occurred_at);
        out
    }

    /// The `limit` most recent events, newest first.
    pub fn query_recent(&self, limit: usize) -> Vec<DomainEvent> {
        let mut out: Vec<DomainEvent> = self.events.iter().rev().cloned().collect();
        out.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        out.truncate(limit);
        out
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::events::{EventType, RequestContext};
    use crate::state_machine::job::tests::new_job;
    use crate::state_machine::Job;

    fn created(job: &Job) -> NewEvent {
        NewEvent::job_created(job, &RequestContext::system()).unwrap()
    }

    fn append(store: &mut EventStore, event: NewEvent) -> DomainEvent {
        let event = store.sequence(vec![event]).remove(0);
        store.insert(event.clone()).unwrap();
        event
    }

    #[test]
    fn sequence_numbers_start_at_one_per_aggregate() {
        let mut store = EventStore::new();
        let a = Job::new(new_job());
        let b = Job::new(new_job());

        assert_eq!(append(&mut store, created(&a)).sequence_number, 1);
        assert_eq!(append(&mut store, created(&b)).sequence_number, 1);
        assert_eq!(append(&mut store, created(&a)).sequence_number, 2);
        assert_eq!(store.next_sequence(&a.id), 3);
        assert_eq!(store.next_sequence("unknown"), 1);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn insert_rejects_taken_and_gapped_numbers() {
        let mut store = EventStore::new();
        let job = Job::new(new_job());
        append(&mut store, created(&job));

        let taken = store.insert(created(&job).into_domain(1)).unwrap_err();
        assert_eq!(
            taken,
            ConflictKind::SequenceTaken {
                aggregate_id: job.id.clone(),
                attempted: 1,
                expected: 2
            }
        );
        assert!(store.check_next(&job.id, 3).is_err());
        assert!(store.insert(created(&job).into_domain(3)).is_err());
        store.insert(created(&job).into_domain(2)).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn check_continues_validates_a_whole_batch() {
        let mut store = EventStore::new();
        let a = Job::new(new_job());
        let b = Job::new(new_job());
        append(&mut store, created(&a));

        let good = vec![
            created(&a).into_domain(2),
            created(&b).into_domain(1),
            created(&a).into_domain(3),
        ];
        assert!(store.check_continues(&good).is_ok());

        let reused = vec![created(&b).into_domain(1), created(&a).into_domain(1)];
        let err = store.check_continues(&reused).unwrap_err();
        assert!(matches!(err, ConflictKind::SequenceTaken { attempted: 1, expected: 2, .. }));
        let repeated = vec![created(&b).into_domain(1), created(&b).into_domain(1)];
        assert!(store.check_continues(&repeated).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn sequence_batch_numbers_consecutively_without_storing() {
        let store = EventStore::new();
        let a = Job::new(new_job());
        let b = Job::new(new_job());
        let batch = store.sequence(vec![created(&a), created(&b), created(&a)]);
        let seqs: Vec<u64> = batch.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 1, 2]);
        assert!(store.is_empty());
    }

    #[test]
    fn query_after_returns_tail() {
        let mut store = EventStore::new();
        let job = Job::new(new_job());
        for _ in 0..4 {
            append(&mut store, created(&job));
        }
        let tail: Vec<u64> = store
            .query_after(&job.id, 2)
            .iter()
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(tail, vec![3, 4]);
        assert_eq!(store.query_by_aggregate(&job.id).len(), 4);
    }

    #[test]
    fn correlation_spans_aggregates_in_time_order() {
        let mut store = EventStore::new();
        let now = Utc::now();
        let mut late = Job::new_at(new_job(), now + Duration::seconds(5));
        late.correlation_id = "trace".into();
        let mut early = Job::new_at(new_job(), now);
        early.correlation_id = "trace".into();
        let other = Job::new(new_job());

        append(&mut store, created(&late));
        append(&mut store, created(&early));
        append(&mut store, created(&other));

        let trace = store.query_by_correlation("trace");
        let ids: Vec<&str> = trace.iter().map(|e| e.aggregate_id.as_str()).collect();
        assert_eq!(ids, vec![early.id.as_str(), late.id.as_str()]);
    }

    #[test]
    fn recent_is_newest_first_and_limited() {
        let mut store = EventStore::new();
        let now = Utc::now();
        let jobs: Vec<Job> = (0..5)
            .map(|i| Job::new_at(new_job(), now + Duration::seconds(i)))
            .collect();
        for job in &jobs {
            append(&mut store, created(job));
        }
        let recent = store.query_recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].aggregate_id, jobs[4].id);
        assert_eq!(recent[1].aggregate_id, jobs[3].id);
        assert!(recent.iter().all(|e| e.event_type == EventType::JobCreated));
        assert!(store.query_recent(0).is_empty());
    }
}
