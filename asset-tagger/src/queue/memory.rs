//! In-process queue backend.
//!
//! Mirrors the Redis layout: a main list (push head, pop tail), a processing
//! list with a lease-expiry index, a delayed index keyed by ready-at, a
//! dead-letter list and a dedup set, all behind one mutex so every transition
//! is atomic. A reaper moves expired leases and ready delays back to the main
//! list once per second, at most [`REAP_BATCH`] per index per tick.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{
    EnqueueOutcome, JobQueue, LeaseControl, LeasedTask, QueueMetrics, TaskLease, file_in_progress,
    lease_token,
};
use crate::Result;
use crate::database::models::JobStatus;
use crate::database::repositories::FileRepository;
use crate::database::time::{duration_ms, ms_after, ms_before, now_ms};

pub const REAP_INTERVAL: Duration = Duration::from_secs(1);
pub const REAP_BATCH: usize = 100;

#[derive(Debug, Clone)]
struct MemJob {
    job_id: String,
    status: JobStatus,
    tries: i64,
    lease_by: Option<String>,
    last_error: Option<String>,
    updated_at: i64,
}

#[derive(Default)]
struct QueueState {
    main: VecDeque<String>,
    processing: VecDeque<String>,
    processing_z: HashMap<String, i64>,
    delayed_z: HashMap<String, i64>,
    dlq: VecDeque<String>,
    dedup: HashSet<String>,
    jobs: HashMap<String, MemJob>,
}

impl QueueState {
    fn remove_from(list: &mut VecDeque<String>, file_id: &str) {
        list.retain(|id| id != file_id);
    }

    fn push_main(&mut self, file_id: &str, priority: i64) {
        if priority > 0 {
            self.main.push_back(file_id.to_string());
        } else {
            self.main.push_front(file_id.to_string());
        }
        self.dedup.insert(file_id.to_string());
    }

    fn enqueue(&mut self, file_id: &str, priority: i64, now: i64) -> EnqueueOutcome {
        let Some(job) = self.jobs.get(file_id).cloned() else {
            self.jobs.insert(
                file_id.to_string(),
                MemJob {
                    job_id: uuid::Uuid::new_v4().to_string(),
                    status: JobStatus::Queued,
                    tries: 0,
                    lease_by: None,
                    last_error: None,
                    updated_at: now,
                },
            );
            self.push_main(file_id, priority);
            return EnqueueOutcome::Inserted;
        };

        if job.status.blocks_enqueue() {
            return EnqueueOutcome::AlreadySettled;
        }
        if job.status == JobStatus::Processing
            && self.processing_z.get(file_id).is_some_and(|l| *l > now)
        {
            return EnqueueOutcome::LeaseActive;
        }
        if job.status == JobStatus::Queued && self.main.iter().any(|id| id == file_id) {
            if priority > 0 {
                Self::remove_from(&mut self.main, file_id);
                self.push_main(file_id, priority);
            }
            return EnqueueOutcome::AlreadyQueued;
        }
        // Backing off after a nack; the delay stands.
        if job.status == JobStatus::Queued && self.delayed_z.contains_key(file_id) {
            return EnqueueOutcome::AlreadyQueued;
        }

        self.processing_z.remove(file_id);
        self.delayed_z.remove(file_id);
        Self::remove_from(&mut self.processing, file_id);
        Self::remove_from(&mut self.dlq, file_id);
        if let Some(job) = self.jobs.get_mut(file_id) {
            job.status = JobStatus::Queued;
            job.lease_by = None;
            job.updated_at = now;
        }
        self.push_main(file_id, priority);
        EnqueueOutcome::Requeued
    }

    fn fetch(&mut self, token: &str, lease_until: i64, now: i64) -> Option<TaskLease> {
        let file_id = self.main.pop_back()?;
        self.processing.push_front(file_id.clone());
        self.processing_z.insert(file_id.clone(), lease_until);

        let job = self.jobs.get_mut(&file_id)?;
        job.status = JobStatus::Processing;
        job.lease_by = Some(token.to_string());
        job.updated_at = now;

        Some(TaskLease {
            job_id: job.job_id.clone(),
            file_id,
            token: token.to_string(),
        })
    }

    fn holds_lease(&self, lease: &TaskLease) -> bool {
        self.jobs.get(&lease.file_id).is_some_and(|job| {
            job.status == JobStatus::Processing
                && job.job_id == lease.job_id
                && job.lease_by.as_deref() == Some(lease.token.as_str())
        })
    }

    fn renew(&mut self, lease: &TaskLease, lease_until: i64) -> bool {
        if !self.holds_lease(lease) {
            return false;
        }
        self.processing_z.insert(lease.file_id.clone(), lease_until);
        true
    }

    fn leave_processing(&mut self, file_id: &str) {
        Self::remove_from(&mut self.processing, file_id);
        self.processing_z.remove(file_id);
    }

    fn ack(&mut self, lease: &TaskLease, now: i64) -> bool {
        if !self.holds_lease(lease) {
            return false;
        }
        self.leave_processing(&lease.file_id);
        self.dedup.remove(&lease.file_id);
        if let Some(job) = self.jobs.get_mut(&lease.file_id) {
            job.status = JobStatus::Done;
            job.lease_by = None;
            job.last_error = None;
            job.updated_at = now;
        }
        true
    }

    fn nack(&mut self, lease: &TaskLease, ready_at: i64, to_dlq: bool, reason: &str, now: i64) -> bool {
        if !self.holds_lease(lease) {
            return false;
        }
        self.leave_processing(&lease.file_id);
        if to_dlq {
            self.dedup.remove(&lease.file_id);
            self.dlq.push_front(lease.file_id.clone());
        } else if ready_at <= now {
            self.main.push_front(lease.file_id.clone());
        } else {
            self.delayed_z.insert(lease.file_id.clone(), ready_at);
        }
        if let Some(job) = self.jobs.get_mut(&lease.file_id) {
            job.status = if to_dlq {
                JobStatus::Failed
            } else {
                JobStatus::Queued
            };
            job.tries += 1;
            job.lease_by = None;
            job.last_error = Some(reason.to_string());
            job.updated_at = now;
        }
        true
    }

    /// Oldest-first keys of `index` with a score satisfying `due`, at most `limit`.
    fn due(index: &HashMap<String, i64>, limit: usize, due: impl Fn(i64) -> bool) -> Vec<String> {
        let mut entries: Vec<(&String, &i64)> = index.iter().filter(|(_, s)| due(**s)).collect();
        entries.sort_by_key(|(_, s)| **s);
        entries
            .into_iter()
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn reap(&mut self, now: i64, limit: usize) -> usize {
        let expired = Self::due(&self.processing_z, limit, |lease| lease < now);
        for file_id in &expired {
            self.leave_processing(file_id);
            if let Some(job) = self.jobs.get_mut(file_id) {
                job.status = JobStatus::Queued;
                job.lease_by = None;
                job.updated_at = now;
            }
            self.main.push_front(file_id.clone());
        }

        let ready = Self::due(&self.delayed_z, limit, |ready_at| ready_at <= now);
        for file_id in &ready {
            self.delayed_z.remove(file_id);
            self.main.push_front(file_id.clone());
        }

        expired.len() + ready.len()
    }

    fn remove_terminal(&mut self, keep: impl Fn(&String, &MemJob) -> bool) -> u64 {
        let doomed: Vec<String> = self
            .jobs
            .iter()
            .filter(|(id, job)| job.status.is_terminal() && !keep(id, job))
            .map(|(id, _)| id.clone())
            .collect();
        for file_id in &doomed {
            self.jobs.remove(file_id);
            Self::remove_from(&mut self.dlq, file_id);
        }
        doomed.len() as u64
    }

    fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            queued: self.main.len() as i64,
            in_flight: self.processing.len() as i64,
            delayed: self.delayed_z.len() as i64,
            dlq: self.dlq.len() as i64,
        }
    }
}

/// Queue held entirely in process memory.
pub struct MemoryJobQueue {
    state: Arc<Mutex<QueueState>>,
    files: Arc<dyn FileRepository>,
    control: Arc<MemoryLeaseControl>,
    worker_id: String,
    cancel: CancellationToken,
}

impl MemoryJobQueue {
    /// Create the queue and spawn its reaper on the current runtime.
    pub fn start(files: Arc<dyn FileRepository>, worker_id: impl Into<String>) -> Arc<Self> {
        Self::start_with_interval(files, worker_id, REAP_INTERVAL)
    }

    pub fn start_with_interval(
        files: Arc<dyn FileRepository>,
        worker_id: impl Into<String>,
        reap_interval: Duration,
    ) -> Arc<Self> {
        let state = Arc::new(Mutex::new(QueueState::default()));
        let cancel = CancellationToken::new();

        let reaper_state = state.clone();
        let reaper_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reap_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = reaper_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let moved = reaper_state.lock().reap(now_ms(), REAP_BATCH);
                        if moved > 0 {
                            tracing::debug!(moved, "Reaper returned jobs to the main queue");
                        }
                    }
                }
            }
            tracing::debug!("Memory queue reaper stopped");
        });

        Arc::new(Self {
            control: Arc::new(MemoryLeaseControl {
                state: state.clone(),
            }),
            state,
            files,
            worker_id: worker_id.into(),
            cancel,
        })
    }

    /// Run one reaper pass immediately; returns how many jobs moved.
    pub fn reap_now(&self) -> usize {
        self.state.lock().reap(now_ms(), REAP_BATCH)
    }
}

impl Drop for MemoryJobQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue_unique(&self, file_id: &str, priority: i64) -> Result<EnqueueOutcome> {
        if file_in_progress(self.files.as_ref(), file_id).await? {
            return Ok(EnqueueOutcome::FileInProgress);
        }

        let outcome = self.state.lock().enqueue(file_id, priority, now_ms());
        if outcome.is_enqueued() || outcome == EnqueueOutcome::AlreadyQueued {
            self.files.mark_pending(file_id).await?;
        }
        tracing::debug!(file_id, ?outcome, "Enqueue");
        Ok(outcome)
    }

    async fn fetch(&self, lease: Duration) -> Result<Option<LeasedTask>> {
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        let token = lease_token(&self.worker_id);
        let leased = self.state.lock().fetch(&token, ms_after(lease), now_ms());
        Ok(leased.map(|lease| LeasedTask::new(lease, self.control.clone())))
    }

    async fn metrics(&self) -> Result<QueueMetrics> {
        Ok(self.state.lock().metrics())
    }

    async fn purge_terminal(&self, file_ids: &[String]) -> Result<u64> {
        let targets: HashSet<&String> = file_ids.iter().collect();
        Ok(self
            .state
            .lock()
            .remove_terminal(|id, _| !targets.contains(id)))
    }

    async fn cleanup_terminal(&self, older_than: Duration) -> Result<u64> {
        let cutoff = ms_before(older_than);
        Ok(self
            .state
            .lock()
            .remove_terminal(|_, job| job.updated_at >= cutoff))
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}

struct MemoryLeaseControl {
    state: Arc<Mutex<QueueState>>,
}

#[async_trait]
impl LeaseControl for MemoryLeaseControl {
    async fn ack(&self, lease: &TaskLease) -> Result<()> {
        if !self.state.lock().ack(lease, now_ms()) {
            tracing::debug!(file_id = %lease.file_id, "Ack ignored: lease no longer held");
        }
        Ok(())
    }

    async fn nack(
        &self,
        lease: &TaskLease,
        delay: Duration,
        to_dlq: bool,
        reason: &str,
    ) -> Result<()> {
        let now = now_ms();
        let ready_at = now.saturating_add(duration_ms(delay));
        if !self.state.lock().nack(lease, ready_at, to_dlq, reason, now) {
            tracing::debug!(file_id = %lease.file_id, "Nack ignored: lease no longer held");
        }
        Ok(())
    }

    async fn renew(&self, lease: &TaskLease, extend: Duration) -> Result<bool> {
        Ok(self.state.lock().renew(lease, ms_after(extend)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease_of(state: &mut QueueState, token: &str, lease_ms: i64, now: i64) -> TaskLease {
        state.fetch(token, now + lease_ms, now).unwrap()
    }

    #[test]
    fn test_fifo_with_priority_jump() {
        let mut state = QueueState::default();
        state.enqueue("a", 0, 0);
        state.enqueue("b", 0, 0);
        state.enqueue("urgent", 5, 0);

        let order: Vec<String> = (0..3)
            .map(|_| lease_of(&mut state, "t", 1000, 0).file_id)
            .collect();
        assert_eq!(order, vec!["urgent", "a", "b"]);
        assert!(state.fetch("t", 1000, 0).is_none());
    }

    #[test]
    fn test_enqueue_rules() {
        let mut state = QueueState::default();
        assert_eq!(state.enqueue("a", 0, 0), EnqueueOutcome::Inserted);
        assert_eq!(state.enqueue("a", 0, 0), EnqueueOutcome::AlreadyQueued);
        assert_eq!(state.main.len(), 1);

        let lease = lease_of(&mut state, "t", 1000, 0);
        assert_eq!(state.enqueue("a", 0, 10), EnqueueOutcome::LeaseActive);
        // Expired lease: enqueue reclaims the job.
        assert_eq!(state.enqueue("a", 0, 2000), EnqueueOutcome::Requeued);
        assert!(!state.ack(&lease, 2000));

        let lease = lease_of(&mut state, "t2", 1000, 2000);
        assert!(state.ack(&lease, 2100));
        assert_eq!(state.enqueue("a", 0, 2200), EnqueueOutcome::AlreadySettled);
    }

    #[test]
    fn test_nack_delay_and_reap() {
        let mut state = QueueState::default();
        state.enqueue("a", 0, 0);
        let lease = lease_of(&mut state, "t", 1000, 0);
        assert!(state.nack(&lease, 500, false, "later", 0));
        assert_eq!(state.metrics().delayed, 1);
        assert!(state.fetch("t", 1000, 100).is_none());

        assert_eq!(state.reap(400, REAP_BATCH), 0);
        assert_eq!(state.reap(500, REAP_BATCH), 1);
        let again = lease_of(&mut state, "t", 1000, 600);
        assert_eq!(again.file_id, "a");
        assert_eq!(state.jobs["a"].tries, 1);
    }

    #[test]
    fn test_enqueue_keeps_backoff_delay() {
        let mut state = QueueState::default();
        state.enqueue("a", 0, 0);
        let lease = lease_of(&mut state, "t", 1000, 0);
        assert!(state.nack(&lease, 5000, false, "later", 0));

        assert_eq!(state.enqueue("a", 0, 100), EnqueueOutcome::AlreadyQueued);
        assert_eq!(state.enqueue("a", 5, 100), EnqueueOutcome::AlreadyQueued);
        assert_eq!(state.metrics().delayed, 1);
        assert_eq!(state.metrics().queued, 0);
        assert!(state.fetch("t", 1000, 200).is_none());
    }

    #[test]
    fn test_renew_extends_lease_until_reclaimed() {
        let mut state = QueueState::default();
        state.enqueue("a", 0, 0);
        let lease = lease_of(&mut state, "t", 100, 0);

        assert!(state.renew(&lease, 1000));
        assert_eq!(state.reap(500, REAP_BATCH), 0);

        assert_eq!(state.reap(1500, REAP_BATCH), 1);
        assert!(!state.renew(&lease, 3000));
        let fresh = lease_of(&mut state, "t2", 1000, 1600);
        assert!(state.renew(&fresh, 3000));
        assert!(!state.renew(&lease, 3000));
    }

    #[test]
    fn test_reaper_recovers_expired_leases_in_bounded_batches() {
        let mut state = QueueState::default();
        for i in 0..150 {
            state.enqueue(&format!("f{i}"), 0, 0);
        }
        for _ in 0..150 {
            lease_of(&mut state, "t", 10, 0);
        }
        assert_eq!(state.metrics().in_flight, 150);

        assert_eq!(state.reap(100, REAP_BATCH), 100);
        assert_eq!(state.reap(100, REAP_BATCH), 50);
        assert_eq!(state.reap(100, REAP_BATCH), 0);
        assert_eq!(state.metrics().queued, 150);
        assert_eq!(state.metrics().in_flight, 0);
    }

    #[test]
    fn test_dead_letter_and_purge() {
        let mut state = QueueState::default();
        state.enqueue("a", 0, 0);
        let lease = lease_of(&mut state, "t", 1000, 0);
        assert!(state.nack(&lease, 0, true, "fatal", 0));
        assert_eq!(state.metrics().dlq, 1);
        assert!(!state.dedup.contains("a"));

        assert_eq!(state.remove_terminal(|_, _| false), 1);
        assert_eq!(state.metrics().dlq, 0);
        assert_eq!(state.enqueue("a", 0, 10), EnqueueOutcome::Inserted);
    }
}
