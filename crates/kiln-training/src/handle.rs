//! Single-writer ownership of one job's mutable state.
//!
//! Every mutation of a job goes through its `JobHandle`, which serializes
//! writers on one lock and publishes the resulting events through the hub
//! while still holding it, so subscribers observe events in the order the
//! mutations were applied.

use crate::artifacts::Artifact;
use crate::events::{EventHub, JobEvent, JobSubscription};
use crate::job::{ControlAction, ControlOutcome, Job, JobId, JobStatus, RunMetrics};
use crate::logs::{LogEntry, LogLevel};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

/// State machine instance owning one job.
pub struct JobHandle {
    id: JobId,
    created_at: DateTime<Utc>,
    job: RwLock<Job>,
    hub: Arc<EventHub>,
    /// Wakes the training task parked on a paused job.
    resume: Notify,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

impl JobHandle {
    #[must_use]
    pub fn new(job: Job, hub: Arc<EventHub>) -> Self {
        Self {
            id: job.id.clone(),
            created_at: job.created_at,
            job: RwLock::new(job),
            hub,
            resume: Notify::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &JobId {
        &self.id
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn snapshot(&self) -> Job {
        self.job.read().await.clone()
    }

    /// Subscribes to this job's event stream.
    ///
    /// The snapshot is taken and the sink attached under the job lock, so no
    /// event (the terminal one included) can slip between the replayed
    /// snapshot and the live stream.
    pub async fn subscribe(&self) -> JobSubscription {
        let job = self.job.read().await;
        self.hub.subscribe(&job)
    }

    pub async fn status(&self) -> JobStatus {
        self.job.read().await.status
    }

    fn publish_updated(&self, job: &Job) {
        self.hub.publish(&JobEvent::Updated { job_id: job.id.clone(), data: Box::new(job.clone()) });
    }

    fn publish_terminal(&self, job: &Job) {
        self.hub
            .publish(&JobEvent::Terminal { job_id: job.id.clone(), data: Box::new(job.clone()) });
    }

    /// Applies `patch` and moves the job to `new_status`.
    ///
    /// Illegal transitions (including anything out of a terminal state) are
    /// rejected as a logged no-op.
    ///
    /// # Returns
    /// `true` if the transition was applied.
    pub async fn transition(
        &self,
        new_status: JobStatus,
        patch: impl FnOnce(&mut Job),
    ) -> bool {
        let mut job = self.job.write().await;
        if !job.status.can_transition_to(new_status) {
            warn!(
                job_id = %self.id,
                from = %job.status,
                to = %new_status,
                "rejected illegal status transition"
            );
            return false;
        }
        debug!(job_id = %self.id, from = %job.status, to = %new_status, "status transition");
        patch(&mut job);
        job.status = new_status;
        job.updated_at = Utc::now();
        self.publish_updated(&job);
        if new_status.is_terminal() {
            self.publish_terminal(&job);
        }
        true
    }

    /// Applies a patch that does not change the status.
    ///
    /// Terminal jobs are frozen; a patch arriving after the job finished
    /// (e.g. from an epoch in flight during a stop) is discarded.
    pub async fn update(&self, patch: impl FnOnce(&mut Job)) {
        let mut job = self.job.write().await;
        if job.status.is_terminal() {
            debug!(job_id = %self.id, status = %job.status, "ignoring update on terminal job");
            return;
        }
        patch(&mut job);
        job.updated_at = Utc::now();
        self.publish_updated(&job);
    }

    /// Records one finished epoch: the run facet, the named metric values
    /// (replaced wholesale, not merged) and the progress floor.
    pub async fn record_epoch(
        &self,
        run: RunMetrics,
        metrics: serde_json::Map<String, serde_json::Value>,
        progress: u8,
    ) {
        let mut job = self.job.write().await;
        if job.status.is_terminal() {
            debug!(job_id = %self.id, status = %job.status, "ignoring metrics on terminal job");
            return;
        }
        job.run = run;
        job.metrics.clone_from(&metrics);
        // Progress never moves backward while running.
        job.progress = job.progress.max(progress.min(100));
        job.updated_at = Utc::now();
        self.publish_updated(&job);
        self.hub
            .publish(&JobEvent::MetricsUpdated { job_id: self.id.clone(), data: metrics });
    }

    /// Appends to the job's bounded log and publishes the entry.
    pub async fn add_log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) {
        let entry = LogEntry::new(level, message, data);
        let mut job = self.job.write().await;
        if job.status.is_terminal() {
            return;
        }
        job.logs.push(entry.clone());
        job.updated_at = Utc::now();
        self.hub.publish(&JobEvent::Log { job_id: self.id.clone(), data: entry });
    }

    /// Backreferences a freshly registered artifact from the job.
    ///
    /// # Returns
    /// `false` if the job is already terminal and the reference was not
    /// recorded.
    pub async fn attach_artifact(&self, artifact: &Artifact) -> bool {
        let mut job = self.job.write().await;
        if job.status.is_terminal() {
            debug!(job_id = %self.id, status = %job.status, "ignoring artifact on terminal job");
            return false;
        }
        job.artifact_ids.push(artifact.id.clone());
        job.updated_at = Utc::now();
        self.publish_updated(&job);
        self.hub.publish(&JobEvent::ArtifactCreated {
            job_id: self.id.clone(),
            data: artifact.clone(),
        });
        true
    }

    /// Applies an operator control command.
    ///
    /// Actions that do not apply to the current status are reported as a
    /// no-op outcome, never as an error.
    pub async fn control(&self, action: ControlAction) -> ControlOutcome {
        let mut job = self.job.write().await;
        let applied = match (action, job.status) {
            (ControlAction::Pause, JobStatus::Running) => {
                job.status = JobStatus::Paused;
                let entry = LogEntry::new(LogLevel::Info, "Job paused by operator", None);
                job.logs.push(entry.clone());
                job.updated_at = Utc::now();
                self.publish_updated(&job);
                self.hub.publish(&JobEvent::Log { job_id: self.id.clone(), data: entry });
                true
            }
            (ControlAction::Resume, JobStatus::Paused) => {
                job.status = JobStatus::Running;
                let entry = LogEntry::new(LogLevel::Info, "Job resumed by operator", None);
                job.logs.push(entry.clone());
                job.updated_at = Utc::now();
                self.publish_updated(&job);
                self.hub.publish(&JobEvent::Log { job_id: self.id.clone(), data: entry });
                self.resume.notify_waiters();
                true
            }
            (ControlAction::Stop, JobStatus::Running | JobStatus::Paused) => {
                job.status = JobStatus::Stopped;
                job.end_time = Some(Utc::now());
                let entry = LogEntry::new(LogLevel::Warning, "Job stopped by operator", None);
                job.logs.push(entry.clone());
                job.updated_at = Utc::now();
                self.publish_updated(&job);
                self.hub.publish(&JobEvent::Log { job_id: self.id.clone(), data: entry });
                self.publish_terminal(&job);
                self.resume.notify_waiters();
                true
            }
            _ => false,
        };

        if applied {
            info!(job_id = %self.id, action = %action, "control action applied");
            ControlOutcome::Applied { job: job.clone() }
        } else {
            debug!(
                job_id = %self.id,
                action = %action,
                status = %job.status,
                "control action not applicable"
            );
            ControlOutcome::NotApplicable { action, status: job.status }
        }
    }

    /// Parks the caller while the job is paused.
    ///
    /// # Returns
    /// The status observed once the job is no longer paused.
    pub async fn wait_if_paused(&self) -> JobStatus {
        loop {
            let notified = self.resume.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let status = self.job.read().await.status;
            if status != JobStatus::Paused {
                return status;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobConfig;

    fn handle() -> JobHandle {
        let job = Job::new(JobConfig::new("base", vec!["ds".to_string()]));
        JobHandle::new(job, Arc::new(EventHub::new()))
    }

    #[tokio::test]
    async fn test_transition_rejects_terminal_exit() {
        let handle = handle();
        assert!(handle.transition(JobStatus::Running, |_| {}).await);
        assert!(handle.transition(JobStatus::Completed, |job| job.progress = 100).await);

        assert!(!handle.transition(JobStatus::Running, |_| {}).await);
        assert_eq!(handle.status().await, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_subscribe_after_terminal_replays_and_closes() {
        let handle = handle();
        handle.transition(JobStatus::Running, |_| {}).await;
        handle.transition(JobStatus::Completed, |job| job.progress = 100).await;

        // Joining through the handle always sees the current state; a
        // finished job yields its snapshot, the terminal event, then closes.
        let mut subscription = handle.subscribe().await;
        match subscription.recv().await {
            Some(JobEvent::State { data, .. }) => assert_eq!(data.status, JobStatus::Completed),
            other => panic!("expected snapshot, got {other:?}"),
        }
        assert!(matches!(subscription.recv().await, Some(JobEvent::Terminal { .. })));
        assert!(subscription.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_control_pause_resume_stop() {
        let handle = handle();
        handle.transition(JobStatus::Running, |_| {}).await;

        assert!(handle.control(ControlAction::Pause).await.is_applied());
        assert_eq!(handle.status().await, JobStatus::Paused);

        assert!(handle.control(ControlAction::Resume).await.is_applied());
        assert_eq!(handle.status().await, JobStatus::Running);

        assert!(handle.control(ControlAction::Stop).await.is_applied());
        assert_eq!(handle.status().await, JobStatus::Stopped);
        let job = handle.snapshot().await;
        assert!(job.end_time.is_some());
    }

    #[tokio::test]
    async fn test_control_not_applicable_is_noop() {
        let handle = handle();

        // Nothing applies to a job that has not started.
        for action in [ControlAction::Pause, ControlAction::Resume, ControlAction::Stop] {
            let outcome = handle.control(action).await;
            assert!(!outcome.is_applied(), "{action} should not apply to created");
        }

        handle.transition(JobStatus::Running, |_| {}).await;
        let outcome = handle.control(ControlAction::Resume).await;
        assert!(matches!(
            outcome,
            ControlOutcome::NotApplicable { status: JobStatus::Running, .. }
        ));
    }

    #[tokio::test]
    async fn test_wait_if_paused_returns_on_resume() {
        let handle = Arc::new(handle());
        handle.transition(JobStatus::Running, |_| {}).await;
        handle.control(ControlAction::Pause).await;

        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.wait_if_paused().await })
        };
        tokio::task::yield_now().await;
        handle.control(ControlAction::Resume).await;

        let status = waiter.await.expect("waiter task");
        assert_eq!(status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_record_epoch_replaces_metrics_wholesale() {
        let handle = handle();
        handle.transition(JobStatus::Running, |_| {}).await;

        let mut first = serde_json::Map::new();
        first.insert("epoch".to_string(), 1.into());
        first.insert("valLoss".to_string(), serde_json::json!(0.9));
        handle.record_epoch(RunMetrics { epoch: 1, ..RunMetrics::default() }, first, 40).await;

        let mut second = serde_json::Map::new();
        second.insert("epoch".to_string(), 2.into());
        handle.record_epoch(RunMetrics { epoch: 2, ..RunMetrics::default() }, second, 45).await;

        let job = handle.snapshot().await;
        assert_eq!(job.metrics.len(), 1);
        assert!(!job.metrics.contains_key("valLoss"));
        assert_eq!(job.progress, 45);
        assert_eq!(job.run.epoch, 2);
    }

    #[tokio::test]
    async fn test_progress_never_decreases() {
        let handle = handle();
        handle.transition(JobStatus::Running, |_| {}).await;
        handle.record_epoch(RunMetrics::default(), serde_json::Map::new(), 50).await;
        handle.record_epoch(RunMetrics::default(), serde_json::Map::new(), 30).await;
        assert_eq!(handle.snapshot().await.progress, 50);
    }
}
