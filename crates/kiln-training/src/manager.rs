//! Front door for the training-job lifecycle core.
//!
//! A `JobManager` is an explicitly constructed, explicitly owned instance;
//! the host wires it to its transport (HTTP, CLI, ...) and to a real or
//! simulated [`Trainer`].

use crate::artifacts::{Artifact, ArtifactId};
use crate::config::JobConfig;
use crate::error::{TrainingError, TrainingResult};
use crate::events::{EventHub, JobSubscription};
use crate::handle::JobHandle;
use crate::job::{ControlAction, ControlOutcome, Job, JobId, JobStatus};
use crate::logs::{LogEntry, LogLevel};
use crate::registry::{RunRegistry, DEFAULT_MAX_RETAINED_JOBS};
use crate::task::{StagePlan, TrainingTask};
use crate::trainer::{SimulatedTrainer, Trainer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Aggregate lifecycle counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleStats {
    pub total: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
    pub total_artifacts: usize,
    pub live_subscriptions: usize,
}

/// Owns the registry, the event hub and the trainer; creates jobs and
/// spawns one [`TrainingTask`] per job.
pub struct JobManager {
    registry: Arc<RunRegistry>,
    hub: Arc<EventHub>,
    trainer: Arc<dyn Trainer>,
    plan: StagePlan,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager").field("trainer", &self.trainer.id()).finish_non_exhaustive()
    }
}

impl JobManager {
    #[must_use]
    pub fn new(trainer: Arc<dyn Trainer>) -> Self {
        Self::with_max_retained(trainer, DEFAULT_MAX_RETAINED_JOBS)
    }

    #[must_use]
    pub fn with_max_retained(trainer: Arc<dyn Trainer>, max_retained: usize) -> Self {
        Self {
            registry: Arc::new(RunRegistry::new(max_retained)),
            hub: Arc::new(EventHub::new()),
            trainer,
            plan: StagePlan::default(),
        }
    }

    /// Replaces the stage plan used for new jobs.
    #[must_use]
    pub fn with_stage_plan(mut self, plan: StagePlan) -> Self {
        self.plan = plan;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Validates the config, registers a new job and spawns its task.
    ///
    /// # Errors
    /// `TrainingError::Validation` when required config fields are missing;
    /// the job is never created in that case.
    pub async fn create_job(&self, config: JobConfig) -> TrainingResult<Job> {
        config.validate()?;
        let job = Job::new(config);
        info!(job_id = %job.id, model_ref = %job.config.model_ref, "creating training job");

        let handle = Arc::new(JobHandle::new(job.clone(), Arc::clone(&self.hub)));
        self.registry.insert(Arc::clone(&handle)).await;
        TrainingTask::new(
            handle,
            Arc::clone(&self.registry),
            Arc::clone(&self.trainer),
            self.plan.clone(),
        )
        .spawn();
        Ok(job)
    }

    async fn handle(&self, id: &JobId) -> TrainingResult<Arc<JobHandle>> {
        self.registry.get(id).await.ok_or_else(|| TrainingError::JobNotFound(id.to_string()))
    }

    pub async fn get_job(&self, id: &JobId) -> TrainingResult<Job> {
        Ok(self.handle(id).await?.snapshot().await)
    }

    /// Lists jobs newest-first, optionally filtered by status and limited.
    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: Option<usize>) -> Vec<Job> {
        self.registry.list(status, limit).await
    }

    /// Delivers a control command to a job's state machine.
    pub async fn control_job(
        &self,
        id: &JobId,
        action: ControlAction,
    ) -> TrainingResult<ControlOutcome> {
        Ok(self.handle(id).await?.control(action).await)
    }

    /// Attaches a subscriber to a job's event stream.
    ///
    /// The current snapshot is delivered first; the stream closes after the
    /// job's terminal event.
    pub async fn subscribe(&self, id: &JobId) -> TrainingResult<JobSubscription> {
        Ok(self.handle(id).await?.subscribe().await)
    }

    /// Returns up to `limit` most recent log entries for a job.
    pub async fn job_logs(
        &self,
        id: &JobId,
        level: Option<LogLevel>,
        limit: usize,
    ) -> TrainingResult<Vec<LogEntry>> {
        let snapshot = self.handle(id).await?.snapshot().await;
        Ok(snapshot.logs.tail(level, limit))
    }

    /// Returns a job's artifact records in creation order.
    pub async fn job_artifacts(&self, id: &JobId) -> TrainingResult<Vec<Artifact>> {
        let snapshot = self.handle(id).await?.snapshot().await;
        Ok(self.registry.artifacts_for(&snapshot.artifact_ids).await)
    }

    pub async fn artifact(&self, id: &ArtifactId) -> TrainingResult<Artifact> {
        self.registry
            .artifact(id)
            .await
            .ok_or_else(|| TrainingError::ArtifactNotFound(id.to_string()))
    }

    pub async fn stats(&self) -> LifecycleStats {
        let jobs = self.registry.list(None, None).await;
        let mut stats = LifecycleStats {
            total: jobs.len(),
            total_artifacts: self.registry.artifact_count().await,
            live_subscriptions: self.hub.active_subscriptions(),
            ..LifecycleStats::default()
        };
        for job in jobs {
            match job.status {
                JobStatus::Running => stats.running += 1,
                JobStatus::Paused => stats.paused += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Stopped => stats.stopped += 1,
                JobStatus::Created => {}
            }
        }
        stats
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new(Arc::new(SimulatedTrainer::default()))
    }
}
