use crate::config::JobConfig;
use crate::logs::BoundedLog;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for a training job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl JobStatus {
    /// Returns `true` once no further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }

    /// Checks whether the job may move to `to` from this status.
    ///
    /// Transitions are monotonic: a job never moves backward, and terminal
    /// states accept nothing.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (Self::Created, Self::Running) => true,
            (Self::Running, Self::Paused | Self::Stopped | Self::Completed | Self::Failed) => true,
            (Self::Paused, Self::Running | Self::Stopped) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Operator control command for a live job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Resume,
    Stop,
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        };
        f.write_str(s)
    }
}

/// Result of a control command.
///
/// Control actions that do not apply to the job's current status are reported
/// back as a no-op, never as an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ControlOutcome {
    Applied { job: Job },
    NotApplicable { action: ControlAction, status: JobStatus },
}

impl ControlOutcome {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Metric/checkpoint-tracking facet of a job, updated once per epoch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Epochs finished so far (monotonic within a run).
    pub epoch: u32,
    pub train_loss: Option<f64>,
    pub val_loss: Option<f64>,
    pub learning_rate: Option<f64>,
    /// Training throughput in steps per second.
    pub throughput: Option<f64>,
    /// Lowest validation loss observed so far.
    pub best_val_loss: Option<f64>,
    /// Checkpoint reference for the best validation loss so far.
    pub best_checkpoint: Option<String>,
    /// Checkpoint reference for the most recent epoch.
    pub last_checkpoint: Option<String>,
    /// Consecutive epochs without a new best.
    pub patience: u32,
}

/// One managed unit of asynchronous training work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    /// Creation config, echoed back unmodified.
    pub config: JobConfig,
    /// Completion percentage, 0-100. Non-decreasing while running.
    pub progress: u8,
    /// Free-form label for the current pipeline stage.
    pub stage: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Latest named metric values; replaced wholesale on each update.
    pub metrics: serde_json::Map<String, serde_json::Value>,
    /// Checkpoint/early-stopping bookkeeping for this run.
    pub run: RunMetrics,
    /// Human-readable failure message, set only when status is `failed`.
    pub error: Option<String>,
    /// Artifacts produced by this job, in creation order.
    pub artifact_ids: Vec<crate::artifacts::ArtifactId>,
    pub logs: BoundedLog,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Allocates a new job in the `created` status.
    #[must_use]
    pub fn new(config: JobConfig) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            status: JobStatus::Created,
            config,
            progress: 0,
            stage: "created".to_string(),
            start_time: None,
            end_time: None,
            metrics: serde_json::Map::new(),
            run: RunMetrics::default(),
            error: None,
            artifact_ids: Vec::new(),
            logs: BoundedLog::default(),
            created_at: now,
            updated_at: now,
        }
    }
}
