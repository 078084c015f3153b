//! Kiln Training
//!
//! Lifecycle core for long-running, asynchronous training jobs:
//! - Job state machine with pause/resume/stop controls (`JobHandle`)
//! - Per-job event fan-out with snapshot replay on join (`EventHub`)
//! - Bounded per-job logs and immutable artifact records
//! - Best-checkpoint tracking and early stopping (`CheckpointSelector`)
//! - Capacity-capped job registry (`RunRegistry`)
//! - The async task driving one job through its stages (`TrainingTask`)
//!
//! Transport, persistence and the numeric training algorithm live outside
//! this crate; plug the latter in through the [`Trainer`] trait.

pub mod artifacts;
pub mod config;
pub mod error;
pub mod events;
pub mod handle;
pub mod job;
pub mod logs;
pub mod manager;
pub mod registry;
pub mod selector;
pub mod task;
pub mod trainer;

pub use artifacts::{Artifact, ArtifactId, ArtifactKind};
pub use config::JobConfig;
pub use error::{TrainingError, TrainingResult};
pub use events::{EventHub, EventSink, JobEvent, JobSubscription, EVENT_CHANNEL_CAPACITY};
pub use handle::JobHandle;
pub use job::{ControlAction, ControlOutcome, Job, JobId, JobStatus, RunMetrics};
pub use logs::{BoundedLog, LogEntry, LogLevel, DEFAULT_LOG_CAPACITY};
pub use manager::{JobManager, LifecycleStats};
pub use registry::{RunRegistry, DEFAULT_MAX_RETAINED_JOBS};
pub use selector::{evaluate_checkpoint, CheckpointDecision, CheckpointSelector};
pub use task::{Stage, StagePlan, TrainingTask};
pub use trainer::{EpochMetrics, ScriptedTrainer, SimulatedTrainer, Trainer};
