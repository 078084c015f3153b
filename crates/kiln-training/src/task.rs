//! The asynchronous unit of work driving one job through its stages.
//!
//! One `TrainingTask` exists per active job and shares nothing with its
//! siblings besides the registry map. Pause and stop are honored
//! cooperatively at stage and epoch boundaries; no lock is held across a
//! suspension point.

use crate::artifacts::{Artifact, ArtifactKind};
use crate::config::JobConfig;
use crate::error::TrainingError;
use crate::handle::JobHandle;
use crate::job::{JobStatus, RunMetrics};
use crate::logs::LogLevel;
use crate::registry::RunRegistry;
use crate::selector::CheckpointSelector;
use crate::trainer::Trainer;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info};

/// One step in the training pipeline.
#[derive(Debug, Clone, Copy)]
pub struct Stage {
    pub name: &'static str,
    /// Share of overall progress, all stages summing to 100.
    pub weight: u8,
}

const TRAINING_STAGE: &str = "training";

const DEFAULT_STAGES: [Stage; 6] = [
    Stage { name: "preparing", weight: 10 },
    Stage { name: "loading-data", weight: 15 },
    Stage { name: "initializing", weight: 10 },
    Stage { name: TRAINING_STAGE, weight: 55 },
    Stage { name: "evaluating", weight: 5 },
    Stage { name: "saving", weight: 5 },
];

/// Ordered stage sequence plus the pacing of a run.
#[derive(Debug, Clone)]
pub struct StagePlan {
    stages: Vec<Stage>,
    stage_delay: Duration,
    epoch_delay: Duration,
}

impl StagePlan {
    /// Default stages with custom pacing. Tests typically pass zero delays.
    #[must_use]
    pub fn with_delays(stage_delay: Duration, epoch_delay: Duration) -> Self {
        Self { stages: DEFAULT_STAGES.to_vec(), stage_delay, epoch_delay }
    }

    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Progress accumulated by the stages before `index`.
    fn progress_before(&self, index: usize) -> u8 {
        self.stages.iter().take(index).map(|s| u32::from(s.weight)).sum::<u32>().min(100) as u8
    }
}

impl Default for StagePlan {
    fn default() -> Self {
        Self::with_delays(Duration::from_millis(250), Duration::from_millis(500))
    }
}

/// Drives one job from `created` to a terminal state.
pub struct TrainingTask {
    handle: Arc<JobHandle>,
    registry: Arc<RunRegistry>,
    trainer: Arc<dyn Trainer>,
    plan: StagePlan,
}

impl TrainingTask {
    #[must_use]
    pub fn new(
        handle: Arc<JobHandle>,
        registry: Arc<RunRegistry>,
        trainer: Arc<dyn Trainer>,
        plan: StagePlan,
    ) -> Self {
        Self { handle, registry, trainer, plan }
    }

    /// Spawns the task onto the runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let config = self.handle.snapshot().await.config;
        let started = self
            .handle
            .transition(JobStatus::Running, |job| {
                job.start_time = Some(Utc::now());
            })
            .await;
        if !started {
            return;
        }
        self.handle
            .add_log(
                LogLevel::Info,
                "Training started",
                Some(json!({ "trainer": self.trainer.id() })),
            )
            .await;

        match self.execute(&config).await {
            Ok(true) => {
                // A pause during the last stage parks here; only a running
                // job moves on to record completion.
                if !self.halted_at_boundary().await {
                    self.complete().await;
                }
            }
            Ok(false) => {
                debug!(job_id = %self.handle.id(), "training task halted at boundary");
            }
            Err(err) => {
                if self.halted_at_boundary().await {
                    debug!(
                        job_id = %self.handle.id(),
                        error = %err,
                        "job halted before failure was recorded"
                    );
                } else {
                    self.fail(&err).await;
                }
            }
        }
    }

    /// Runs the stage pipeline.
    ///
    /// # Returns
    /// `Ok(true)` when every stage finished, `Ok(false)` when the task
    /// halted cooperatively at a boundary.
    async fn execute(&self, config: &JobConfig) -> Result<bool, TrainingError> {
        let total = self.plan.stages().len();
        for (index, stage) in self.plan.stages().iter().enumerate() {
            if self.halted_at_boundary().await {
                return Ok(false);
            }
            let progress = self.plan.progress_before(index);
            self.handle
                .update(|job| {
                    job.stage = stage.name.to_string();
                    job.progress = job.progress.max(progress);
                })
                .await;
            self.handle
                .add_log(
                    LogLevel::Info,
                    format!("Stage: {}", stage.name),
                    Some(json!({ "stage": index + 1, "total": total })),
                )
                .await;

            if stage.name == TRAINING_STAGE {
                if !self.run_epochs(config, progress, stage.weight).await? {
                    return Ok(false);
                }
            } else {
                sleep(self.plan.stage_delay).await;
            }
        }
        Ok(true)
    }

    /// Epoch loop inside the training stage.
    async fn run_epochs(
        &self,
        config: &JobConfig,
        base_progress: u8,
        weight: u8,
    ) -> Result<bool, TrainingError> {
        let epochs = config.epochs.max(1);
        let mut selector = CheckpointSelector::new(config.max_patience);
        let mut best_checkpoint: Option<String> = None;
        let mut last_checkpoint: Option<String> = None;
        let mut last_epoch_stats: Option<(u32, f64)> = None;

        for epoch in 0..epochs {
            if self.halted_at_boundary().await {
                return Ok(false);
            }

            let metrics = self.trainer.run_epoch(config, epoch).await?;
            let decision = selector.observe(metrics.val_loss);
            let checkpoint_name =
                format!("checkpoint-epoch-{}-val-loss-{:.3}.ckpt", epoch, metrics.val_loss);

            if decision.is_new_best {
                let artifact = self.checkpoint_artifact(&checkpoint_name, epoch, metrics.val_loss);
                best_checkpoint = Some(checkpoint_name.clone());
                self.register_artifact(artifact).await;
            }
            last_checkpoint = Some(checkpoint_name.clone());
            last_epoch_stats = Some((epoch, metrics.val_loss));

            let run = RunMetrics {
                epoch: epoch + 1,
                train_loss: Some(metrics.train_loss),
                val_loss: Some(metrics.val_loss),
                learning_rate: Some(metrics.learning_rate),
                throughput: Some(metrics.throughput),
                best_val_loss: Some(decision.best_val_loss),
                best_checkpoint: best_checkpoint.clone(),
                last_checkpoint: last_checkpoint.clone(),
                patience: decision.patience,
            };
            let mut named = serde_json::Map::new();
            named.insert("epoch".to_string(), json!(epoch + 1));
            named.insert("trainLoss".to_string(), json!(metrics.train_loss));
            named.insert("valLoss".to_string(), json!(metrics.val_loss));
            named.insert("learningRate".to_string(), json!(metrics.learning_rate));
            named.insert("throughput".to_string(), json!(metrics.throughput));

            let span = u32::from(weight) * (epoch + 1) / epochs;
            let progress = u32::from(base_progress) + span;
            self.handle.record_epoch(run, named, progress.min(100) as u8).await;
            self.handle
                .add_log(
                    LogLevel::Info,
                    format!(
                        "Epoch {}/{} | loss: {:.3} | val: {:.3}",
                        epoch + 1,
                        epochs,
                        metrics.train_loss,
                        metrics.val_loss
                    ),
                    Some(json!({ "epoch": epoch + 1, "valLoss": metrics.val_loss })),
                )
                .await;

            sleep(self.plan.epoch_delay).await;

            if selector.should_stop() {
                info!(
                    job_id = %self.handle.id(),
                    epoch = epoch + 1,
                    patience = decision.patience,
                    "early stopping"
                );
                self.handle
                    .add_log(
                        LogLevel::Info,
                        format!("Early stopping at epoch {}", epoch + 1),
                        Some(json!({ "patience": decision.patience })),
                    )
                    .await;
                break;
            }
        }

        // The best checkpoint already has its own record; when the run ended
        // somewhere else, that last checkpoint is retained as well.
        if let (Some(last), Some((epoch, val_loss))) = (&last_checkpoint, last_epoch_stats) {
            if best_checkpoint.as_deref() != Some(last.as_str()) {
                let artifact = self.checkpoint_artifact(last, epoch, val_loss);
                self.register_artifact(artifact).await;
            }
        }
        Ok(true)
    }

    fn checkpoint_artifact(&self, name: &str, epoch: u32, val_loss: f64) -> Artifact {
        let mut metadata = serde_json::Map::new();
        metadata.insert("epoch".to_string(), json!(epoch));
        metadata.insert("valLoss".to_string(), json!(val_loss));
        let size = 500_000 + u64::from(epoch) * 1_000;
        Artifact::new(self.handle.id().clone(), ArtifactKind::Checkpoint, name, size, metadata)
    }

    async fn register_artifact(&self, artifact: Artifact) {
        let id = artifact.id.clone();
        self.registry.add_artifact(artifact.clone()).await;
        if !self.handle.attach_artifact(&artifact).await {
            // The job finished underneath us; drop the orphaned record.
            self.registry.remove_artifact(&id).await;
        }
    }

    async fn complete(&self) {
        let snapshot = self.handle.snapshot().await;

        let mut model_meta = serde_json::Map::new();
        model_meta.insert("baseModel".to_string(), json!(snapshot.config.model_ref));
        if let Some(best) = snapshot.run.best_val_loss {
            model_meta.insert("bestValLoss".to_string(), json!(best));
        }
        let model = Artifact::new(
            self.handle.id().clone(),
            ArtifactKind::Model,
            "final-model.bin",
            2_000_000,
            model_meta,
        );
        self.register_artifact(model).await;

        let mut report_meta = serde_json::Map::new();
        report_meta.insert("totalEpochs".to_string(), json!(snapshot.run.epoch));
        if let Some(best) = snapshot.run.best_val_loss {
            report_meta.insert("bestValLoss".to_string(), json!(best));
        }
        let report = Artifact::new(
            self.handle.id().clone(),
            ArtifactKind::Report,
            "training-report.json",
            15_420,
            report_meta,
        );
        self.register_artifact(report).await;

        self.handle
            .add_log(LogLevel::Success, "Training completed successfully", None)
            .await;
        loop {
            let done = self
                .handle
                .transition(JobStatus::Completed, |job| {
                    job.progress = 100;
                    job.stage = "completed".to_string();
                    job.end_time = Some(Utc::now());
                })
                .await;
            if done {
                info!(job_id = %self.handle.id(), "training job completed");
                return;
            }
            // A pause can land between the last boundary check and the
            // transition; park until the operator resumes or stops.
            if self.handle.wait_if_paused().await.is_terminal() {
                return;
            }
        }
    }

    async fn fail(&self, err: &TrainingError) {
        // Only the human-readable message reaches the job record.
        let message = err.to_string();
        error!(job_id = %self.handle.id(), error = %message, "training job failed");
        self.handle
            .add_log(LogLevel::Error, "Training failed", Some(json!({ "error": message })))
            .await;
        loop {
            let recorded = self
                .handle
                .transition(JobStatus::Failed, |job| {
                    job.error = Some(message.clone());
                    job.end_time = Some(Utc::now());
                })
                .await;
            if recorded || self.handle.wait_if_paused().await.is_terminal() {
                return;
            }
        }
    }

    /// Stage/epoch boundary check: parks while paused, reports whether the
    /// job has been stopped (or otherwise finished) underneath the task.
    async fn halted_at_boundary(&self) -> bool {
        let status = self.handle.wait_if_paused().await;
        if status.is_terminal() {
            debug!(job_id = %self.handle.id(), status = %status, "job halted by operator");
            return true;
        }
        false
    }
}
