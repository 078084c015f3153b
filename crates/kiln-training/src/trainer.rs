use crate::config::JobConfig;
use crate::error::{TrainingError, TrainingResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Metrics reported by a trainer for one finished epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub train_loss: f64,
    pub val_loss: f64,
    pub learning_rate: f64,
    /// Steps per second.
    pub throughput: f64,
}

/// Pluggable training backend.
///
/// The lifecycle core drives the epoch loop and owns all progress, metric,
/// checkpoint and control bookkeeping; a trainer only has to produce the
/// numbers for one epoch.
#[async_trait]
pub trait Trainer: Send + Sync {
    fn id(&self) -> &'static str;

    /// Runs one epoch (0-based) and reports its metrics.
    async fn run_epoch(&self, config: &JobConfig, epoch: u32) -> TrainingResult<EpochMetrics>;
}

/// Built-in trainer producing a deterministic loss-decay curve with the
/// warmup + cosine learning-rate schedule.
#[derive(Debug, Clone)]
pub struct SimulatedTrainer {
    /// Simulated wall time per optimizer step; drives the reported
    /// throughput.
    step_millis: u64,
}

impl SimulatedTrainer {
    #[must_use]
    pub fn new(step_millis: u64) -> Self {
        Self { step_millis: step_millis.max(1) }
    }

    fn learning_rate(config: &JobConfig, epoch: u32) -> f64 {
        let warmup = f64::from(config.warmup_steps.max(1));
        let e = f64::from(epoch);
        if e < warmup {
            config.learning_rate * (e + 1.0) / warmup
        } else {
            let span = (f64::from(config.epochs) - warmup).max(1.0);
            let progress = ((e - warmup) / span).clamp(0.0, 1.0);
            config.learning_rate * (1.0 + (std::f64::consts::PI * progress).cos()) / 2.0
        }
    }
}

impl Default for SimulatedTrainer {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl Trainer for SimulatedTrainer {
    fn id(&self) -> &'static str {
        "simulated"
    }

    async fn run_epoch(&self, config: &JobConfig, epoch: u32) -> TrainingResult<EpochMetrics> {
        let e = f64::from(epoch);
        let train_loss = (3.0 - e * 0.25).max(0.1);
        let val_loss = (2.9 - e * 0.24).max(0.1);
        Ok(EpochMetrics {
            train_loss,
            val_loss,
            learning_rate: Self::learning_rate(config, epoch),
            throughput: 1000.0 / self.step_millis as f64,
        })
    }
}

/// Trainer replaying a fixed validation-loss schedule; epochs past the end
/// of the schedule repeat its final value. Used by tests and demos to drive
/// the checkpoint selector down a known path.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTrainer {
    val_losses: Vec<f64>,
    fail_at_epoch: Option<u32>,
}

impl ScriptedTrainer {
    #[must_use]
    pub fn new(val_losses: Vec<f64>) -> Self {
        Self { val_losses, fail_at_epoch: None }
    }

    /// Injects an execution failure at the given epoch.
    #[must_use]
    pub fn failing_at(mut self, epoch: u32) -> Self {
        self.fail_at_epoch = Some(epoch);
        self
    }
}

#[async_trait]
impl Trainer for ScriptedTrainer {
    fn id(&self) -> &'static str {
        "scripted"
    }

    async fn run_epoch(&self, config: &JobConfig, epoch: u32) -> TrainingResult<EpochMetrics> {
        if self.fail_at_epoch == Some(epoch) {
            return Err(TrainingError::Execution(format!("scripted failure at epoch {epoch}")));
        }
        let val_loss = self
            .val_losses
            .get(epoch as usize)
            .or_else(|| self.val_losses.last())
            .copied()
            .unwrap_or(1.0);
        Ok(EpochMetrics {
            train_loss: (val_loss - 0.05).max(0.01),
            val_loss,
            learning_rate: config.learning_rate,
            throughput: 10.0,
        })
    }
}
