use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};

/// Configuration accepted at job-creation time.
///
/// Recognized fields carry defaults; anything else the caller sends is kept
/// in `extra` and echoed back unmodified with the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    /// Reference to the base model to train.
    pub model_ref: String,
    /// References to the datasets to train on.
    #[serde(default)]
    pub dataset_refs: Vec<String>,
    /// Number of training epochs.
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    /// Examples per optimizer step.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Peak learning rate.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Warmup length for the learning-rate schedule, in epochs.
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: u32,
    /// Consecutive non-improving evaluations tolerated before early stopping.
    #[serde(default = "default_max_patience")]
    pub max_patience: u32,
    /// Unrecognized fields, passed through opaquely.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_epochs() -> u32 {
    10
}

fn default_batch_size() -> u32 {
    32
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_warmup_steps() -> u32 {
    100
}

fn default_max_patience() -> u32 {
    3
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            model_ref: String::new(),
            dataset_refs: Vec::new(),
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            warmup_steps: default_warmup_steps(),
            max_patience: default_max_patience(),
            extra: serde_json::Map::new(),
        }
    }
}

impl JobConfig {
    #[must_use]
    pub fn new(model_ref: impl Into<String>, dataset_refs: Vec<String>) -> Self {
        Self { model_ref: model_ref.into(), dataset_refs, ..Self::default() }
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.model_ref.trim().is_empty() {
            return Err(TrainingError::Validation("modelRef is required".to_string()));
        }
        if self.dataset_refs.is_empty() {
            return Err(TrainingError::Validation("at least one dataset is required".to_string()));
        }
        if self.epochs == 0 {
            return Err(TrainingError::Validation("epochs must be >= 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::Validation("batchSize must be >= 1".to_string()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(TrainingError::Validation("learningRate must be > 0".to_string()));
        }
        if self.max_patience == 0 {
            return Err(TrainingError::Validation("maxPatience must be >= 1".to_string()));
        }
        Ok(())
    }
}
