//! Best-checkpoint selection and early-stopping policy.

use serde::{Deserialize, Serialize};

/// Outcome of evaluating one validation score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDecision {
    /// Best validation loss after this evaluation.
    pub best_val_loss: f64,
    /// Consecutive non-improving evaluations after this one.
    pub patience: u32,
    pub is_new_best: bool,
}

/// Pure selection rule: a strictly lower validation loss becomes the new
/// best and resets patience; anything else increments patience.
#[must_use]
pub fn evaluate_checkpoint(
    current_best: Option<f64>,
    current_patience: u32,
    val_loss: f64,
) -> CheckpointDecision {
    let is_new_best = current_best.is_none_or(|best| val_loss < best);
    if is_new_best {
        CheckpointDecision { best_val_loss: val_loss, patience: 0, is_new_best: true }
    } else {
        CheckpointDecision {
            best_val_loss: current_best.unwrap_or(val_loss),
            patience: current_patience + 1,
            is_new_best: false,
        }
    }
}

/// Running best-checkpoint tracker for one training run.
#[derive(Debug, Clone)]
pub struct CheckpointSelector {
    best_val_loss: Option<f64>,
    patience: u32,
    max_patience: u32,
}

impl CheckpointSelector {
    #[must_use]
    pub fn new(max_patience: u32) -> Self {
        Self { best_val_loss: None, patience: 0, max_patience: max_patience.max(1) }
    }

    /// Feeds one validation loss through the selection rule.
    pub fn observe(&mut self, val_loss: f64) -> CheckpointDecision {
        let decision = evaluate_checkpoint(self.best_val_loss, self.patience, val_loss);
        self.best_val_loss = Some(decision.best_val_loss);
        self.patience = decision.patience;
        decision
    }

    /// Whether the epoch loop should stop early.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.patience >= self.max_patience
    }

    #[must_use]
    pub fn best_val_loss(&self) -> Option<f64> {
        self.best_val_loss
    }

    #[must_use]
    pub fn patience(&self) -> u32 {
        self.patience
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_is_best() {
        let decision = evaluate_checkpoint(None, 0, 1.5);
        assert!(decision.is_new_best);
        assert_eq!(decision.best_val_loss, 1.5);
        assert_eq!(decision.patience, 0);
    }

    #[test]
    fn test_improvement_resets_patience() {
        let decision = evaluate_checkpoint(Some(1.0), 2, 0.8);
        assert!(decision.is_new_best);
        assert_eq!(decision.best_val_loss, 0.8);
        assert_eq!(decision.patience, 0);
    }

    #[test]
    fn test_no_improvement_increments_patience() {
        let decision = evaluate_checkpoint(Some(0.8), 0, 0.8);
        assert!(!decision.is_new_best);
        assert_eq!(decision.best_val_loss, 0.8);
        assert_eq!(decision.patience, 1);
    }

    #[test]
    fn test_early_stop_after_max_patience() {
        let mut selector = CheckpointSelector::new(3);
        for (val_loss, stop) in [(0.9, false), (0.95, false), (1.0, false), (1.1, true)] {
            selector.observe(val_loss);
            assert_eq!(selector.should_stop(), stop, "val_loss {val_loss}");
        }
        assert_eq!(selector.best_val_loss(), Some(0.9));
        assert_eq!(selector.patience(), 3);
    }

    #[test]
    fn test_best_never_exceeds_observed_minimum() {
        let mut selector = CheckpointSelector::new(10);
        let losses = [2.0, 1.4, 1.7, 1.1, 1.1, 0.9, 1.3];
        let mut min_seen = f64::INFINITY;
        for loss in losses {
            min_seen = min_seen.min(loss);
            selector.observe(loss);
            assert_eq!(selector.best_val_loss(), Some(min_seen));
        }
    }
}
