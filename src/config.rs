//! Run configuration.

use std::path::PathBuf;

use serde::Serialize;

use crate::model::DEFAULT_HEADS;

pub const DEFAULT_EPOCHS: usize = 1;
/// Large batches tend to drive batch normalization to NaN.
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_DATA_DIR: &str = "train";
pub const DEFAULT_VALN_DIR: &str = "valn";
/// A validation prediction counts as success above this value.
pub const DEFAULT_THRESHOLD: f64 = 0.7;
pub const DEFAULT_LEARNING_RATE: f64 = 0.03;

/// Everything one training run needs.
#[derive(Debug, Clone, Serialize)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Parallel heads in the gate network.
    pub heads: usize,
    pub data_dir: PathBuf,
    /// Optional validation corpus; skipped when absent.
    pub valn_dir: Option<PathBuf>,
    pub threshold: f64,
    /// RNG seed for initialization, shuffling and dropout.
    pub seed: Option<u64>,
    pub learning_rate: f64,
    /// Fuzzlogs to score with the trained network.
    pub predict: Vec<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: DEFAULT_EPOCHS,
            batch_size: DEFAULT_BATCH_SIZE,
            heads: DEFAULT_HEADS,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            valn_dir: Some(PathBuf::from(DEFAULT_VALN_DIR)),
            threshold: DEFAULT_THRESHOLD,
            seed: None,
            learning_rate: DEFAULT_LEARNING_RATE,
            predict: Vec::new(),
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> eyre::Result<()> {
        if self.batch_size == 0 {
            eyre::bail!("batch size must be at least 1");
        }
        if self.heads == 0 {
            eyre::bail!("head count must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            eyre::bail!("threshold {} is outside [0, 1]", self.threshold);
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            eyre::bail!("learning rate must be positive, got {}", self.learning_rate);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = TrainConfig::default();
        assert_eq!(cfg.epochs, 1);
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.heads, 50);
        assert_eq!(cfg.data_dir, PathBuf::from("train"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_degenerate_values() {
        let cfg = TrainConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = TrainConfig {
            heads: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = TrainConfig {
            learning_rate: 0.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = TrainConfig {
            epochs: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
