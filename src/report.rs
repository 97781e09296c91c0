//! End-of-run report.

use std::fmt::Write as _;

use serde::Serialize;

use crate::config::TrainConfig;
use crate::model::Topology;
use crate::train::EpochStats;
use crate::validate::{Prediction, ValidationResult};

/// Shape of the loaded training corpus.
#[derive(Debug, Clone, Serialize)]
pub struct CorpusSummary {
    pub runs: usize,
    pub poscount: usize,
    pub locations: usize,
    pub watermark: usize,
    pub success_rate: f64,
}

/// Everything a training run produced. Nothing here is written to disk.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub config: TrainConfig,
    /// Seed actually used, drawn from entropy when the config had none.
    pub seed: u64,
    pub corpus: CorpusSummary,
    pub topology: Topology,
    pub param_count: usize,
    pub history: Vec<EpochStats>,
    /// Inference-mode loss over the training corpus after the last epoch.
    pub final_loss: f64,
    /// Inference-mode accuracy over the training corpus after the last epoch.
    pub final_acc: f64,
    pub validation: Option<ValidationResult>,
    pub predictions: Vec<Prediction>,
    pub fingerprint: String,
}

/// Output format for [`RunReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Summary,
    Json,
}

impl ReportFormat {
    pub fn parse(s: &str) -> eyre::Result<Self> {
        match s {
            "summary" => Ok(Self::Summary),
            "json" => Ok(Self::Json),
            other => eyre::bail!("unknown report format '{}' (expected summary or json)", other),
        }
    }
}

impl RunReport {
    pub fn render(&self, format: ReportFormat) -> eyre::Result<String> {
        match format {
            ReportFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            ReportFormat::Summary => Ok(self.summary()),
        }
    }

    /// Human-readable multi-line summary.
    pub fn summary(&self) -> String {
        let mut s = String::new();
        // Writing to a String cannot fail.
        let _ = writeln!(s, "Gate Network Training");
        let _ = writeln!(s, "=====================");
        let _ = writeln!(
            s,
            "Corpus:     {} runs, {} positions, {} locations ({:.1}% success)",
            self.corpus.runs,
            self.corpus.poscount,
            self.corpus.locations,
            self.corpus.success_rate * 100.0
        );
        let _ = writeln!(
            s,
            "Model:      {} heads, {} params",
            self.topology.heads, self.param_count
        );
        let _ = writeln!(
            s,
            "Training:   {} epochs, batch size {}, seed {}",
            self.config.epochs, self.config.batch_size, self.seed
        );
        let _ = writeln!(s);
        for h in &self.history {
            let _ = writeln!(
                s,
                "  epoch {:>4}  loss {:.6}  acc {:.4}",
                h.epoch, h.loss, h.acc
            );
        }
        if !self.history.is_empty() {
            let _ = writeln!(s);
        }
        let _ = writeln!(
            s,
            "Final:      loss {:.6}  acc {:.4}",
            self.final_loss, self.final_acc
        );
        if let Some(v) = &self.validation {
            let _ = writeln!(
                s,
                "Validation: {:.4} ({}/{} at threshold {}; missed {} successes, {} failures)",
                v.accuracy, v.correct, v.runs, v.threshold, v.missed_successes, v.missed_failures
            );
        }
        for p in &self.predictions {
            let _ = writeln!(
                s,
                "Predict:    {} {:.6} ({})",
                p.path.display(),
                p.score,
                if p.success { "success" } else { "failure" }
            );
        }
        let _ = writeln!(s, "Params:     {}", self.fingerprint);
        s
    }
}
