//! Held-out validation and single-log prediction.

use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use serde::Serialize;
use tracing::info;

use crate::corpus::{log_to_locs_vals, Corpus, Dataset, LocationIndex};
use crate::fuzzlog::{self, LogEntry};
use crate::model::GateNet;

/// Outcome of validating against a held-out corpus.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub runs: usize,
    pub correct: usize,
    /// Fraction of runs predicted correctly.
    pub accuracy: f64,
    pub threshold: f64,
    /// Runs labelled success but predicted at or below the threshold.
    pub missed_successes: usize,
    /// Runs labelled failure but predicted above the threshold.
    pub missed_failures: usize,
}

/// Score for one fuzzlog passed on the command line.
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub path: PathBuf,
    pub score: f64,
    /// `score` is strictly above the threshold.
    pub success: bool,
}

/// Compare `net`'s predictions on `data` with its labels.
///
/// A prediction means success when it is strictly above `threshold`.
pub fn validate(net: &GateNet, data: &Dataset, threshold: f64) -> Result<ValidationResult> {
    let locs: Vec<&[usize]> = data.locs.iter().map(Vec::as_slice).collect();
    let vals: Vec<&[f64]> = data.vals.iter().map(Vec::as_slice).collect();
    let pred = net.predict(&locs, &vals)?;

    let mut result = ValidationResult {
        runs: data.len(),
        correct: 0,
        accuracy: 0.0,
        threshold,
        missed_successes: 0,
        missed_failures: 0,
    };
    for (p, &label) in pred.iter().zip(&data.labels) {
        match (*p > threshold, label) {
            (a, b) if a == b => result.correct += 1,
            (false, true) => result.missed_successes += 1,
            _ => result.missed_failures += 1,
        }
    }
    if result.runs > 0 {
        result.accuracy = result.correct as f64 / result.runs as f64;
    }
    Ok(result)
}

/// Validate against the corpus in `dir`, if it holds any fuzzlogs.
pub fn validate_dir(
    net: &GateNet,
    corpus: &Corpus,
    dir: &Path,
    threshold: f64,
) -> Result<Option<ValidationResult>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let data = corpus.load_aligned(dir)?;
    if data.is_empty() {
        return Ok(None);
    }
    let result = validate(net, &data, threshold)?;
    info!(
        dir = %dir.display(),
        runs = result.runs,
        accuracy = result.accuracy,
        missed_successes = result.missed_successes,
        missed_failures = result.missed_failures,
        "validation done"
    );
    Ok(Some(result))
}

/// Prediction for one fuzzlog laid out against a training vocabulary.
///
/// Entries past the network's position count are ignored.
pub fn predict_log(net: &GateNet, log: &[LogEntry], locidx: &LocationIndex) -> Result<f64> {
    let poscount = net.topology().poscount;
    let (locs, vals) = log_to_locs_vals(log, locidx, poscount);
    let pred = net.predict(&[locs.as_slice()], &[vals.as_slice()])?;
    pred.first()
        .copied()
        .ok_or_else(|| eyre::eyre!("network returned no prediction"))
}

/// Score every fuzzlog in `paths`.
pub fn predict_files(
    net: &GateNet,
    locidx: &LocationIndex,
    paths: &[PathBuf],
    threshold: f64,
) -> Result<Vec<Prediction>> {
    paths
        .iter()
        .map(|path| -> Result<Prediction> {
            let log = fuzzlog::read_file(path)?;
            let score = predict_log(net, &log, locidx)
                .wrap_err_with(|| format!("predicting {}", path.display()))?;
            info!(path = %path.display(), score, "prediction");
            Ok(Prediction {
                path: path.clone(),
                score,
                success: score > threshold,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Topology;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn net() -> GateNet {
        let topo = Topology {
            poscount: 2,
            watermark: 3,
            heads: 1,
        };
        GateNet::new(topo, &mut ChaCha8Rng::seed_from_u64(12)).unwrap()
    }

    #[test]
    fn test_threshold_extremes() {
        let net = net();
        let data = Dataset {
            locs: vec![vec![1, 2], vec![2, 1], vec![1, 0]],
            vals: vec![vec![0.0, 1.0], vec![3.0, -2.0], vec![1.0, 0.0]],
            labels: vec![true, false, true],
        };

        // Nothing is above 1.0: every success is missed.
        let r = validate(&net, &data, 1.0).unwrap();
        assert_eq!(r.correct, 1);
        assert_eq!(r.missed_successes, 2);
        assert_eq!(r.missed_failures, 0);

        // Sigmoid output is always above 0.0: every failure is missed.
        let r = validate(&net, &data, 0.0).unwrap();
        assert_eq!(r.correct, 2);
        assert_eq!(r.missed_failures, 1);
        assert!((r.accuracy - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_predict_log_matches_batch_predict() {
        let net = net();
        let mut locidx = LocationIndex::new();
        locidx.get_or_insert(100);
        locidx.get_or_insert(200);
        let log = [
            LogEntry { value: 2.0, location: 200 },
            LogEntry { value: -1.0, location: 100 },
            LogEntry { value: 9.0, location: 100 },
        ];
        let p = predict_log(&net, &log, &locidx).unwrap();
        let expected = net.predict(&[&[2usize, 1][..]], &[&[2.0, -1.0][..]]).unwrap()[0];
        assert!((p - expected).abs() < 1e-15);
        assert!((0.0..=1.0).contains(&p));
    }

    #[test]
    fn test_predict_files_reads_and_thresholds() {
        let net = net();
        let mut locidx = LocationIndex::new();
        locidx.get_or_insert(100);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.f");
        let log = [LogEntry { value: 1.5, location: 100 }];
        std::fs::write(&path, fuzzlog::encode(&log)).unwrap();

        let preds = predict_files(&net, &locidx, &[path.clone()], 0.0).unwrap();
        assert_eq!(preds.len(), 1);
        assert_eq!(preds[0].path, path);
        assert_eq!(preds[0].score, predict_log(&net, &log, &locidx).unwrap());
        assert!(preds[0].success);

        let missing = dir.path().join("gone.s");
        let err = predict_files(&net, &locidx, &[missing], 0.7).unwrap_err();
        assert!(format!("{err:?}").contains("gone.s"));
    }

    #[test]
    fn test_empty_dataset() {
        let r = validate(&net(), &Dataset::default(), 0.7).unwrap();
        assert_eq!(r.runs, 0);
        assert_eq!(r.accuracy, 0.0);
    }
}
