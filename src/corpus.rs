//! Training corpus loading.
//!
//! A corpus directory holds one fuzzlog per test run. The file name's
//! extension carries the outcome: `.s` for success, `.f` for failure (e.g.
//! `17.s`). Files with any other name are ignored.
//!
//! Loading happens in two passes, like the corpus was produced: the first pass
//! sizes the problem (longest log, distinct locations), the second lays every
//! run out over exactly `poscount` positions.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use serde::Serialize;
use tracing::{debug, info};

use crate::fuzzlog::{self, LogEntry};

// ---------------------------------------------------------------------------
// Location vocabulary
// ---------------------------------------------------------------------------

/// Assigns dense indexes to location ids.
///
/// Indexes start at 1; 0 is reserved for padding positions that no run
/// reached. The same location always gets the same index.
#[derive(Debug, Clone)]
pub struct LocationIndex {
    map: HashMap<u64, usize>,
    watermark: usize,
}

impl Default for LocationIndex {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
            watermark: 1,
        }
    }
}

impl LocationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `loc`, if it has one.
    pub fn get(&self, loc: u64) -> Option<usize> {
        self.map.get(&loc).copied()
    }

    /// Like [`get`](Self::get), but assigns the next index to an unseen location.
    pub fn get_or_insert(&mut self, loc: u64) -> usize {
        if let Some(idx) = self.map.get(&loc) {
            return *idx;
        }
        let idx = self.watermark;
        self.map.insert(loc, idx);
        self.watermark += 1;
        idx
    }

    /// Next index to be assigned. Equals the embedding-table size.
    pub fn watermark(&self) -> usize {
        self.watermark
    }

    /// Number of distinct locations seen.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Run records
// ---------------------------------------------------------------------------

/// Outcome marker carried by a corpus file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    /// Outcome encoded in `path`'s extension, or `None` for non-corpus files.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "s" => Some(Self::Success),
            "f" => Some(Self::Failure),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// One parsed fuzzlog with its label.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub path: PathBuf,
    pub entries: Vec<LogEntry>,
    pub outcome: Outcome,
}

/// List the corpus files in `dir`, sorted by name.
pub fn discover(dir: &Path) -> Result<Vec<PathBuf>> {
    let rd = fs::read_dir(dir)
        .wrap_err_with(|| format!("cannot open corpus directory {}", dir.display()))?;
    let mut files = Vec::new();
    for entry in rd {
        let path = entry
            .wrap_err_with(|| format!("reading {}", dir.display()))?
            .path();
        if path.is_file() && Outcome::from_path(&path).is_some() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Parse every file in `files`.
pub fn read_runs(files: &[PathBuf]) -> Result<Vec<RunRecord>> {
    files
        .iter()
        .map(|path| -> Result<RunRecord> {
            let outcome = Outcome::from_path(path)
                .ok_or_else(|| eyre::eyre!("{} has no .s/.f outcome marker", path.display()))?;
            let entries = fuzzlog::read_file(path)?;
            debug!(path = %path.display(), entries = entries.len(), ?outcome, "parsed fuzzlog");
            Ok(RunRecord {
                path: path.clone(),
                entries,
                outcome,
            })
        })
        .collect()
}

/// Count positions and index locations over all runs.
///
/// Returns `(poscount, locidx)` where `poscount` is the length of the longest
/// run.
pub fn count_locpos(runs: &[RunRecord]) -> (usize, LocationIndex) {
    let mut locidx = LocationIndex::new();
    let mut poscount = 0;
    for run in runs {
        for e in &run.entries {
            locidx.get_or_insert(e.location);
        }
        poscount = poscount.max(run.entries.len());
    }
    (poscount, locidx)
}

// ---------------------------------------------------------------------------
// Feature arrays
// ---------------------------------------------------------------------------

/// Aligned model inputs: one row per run, `poscount` columns per row.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub locs: Vec<Vec<usize>>,
    pub vals: Vec<Vec<f64>>,
    pub labels: Vec<bool>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Fraction of rows labelled success.
    pub fn success_rate(&self) -> f64 {
        if self.labels.is_empty() {
            return 0.0;
        }
        self.labels.iter().filter(|&&l| l).count() as f64 / self.labels.len() as f64
    }

    /// Check row counts, row widths and index range.
    pub fn check_shape(&self, poscount: usize, watermark: usize) -> Result<()> {
        if self.locs.len() != self.vals.len() || self.vals.len() != self.labels.len() {
            eyre::bail!(
                "misaligned dataset: {} loc rows, {} value rows, {} labels",
                self.locs.len(),
                self.vals.len(),
                self.labels.len()
            );
        }
        for (i, (l, v)) in self.locs.iter().zip(&self.vals).enumerate() {
            if l.len() != poscount || v.len() != poscount {
                eyre::bail!(
                    "row {} has {} locations and {} values, expected {}",
                    i,
                    l.len(),
                    v.len(),
                    poscount
                );
            }
            if let Some(&bad) = l.iter().find(|&&idx| idx >= watermark) {
                eyre::bail!("row {} has location index {} >= watermark {}", i, bad, watermark);
            }
        }
        Ok(())
    }
}

/// Lay one log out over `poscount` positions.
///
/// Positions past the end of the log, past `poscount`, or holding a location
/// unknown to `locidx` stay zero.
pub fn log_to_locs_vals(
    entries: &[LogEntry],
    locidx: &LocationIndex,
    poscount: usize,
) -> (Vec<usize>, Vec<f64>) {
    let mut locs = vec![0usize; poscount];
    let mut vals = vec![0f64; poscount];
    for (p, e) in entries.iter().take(poscount).enumerate() {
        if let Some(idx) = locidx.get(e.location) {
            locs[p] = idx;
            vals[p] = e.value;
        }
    }
    (locs, vals)
}

/// Build the aligned arrays for `runs`.
pub fn read_data(runs: &[RunRecord], poscount: usize, locidx: &LocationIndex) -> Dataset {
    let mut data = Dataset::default();
    for run in runs {
        let (locs, vals) = log_to_locs_vals(&run.entries, locidx, poscount);
        data.locs.push(locs);
        data.vals.push(vals);
        data.labels.push(run.outcome.is_success());
    }
    data
}

// ---------------------------------------------------------------------------
// Loaded corpus
// ---------------------------------------------------------------------------

/// A training corpus with its vocabulary.
#[derive(Debug, Clone)]
pub struct Corpus {
    pub poscount: usize,
    pub locidx: LocationIndex,
    pub data: Dataset,
    pub files: Vec<PathBuf>,
}

impl Corpus {
    /// Load every `.s`/`.f` fuzzlog under `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let files = discover(dir)?;
        if files.is_empty() {
            eyre::bail!("no .s/.f fuzzlogs found in {}", dir.display());
        }
        let runs = read_runs(&files)?;
        let (poscount, locidx) = count_locpos(&runs);
        if poscount == 0 {
            eyre::bail!("all {} fuzzlogs in {} are empty", files.len(), dir.display());
        }
        let data = read_data(&runs, poscount, &locidx);

        info!(
            dir = %dir.display(),
            runs = data.len(),
            poscount,
            locations = locidx.len(),
            success_rate = data.success_rate(),
            "corpus loaded"
        );

        Ok(Self {
            poscount,
            locidx,
            data,
            files,
        })
    }

    /// Load another directory against this corpus's vocabulary and width.
    ///
    /// Locations unseen in training map to the padding index.
    pub fn load_aligned(&self, dir: &Path) -> Result<Dataset> {
        let files = discover(dir)?;
        let runs = read_runs(&files)?;
        Ok(read_data(&runs, self.poscount, &self.locidx))
    }
}
