use anyhow::{bail, Context, Error};
use itertools::Itertools;
use log::{debug, info};
use ndarray::{Array2, ArrayView1, Axis};
use profile_stats::{correlation_matrix, CorrelationMethod, Statistics};
use profile_types::{FeatureSpec, PipelineError, ProfileTable, RowFilter, Stage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// A blocklist rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlocklistEntry {
    /// exactly this feature
    Exact(String),
    /// every feature whose name contains this text
    Contains(String),
}

impl BlocklistEntry {
    fn matches(&self, name: &str) -> bool {
        match self {
            BlocklistEntry::Exact(e) => name == e,
            BlocklistEntry::Contains(s) => name.contains(s.as_str()),
        }
    }
}

/// CellProfiler measurements that are known to be unreliable or that describe object
/// bookkeeping rather than morphology.
pub fn default_blocklist() -> Vec<BlocklistEntry> {
    [
        "Correlation_Manders",
        "Correlation_RWC",
        "Correlation_Costes",
        "Granularity_14",
        "Granularity_15",
        "Granularity_16",
        "_Location_",
        "_Parent_",
        "_Children_",
        "Number_Object_Number",
    ]
    .into_iter()
    .map(|s| BlocklistEntry::Contains(s.to_string()))
    .collect()
}

/// Read a blocklist file: a `blocklist` header followed by one feature per line.
/// `*text*` lines block every feature containing `text`.
pub fn load_blocklist(path: impl AsRef<Path>) -> Result<Vec<BlocklistEntry>, Error> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| path.display().to_string())?;
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    match lines.next() {
        Some("blocklist") => (),
        other => bail!("{}: expected a `blocklist` header, found {:?}", path.display(), other),
    }
    Ok(lines
        .map(|l| match l.strip_prefix('*').and_then(|s| s.strip_suffix('*')) {
            Some(inner) => BlocklistEntry::Contains(inner.to_string()),
            None => BlocklistEntry::Exact(l.to_string()),
        })
        .collect())
}

/// One feature-selection operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum SelectionOp {
    /// drop near-constant features
    VarianceThreshold {
        /// minimum ratio of second most common to most common value
        freq_cut: f64,
        /// minimum ratio of distinct values to rows
        unique_cut: f64,
    },
    /// drop features with too many missing values
    DropNaColumns {
        /// maximum missing fraction
        cutoff: f64,
    },
    /// drop one feature of every highly correlated pair
    CorrelationThreshold {
        /// absolute correlation above which a pair is redundant
        threshold: f64,
        /// correlation coefficient
        method: CorrelationMethod,
    },
    /// drop blocklisted features
    Blocklist {
        /// rules
        entries: Vec<BlocklistEntry>,
    },
    /// drop features with extreme values
    DropOutliers {
        /// maximum absolute value
        cutoff: f64,
    },
}

impl SelectionOp {
    /// Operation name as used in configuration and reports.
    pub fn name(&self) -> &'static str {
        match self {
            SelectionOp::VarianceThreshold { .. } => "variance_threshold",
            SelectionOp::DropNaColumns { .. } => "drop_na_columns",
            SelectionOp::CorrelationThreshold { .. } => "correlation_threshold",
            SelectionOp::Blocklist { .. } => "blocklist",
            SelectionOp::DropOutliers { .. } => "drop_outliers",
        }
    }

    /// The operations run by the profiling notebooks, in order.
    pub fn standard() -> Vec<SelectionOp> {
        [
            "variance_threshold",
            "drop_na_columns",
            "correlation_threshold",
            "blocklist",
            "drop_outliers",
        ]
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect()
    }

    /// Indices (into `names`) of the columns this operation drops. `data` holds the
    /// statistics rows only.
    fn excluded(&self, names: &[String], data: &Array2<f64>) -> Result<Vec<usize>, PipelineError> {
        let columns = || data.axis_iter(Axis(1)).into_par_iter();
        Ok(match self {
            SelectionOp::VarianceThreshold { freq_cut, unique_cut } => {
                validate_fraction(self, "freq_cut", *freq_cut)?;
                validate_fraction(self, "unique_cut", *unique_cut)?;
                let n = data.nrows() as f64;
                let flags: Vec<bool> = columns()
                    .map(|col| {
                        let counts = value_counts(col);
                        let freq_drop = match counts.as_slice() {
                            [first, second, ..] => (*second as f64 / *first as f64) < *freq_cut,
                            _ => true,
                        };
                        freq_drop || (counts.len() as f64 / n) < *unique_cut
                    })
                    .collect();
                flagged(flags)
            }
            SelectionOp::DropNaColumns { cutoff } => {
                validate_fraction(self, "cutoff", *cutoff)?;
                let n = data.nrows() as f64;
                let flags: Vec<bool> = columns()
                    .map(|col| col.iter().filter(|x| x.is_nan()).count() as f64 / n > *cutoff)
                    .collect();
                flagged(flags)
            }
            SelectionOp::CorrelationThreshold { threshold, method } => {
                if !(0.0..=1.0).contains(threshold) {
                    return Err(self.invalid(format!("threshold must be in [0, 1], got {threshold}")));
                }
                correlated(names, data, *threshold, *method)?
            }
            SelectionOp::Blocklist { entries } => names
                .iter()
                .enumerate()
                .filter(|(_, n)| entries.iter().any(|e| e.matches(n)))
                .map(|(i, _)| i)
                .collect(),
            SelectionOp::DropOutliers { cutoff } => {
                let flags: Vec<bool> = columns()
                    .map(|col| col.iter().any(|x| x.abs() > *cutoff))
                    .collect();
                flagged(flags)
            }
        })
    }

    fn invalid(&self, detail: String) -> PipelineError {
        PipelineError::statistical(Stage::FeatureSelect, format!("{}: {}", self.name(), detail))
    }
}

fn validate_fraction(op: &SelectionOp, name: &str, v: f64) -> Result<(), PipelineError> {
    if (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(op.invalid(format!("{name} must be in [0, 1], got {v}")))
    }
}

fn flagged(flags: Vec<bool>) -> Vec<usize> {
    flags.into_iter().positions(|f| f).collect()
}

/// Occurrence counts of the distinct present values, most common first.
fn value_counts(col: ArrayView1<f64>) -> Vec<usize> {
    let mut counts: HashMap<u64, usize> = HashMap::new();
    for &x in col.iter().filter(|x| !x.is_nan()) {
        // fold -0.0 into 0.0
        let x = if x == 0.0 { 0.0 } else { x };
        *counts.entry(x.to_bits()).or_default() += 1;
    }
    let mut counts: Vec<usize> = counts.into_values().collect();
    counts.sort_unstable_by(|a, b| b.cmp(a));
    counts
}

/// For every pair with absolute correlation above `threshold`, most correlated first,
/// drop the member with the larger summed absolute correlation to all other columns
/// (the later column on ties). Pairs with an already dropped member are skipped.
fn correlated(
    names: &[String],
    data: &Array2<f64>,
    threshold: f64,
    method: CorrelationMethod,
) -> Result<Vec<usize>, PipelineError> {
    let constant: Vec<String> = data
        .axis_iter(Axis(1))
        .zip(names)
        .filter(|(col, _)| {
            let v = col.to_vec();
            v.count_present() < 2 || v.std(0.0) == 0.0
        })
        .map(|(_, n)| n.clone())
        .collect();
    if !constant.is_empty() {
        return Err(PipelineError::Selection {
            operation: "correlation_threshold".to_string(),
            columns: constant,
            source: Box::new(PipelineError::statistical(
                Stage::FeatureSelect,
                "correlation is undefined for zero-variance columns",
            )),
        });
    }

    let abs = correlation_matrix(data.view(), method).mapv(f64::abs);
    let p = abs.ncols();
    let totals: Vec<f64> = (0..p)
        .map(|i| (0..p).filter(|&j| j != i && !abs[[i, j]].is_nan()).map(|j| abs[[i, j]]).sum())
        .collect();

    let mut pairs: Vec<(f64, usize, usize)> = vec![];
    for i in 0..p {
        for j in (i + 1)..p {
            if abs[[i, j]] > threshold {
                pairs.push((abs[[i, j]], i, j));
            }
        }
    }
    pairs.sort_by(|a, b| b.0.total_cmp(&a.0).then((a.1, a.2).cmp(&(b.1, b.2))));

    let mut dropped = BTreeSet::new();
    for (_, i, j) in pairs {
        if dropped.contains(&i) || dropped.contains(&j) {
            continue;
        }
        dropped.insert(if totals[i] > totals[j] { i } else { j });
    }
    Ok(dropped.into_iter().collect())
}

impl FromStr for SelectionOp {
    type Err = Error;

    /// Operation by name, with default parameters.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "variance_threshold" => SelectionOp::VarianceThreshold {
                freq_cut: 0.05,
                unique_cut: 0.01,
            },
            "drop_na_columns" => SelectionOp::DropNaColumns { cutoff: 0.05 },
            "correlation_threshold" => SelectionOp::CorrelationThreshold {
                threshold: 0.9,
                method: CorrelationMethod::Pearson,
            },
            "blocklist" => SelectionOp::Blocklist {
                entries: default_blocklist(),
            },
            "drop_outliers" => SelectionOp::DropOutliers { cutoff: 500.0 },
            _ => bail!("feature selection operation not recognized: {s}"),
        })
    }
}

impl fmt::Display for SelectionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Options of the feature selection step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSelectOptions {
    /// candidate features; others pass through untouched
    pub features: FeatureSpec,
    /// rows the statistics are computed from
    pub samples: RowFilter,
    /// operations, applied in order to the surviving features
    pub operations: Vec<SelectionOp>,
}

impl Default for FeatureSelectOptions {
    fn default() -> Self {
        FeatureSelectOptions {
            features: FeatureSpec::Infer,
            samples: RowFilter::All,
            operations: SelectionOp::standard(),
        }
    }
}

/// Features removed by one operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SelectionStep {
    /// operation name
    pub operation: String,
    /// removed feature names
    pub dropped: Vec<String>,
}

/// Output of [`feature_select`].
#[derive(Clone, Debug)]
pub struct Selected {
    /// profiles restricted to the surviving features
    pub profiles: ProfileTable,
    /// what each operation removed
    pub report: Vec<SelectionStep>,
}

/// Remove uninformative and redundant features.
///
/// Operations run in order, each on the features that survived the previous ones. The
/// input is never modified: on failure no partial result is returned.
pub fn feature_select(profiles: &ProfileTable, opts: &FeatureSelectOptions) -> Result<Selected, Error> {
    let candidates = profiles.resolve_features(&opts.features, Stage::FeatureSelect)?;
    let rows = opts.samples.rows(profiles, Stage::FeatureSelect)?;
    let stats = profiles.features().select(Axis(0), &rows);

    let mut alive: Vec<usize> = candidates.clone();
    let mut report = vec![];
    for op in &opts.operations {
        let names: Vec<String> = alive.iter().map(|&c| profiles.feature_names()[c].clone()).collect();
        let data = stats.select(Axis(1), &alive);
        let excluded = op.excluded(&names, &data).map_err(|e| match e {
            e @ PipelineError::Selection { .. } => e,
            e => PipelineError::Selection {
                operation: op.name().to_string(),
                columns: vec![],
                source: Box::new(e),
            },
        })?;
        let dropped: Vec<String> = excluded.iter().map(|&i| names[i].clone()).collect();
        debug!("{}: dropping {:?}", op, dropped);
        info!("{} removed {} of {} features", op, dropped.len(), alive.len());
        let excluded: BTreeSet<usize> = excluded.into_iter().collect();
        alive = alive
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !excluded.contains(i))
            .map(|(_, c)| c)
            .collect();
        report.push(SelectionStep {
            operation: op.name().to_string(),
            dropped,
        });
    }

    // features outside the candidate set are kept in place
    let candidate_set: BTreeSet<usize> = candidates.into_iter().collect();
    let alive_set: BTreeSet<usize> = alive.into_iter().collect();
    let keep: Vec<usize> = (0..profiles.n_features())
        .filter(|c| !candidate_set.contains(c) || alive_set.contains(c))
        .collect();
    let out = profiles.select_features(&keep);
    info!("kept {} of {} features", out.n_features(), profiles.n_features());
    Ok(Selected { profiles: out, report })
}
