use anyhow::{bail, Error};
use log::info;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use profile_stats::{row_similarity, CorrelationMethod, Statistics};
use profile_types::{FeatureSpec, MetadataColumn, PipelineError, ProfileTable, Stage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Parameters of the moderated z-score.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModzOptions {
    /// correlation between replicate profiles
    pub method: CorrelationMethod,
    /// lower bound of a replicate weight before normalization
    pub min_weight: f64,
    /// decimals kept in weights and consensus values
    pub precision: i32,
}

impl Default for ModzOptions {
    fn default() -> Self {
        ModzOptions {
            method: CorrelationMethod::Spearman,
            min_weight: 0.01,
            precision: 4,
        }
    }
}

/// How replicate profiles are collapsed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusOperation {
    /// per-feature median
    #[default]
    Median,
    /// per-feature mean
    Mean,
    /// correlation-weighted average
    Modz(ModzOptions),
}

impl FromStr for ConsensusOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "median" => Ok(ConsensusOperation::Median),
            "mean" => Ok(ConsensusOperation::Mean),
            "modz" => Ok(ConsensusOperation::Modz(ModzOptions::default())),
            _ => bail!("consensus operation not recognized: {s}"),
        }
    }
}

/// Options of the consensus step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusOptions {
    /// metadata columns identifying replicates of the same condition
    pub replicate_columns: Vec<String>,
    /// features to collapse
    pub features: FeatureSpec,
    /// collapsing operation
    pub operation: ConsensusOperation,
}

impl Default for ConsensusOptions {
    fn default() -> Self {
        ConsensusOptions {
            replicate_columns: vec!["Metadata_Plate".to_string(), "Metadata_Well".to_string()],
            features: FeatureSpec::Infer,
            operation: ConsensusOperation::Median,
        }
    }
}

fn round_to(x: f64, precision: i32) -> f64 {
    let m = 10f64.powi(precision);
    (x * m).round() / m
}

/// Replicate weights of the moderated z-score: the mean of each replicate's correlations
/// to the others, negatives counted as zero, bounded below by `min_weight` and normalized
/// to sum to one.
pub fn modz_weights(replicates: ArrayView2<f64>, opts: &ModzOptions) -> Result<Array1<f64>, PipelineError> {
    let n = replicates.nrows();
    if n < 2 {
        return Ok(Array1::ones(n));
    }
    let sim = row_similarity(replicates, opts.method);
    let mut weights = Array1::zeros(n);
    for i in 0..n {
        let mut total = 0.0;
        for j in (0..n).filter(|&j| j != i) {
            let c = sim[[i, j]];
            if c.is_nan() {
                return Err(PipelineError::statistical(
                    Stage::Consensus,
                    format!("replicates {i} and {j} have an undefined {} correlation", opts.method),
                ));
            }
            total += c.max(0.0);
        }
        weights[i] = (total / (n - 1) as f64).max(opts.min_weight);
    }
    let sum = weights.sum();
    Ok(weights.mapv(|w| round_to(w / sum, opts.precision)))
}

fn collapse(rows: ArrayView2<f64>, operation: &ConsensusOperation) -> Result<Vec<f64>, PipelineError> {
    if rows.nrows() == 1 {
        return Ok(rows.row(0).to_vec());
    }
    Ok(match operation {
        ConsensusOperation::Median => rows.axis_iter(Axis(1)).map(|c| c.to_vec().median()).collect(),
        ConsensusOperation::Mean => rows.axis_iter(Axis(1)).map(|c| c.to_vec().mean()).collect(),
        ConsensusOperation::Modz(opts) => {
            let w = modz_weights(rows, opts)?;
            rows.axis_iter(Axis(1))
                .map(|c| {
                    let (sum, weight) = c
                        .iter()
                        .zip(&w)
                        .filter(|(x, _)| !x.is_nan())
                        .fold((0.0, 0.0), |(s, t), (x, w)| (s + x * w, t + w));
                    if weight > 0.0 {
                        round_to(sum / weight, opts.precision)
                    } else {
                        f64::NAN
                    }
                })
                .collect()
        }
    })
}

/// Collapse the replicates of every condition into one profile.
///
/// Output rows are sorted by the replicate key; the metadata is the replicate columns.
pub fn consensus(profiles: &ProfileTable, opts: &ConsensusOptions) -> Result<ProfileTable, Error> {
    if opts.replicate_columns.is_empty() {
        return Err(PipelineError::schema(Stage::Consensus, "no replicate columns given").into());
    }
    let columns = profiles.resolve_features(&opts.features, Stage::Consensus)?;
    let groups = profiles.group_rows(&opts.replicate_columns, Stage::Consensus)?;
    let selected = profiles.select_features(&columns);
    let data = selected.features();

    let groups: Vec<(Vec<String>, Vec<usize>)> = groups.into_iter().collect();
    let collapsed = groups
        .par_iter()
        .map(|(_, rows)| collapse(data.select(Axis(0), rows).view(), &opts.operation))
        .collect::<Result<Vec<_>, _>>()?;

    let p = selected.n_features();
    let mut values = Array2::zeros((groups.len(), p));
    for (mut row, c) in values.axis_iter_mut(Axis(0)).zip(collapsed) {
        row.assign(&Array1::from(c));
    }
    let metadata = opts
        .replicate_columns
        .iter()
        .enumerate()
        .map(|(i, name)| MetadataColumn::new(name.clone(), groups.iter().map(|(k, _)| k[i].clone())))
        .collect();
    let out = ProfileTable::new(metadata, selected.feature_names().to_vec(), values)?;
    info!(
        "collapsed {} profiles into {} consensus profiles on ({})",
        profiles.nrows(),
        out.nrows(),
        opts.replicate_columns.join(", ")
    );
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use ndarray::array;

    fn profiles() -> ProfileTable {
        ProfileTable::new(
            vec![
                MetadataColumn::new("Metadata_clone", ["A", "A", "A", "B"]),
                MetadataColumn::new("Metadata_Well", ["W1", "W2", "W3", "W4"]),
            ],
            vec!["Cells_x".to_string(), "Cells_y".to_string(), "Cells_z".to_string()],
            array![
                [1.0, 2.0, 3.0],
                [2.0, 4.0, 6.0],
                [3.0, 2.0, 1.0],
                [7.0, 8.0, 9.0]
            ],
        )
        .unwrap()
    }

    fn opts(operation: ConsensusOperation) -> ConsensusOptions {
        ConsensusOptions {
            replicate_columns: vec!["Metadata_clone".to_string()],
            operation,
            ..ConsensusOptions::default()
        }
    }

    #[test]
    fn test_median_and_mean() {
        let out = consensus(&profiles(), &opts(ConsensusOperation::Median)).unwrap();
        assert_eq!(out.metadata_names(), vec!["Metadata_clone"]);
        assert_eq!(out.metadata_values("Metadata_clone").unwrap(), &["A", "B"]);
        assert_eq!(out.features(), &array![[2.0, 2.0, 3.0], [7.0, 8.0, 9.0]]);

        let out = consensus(&profiles(), &opts(ConsensusOperation::Mean)).unwrap();
        assert_approx_eq!(out.features()[[0, 1]], 8.0 / 3.0);
    }

    #[test]
    fn test_modz_weights() {
        let rows = array![[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [3.0, 2.0, 1.0]];
        let w = modz_weights(rows.view(), &ModzOptions::default()).unwrap();
        // rows 0 and 1 agree, row 2 is anti-correlated with both and falls to min_weight
        assert_approx_eq!(w[0], round_to(0.5 / 1.01, 4));
        assert_approx_eq!(w[1], w[0]);
        assert_approx_eq!(w[2], round_to(0.01 / 1.01, 4));

        let out = consensus(&profiles(), &opts("modz".parse().unwrap())).unwrap();
        let expected = round_to((w[0] * 1.0 + w[1] * 2.0 + w[2] * 3.0) / w.sum(), 4);
        assert_approx_eq!(out.features()[[0, 0]], expected);
        // singleton passes through
        assert_eq!(out.features().row(1).to_vec(), vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_modz_missing_values() {
        let t = ProfileTable::new(
            vec![MetadataColumn::new("Metadata_clone", ["A", "A", "A"])],
            ["Cells_x", "Cells_y", "Cells_z", "Cells_w", "Cells_v"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            array![
                [1.0, 2.0, 3.0, f64::NAN, f64::NAN],
                [2.0, 4.0, 6.0, f64::NAN, f64::NAN],
                [3.0, 2.0, 1.0, 10.0, f64::NAN]
            ],
        )
        .unwrap();
        let out = consensus(&t, &opts("modz".parse().unwrap())).unwrap();
        // weights are renormalized over the replicates that have a value
        assert_approx_eq!(out.features()[[0, 3]], 10.0);
        assert!(out.features()[[0, 4]].is_nan());

        let w = modz_weights(t.features().slice(ndarray::s![.., ..3]), &ModzOptions::default()).unwrap();
        let expected = round_to((w[0] * 3.0 + w[1] * 6.0 + w[2] * 1.0) / w.sum(), 4);
        assert_approx_eq!(out.features()[[0, 2]], expected);

        let median = consensus(&t, &opts(ConsensusOperation::Median)).unwrap();
        assert_approx_eq!(median.features()[[0, 3]], 10.0);
    }

    #[test]
    fn test_modz_constant_replicate() {
        let rows = array![[1.0, 1.0, 1.0], [2.0, 4.0, 6.0]];
        let err = modz_weights(rows.view(), &ModzOptions::default()).unwrap_err();
        assert_eq!(err.stage(), Stage::Consensus);
    }

    #[test]
    fn test_missing_replicate_column() {
        let o = ConsensusOptions {
            replicate_columns: vec!["Metadata_dose".to_string()],
            ..ConsensusOptions::default()
        };
        let err = consensus(&profiles(), &o).unwrap_err();
        assert!(err.to_string().contains("Metadata_dose"));
    }

    #[test]
    fn test_one_row_per_key() {
        let o = ConsensusOptions {
            replicate_columns: vec!["Metadata_clone".to_string(), "Metadata_Well".to_string()],
            ..ConsensusOptions::default()
        };
        let out = consensus(&profiles(), &o).unwrap();
        assert_eq!(out.nrows(), 4);
        assert_eq!(out.features(), profiles().features());
    }

    #[test]
    fn test_operation_json() {
        let op: ConsensusOperation = serde_json::from_str(r#"{"modz": {"method": "pearson"}}"#).unwrap();
        assert_eq!(
            op,
            ConsensusOperation::Modz(ModzOptions {
                method: CorrelationMethod::Pearson,
                ..ModzOptions::default()
            })
        );
    }
}
