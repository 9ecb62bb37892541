use crate::enrichment::{enrichment, Enrichment};
use crate::grit::{grit, GritScore, GritSummary};
use crate::melt::{similarity_matrix, similarity_melt};
use crate::reproducibility::{replicate_reproducibility, Reproducibility};
use anyhow::Error;
use cyto_rs::io::{write_serialized, write_table, WriteOptions};
use itertools::Itertools;
use log::{info, warn};
use ndarray::Array2;
use noisy_float::prelude::n64;
use profile_stats::CorrelationMethod;
use profile_types::{FeatureSpec, MetadataColumn, PipelineError, ProfileTable, Stage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::path::Path;

/// How profiles are grouped into replicates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicateGroups {
    /// rows sharing every listed column are replicates
    Columns(Vec<String>),
    /// profile id and group id columns of a grit evaluation
    Grit {
        /// perturbation id column
        profile_col: String,
        /// perturbation group column
        group_col: String,
    },
}

/// Metric to compute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    /// fraction of replicate pairs above a null quantile
    ReplicateReproducibility {
        /// quantile of the non-replicate similarities used as threshold
        quantile_over_null: f64,
        /// also report the median similarity of every replicate group
        return_median_correlations: bool,
    },
    /// Fisher's exact enrichment of replicate pairs above similarity percentiles
    Enrichment {
        /// percentiles in `[0, 1]`
        percentiles: Vec<f64>,
    },
    /// phenotype strength against control perturbations
    Grit {
        /// perturbation ids of the controls
        control_perts: Vec<String>,
        /// summary of the z-scores
        summary: GritSummary,
    },
}

impl Operation {
    /// Replicate reproducibility with the 0.95 null quantile.
    pub fn replicate_reproducibility() -> Self {
        Operation::ReplicateReproducibility {
            quantile_over_null: 0.95,
            return_median_correlations: false,
        }
    }

    /// Enrichment at the percentiles used by the evaluation notebooks.
    pub fn enrichment() -> Self {
        Operation::Enrichment {
            percentiles: vec![0.99, 0.95, 0.9, 0.75, 0.5],
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Operation::ReplicateReproducibility { .. } => "replicate_reproducibility",
            Operation::Enrichment { .. } => "enrichment",
            Operation::Grit { .. } => "grit",
        }
    }
}

/// Options of a profile evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluateOptions {
    /// features the similarities are computed over
    #[serde(default)]
    pub features: FeatureSpec,
    /// metadata columns the evaluation may refer to
    pub meta_features: Vec<String>,
    /// replicate grouping
    pub replicate_groups: ReplicateGroups,
    /// metric
    pub operation: Operation,
    /// similarity between profiles
    #[serde(default)]
    pub similarity_metric: CorrelationMethod,
}

/// Output of [`evaluate`].
#[derive(Clone, Debug, PartialEq)]
pub enum Evaluation {
    /// replicate reproducibility
    ReplicateReproducibility(Reproducibility),
    /// one row per percentile
    Enrichment(Vec<Enrichment>),
    /// one score per non-control perturbation
    Grit(Vec<GritScore>),
}

fn check_meta_features(profiles: &ProfileTable, opts: &EvaluateOptions) -> Result<(), PipelineError> {
    profiles.require_metadata(&opts.meta_features, Stage::Evaluate)?;
    let grouping: Vec<&String> = match &opts.replicate_groups {
        ReplicateGroups::Columns(cols) => cols.iter().collect(),
        ReplicateGroups::Grit { profile_col, group_col } => vec![profile_col, group_col],
    };
    let outside: Vec<&String> = grouping
        .into_iter()
        .filter(|c| !opts.meta_features.contains(c))
        .collect();
    if !outside.is_empty() {
        return Err(PipelineError::schema(
            Stage::Evaluate,
            format!("replicate group columns must be meta features: {}", outside.iter().join(", ")),
        ));
    }
    Ok(())
}

/// Evaluate the quality of a set of profiles.
pub fn evaluate(profiles: &ProfileTable, opts: &EvaluateOptions) -> Result<Evaluation, Error> {
    check_meta_features(profiles, opts)?;
    let features = profiles.resolve_features(&opts.features, Stage::Evaluate)?;
    if features.is_empty() {
        return Err(PipelineError::schema(Stage::Evaluate, "no features to compare profiles on").into());
    }
    let sim = similarity_matrix(profiles, &features, opts.similarity_metric)?;

    let res = match (&opts.operation, &opts.replicate_groups) {
        (Operation::Grit { control_perts, summary }, ReplicateGroups::Grit { profile_col, group_col }) => {
            let cols = profiles.require_metadata(&[profile_col, group_col], Stage::Evaluate)?;
            let scores = grit(&sim, cols[0], cols[1], control_perts, *summary)?;
            let undefined = scores.iter().filter(|s| s.grit.is_none()).count();
            if undefined > 0 {
                warn!("{} of {} perturbations have no grit: no other perturbation in their group", undefined, scores.len());
            }
            Evaluation::Grit(scores)
        }
        (Operation::Grit { .. }, ReplicateGroups::Columns(_)) => {
            return Err(PipelineError::schema(
                Stage::Evaluate,
                "grit needs replicate groups given as profile and group columns",
            )
            .into())
        }
        (op, ReplicateGroups::Grit { .. }) => {
            return Err(PipelineError::schema(
                Stage::Evaluate,
                format!("{} needs replicate groups given as columns", op.name()),
            )
            .into())
        }
        (op, ReplicateGroups::Columns(cols)) => {
            let values = profiles.require_metadata(cols, Stage::Evaluate)?;
            let keys: Vec<Vec<&str>> = (0..profiles.nrows())
                .map(|r| values.iter().map(|c| c[r].as_str()).collect())
                .collect();
            let pairs = similarity_melt(&sim, &keys)?;
            match op {
                Operation::ReplicateReproducibility {
                    quantile_over_null,
                    return_median_correlations,
                } => Evaluation::ReplicateReproducibility(replicate_reproducibility(
                    &pairs,
                    &keys,
                    *quantile_over_null,
                    *return_median_correlations,
                )?),
                Operation::Enrichment { percentiles } => Evaluation::Enrichment(enrichment(&pairs, percentiles)?),
                Operation::Grit { .. } => unreachable!("grit is handled above"),
            }
        }
    };
    info!(
        "{} over {} profiles x {} features ({})",
        opts.operation.name(),
        profiles.nrows(),
        features.len(),
        opts.similarity_metric
    );
    Ok(res)
}

/// Grit of one perturbation within one stratum (cell line, plate).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StratumGrit {
    /// stratum value
    pub stratum: String,
    /// profile id
    pub perturbation: String,
    /// group id
    pub group: String,
    /// grit; empty when undefined
    pub grit: Option<f64>,
}

/// Grit computed separately within each stratum.
#[derive(Clone, Debug, PartialEq)]
pub struct StratifiedGrit {
    /// scores sorted by grit, highest first; undefined scores last
    pub scores: Vec<StratumGrit>,
    /// number of undefined scores
    pub undefined: usize,
}

/// Run a grit evaluation within every distinct value of `stratum_col` and rank the
/// combined scores. Undefined scores are kept and counted, not dropped.
pub fn grit_by_stratum(profiles: &ProfileTable, stratum_col: &str, opts: &EvaluateOptions) -> Result<StratifiedGrit, Error> {
    if !matches!(opts.operation, Operation::Grit { .. }) {
        return Err(PipelineError::schema(Stage::Evaluate, "stratified evaluation is only defined for grit").into());
    }
    let strata = profiles.group_rows(&[stratum_col], Stage::Evaluate)?;
    let per_stratum = strata
        .into_iter()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|(key, rows)| {
            let subset = profiles.select_rows(&rows);
            match evaluate(&subset, opts) {
                Ok(Evaluation::Grit(scores)) => Ok(scores
                    .into_iter()
                    .map(|s| StratumGrit {
                        stratum: key[0].clone(),
                        perturbation: s.perturbation,
                        group: s.group,
                        grit: s.grit,
                    })
                    .collect::<Vec<_>>()),
                Ok(_) => unreachable!("grit evaluation returns grit scores"),
                Err(e) => Err(e.context(format!("{} = {}", stratum_col, key[0]))),
            }
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let mut scores: Vec<StratumGrit> = per_stratum.into_iter().flatten().collect();
    scores.sort_by_key(|s| Reverse(s.grit.map(n64)));
    let undefined = scores.iter().filter(|s| s.grit.is_none()).count();
    if undefined > 0 {
        warn!(
            "{} of {} grit scores are undefined ({} strata)",
            undefined,
            scores.len(),
            scores.iter().map(|s| &s.stratum).unique().count()
        );
    }
    Ok(StratifiedGrit { scores, undefined })
}

/// Write an evaluation result as a delimited table.
pub fn write_evaluation(
    evaluation: &Evaluation,
    path: impl AsRef<Path>,
    opts: &WriteOptions,
) -> Result<(), Error> {
    match evaluation {
        Evaluation::ReplicateReproducibility(r) => write_serialized(std::slice::from_ref(r), path, opts),
        Evaluation::Enrichment(rows) => write_serialized(rows, path, opts),
        Evaluation::Grit(rows) => write_serialized(rows, path, opts),
    }
}

/// Write the per-group median replicate similarities, one column per replicate column.
pub fn write_median_correlations(
    reproducibility: &Reproducibility,
    replicate_columns: &[String],
    path: impl AsRef<Path>,
    opts: &WriteOptions,
) -> Result<(), Error> {
    let Some(medians) = &reproducibility.median_correlations else {
        return Err(PipelineError::schema(Stage::Evaluate, "median correlations were not computed").into());
    };
    let metadata = replicate_columns
        .iter()
        .enumerate()
        .map(|(i, name)| MetadataColumn::new(name.clone(), medians.iter().map(|m| m.group[i].clone())))
        .collect();
    let values = Array2::from_shape_vec((medians.len(), 1), medians.iter().map(|m| m.similarity).collect())?;
    let table = ProfileTable::new(metadata, vec!["similarity_metric".to_string()], values)?;
    write_table(&table, path, opts)
}
