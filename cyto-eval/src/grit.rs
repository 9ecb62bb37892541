//! Grit: how strongly a perturbation's profile agrees with other perturbations of its group,
//! measured in units of its similarity to control perturbations.

use ndarray::Array2;
use profile_stats::Statistics;
use profile_types::{PipelineError, ProfileTable, Stage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// How the z-scored replicate similarities of a perturbation are summarised.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GritSummary {
    /// mean
    #[default]
    Mean,
    /// median
    Median,
}

impl fmt::Display for GritSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GritSummary::Mean => "mean",
            GritSummary::Median => "median",
        })
    }
}

/// Grit of one perturbation. `grit` is `None` when the perturbation has no other
/// perturbation in its group to compare against.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GritScore {
    /// profile id (guide, compound)
    pub perturbation: String,
    /// group id (gene, mechanism)
    pub group: String,
    /// z-scored similarity to the group
    pub grit: Option<f64>,
}

/// Distinct profile ids whose group is one of `control_groups`.
pub fn control_perturbations(
    profiles: &ProfileTable,
    profile_col: &str,
    group_col: &str,
    control_groups: &[String],
) -> Result<Vec<String>, PipelineError> {
    let cols = profiles.require_metadata(&[profile_col, group_col], Stage::Evaluate)?;
    let controls: BTreeSet<&String> = cols[0]
        .iter()
        .zip(cols[1])
        .filter(|(_, g)| control_groups.contains(g))
        .map(|(p, _)| p)
        .collect();
    Ok(controls.into_iter().cloned().collect())
}

/// Grit of every non-control perturbation.
///
/// For each row of a perturbation, its similarities to rows of other perturbations in the
/// same group are z-scored against its similarities to control rows (mean and population
/// standard deviation, a zero deviation counted as one); all z-scores of the perturbation
/// are then summarised.
pub fn grit(
    sim: &Array2<f64>,
    perturbations: &[String],
    groups: &[String],
    control_perts: &[String],
    summary: GritSummary,
) -> Result<Vec<GritScore>, PipelineError> {
    if control_perts.is_empty() {
        return Err(PipelineError::statistical(Stage::Evaluate, "grit needs control perturbations"));
    }
    let is_control: Vec<bool> = perturbations.iter().map(|p| control_perts.contains(p)).collect();
    if !is_control.iter().any(|c| *c) {
        return Err(PipelineError::schema(
            Stage::Evaluate,
            format!("none of the control perturbations are present: {}", control_perts.join(", ")),
        ));
    }

    let mut rows_of: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, p) in perturbations.iter().enumerate() {
        if !is_control[i] {
            rows_of.entry(p.as_str()).or_default().push(i);
        }
    }

    let mut scores = Vec::with_capacity(rows_of.len());
    for (pert, rows) in rows_of {
        let group = &groups[rows[0]];
        let mut z = vec![];
        for &i in &rows {
            let control: Vec<f64> = (0..perturbations.len())
                .filter(|&j| j != i && is_control[j] && !sim[[i, j]].is_nan())
                .map(|j| sim[[i, j]])
                .collect();
            if control.len() < 2 {
                return Err(PipelineError::statistical(
                    Stage::Evaluate,
                    format!(
                        "perturbation {} has {} control comparisons, at least 2 are needed",
                        pert,
                        control.len()
                    ),
                ));
            }
            let mean = control.mean();
            let sd = match control.std(0.0) {
                s if s > 0.0 => s,
                _ => 1.0,
            };
            z.extend(
                (0..perturbations.len())
                    .filter(|&j| {
                        !is_control[j] && groups[j] == *group && perturbations[j] != pert && !sim[[i, j]].is_nan()
                    })
                    .map(|j| (sim[[i, j]] - mean) / sd),
            );
        }
        let grit = (!z.is_empty()).then(|| match summary {
            GritSummary::Mean => z.mean(),
            GritSummary::Median => z.median(),
        });
        scores.push(GritScore {
            perturbation: pert.to_string(),
            group: group.clone(),
            grit,
        });
    }
    Ok(scores)
}
