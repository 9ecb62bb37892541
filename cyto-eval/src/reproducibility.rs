use crate::melt::SimilarityPair;
use profile_stats::{quantile_of_sorted, sorted_finite, Statistics};
use profile_types::{PipelineError, Stage};
use serde::Serialize;
use std::collections::BTreeMap;

/// Median similarity among the replicates of one group.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MedianCorrelation {
    /// replicate key
    pub group: Vec<String>,
    /// median of the pairwise replicate similarities
    pub similarity: f64,
}

/// Result of the replicate reproducibility evaluation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Reproducibility {
    /// fraction of replicate pairs above the threshold
    pub score: f64,
    /// quantile of the non-replicate similarities
    pub threshold: f64,
    /// replicate pairs compared
    pub replicate_pairs: usize,
    /// per-group medians, when requested
    #[serde(skip)]
    pub median_correlations: Option<Vec<MedianCorrelation>>,
}

/// Fraction of replicate pairs whose similarity exceeds the `quantile_over_null` quantile
/// of the non-replicate similarities.
pub fn replicate_reproducibility(
    pairs: &[SimilarityPair],
    keys: &[Vec<&str>],
    quantile_over_null: f64,
    return_median_correlations: bool,
) -> Result<Reproducibility, PipelineError> {
    if !(0.0..=1.0).contains(&quantile_over_null) {
        return Err(PipelineError::statistical(
            Stage::Evaluate,
            format!("quantile_over_null must be in [0, 1], got {quantile_over_null}"),
        ));
    }
    let (replicates, null): (Vec<&SimilarityPair>, Vec<&SimilarityPair>) =
        pairs.iter().partition(|p| p.group_replicate);
    if replicates.is_empty() {
        return Err(PipelineError::cardinality(
            Stage::Evaluate,
            "no replicate pairs: every replicate group has a single profile",
        ));
    }
    if null.is_empty() {
        return Err(PipelineError::cardinality(
            Stage::Evaluate,
            "no non-replicate pairs: all profiles belong to one replicate group",
        ));
    }

    let null_sims = sorted_finite(&null.iter().map(|p| p.similarity).collect::<Vec<_>>());
    let threshold = quantile_of_sorted(&null_sims, quantile_over_null);
    let above = replicates.iter().filter(|p| p.similarity > threshold).count();
    let score = above as f64 / replicates.len() as f64;

    let median_correlations = return_median_correlations.then(|| {
        let mut groups: BTreeMap<&[&str], Vec<f64>> = BTreeMap::new();
        for p in &replicates {
            groups.entry(keys[p.a].as_slice()).or_default().push(p.similarity);
        }
        groups
            .into_iter()
            .map(|(k, sims)| MedianCorrelation {
                group: k.iter().map(|s| s.to_string()).collect(),
                similarity: sims.median(),
            })
            .collect()
    });

    Ok(Reproducibility {
        score,
        threshold,
        replicate_pairs: replicates.len(),
        median_correlations,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn pair(a: usize, b: usize, similarity: f64, group_replicate: bool) -> SimilarityPair {
        SimilarityPair {
            a,
            b,
            similarity,
            group_replicate,
        }
    }

    #[test]
    fn test_score() {
        let keys = vec![vec!["x"], vec!["x"], vec!["y"], vec!["y"], vec!["z"]];
        let pairs = vec![
            pair(0, 1, 0.9, true),
            pair(2, 3, 0.1, true),
            pair(0, 2, 0.0, false),
            pair(0, 3, 0.2, false),
            pair(1, 2, -0.5, false),
            pair(1, 4, 0.4, false),
        ];
        let r = replicate_reproducibility(&pairs, &keys, 0.5, true).unwrap();
        // null sorted: -0.5, 0.0, 0.2, 0.4 -> median 0.1, and 0.1 is not strictly above
        assert_approx_eq!(r.threshold, 0.1);
        assert_approx_eq!(r.score, 0.5);
        assert_eq!(r.replicate_pairs, 2);
        let medians = r.median_correlations.unwrap();
        assert_eq!(medians.len(), 2);
        assert_eq!(medians[0].group, vec!["x".to_string()]);
        assert_approx_eq!(medians[0].similarity, 0.9);
    }

    #[test]
    fn test_requires_both_kinds_of_pairs() {
        let keys = vec![vec!["x"], vec!["y"]];
        let err = replicate_reproducibility(&[pair(0, 1, 0.3, false)], &keys, 0.95, false).unwrap_err();
        assert!(matches!(err, PipelineError::Cardinality { .. }));

        let keys = vec![vec!["x"], vec!["x"]];
        let err = replicate_reproducibility(&[pair(0, 1, 0.3, true)], &keys, 0.95, false).unwrap_err();
        assert!(matches!(err, PipelineError::Cardinality { .. }));
    }
}
