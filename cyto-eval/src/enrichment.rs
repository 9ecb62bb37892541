use crate::melt::SimilarityPair;
use profile_stats::{fisher_exact_greater, quantile_of_sorted, sorted_finite};
use profile_types::{PipelineError, Stage};
use serde::Serialize;

/// Enrichment of replicate pairs above one similarity percentile.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Enrichment {
    /// percentile of all similarities used as threshold
    pub percentile: f64,
    /// similarity at that percentile
    pub threshold: f64,
    /// odds of a replicate pair being above the threshold relative to a non-replicate pair
    pub odds_ratio: f64,
    /// one-sided Fisher's exact p-value
    pub p_value: f64,
}

/// For each percentile, contrast replicate and non-replicate pairs above and below the
/// similarity at that percentile with a one-sided Fisher's exact test.
pub fn enrichment(pairs: &[SimilarityPair], percentiles: &[f64]) -> Result<Vec<Enrichment>, PipelineError> {
    if pairs.is_empty() {
        return Err(PipelineError::cardinality(Stage::Evaluate, "no profile pairs to compare"));
    }
    if let Some(p) = percentiles.iter().find(|p| !(0.0..=1.0).contains(*p)) {
        return Err(PipelineError::statistical(
            Stage::Evaluate,
            format!("enrichment percentile must be in [0, 1], got {p}"),
        ));
    }
    let all = sorted_finite(&pairs.iter().map(|p| p.similarity).collect::<Vec<_>>());

    Ok(percentiles
        .iter()
        .map(|&percentile| {
            let threshold = quantile_of_sorted(&all, percentile);
            let mut table = [[0u64; 2]; 2];
            for p in pairs {
                let row = usize::from(!p.group_replicate);
                let col = usize::from(p.similarity <= threshold);
                table[row][col] += 1;
            }
            let fisher = fisher_exact_greater(table);
            Enrichment {
                percentile,
                threshold,
                odds_ratio: fisher.odds_ratio,
                p_value: fisher.p_value,
            }
        })
        .collect())
}
