use itertools::Itertools;
use ndarray::{Array2, Axis};
use profile_stats::{row_similarity, CorrelationMethod};
use profile_types::{PipelineError, ProfileTable, Stage};

/// Similarity between two profiles, `a < b` as row indices.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimilarityPair {
    /// first row
    pub a: usize,
    /// second row
    pub b: usize,
    /// similarity across features
    pub similarity: f64,
    /// both rows share every replicate column value
    pub group_replicate: bool,
}

/// Row by row similarity over the selected feature columns. A constant profile has no
/// correlation with anything and is a statistical error naming the rows.
pub fn similarity_matrix(
    profiles: &ProfileTable,
    features: &[usize],
    method: CorrelationMethod,
) -> Result<Array2<f64>, PipelineError> {
    let data = profiles.features().select(Axis(1), features);
    let sim = row_similarity(data.view(), method);
    let constant: Vec<usize> = (0..sim.nrows()).filter(|&i| sim[[i, i]].is_nan()).collect();
    if !constant.is_empty() {
        return Err(PipelineError::statistical(
            Stage::Evaluate,
            format!(
                "{} profiles are constant across the features, similarity is undefined for rows {}",
                constant.len(),
                constant.iter().take(10).join(", ")
            ),
        ));
    }
    Ok(sim)
}

/// Every unordered pair of distinct rows with its similarity. `keys[i]` is the replicate
/// key of row `i`. An undefined similarity fails rather than leaving the pair out.
pub fn similarity_melt(sim: &Array2<f64>, keys: &[Vec<&str>]) -> Result<Vec<SimilarityPair>, PipelineError> {
    let n = sim.nrows();
    let mut pairs = Vec::with_capacity(n * n.saturating_sub(1) / 2);
    for a in 0..n {
        for b in (a + 1)..n {
            let similarity = sim[[a, b]];
            if similarity.is_nan() {
                return Err(PipelineError::statistical(
                    Stage::Evaluate,
                    format!("similarity of rows {a} and {b} is undefined: too few features present in both"),
                ));
            }
            pairs.push(SimilarityPair {
                a,
                b,
                similarity,
                group_replicate: keys[a] == keys[b],
            });
        }
    }
    Ok(pairs)
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;
    use profile_types::MetadataColumn;

    fn table(values: Array2<f64>) -> ProfileTable {
        ProfileTable::new(
            vec![MetadataColumn::new("Metadata_g", ["x", "x", "y", "y"])],
            vec!["f1".to_string(), "f2".to_string(), "f3".to_string()],
            values,
        )
        .unwrap()
    }

    fn keys(t: &ProfileTable) -> Vec<Vec<&str>> {
        t.metadata_values("Metadata_g")
            .unwrap()
            .iter()
            .map(|v| vec![v.as_str()])
            .collect()
    }

    #[test]
    fn test_melt() {
        let t = table(array![[1.0, 2.0, 3.0], [1.0, 2.0, 4.0], [3.0, 2.0, 1.0], [5.0, 4.0, 5.0]]);
        let sim = similarity_matrix(&t, &[0, 1, 2], CorrelationMethod::Pearson).unwrap();
        let pairs = similarity_melt(&sim, &keys(&t)).unwrap();
        assert_eq!(pairs.len(), 6);
        assert_eq!((pairs[0].a, pairs[0].b), (0, 1));
        assert!(pairs[0].group_replicate);
        assert!(!pairs[1].group_replicate);
        assert!((pairs[1].similarity + 1.0).abs() < 1e-12);
        assert!(pairs[5].group_replicate);
    }

    #[test]
    fn test_constant_profile() {
        let t = table(array![[1.0, 2.0, 3.0], [1.0, 2.0, 4.0], [3.0, 2.0, 1.0], [5.0, 5.0, 5.0]]);
        let err = similarity_matrix(&t, &[0, 1, 2], CorrelationMethod::Pearson).unwrap_err();
        match err {
            PipelineError::Statistical { detail, .. } => assert!(detail.ends_with("rows 3")),
            e => panic!("unexpected error {e:?}"),
        }
    }

    #[test]
    fn test_undefined_pair() {
        let sim = array![[1.0, f64::NAN], [f64::NAN, 1.0]];
        let err = similarity_melt(&sim, &[vec!["x"], vec!["y"]]).unwrap_err();
        assert_eq!(err.stage(), Stage::Evaluate);
    }
}
