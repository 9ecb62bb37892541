use crate::columns::FeatureSpec;
use crate::error::{PipelineError, Stage};
use itertools::Itertools;
use ndarray::{concatenate, Array2, ArrayView1, Axis};
use std::collections::{BTreeMap, HashSet};

/// A named metadata column. Values are kept verbatim; a missing value is the empty string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataColumn {
    /// column name, including its metadata prefix
    pub name: String,
    /// one value per row
    pub values: Vec<String>,
}

impl MetadataColumn {
    /// Column from a name and its row values.
    pub fn new<S: Into<String>>(name: impl Into<String>, values: impl IntoIterator<Item = S>) -> Self {
        MetadataColumn {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Row-per-sample table of metadata and numeric features. Missing feature values are `NaN`.
///
/// Rows are wells, replicates or consensus units depending on the stage that produced the
/// table. Tables are never modified in place by a stage: every stage builds a new one.
#[derive(Clone, Debug)]
pub struct ProfileTable {
    metadata: Vec<MetadataColumn>,
    feature_names: Vec<String>,
    features: Array2<f64>,
}

impl ProfileTable {
    /// Assemble a table, checking that every column has one value per row and that no
    /// column name is used twice.
    pub fn new(
        metadata: Vec<MetadataColumn>,
        feature_names: Vec<String>,
        features: Array2<f64>,
    ) -> Result<ProfileTable, PipelineError> {
        if feature_names.len() != features.ncols() {
            return Err(PipelineError::schema(
                Stage::Io,
                format!(
                    "{} feature names for a matrix with {} columns",
                    feature_names.len(),
                    features.ncols()
                ),
            ));
        }
        if let Some(c) = metadata.iter().find(|c| c.values.len() != features.nrows()) {
            return Err(PipelineError::schema(
                Stage::Io,
                format!(
                    "metadata column {} has {} values, expected {}",
                    c.name,
                    c.values.len(),
                    features.nrows()
                ),
            ));
        }
        let mut seen = HashSet::new();
        let duplicated = metadata
            .iter()
            .map(|c| c.name.as_str())
            .chain(feature_names.iter().map(String::as_str))
            .filter(|n| !seen.insert(*n))
            .collect::<Vec<_>>();
        if !duplicated.is_empty() {
            return Err(PipelineError::schema(
                Stage::Io,
                format!("duplicated column names: {}", duplicated.join(", ")),
            ));
        }
        Ok(ProfileTable {
            metadata,
            feature_names,
            features,
        })
    }

    /// Table with metadata only and no feature columns.
    pub fn from_metadata(metadata: Vec<MetadataColumn>) -> Result<ProfileTable, PipelineError> {
        let n = metadata.first().map_or(0, |c| c.values.len());
        ProfileTable::new(metadata, vec![], Array2::zeros((n, 0)))
    }

    /// Number of rows.
    pub fn nrows(&self) -> usize {
        self.features.nrows()
    }

    /// True when the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.nrows() == 0
    }

    /// Number of feature columns.
    pub fn n_features(&self) -> usize {
        self.features.ncols()
    }

    /// Metadata columns in table order.
    pub fn metadata(&self) -> &[MetadataColumn] {
        &self.metadata
    }

    /// Metadata column names in table order.
    pub fn metadata_names(&self) -> Vec<&str> {
        self.metadata.iter().map(|c| c.name.as_str()).collect()
    }

    /// Feature column names, aligned with the columns of [`ProfileTable::features`].
    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Row-by-feature matrix.
    pub fn features(&self) -> &Array2<f64> {
        &self.features
    }

    /// One feature column.
    pub fn feature(&self, index: usize) -> ArrayView1<'_, f64> {
        self.features.column(index)
    }

    /// Take the table apart into metadata, feature names and the feature matrix.
    pub fn into_parts(self) -> (Vec<MetadataColumn>, Vec<String>, Array2<f64>) {
        (self.metadata, self.feature_names, self.features)
    }

    /// Values of the named metadata column, if present.
    pub fn metadata_values(&self, name: &str) -> Option<&[String]> {
        self.metadata
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.values.as_slice())
    }

    /// Position of the named feature column.
    pub fn feature_index(&self, name: &str) -> Option<usize> {
        self.feature_names.iter().position(|f| f == name)
    }

    /// Indices of the feature columns an operation should use.
    pub fn resolve_features(&self, spec: &FeatureSpec, stage: Stage) -> Result<Vec<usize>, PipelineError> {
        match spec {
            FeatureSpec::Infer => Ok((0..self.n_features()).collect()),
            FeatureSpec::Explicit(names) => {
                let (found, missing): (Vec<_>, Vec<_>) = names
                    .iter()
                    .map(|n| self.feature_index(n).ok_or(n.as_str()))
                    .partition(Result::is_ok);
                if !missing.is_empty() {
                    return Err(PipelineError::schema(
                        stage,
                        format!(
                            "feature columns not found: {}",
                            missing.into_iter().filter_map(Result::err).join(", ")
                        ),
                    ));
                }
                Ok(found.into_iter().filter_map(Result::ok).collect())
            }
        }
    }

    /// Value slices for the named metadata columns; all must exist.
    pub fn require_metadata<S: AsRef<str>>(&self, names: &[S], stage: Stage) -> Result<Vec<&[String]>, PipelineError> {
        let missing = names
            .iter()
            .map(|n| n.as_ref())
            .filter(|n| self.metadata_values(n).is_none())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(PipelineError::schema(
                stage,
                format!(
                    "metadata columns not found: {} (available: {})",
                    missing.join(", "),
                    self.metadata_names().join(", ")
                ),
            ));
        }
        Ok(names
            .iter()
            .filter_map(|n| self.metadata_values(n.as_ref()))
            .collect())
    }

    /// Rows grouped by the values of `columns`, keys in sorted order.
    pub fn group_rows<S: AsRef<str>>(
        &self,
        columns: &[S],
        stage: Stage,
    ) -> Result<BTreeMap<Vec<String>, Vec<usize>>, PipelineError> {
        let cols = self.require_metadata(columns, stage)?;
        let mut groups: BTreeMap<Vec<String>, Vec<usize>> = BTreeMap::new();
        for row in 0..self.nrows() {
            let key = cols.iter().map(|c| c[row].clone()).collect();
            groups.entry(key).or_default().push(row);
        }
        Ok(groups)
    }

    /// Fails with a cardinality error naming the first repeated key.
    pub fn assert_unique<S: AsRef<str>>(&self, columns: &[S], stage: Stage) -> Result<(), PipelineError> {
        let groups = self.group_rows(columns, stage)?;
        if let Some((key, rows)) = groups.iter().find(|(_, rows)| rows.len() > 1) {
            return Err(PipelineError::cardinality(
                stage,
                format!(
                    "key ({}) = ({}) is shared by {} rows",
                    columns.iter().map(|n| n.as_ref()).join(", "),
                    key.join(", "),
                    rows.len()
                ),
            ));
        }
        Ok(())
    }

    /// Subset (and reorder) rows.
    pub fn select_rows(&self, rows: &[usize]) -> ProfileTable {
        ProfileTable {
            metadata: self
                .metadata
                .iter()
                .map(|c| MetadataColumn {
                    name: c.name.clone(),
                    values: rows.iter().map(|&r| c.values[r].clone()).collect(),
                })
                .collect(),
            feature_names: self.feature_names.clone(),
            features: self.features.select(Axis(0), rows),
        }
    }

    /// Subset (and reorder) feature columns. Metadata is untouched.
    pub fn select_features(&self, columns: &[usize]) -> ProfileTable {
        ProfileTable {
            metadata: self.metadata.clone(),
            feature_names: columns.iter().map(|&c| self.feature_names[c].clone()).collect(),
            features: self.features.select(Axis(1), columns),
        }
    }

    /// Same metadata, new feature block.
    pub fn with_features(&self, feature_names: Vec<String>, features: Array2<f64>) -> Result<ProfileTable, PipelineError> {
        ProfileTable::new(self.metadata.clone(), feature_names, features)
    }

    /// Append a metadata column after the existing ones.
    pub fn push_metadata(&mut self, column: MetadataColumn) -> Result<(), PipelineError> {
        if column.values.len() != self.nrows() {
            return Err(PipelineError::schema(
                Stage::Io,
                format!(
                    "metadata column {} has {} values, expected {}",
                    column.name,
                    column.values.len(),
                    self.nrows()
                ),
            ));
        }
        if self.metadata_values(&column.name).is_some() || self.feature_index(&column.name).is_some() {
            return Err(PipelineError::schema(
                Stage::Io,
                format!("column {} already exists", column.name),
            ));
        }
        self.metadata.push(column);
        Ok(())
    }

    /// Stack tables with identical column layouts.
    pub fn concat(tables: &[ProfileTable]) -> Result<ProfileTable, PipelineError> {
        let Some(first) = tables.first() else {
            return Err(PipelineError::cardinality(Stage::Io, "no tables to concatenate"));
        };
        for t in &tables[1..] {
            if t.metadata_names() != first.metadata_names() || t.feature_names != first.feature_names {
                return Err(PipelineError::schema(
                    Stage::Io,
                    "tables to concatenate have different columns",
                ));
            }
        }
        let metadata = first
            .metadata
            .iter()
            .enumerate()
            .map(|(i, c)| MetadataColumn {
                name: c.name.clone(),
                values: tables.iter().flat_map(|t| t.metadata[i].values.iter().cloned()).collect(),
            })
            .collect();
        let views = tables.iter().map(|t| t.features.view()).collect::<Vec<_>>();
        let features = concatenate(Axis(0), &views)
            .map_err(|e| PipelineError::schema(Stage::Io, format!("cannot stack feature blocks: {e}")))?;
        ProfileTable::new(metadata, first.feature_names.clone(), features)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    fn table() -> ProfileTable {
        ProfileTable::new(
            vec![
                MetadataColumn::new("Metadata_Plate", ["P1", "P1", "P1", "P1"]),
                MetadataColumn::new("Metadata_Well", ["A01", "A02", "A01", "B01"]),
            ],
            vec!["Cells_a".to_string(), "Nuclei_b".to_string()],
            array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0], [7.0, f64::NAN]],
        )
        .unwrap()
    }

    #[test]
    fn test_new_validates_shape() {
        let err = ProfileTable::new(
            vec![MetadataColumn::new("Metadata_Well", ["A01"])],
            vec!["Cells_a".to_string()],
            Array2::zeros((2, 1)),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Metadata_Well"));

        let err = ProfileTable::new(
            vec![MetadataColumn::new("Cells_a", ["x"])],
            vec!["Cells_a".to_string()],
            Array2::zeros((1, 1)),
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicated"));
    }

    #[test]
    fn test_group_rows_and_unique() {
        let t = table();
        let g = t.group_rows(&["Metadata_Well"], Stage::Consensus).unwrap();
        assert_eq!(g.len(), 3);
        assert_eq!(g[&vec!["A01".to_string()]], vec![0, 2]);

        let err = t.assert_unique(&["Metadata_Plate", "Metadata_Well"], Stage::Aggregate).unwrap_err();
        assert!(matches!(err, PipelineError::Cardinality { .. }));
        assert!(err.to_string().contains("(P1, A01)"));

        assert!(t.select_rows(&[0, 1, 3]).assert_unique(&["Metadata_Well"], Stage::Aggregate).is_ok());
    }

    #[test]
    fn test_resolve_features() {
        let t = table();
        assert_eq!(t.resolve_features(&FeatureSpec::Infer, Stage::Normalize).unwrap(), vec![0, 1]);
        assert_eq!(
            t.resolve_features(&FeatureSpec::Explicit(vec!["Nuclei_b".to_string()]), Stage::Normalize)
                .unwrap(),
            vec![1]
        );
        let err = t
            .resolve_features(&FeatureSpec::Explicit(vec!["Cells_z".to_string()]), Stage::Normalize)
            .unwrap_err();
        assert!(err.to_string().contains("Cells_z"));
    }

    #[test]
    fn test_select_and_concat() {
        let t = table();
        let a = t.select_rows(&[3, 0]);
        assert_eq!(a.metadata_values("Metadata_Well").unwrap(), ["B01", "A01"]);
        assert_eq!(a.features()[[1, 1]], 2.0);

        let f = t.select_features(&[1]);
        assert_eq!(f.feature_names(), ["Nuclei_b"]);
        assert_eq!(f.metadata().len(), 2);

        let both = ProfileTable::concat(&[a.clone(), a]).unwrap();
        assert_eq!(both.nrows(), 4);
        assert_eq!(both.metadata_values("Metadata_Well").unwrap()[2], "B01");
        assert!(ProfileTable::concat(&[t.clone(), f]).is_err());
    }

    #[test]
    fn test_push_metadata() {
        let mut t = table();
        t.push_metadata(MetadataColumn::new("Metadata_cell_line", ["A549"; 4])).unwrap();
        assert_eq!(t.metadata_names().last(), Some(&"Metadata_cell_line"));
        assert!(t.push_metadata(MetadataColumn::new("Metadata_Well", ["x"; 4])).is_err());
        assert!(t.push_metadata(MetadataColumn::new("Metadata_short", ["x"])).is_err());
    }
}
