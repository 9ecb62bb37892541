use crate::error::{PipelineError, Stage};
use serde::{Deserialize, Serialize};

/// Default metadata column prefix
pub const METADATA_PREFIX: &str = "Metadata_";

/// Class of a column in a profile table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnClass {
    /// descriptive field, carried verbatim
    Metadata,
    /// numeric morphology measurement
    Feature,
    /// matched neither rule
    Unclassified,
}

/// What to do with a column that is neither metadata nor a feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnclassifiedPolicy {
    /// refuse to load the table
    #[default]
    Fail,
    /// keep the column as metadata
    Metadata,
    /// leave the column out
    Drop,
}

/// Prefix rule that splits the columns of a table into metadata and features.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnClassifier {
    /// columns starting with this prefix are metadata
    pub metadata_prefix: String,
    /// columns starting with any of these prefixes are features
    pub feature_prefixes: Vec<String>,
    /// handling of everything else
    pub unclassified: UnclassifiedPolicy,
}

impl Default for ColumnClassifier {
    fn default() -> Self {
        ColumnClassifier {
            metadata_prefix: METADATA_PREFIX.to_string(),
            feature_prefixes: vec!["Cells_".to_string(), "Cytoplasm_".to_string(), "Nuclei_".to_string()],
            unclassified: UnclassifiedPolicy::Fail,
        }
    }
}

impl ColumnClassifier {
    /// Classifier that also treats `Image_` columns as features.
    pub fn with_image_features() -> Self {
        let mut c = ColumnClassifier::default();
        c.feature_prefixes.push("Image_".to_string());
        c
    }

    /// Class of a single column name. Metadata wins when both rules match.
    pub fn classify(&self, name: &str) -> ColumnClass {
        if name.starts_with(&self.metadata_prefix) {
            ColumnClass::Metadata
        } else if self.feature_prefixes.iter().any(|p| name.starts_with(p.as_str())) {
            ColumnClass::Feature
        } else {
            ColumnClass::Unclassified
        }
    }

    /// Resolve the class of every column of a header, applying the unclassified policy.
    /// `None` marks a dropped column.
    pub fn resolve(&self, header: &[String], stage: Stage) -> Result<Vec<Option<ColumnClass>>, PipelineError> {
        let mut unclassified = Vec::new();
        let classes = header
            .iter()
            .map(|name| match self.classify(name) {
                ColumnClass::Unclassified => match self.unclassified {
                    UnclassifiedPolicy::Fail => {
                        unclassified.push(name.clone());
                        None
                    }
                    UnclassifiedPolicy::Metadata => Some(ColumnClass::Metadata),
                    UnclassifiedPolicy::Drop => None,
                },
                c => Some(c),
            })
            .collect();
        if !unclassified.is_empty() {
            return Err(PipelineError::schema(
                stage,
                format!(
                    "columns match neither the metadata prefix `{}` nor a feature prefix: {}",
                    self.metadata_prefix,
                    unclassified.join(", ")
                ),
            ));
        }
        Ok(classes)
    }

    /// Add the metadata prefix to a column name unless it already carries it.
    pub fn with_metadata_prefix(&self, name: &str) -> String {
        if name.starts_with(&self.metadata_prefix) {
            name.to_string()
        } else {
            format!("{}{}", self.metadata_prefix, name)
        }
    }
}

/// Which feature columns an operation works on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSpec {
    /// every feature column of the table
    #[default]
    Infer,
    /// exactly these columns, in this order
    Explicit(Vec<String>),
}
