use std::fmt;
use thiserror::Error;

/// Pipeline stage that raised an error. Used in messages so that a failure can be traced
/// back to the step that needs corrected inputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// reading a single-cell store or platemap
    Load,
    /// single-cell to well aggregation
    Aggregate,
    /// platemap annotation
    Annotate,
    /// normalization against a reference subset
    Normalize,
    /// feature selection
    FeatureSelect,
    /// replicate consensus
    Consensus,
    /// profile quality evaluation
    Evaluate,
    /// table file reading and writing
    Io,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Load => "load",
            Stage::Aggregate => "aggregate",
            Stage::Annotate => "annotate",
            Stage::Normalize => "normalize",
            Stage::FeatureSelect => "feature_select",
            Stage::Consensus => "consensus",
            Stage::Evaluate => "evaluate",
            Stage::Io => "io",
        };
        f.write_str(name)
    }
}

/// Domain errors. Library functions return `anyhow::Result`; these are wrapped inside so
/// callers can `downcast_ref::<PipelineError>()` to tell the classes apart.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing, unclassified or colliding columns, or an empty reference subset.
    #[error("[{stage}] schema error: {detail}")]
    Schema {
        /// stage raising the error
        stage: Stage,
        /// offending columns / predicate
        detail: String,
    },
    /// Joins that fan out, keys that are not unique, groups that come out empty.
    #[error("[{stage}] cardinality error: {detail}")]
    Cardinality {
        /// stage raising the error
        stage: Stage,
        /// offending keys
        detail: String,
    },
    /// Computations that are not defined for the data they were given.
    #[error("[{stage}] statistical error: {detail}")]
    Statistical {
        /// stage raising the error
        stage: Stage,
        /// offending columns / parameters
        detail: String,
    },
    /// A feature-selection operation failed; nothing was removed.
    #[error("[feature_select] operation `{operation}` failed on columns [{}]: {source}", columns.join(", "))]
    Selection {
        /// operation name
        operation: String,
        /// columns that triggered the failure
        columns: Vec<String>,
        /// underlying failure
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Schema error constructor
    pub fn schema(stage: Stage, detail: impl Into<String>) -> Self {
        PipelineError::Schema {
            stage,
            detail: detail.into(),
        }
    }

    /// Cardinality error constructor
    pub fn cardinality(stage: Stage, detail: impl Into<String>) -> Self {
        PipelineError::Cardinality {
            stage,
            detail: detail.into(),
        }
    }

    /// Statistical-validity error constructor
    pub fn statistical(stage: Stage, detail: impl Into<String>) -> Self {
        PipelineError::Statistical {
            stage,
            detail: detail.into(),
        }
    }

    /// The stage the error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Schema { stage, .. }
            | PipelineError::Cardinality { stage, .. }
            | PipelineError::Statistical { stage, .. } => *stage,
            PipelineError::Selection { .. } => Stage::FeatureSelect,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_messages_name_stage() {
        let e = PipelineError::schema(Stage::Normalize, "no rows match Metadata_treatment == DMSO");
        assert_eq!(
            e.to_string(),
            "[normalize] schema error: no rows match Metadata_treatment == DMSO"
        );

        let e = PipelineError::Selection {
            operation: "correlation_threshold".to_string(),
            columns: vec!["Cells_A".to_string(), "Cells_B".to_string()],
            source: Box::new(PipelineError::statistical(Stage::FeatureSelect, "zero variance")),
        };
        assert_eq!(e.stage(), Stage::FeatureSelect);
        assert!(e.to_string().contains("[Cells_A, Cells_B]"));
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = PipelineError::cardinality(Stage::Annotate, "duplicate key A01").into();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::Cardinality { stage, .. }) => assert_eq!(*stage, Stage::Annotate),
            other => panic!("unexpected {other:?}"),
        }
    }
}
