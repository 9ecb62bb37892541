//! Quality metrics of morphological profiles: replicate reproducibility, enrichment of
//! replicate pairs among the most similar profiles, and grit.

#![deny(missing_docs)]

/// Enrichment of replicate pairs among the most similar profile pairs.
pub mod enrichment;
/// Top-level evaluation entry points and options.
pub mod evaluate;
pub mod grit;
/// Pairwise similarity matrices and their long-form melt.
pub mod melt;
/// Replicate reproducibility metrics.
pub mod reproducibility;

pub use evaluate::{evaluate, grit_by_stratum, EvaluateOptions, Evaluation, Operation, ReplicateGroups};
pub use grit::GritSummary;
