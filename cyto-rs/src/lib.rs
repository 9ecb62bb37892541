//! # cyto-rs: image-based profiling in Rust
//!
//! Single-cell measurements go in, replicate-level profiles come out:
//!
//! 1. [`aggregate`] collapses single cells into one row per well
//! 2. [`annotate`] attaches platemap metadata
//! 3. [`normalize`] rescales features against a control subset
//! 4. [`feature_select`] drops uninformative or redundant features
//! 5. [`consensus`] collapses replicate wells
//!
//! Every stage reads one table and writes one table; [`config`] chains them through
//! gzip-compressed files.

#![deny(missing_docs)]

/// Single-cell to well aggregation
pub mod aggregate;

/// Platemap annotation
pub mod annotate;

/// Pipeline configuration and file-to-file stage runners
pub mod config;

/// Replicate consensus profiles
pub mod consensus;

/// Feature selection operations
pub mod feature_select;

/// Delimited, optionally gzip-compressed, table files
pub mod io;

/// Normalization against a reference subset
pub mod normalize;

/// Single-cell measurement stores
pub mod store;

pub use profile_types::{
    ColumnClassifier, FeatureSpec, MetadataColumn, PipelineError, Predicate, ProfileTable, RowFilter, Stage,
};
