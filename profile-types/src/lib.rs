//! Shared types for image-based profile tables: the table itself, how its columns
//! are classified, typed row predicates, and the pipeline error taxonomy.

#![deny(missing_docs)]

/// Metadata / feature column classification
pub mod columns;

/// Pipeline error taxonomy
pub mod error;

/// Typed row predicates over metadata columns
pub mod predicate;

/// The profile table
pub mod table;

pub use columns::{ColumnClass, ColumnClassifier, FeatureSpec, UnclassifiedPolicy};
pub use error::{PipelineError, Stage};
pub use predicate::{Predicate, RowFilter};
pub use table::{MetadataColumn, ProfileTable};
