//! Statistics used by the profiling and evaluation stages.

#![deny(missing_docs)]

/// correlation and ranks
pub mod corr;
/// Fisher's exact test
pub mod fisher;
/// descriptive statistics
pub mod stat;

pub use corr::{correlation, correlation_matrix, rank_average, row_similarity, CorrelationMethod};
pub use fisher::{fisher_exact_greater, FisherResult};
pub use stat::{finite_values, quantile_of_sorted, sorted_finite, Statistics};
