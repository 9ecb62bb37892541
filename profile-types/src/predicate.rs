use crate::error::{PipelineError, Stage};
use crate::table::ProfileTable;
use anyhow::{bail, Error};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Row predicate over metadata columns, compared as verbatim strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// `column == value`
    Eq {
        /// metadata column
        column: String,
        /// value to match
        value: String,
    },
    /// `column != value`
    Ne {
        /// metadata column
        column: String,
        /// value to exclude
        value: String,
    },
    /// `column` is one of `values`
    In {
        /// metadata column
        column: String,
        /// accepted values
        values: Vec<String>,
    },
    /// `column` is none of `values`
    NotIn {
        /// metadata column
        column: String,
        /// rejected values
        values: Vec<String>,
    },
    /// every predicate holds
    And {
        /// conjuncts
        all: Vec<Predicate>,
    },
    /// at least one predicate holds
    Or {
        /// disjuncts
        any: Vec<Predicate>,
    },
}

impl Predicate {
    /// `column == value`
    pub fn equals(column: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    /// `column` is one of `values`
    pub fn is_in<S: Into<String>>(column: impl Into<String>, values: impl IntoIterator<Item = S>) -> Self {
        Predicate::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Evaluate the predicate on every row. Every referenced column must be a metadata
    /// column of `table`.
    pub fn mask(&self, table: &ProfileTable, stage: Stage) -> Result<Vec<bool>, PipelineError> {
        let column = |name: &str| {
            table.metadata_values(name).ok_or_else(|| {
                PipelineError::schema(
                    stage,
                    format!("predicate `{self}` refers to missing metadata column {name}"),
                )
            })
        };
        Ok(match self {
            Predicate::Eq { column: c, value } => column(c)?.iter().map(|v| v == value).collect(),
            Predicate::Ne { column: c, value } => column(c)?.iter().map(|v| v != value).collect(),
            Predicate::In { column: c, values } => column(c)?.iter().map(|v| values.contains(v)).collect(),
            Predicate::NotIn { column: c, values } => column(c)?.iter().map(|v| !values.contains(v)).collect(),
            Predicate::And { all } => {
                let mut mask = vec![true; table.nrows()];
                for p in all {
                    for (m, x) in mask.iter_mut().zip(p.mask(table, stage)?) {
                        *m &= x;
                    }
                }
                mask
            }
            Predicate::Or { any } => {
                let mut mask = vec![false; table.nrows()];
                for p in any {
                    for (m, x) in mask.iter_mut().zip(p.mask(table, stage)?) {
                        *m |= x;
                    }
                }
                mask
            }
        })
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Eq { column, value } => write!(f, "{column} == '{value}'"),
            Predicate::Ne { column, value } => write!(f, "{column} != '{value}'"),
            Predicate::In { column, values } => {
                write!(f, "{column} in [{}]", values.iter().map(|v| format!("'{v}'")).join(", "))
            }
            Predicate::NotIn { column, values } => {
                write!(f, "{column} not in [{}]", values.iter().map(|v| format!("'{v}'")).join(", "))
            }
            Predicate::And { all } => write!(f, "({})", all.iter().join(" and ")),
            Predicate::Or { any } => write!(f, "({})", any.iter().join(" or ")),
        }
    }
}

/// Command line form: `COLUMN==VALUE` or `COLUMN!=VALUE`.
impl FromStr for Predicate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (column, value, negate) = if let Some((c, v)) = s.split_once("!=") {
            (c, v, true)
        } else if let Some((c, v)) = s.split_once("==") {
            (c, v, false)
        } else {
            bail!("predicate not recognized, expected COLUMN==VALUE or COLUMN!=VALUE: {}", s)
        };
        let column = column.trim();
        if column.is_empty() {
            bail!("predicate has an empty column name: {}", s);
        }
        let value = value.trim().trim_matches('\'').to_string();
        Ok(if negate {
            Predicate::Ne {
                column: column.to_string(),
                value,
            }
        } else {
            Predicate::Eq {
                column: column.to_string(),
                value,
            }
        })
    }
}

/// Rows an operation computes its statistics from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RowFilter {
    /// every row
    #[default]
    All,
    /// rows matching the predicate
    Where(Predicate),
}

impl RowFilter {
    /// Indices of the selected rows. An empty selection is a schema error: statistics over
    /// zero rows are undefined and must not fall back to the whole table.
    pub fn rows(&self, table: &ProfileTable, stage: Stage) -> Result<Vec<usize>, PipelineError> {
        let rows: Vec<usize> = match self {
            RowFilter::All => (0..table.nrows()).collect(),
            RowFilter::Where(p) => p
                .mask(table, stage)?
                .into_iter()
                .enumerate()
                .filter_map(|(i, m)| m.then_some(i))
                .collect(),
        };
        if rows.is_empty() {
            return Err(PipelineError::schema(stage, format!("no rows selected by {self}")));
        }
        Ok(rows)
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowFilter::All => f.write_str("all"),
            RowFilter::Where(p) => write!(f, "{p}"),
        }
    }
}
