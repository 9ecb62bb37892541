use crate::store::RawTable;
use anyhow::Error;
use log::{info, warn};
use profile_types::{ColumnClassifier, MetadataColumn, PipelineError, ProfileTable, Stage};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Pair of columns a metadata table is joined on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinOn {
    /// column of the metadata table, after any prefixing
    pub metadata: String,
    /// metadata column of the profiles
    pub profiles: String,
}

impl JoinOn {
    /// Join the metadata column `metadata` against the profile column `profiles`.
    pub fn new(metadata: impl Into<String>, profiles: impl Into<String>) -> Self {
        JoinOn {
            metadata: metadata.into(),
            profiles: profiles.into(),
        }
    }
}

/// What happens to profile rows without a platemap match.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    /// drop them
    #[default]
    Inner,
    /// keep them with empty platemap metadata
    Left,
}

/// Options of the platemap annotation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotateOptions {
    /// platemap / profile join columns
    pub join_on: JoinOn,
    /// prefix platemap columns that lack the metadata prefix
    pub add_metadata_prefix: bool,
    /// handling of unmatched profile rows
    pub join: JoinKind,
    /// metadata prefix rule applied to the platemap columns
    pub classifier: ColumnClassifier,
}

impl Default for AnnotateOptions {
    fn default() -> Self {
        AnnotateOptions {
            join_on: JoinOn::new("Metadata_well_position", "Metadata_Well"),
            add_metadata_prefix: true,
            join: JoinKind::Inner,
            classifier: ColumnClassifier::default(),
        }
    }
}

fn prefixed(name: &str, prefix: Option<&ColumnClassifier>) -> String {
    match prefix {
        Some(c) => c.with_metadata_prefix(name),
        None => name.to_string(),
    }
}

/// Join one metadata table onto the profiles. The metadata columns come first in the output.
fn join_metadata(
    profiles: &ProfileTable,
    table: &RawTable,
    join_on: &JoinOn,
    prefix: Option<&ColumnClassifier>,
    join: JoinKind,
    what: &str,
) -> Result<ProfileTable, Error> {
    let columns: Vec<String> = table.columns.iter().map(|c| prefixed(c, prefix)).collect();
    let mut seen = HashSet::new();
    if let Some(dup) = columns.iter().find(|c| !seen.insert(c.as_str())) {
        return Err(PipelineError::schema(Stage::Annotate, format!("{what} column {dup} appears twice")).into());
    }

    let key_col = columns.iter().position(|c| *c == join_on.metadata).ok_or_else(|| {
        PipelineError::schema(
            Stage::Annotate,
            format!(
                "{} has no join column {} (columns: {})",
                what,
                join_on.metadata,
                columns.join(", ")
            ),
        )
    })?;
    let profile_keys = profiles.require_metadata(&[join_on.profiles.as_str()], Stage::Annotate)?[0];

    let collisions: Vec<&str> = columns
        .iter()
        .enumerate()
        .filter(|(i, c)| {
            *i != key_col && (profiles.metadata_values(c).is_some() || profiles.feature_index(c).is_some())
        })
        .map(|(_, c)| c.as_str())
        .collect();
    if !collisions.is_empty() {
        return Err(PipelineError::schema(
            Stage::Annotate,
            format!("{} columns already present in the profiles: {}", what, collisions.join(", ")),
        )
        .into());
    }

    let mut index: HashMap<String, usize> = HashMap::with_capacity(table.nrows());
    for row in 0..table.nrows() {
        let key = table.rows[row][key_col].to_key_string();
        if let Some(first) = index.insert(key.clone(), row) {
            return Err(PipelineError::cardinality(
                Stage::Annotate,
                format!(
                    "{} key {} = {} appears in rows {} and {}; the join would duplicate profiles",
                    what, join_on.metadata, key, first, row
                ),
            )
            .into());
        }
    }

    let matches: Vec<Option<usize>> = profile_keys.iter().map(|k| index.get(k).copied()).collect();
    let matched = matches.iter().filter(|m| m.is_some()).count();
    if matched == 0 {
        return Err(PipelineError::cardinality(
            Stage::Annotate,
            format!(
                "no profile {} value matches {} {}",
                join_on.profiles, what, join_on.metadata
            ),
        )
        .into());
    }
    let unmatched = profiles.nrows() - matched;

    let rows: Vec<usize> = match join {
        JoinKind::Inner => (0..profiles.nrows()).filter(|&r| matches[r].is_some()).collect(),
        JoinKind::Left => (0..profiles.nrows()).collect(),
    };
    if unmatched > 0 {
        match join {
            JoinKind::Inner => warn!("dropped {unmatched} profiles without a {what} entry"),
            JoinKind::Left => warn!("{unmatched} profiles have no {what} entry"),
        }
    }

    let mut metadata: Vec<MetadataColumn> = columns
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != key_col)
        .map(|(i, name)| {
            MetadataColumn::new(
                name.clone(),
                rows.iter().map(|&r| match matches[r] {
                    Some(m) => table.rows[m][i].to_key_string(),
                    None => String::new(),
                }),
            )
        })
        .collect();
    let (profile_meta, feature_names, features) = profiles.select_rows(&rows).into_parts();
    metadata.extend(profile_meta);
    Ok(ProfileTable::new(metadata, feature_names, features)?)
}

/// Attach platemap metadata to aggregated profiles.
///
/// The platemap key must be unique, every platemap column (other than the join column)
/// must be new to the profiles, and at least one profile must match.
pub fn annotate(profiles: &ProfileTable, platemap: &RawTable, opts: &AnnotateOptions) -> Result<ProfileTable, Error> {
    let out = join_metadata(
        profiles,
        platemap,
        &opts.join_on,
        opts.add_metadata_prefix.then_some(&opts.classifier),
        opts.join,
        "platemap",
    )?;
    info!(
        "annotated {} of {} profiles with {} platemap columns",
        out.nrows(),
        profiles.nrows(),
        platemap.columns.len().saturating_sub(1)
    );
    Ok(out)
}

/// Annotate with a platemap, then left-join a second, external metadata table
/// (compound or gene information keyed by a platemap column).
pub fn annotate_with_external(
    profiles: &ProfileTable,
    platemap: &RawTable,
    external: &RawTable,
    external_join_on: &JoinOn,
    opts: &AnnotateOptions,
) -> Result<ProfileTable, Error> {
    let annotated = annotate(profiles, platemap, opts)?;
    join_metadata(
        &annotated,
        external,
        external_join_on,
        opts.add_metadata_prefix.then_some(&opts.classifier),
        JoinKind::Left,
        "external metadata",
    )
}

/// Left-join the platemap onto a per-well cell count table so that the counts carry the
/// treatment annotations.
pub fn annotate_cell_counts(
    counts: &ProfileTable,
    platemap: &RawTable,
    opts: &AnnotateOptions,
) -> Result<ProfileTable, Error> {
    join_metadata(
        counts,
        platemap,
        &opts.join_on,
        opts.add_metadata_prefix.then_some(&opts.classifier),
        JoinKind::Left,
        "platemap",
    )
}
