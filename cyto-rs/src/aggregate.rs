use crate::store::{RawTable, SingleCellSource, Value};
use anyhow::Error;
use itertools::Itertools;
use log::{debug, info, warn};
use ndarray::Array2;
use profile_stats::Statistics;
use profile_types::{MetadataColumn, PipelineError, ProfileTable, Stage};
use rand::seq::index;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Name of the per-stratum cell count column.
pub const COUNT_CELLS_COLUMN: &str = "Metadata_Count_Cells";

/// Summary statistic applied to the single cells of a stratum.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOperation {
    /// median of the present values
    #[default]
    Median,
    /// mean of the present values
    Mean,
}

impl AggregateOperation {
    fn apply(self, values: &[f64]) -> f64 {
        match self {
            AggregateOperation::Median => values.median(),
            AggregateOperation::Mean => values.mean(),
        }
    }
}

impl FromStr for AggregateOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "median" => Ok(AggregateOperation::Median),
            "mean" => Ok(AggregateOperation::Mean),
            _ => Err(anyhow::format_err!("aggregation operation not recognized: {s}")),
        }
    }
}

impl fmt::Display for AggregateOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AggregateOperation::Median => "median",
            AggregateOperation::Mean => "mean",
        })
    }
}

/// Which single cells of each stratum enter the aggregate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsample {
    /// every cell
    #[default]
    All,
    /// `round(fraction * n)` cells per stratum, `fraction` in `(0, 1]`
    Fraction(f64),
    /// at most this many cells per stratum
    Count(usize),
}

impl Subsample {
    fn size(self, n: usize) -> usize {
        match self {
            Subsample::All => n,
            Subsample::Fraction(f) => ((f * n as f64).round() as usize).min(n),
            Subsample::Count(c) => c.min(n),
        }
    }

    fn validate(self) -> Result<(), PipelineError> {
        match self {
            Subsample::Fraction(f) if !(f > 0.0 && f <= 1.0) => Err(PipelineError::statistical(
                Stage::Aggregate,
                format!("subsample fraction must be in (0, 1], got {f}"),
            )),
            Subsample::Count(0) => Err(PipelineError::statistical(
                Stage::Aggregate,
                "subsample count must be positive",
            )),
            _ => Ok(()),
        }
    }
}

/// Options of the single cell to well aggregation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateOptions {
    /// image table columns that identify a well
    pub strata: Vec<String>,
    /// compartment tables to aggregate
    pub compartments: Vec<String>,
    /// columns linking compartment rows to image rows
    pub merge_cols: Vec<String>,
    /// per-image object id column of the compartment tables
    pub object_column: String,
    /// summary statistic
    pub operation: AggregateOperation,
    /// single-cell subsampling
    pub subsample: Subsample,
    /// seed of the subsampling generator; drawn from entropy when unset
    pub seed: Option<u64>,
    /// also aggregate numeric `Image_` columns of the image table
    pub image_features: bool,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        AggregateOptions {
            strata: vec!["Metadata_Plate".to_string(), "Metadata_Well".to_string()],
            compartments: vec!["cells".to_string(), "cytoplasm".to_string(), "nuclei".to_string()],
            merge_cols: vec!["TableNumber".to_string(), "ImageNumber".to_string()],
            object_column: "ObjectNumber".to_string(),
            operation: AggregateOperation::Median,
            subsample: Subsample::All,
            seed: None,
            image_features: false,
        }
    }
}

/// Output of [`aggregate`].
#[derive(Clone, Debug)]
pub struct Aggregated {
    /// one row per stratum
    pub profiles: ProfileTable,
    /// strata and their cell counts
    pub cell_counts: ProfileTable,
}

/// `cells` -> `Cells_`
fn feature_prefix(compartment: &str) -> String {
    let mut chars = compartment.chars();
    match chars.next() {
        Some(c) => format!("{}{}_", c.to_uppercase(), chars.as_str().to_lowercase()),
        None => String::new(),
    }
}

/// Compartment whose objects are counted and subsampled.
fn count_compartment(opts: &AggregateOptions) -> Result<&str, PipelineError> {
    opts.compartments
        .iter()
        .find(|c| c.eq_ignore_ascii_case("cells"))
        .or_else(|| opts.compartments.first())
        .map(String::as_str)
        .ok_or_else(|| PipelineError::schema(Stage::Aggregate, "no compartments to aggregate"))
}

/// Map from merge key to stratum key, built from the image table.
struct ImageIndex {
    strata: HashMap<Vec<String>, Vec<String>>,
}

impl ImageIndex {
    fn new(image: &RawTable, opts: &AggregateOptions) -> Result<ImageIndex, PipelineError> {
        let merge = image.require(&opts.merge_cols, Stage::Aggregate, "image")?;
        let strata_cols = image.require(&opts.strata, Stage::Aggregate, "image")?;
        let mut strata = HashMap::with_capacity(image.nrows());
        for row in 0..image.nrows() {
            let key = image.key(row, &merge);
            if strata.insert(key.clone(), image.key(row, &strata_cols)).is_some() {
                return Err(PipelineError::cardinality(
                    Stage::Aggregate,
                    format!(
                        "image table rows are not unique on ({}): ({}) repeats",
                        opts.merge_cols.join(", "),
                        key.join(", ")
                    ),
                ));
            }
        }
        Ok(ImageIndex { strata })
    }

    /// Stratum of every row of a compartment table.
    fn assign(&self, table: &RawTable, compartment: &str, merge: &[usize]) -> Result<Vec<Vec<String>>, PipelineError> {
        (0..table.nrows())
            .map(|row| {
                let key = table.key(row, merge);
                self.strata.get(&key).cloned().ok_or_else(|| {
                    PipelineError::cardinality(
                        Stage::Aggregate,
                        format!(
                            "{} row {} references image ({}) missing from the image table",
                            compartment,
                            row,
                            key.join(", ")
                        ),
                    )
                })
            })
            .collect()
    }
}

/// A compartment table with each row tagged by stratum and object identity.
struct Compartment {
    name: String,
    table: RawTable,
    strata: Vec<Vec<String>>,
    objects: Option<Vec<(Vec<String>, String)>>,
}

fn load_compartment(
    source: &dyn SingleCellSource,
    name: &str,
    index: &ImageIndex,
    opts: &AggregateOptions,
    with_objects: bool,
) -> Result<Compartment, Error> {
    let table = source.compartment_table(name)?;
    let merge = table.require(&opts.merge_cols, Stage::Aggregate, name)?;
    let strata = index.assign(&table, name, &merge)?;
    let objects = if with_objects {
        let obj = table.require(&[opts.object_column.as_str()], Stage::Aggregate, name)?[0];
        Some(
            (0..table.nrows())
                .map(|row| (table.key(row, &merge), table.rows[row][obj].to_key_string()))
                .collect(),
        )
    } else {
        None
    };
    debug!("{}: {} objects", name, table.nrows());
    Ok(Compartment {
        name: name.to_string(),
        table,
        strata,
        objects,
    })
}

/// Numeric columns with the given prefix; columns holding text are skipped.
fn numeric_columns(table: &RawTable, prefix: &str, skip: &[String]) -> Vec<(String, Vec<f64>)> {
    table
        .columns
        .iter()
        .enumerate()
        .filter(|(_, name)| name.starts_with(prefix) && !skip.contains(name))
        .filter_map(|(c, name)| {
            let mut values = Vec::with_capacity(table.nrows());
            for row in &table.rows {
                match row[c].as_f64() {
                    Some(v) => values.push(v),
                    None if row[c] == Value::Null => values.push(f64::NAN),
                    None => {
                        debug!("skipping non-numeric column {}", name);
                        return None;
                    }
                }
            }
            Some((name.clone(), values))
        })
        .collect()
}

/// Per-stratum aggregate of a set of feature columns over the selected rows.
fn aggregate_columns(
    columns: &[(String, Vec<f64>)],
    strata: &[Vec<String>],
    keep: &[bool],
    operation: AggregateOperation,
) -> BTreeMap<Vec<String>, Vec<f64>> {
    let mut groups: BTreeMap<&Vec<String>, Vec<usize>> = BTreeMap::new();
    for (row, key) in strata.iter().enumerate() {
        if keep[row] {
            groups.entry(key).or_default().push(row);
        }
    }
    groups
        .into_iter()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|(key, rows)| {
            let agg = columns
                .iter()
                .map(|(_, values)| {
                    let v: Vec<f64> = rows.iter().map(|&r| values[r]).collect();
                    operation.apply(&v)
                })
                .collect();
            (key.clone(), agg)
        })
        .collect()
}

/// Draw the objects of each stratum that enter the aggregate.
fn subsample_objects(counted: &Compartment, opts: &AggregateOptions) -> Result<HashSet<(Vec<String>, String)>, Error> {
    opts.subsample.validate()?;
    let Some(objects) = counted.objects.as_ref() else {
        return Err(PipelineError::schema(Stage::Aggregate, "object identities were not loaded").into());
    };
    let mut rng = match opts.seed {
        Some(seed) => Pcg64::seed_from_u64(seed),
        None => Pcg64::from_entropy(),
    };
    let mut by_stratum: BTreeMap<&Vec<String>, Vec<usize>> = BTreeMap::new();
    for (row, key) in counted.strata.iter().enumerate() {
        by_stratum.entry(key).or_default().push(row);
    }
    let mut drawn = HashSet::new();
    for rows in by_stratum.values() {
        let k = opts.subsample.size(rows.len());
        let mut picked = index::sample(&mut rng, rows.len(), k).into_vec();
        picked.sort_unstable();
        drawn.extend(picked.into_iter().map(|i| objects[rows[i]].clone()));
    }
    info!("subsampled {} of {} {} objects", drawn.len(), objects.len(), counted.name);
    Ok(drawn)
}

/// Count the objects of the counted compartment per stratum.
fn counts_table(counted: &Compartment, strata_names: &[String]) -> Result<ProfileTable, PipelineError> {
    let mut counts: BTreeMap<&Vec<String>, usize> = BTreeMap::new();
    for key in &counted.strata {
        *counts.entry(key).or_default() += 1;
    }
    let mut columns: Vec<MetadataColumn> = strata_names
        .iter()
        .enumerate()
        .map(|(i, name)| MetadataColumn::new(name.clone(), counts.keys().map(|k| k[i].clone())))
        .collect();
    columns.push(MetadataColumn::new(
        COUNT_CELLS_COLUMN,
        counts.values().map(|c| c.to_string()),
    ));
    ProfileTable::from_metadata(columns)
}

/// Number of cells per stratum, counted before any subsampling.
pub fn count_cells(source: &dyn SingleCellSource, opts: &AggregateOptions) -> Result<ProfileTable, Error> {
    let image = source.image_table()?;
    let index = ImageIndex::new(&image, opts)?;
    let counted = load_compartment(source, count_compartment(opts)?, &index, opts, false)?;
    Ok(counts_table(&counted, &opts.strata)?)
}

/// Collapse the single cells of every compartment into one profile per stratum.
///
/// Compartments are aggregated independently and joined on the strata; a stratum missing
/// from any compartment is a cardinality error. Rows are sorted by stratum.
pub fn aggregate(source: &dyn SingleCellSource, opts: &AggregateOptions) -> Result<Aggregated, Error> {
    let image = source.image_table()?;
    let index = ImageIndex::new(&image, opts)?;
    let counted_name = count_compartment(opts)?;
    let subsampling = opts.subsample != Subsample::All;

    let compartments = opts
        .compartments
        .iter()
        .map(|c| load_compartment(source, c, &index, opts, subsampling))
        .collect::<Result<Vec<_>, _>>()?;
    let counted = compartments
        .iter()
        .find(|c| c.name == counted_name)
        .ok_or_else(|| PipelineError::schema(Stage::Aggregate, format!("compartment {counted_name} not loaded")))?;
    let cell_counts = counts_table(counted, &opts.strata)?;

    let drawn = if subsampling {
        Some(subsample_objects(counted, opts)?)
    } else {
        None
    };

    let mut blocks: Vec<(String, Vec<String>, BTreeMap<Vec<String>, Vec<f64>>)> = vec![];
    for c in &compartments {
        let keep: Vec<bool> = match (&drawn, &c.objects) {
            (Some(drawn), Some(objects)) => objects.iter().map(|o| drawn.contains(o)).collect(),
            _ => vec![true; c.table.nrows()],
        };
        let columns = numeric_columns(&c.table, &feature_prefix(&c.name), &opts.merge_cols);
        if columns.is_empty() {
            warn!("compartment {} has no numeric {} columns", c.name, feature_prefix(&c.name));
        }
        let agg = aggregate_columns(&columns, &c.strata, &keep, opts.operation);
        blocks.push((c.name.clone(), columns.into_iter().map(|(n, _)| n).collect(), agg));
    }

    if opts.image_features {
        let mut skip = opts.merge_cols.clone();
        skip.extend(opts.strata.iter().cloned());
        let columns = numeric_columns(&image, "Image_", &skip);
        let merge = image.require(&opts.merge_cols, Stage::Aggregate, "image")?;
        let strata = index.assign(&image, "image", &merge)?;
        let agg = aggregate_columns(&columns, &strata, &vec![true; image.nrows()], opts.operation);
        blocks.push(("image".to_string(), columns.into_iter().map(|(n, _)| n).collect(), agg));
    }

    // every block must cover every stratum
    let keys: BTreeSet<&Vec<String>> = blocks.iter().flat_map(|(_, _, b)| b.keys()).collect();
    for (name, _, b) in &blocks {
        let missing: Vec<String> = keys
            .iter()
            .filter(|k| !b.contains_key(**k))
            .map(|k| k.join("/"))
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::cardinality(
                Stage::Aggregate,
                format!(
                    "{} strata have no {} objects: {}",
                    missing.len(),
                    name,
                    missing.iter().take(5).join(", ")
                ),
            )
            .into());
        }
    }

    let feature_names: Vec<String> = blocks.iter().flat_map(|(_, names, _)| names.iter().cloned()).collect();
    let mut values = Vec::with_capacity(keys.len() * feature_names.len());
    for k in &keys {
        for (_, _, b) in &blocks {
            values.extend_from_slice(&b[*k]);
        }
    }
    let features = Array2::from_shape_vec((keys.len(), feature_names.len()), values)?;
    let metadata = opts
        .strata
        .iter()
        .enumerate()
        .map(|(i, name)| MetadataColumn::new(name.clone(), keys.iter().map(|k| k[i].clone())))
        .collect();
    let profiles = ProfileTable::new(metadata, feature_names, features)?;
    info!(
        "aggregated {} {} objects into {} profiles with {} features ({})",
        counted.table.nrows(),
        counted.name,
        profiles.nrows(),
        profiles.n_features(),
        opts.operation
    );

    Ok(Aggregated { profiles, cell_counts })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::InMemorySource;
    use assert_approx_eq::assert_approx_eq;

    fn raw(columns: &[&str], rows: Vec<Vec<Value>>) -> RawTable {
        RawTable::new(columns.iter().map(|c| c.to_string()).collect(), rows).unwrap()
    }

    fn t(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    fn i(v: i64) -> Value {
        Value::Integer(v)
    }

    fn r(v: f64) -> Value {
        Value::Real(v)
    }

    /// Two wells, two images in A01 and one in A02.
    fn source() -> InMemorySource {
        let image = raw(
            &["TableNumber", "ImageNumber", "Metadata_Plate", "Metadata_Well", "Image_Count_Cells"],
            vec![
                vec![i(1), i(1), t("P1"), t("A01"), i(2)],
                vec![i(1), i(2), t("P1"), t("A01"), i(1)],
                vec![i(1), i(3), t("P1"), t("A02"), i(2)],
            ],
        );
        let objects = |prefix: &str, values: [f64; 5]| {
            let name = format!("{prefix}_AreaShape_Area");
            let cols = ["TableNumber", "ImageNumber", "ObjectNumber", name.as_str()];
            raw(
                &cols,
                vec![
                    vec![i(1), i(1), i(1), r(values[0])],
                    vec![i(1), i(1), i(2), r(values[1])],
                    vec![i(1), i(2), i(1), r(values[2])],
                    vec![i(1), i(3), i(1), r(values[3])],
                    vec![i(1), i(3), i(2), r(values[4])],
                ],
            )
        };
        InMemorySource::new(image)
            .with_compartment("cells", objects("Cells", [1.0, 2.0, 9.0, 4.0, 6.0]))
            .with_compartment("nuclei", objects("Nuclei", [1.0, 1.0, 1.0, f64::NAN, 3.0]))
    }

    fn opts() -> AggregateOptions {
        AggregateOptions {
            compartments: vec!["cells".to_string(), "nuclei".to_string()],
            ..AggregateOptions::default()
        }
    }

    #[test]
    fn test_median_per_well() {
        let out = aggregate(&source(), &opts()).unwrap();
        let p = &out.profiles;
        assert_eq!(p.nrows(), 2);
        assert_eq!(p.metadata_names(), vec!["Metadata_Plate", "Metadata_Well"]);
        assert_eq!(p.metadata_values("Metadata_Well").unwrap(), &["A01", "A02"]);
        assert_eq!(
            p.feature_names(),
            &["Cells_AreaShape_Area".to_string(), "Nuclei_AreaShape_Area".to_string()]
        );
        assert_approx_eq!(p.features()[[0, 0]], 2.0);
        assert_approx_eq!(p.features()[[1, 0]], 5.0);
        // missing values are skipped
        assert_approx_eq!(p.features()[[1, 1]], 3.0);

        let counts = &out.cell_counts;
        assert_eq!(counts.metadata_values(COUNT_CELLS_COLUMN).unwrap(), &["3", "2"]);
    }

    #[test]
    fn test_mean_and_image_features() {
        let o = AggregateOptions {
            operation: AggregateOperation::Mean,
            image_features: true,
            ..opts()
        };
        let p = aggregate(&source(), &o).unwrap().profiles;
        assert_eq!(p.n_features(), 3);
        assert_eq!(p.feature_names()[2], "Image_Count_Cells");
        assert_approx_eq!(p.features()[[0, 0]], 4.0);
        assert_approx_eq!(p.features()[[0, 2]], 1.5);
        assert_approx_eq!(p.features()[[1, 2]], 2.0);
    }

    #[test]
    fn test_duplicate_image_key() {
        let image = raw(
            &["TableNumber", "ImageNumber", "Metadata_Plate", "Metadata_Well"],
            vec![vec![i(1), i(1), t("P1"), t("A01")], vec![i(1), i(1), t("P1"), t("A02")]],
        );
        let src = InMemorySource::new(image).with_compartment("cells", RawTable::default());
        let err = aggregate(&src, &opts()).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::Cardinality { .. }) => (),
            e => panic!("unexpected error {e:?}"),
        }
    }

    #[test]
    fn test_compartments_cover_different_wells() {
        let image = raw(
            &["TableNumber", "ImageNumber", "Metadata_Plate", "Metadata_Well"],
            vec![vec![i(1), i(1), t("P1"), t("A01")], vec![i(1), i(2), t("P1"), t("A02")]],
        );
        let cells = raw(
            &["TableNumber", "ImageNumber", "ObjectNumber", "Cells_AreaShape_Area"],
            vec![vec![i(1), i(1), i(1), r(1.0)], vec![i(1), i(2), i(1), r(2.0)]],
        );
        let nuclei = raw(
            &["TableNumber", "ImageNumber", "ObjectNumber", "Nuclei_AreaShape_Area"],
            vec![vec![i(1), i(1), i(1), r(3.0)]],
        );
        let src = InMemorySource::new(image)
            .with_compartment("cells", cells)
            .with_compartment("nuclei", nuclei);
        let err = aggregate(&src, &opts()).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::Cardinality { detail, .. }) => {
                assert!(detail.contains("nuclei"));
                assert!(detail.contains("P1/A02"));
            }
            e => panic!("unexpected error {e:?}"),
        }
    }

    #[test]
    fn test_missing_compartment() {
        let o = AggregateOptions {
            compartments: vec!["cells".to_string(), "cytoplasm".to_string()],
            ..opts()
        };
        assert!(aggregate(&source(), &o).is_err());
    }

    #[test]
    fn test_subsample_is_seeded() {
        let o = AggregateOptions {
            subsample: Subsample::Count(1),
            seed: Some(7),
            ..opts()
        };
        let a = aggregate(&source(), &o).unwrap();
        let b = aggregate(&source(), &o).unwrap();
        assert_eq!(a.profiles.features().column(0), b.profiles.features().column(0));
        // one cell per well, and the same cell in each compartment
        let cells = [1.0, 2.0, 9.0, 4.0, 6.0];
        assert!(cells[..3].contains(&a.profiles.features()[[0, 0]]));
        assert!(cells[3..].contains(&a.profiles.features()[[1, 0]]));
        // counts are taken before subsampling
        assert_eq!(a.cell_counts.metadata_values(COUNT_CELLS_COLUMN).unwrap(), &["3", "2"]);
    }

    #[test]
    fn test_subsample_sizes() {
        assert_eq!(Subsample::Fraction(0.5).size(5), 3);
        assert_eq!(Subsample::Fraction(1.0).size(5), 5);
        assert_eq!(Subsample::Count(10).size(4), 4);
        assert!(Subsample::Fraction(0.0).validate().is_err());
        assert!(Subsample::Count(0).validate().is_err());
    }

    #[test]
    fn test_count_cells() {
        let counts = count_cells(&source(), &opts()).unwrap();
        assert_eq!(counts.metadata_names(), vec!["Metadata_Plate", "Metadata_Well", COUNT_CELLS_COLUMN]);
        assert_eq!(counts.nrows(), 2);
        assert_eq!(counts.n_features(), 0);
    }

    #[test]
    fn test_feature_prefix() {
        assert_eq!(feature_prefix("cells"), "Cells_");
        assert_eq!(feature_prefix("Cytoplasm"), "Cytoplasm_");
    }
}
