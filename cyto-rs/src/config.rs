use crate::aggregate::{aggregate, AggregateOptions};
use crate::annotate::{annotate, annotate_cell_counts, annotate_with_external, AnnotateOptions, JoinOn};
use crate::consensus::{consensus, ConsensusOptions};
use crate::feature_select::{feature_select, load_blocklist, FeatureSelectOptions, SelectionOp, SelectionStep};
use crate::io::{read_raw_table, write_serialized, write_table, WriteOptions};
use crate::normalize::{normalize, NormalizeOptions};
use crate::store::SqliteStore;
use anyhow::{Context, Error};
use log::info;
use profile_types::ProfileTable;
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// A second metadata table joined after the platemap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalMetadata {
    /// delimited file
    pub path: PathBuf,
    /// join columns
    pub join_on: JoinOn,
}

/// Everything needed to profile one plate, from its single-cell store to consensus profiles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// plate name; prefixes every output file
    pub plate: String,
    /// CellProfiler SQLite file
    pub sqlite: PathBuf,
    /// platemap file
    pub platemap: PathBuf,
    /// platemap delimiter; inferred from the file name when unset
    #[serde(default)]
    pub platemap_delimiter: Option<char>,
    /// optional second metadata table
    #[serde(default)]
    pub external_metadata: Option<ExternalMetadata>,
    /// feature blocklist replacing the built-in one
    #[serde(default)]
    pub blocklist: Option<PathBuf>,
    /// directory receiving every output
    pub output_dir: PathBuf,
    /// output file settings
    #[serde(default)]
    pub write: WriteOptions,
    /// aggregation
    #[serde(default)]
    pub aggregate: AggregateOptions,
    /// annotation
    #[serde(default)]
    pub annotate: AnnotateOptions,
    /// normalization
    #[serde(default)]
    pub normalize: NormalizeOptions,
    /// feature selection
    #[serde(default)]
    pub feature_select: FeatureSelectOptions,
    /// consensus
    #[serde(default)]
    pub consensus: ConsensusOptions,
}

impl PipelineConfig {
    /// Load a configuration from a JSON file.
    pub fn from_json(path: impl AsRef<Path>) -> Result<PipelineConfig, Error> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| path.display().to_string())?;
        let config = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing pipeline configuration {}", path.display()))?;
        Ok(config)
    }

    /// Feature selection options with the configured blocklist file, if any, in place of
    /// the built-in blocklist.
    pub fn feature_select_options(&self) -> Result<FeatureSelectOptions, Error> {
        let mut opts = self.feature_select.clone();
        if let Some(path) = &self.blocklist {
            let loaded = load_blocklist(path)?;
            info!("loaded {} blocklist entries from {}", loaded.len(), path.display());
            for op in opts.operations.iter_mut() {
                if let SelectionOp::Blocklist { entries } = op {
                    *entries = loaded.clone();
                }
            }
        }
        Ok(opts)
    }

    /// Output location of a named intermediate, `{output_dir}/{plate}{suffix}`.
    pub fn output(&self, suffix: &str) -> PathBuf {
        self.output_dir.join(format!("{}{}", self.plate, suffix))
    }
}

/// Files written by [`run_pipeline`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PipelineOutputs {
    /// per-well aggregated profiles
    pub aggregated: PathBuf,
    /// per-well cell counts
    pub cell_counts: PathBuf,
    /// annotated profiles
    pub augmented: PathBuf,
    /// normalized profiles
    pub normalized: PathBuf,
    /// normalized, feature-selected profiles
    pub feature_selected: PathBuf,
    /// per-operation list of removed features
    pub selection_report: PathBuf,
    /// replicate consensus profiles
    pub consensus: PathBuf,
}

#[derive(Serialize)]
struct DroppedFeature<'a> {
    operation: &'a str,
    feature: &'a str,
}

/// Write a feature selection report, one removed feature per row.
pub fn write_selection_report(report: &[SelectionStep], path: impl AsRef<Path>, opts: &WriteOptions) -> Result<(), Error> {
    let rows: Vec<DroppedFeature> = report
        .iter()
        .flat_map(|s| {
            s.dropped.iter().map(move |f| DroppedFeature {
                operation: &s.operation,
                feature: f,
            })
        })
        .collect();
    write_serialized(&rows, path, opts)
}

/// Profiles after each stage of a pipeline run.
#[derive(Clone, Debug)]
pub struct PipelineTables {
    /// aggregated
    pub aggregated: ProfileTable,
    /// annotated
    pub augmented: ProfileTable,
    /// normalized
    pub normalized: ProfileTable,
    /// feature selected
    pub feature_selected: ProfileTable,
    /// consensus
    pub consensus: ProfileTable,
}

/// Aggregate, annotate, normalize, select features and build consensus profiles for one
/// plate, writing every intermediate table.
pub fn run_pipeline(config: &PipelineConfig) -> Result<(PipelineTables, PipelineOutputs), Error> {
    create_dir_all(&config.output_dir).with_context(|| config.output_dir.display().to_string())?;
    let outputs = PipelineOutputs {
        aggregated: config.output(".csv.gz"),
        cell_counts: config.output("_cell_counts.tsv"),
        augmented: config.output("_augmented.csv.gz"),
        normalized: config.output("_normalized.csv.gz"),
        feature_selected: config.output("_normalized_feature_select.csv.gz"),
        selection_report: config.output("_feature_select_report.tsv"),
        consensus: config.output("_consensus.csv.gz"),
    };
    let write = &config.write;

    info!("plate {}: reading {}", config.plate, config.sqlite.display());
    let store = SqliteStore::open(&config.sqlite)?;
    let aggregated = aggregate(&store, &config.aggregate)?;
    write_table(&aggregated.profiles, &outputs.aggregated, write)?;

    let platemap = read_raw_table(&config.platemap, config.platemap_delimiter)?;
    let cell_counts = annotate_cell_counts(&aggregated.cell_counts, &platemap, &config.annotate)?;
    write_table(&cell_counts, &outputs.cell_counts, write)?;
    let augmented = match &config.external_metadata {
        Some(ext) => {
            let external = read_raw_table(&ext.path, None)?;
            annotate_with_external(&aggregated.profiles, &platemap, &external, &ext.join_on, &config.annotate)?
        }
        None => annotate(&aggregated.profiles, &platemap, &config.annotate)?,
    };
    write_table(&augmented, &outputs.augmented, write)?;

    let normalized = normalize(&augmented, &config.normalize)?.profiles;
    write_table(&normalized, &outputs.normalized, write)?;

    let selected = feature_select(&normalized, &config.feature_select_options()?)?;
    write_table(&selected.profiles, &outputs.feature_selected, write)?;
    write_selection_report(&selected.report, &outputs.selection_report, write)?;

    let consensus = consensus(&selected.profiles, &config.consensus)?;
    write_table(&consensus, &outputs.consensus, write)?;
    info!("plate {}: outputs in {}", config.plate, config.output_dir.display());

    Ok((
        PipelineTables {
            aggregated: aggregated.profiles,
            augmented,
            normalized,
            feature_selected: selected.profiles,
            consensus,
        },
        outputs,
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::consensus::ConsensusOperation;
    use crate::feature_select::BlocklistEntry;
    use profile_types::{Predicate, RowFilter};

    #[test]
    fn test_config_json_defaults() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{
                "plate": "218360",
                "sqlite": "218360.sqlite",
                "platemap": "platemap.txt",
                "output_dir": "out",
                "normalize": {"samples": {"where": {"op": "eq", "column": "Metadata_treatment", "value": "0.1% DMSO"}}},
                "consensus": {"replicate_columns": ["Metadata_clone_number", "Metadata_treatment"], "operation": {"modz": {}}}
            }"#,
        )
        .unwrap();
        assert_eq!(config.aggregate, AggregateOptions::default());
        assert_eq!(
            config.normalize.samples,
            RowFilter::Where(Predicate::equals("Metadata_treatment", "0.1% DMSO"))
        );
        assert!(matches!(config.consensus.operation, ConsensusOperation::Modz(_)));
        assert_eq!(config.write.gzip_mtime, 1);
        assert_eq!(config.output("_augmented.csv.gz"), PathBuf::from("out/218360_augmented.csv.gz"));
    }

    #[test]
    fn test_blocklist_file_replaces_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocklist.txt");
        std::fs::write(&path, "blocklist\nCells_Foo\n").unwrap();
        let config = PipelineConfig {
            plate: "p".to_string(),
            sqlite: PathBuf::new(),
            platemap: PathBuf::new(),
            platemap_delimiter: None,
            external_metadata: None,
            blocklist: Some(path),
            output_dir: PathBuf::new(),
            write: WriteOptions::default(),
            aggregate: AggregateOptions::default(),
            annotate: AnnotateOptions::default(),
            normalize: NormalizeOptions::default(),
            feature_select: FeatureSelectOptions::default(),
            consensus: ConsensusOptions::default(),
        };
        let opts = config.feature_select_options().unwrap();
        let entries: Vec<&Vec<BlocklistEntry>> = opts
            .operations
            .iter()
            .filter_map(|op| match op {
                SelectionOp::Blocklist { entries } => Some(entries),
                _ => None,
            })
            .collect();
        assert_eq!(entries, vec![&vec![BlocklistEntry::Exact("Cells_Foo".to_string())]]);
    }

    #[test]
    fn test_selection_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.tsv");
        let report = vec![
            SelectionStep {
                operation: "blocklist".to_string(),
                dropped: vec!["Cells_Location_X".to_string(), "Nuclei_Parent_Cells".to_string()],
            },
            SelectionStep {
                operation: "drop_outliers".to_string(),
                dropped: vec![],
            },
        ];
        write_selection_report(&report, &path, &WriteOptions::default()).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "operation\tfeature\nblocklist\tCells_Location_X\nblocklist\tNuclei_Parent_Cells\n"
        );
    }
}
