// Command line utility for running cyto-rs stages

use anyhow::{bail, Context, Error};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use cyto_eval::evaluate::{grit_by_stratum, write_evaluation, write_median_correlations, Evaluation};
use cyto_eval::EvaluateOptions;
use cyto_rs::aggregate::{aggregate, AggregateOperation, AggregateOptions};
use cyto_rs::annotate::{annotate, annotate_with_external, AnnotateOptions, JoinKind, JoinOn};
use cyto_rs::config::{run_pipeline, write_selection_report, PipelineConfig};
use cyto_rs::consensus::{consensus, ConsensusOperation, ConsensusOptions};
use cyto_rs::feature_select::{feature_select, load_blocklist, FeatureSelectOptions, SelectionOp};
use cyto_rs::io::{read_raw_table, read_table, write_serialized, write_table, ReadOptions, WriteOptions};
use cyto_rs::normalize::{normalize, NormalizeMethod, NormalizeOptions};
use cyto_rs::store::SqliteStore;
use log::{info, LevelFilter};
use profile_types::{Predicate, ProfileTable, RowFilter};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

fn input(name: &'static str, help: &'static str, index: usize) -> Arg {
    Arg::new(name)
        .help(help)
        .required(true)
        .index(index)
        .value_parser(value_parser!(PathBuf))
}

fn options_arg() -> Arg {
    Arg::new("OPTIONS")
        .help("JSON file with the stage options; command line flags override it")
        .long("options")
        .value_parser(value_parser!(PathBuf))
}

fn samples_arg() -> Arg {
    Arg::new("SAMPLES")
        .help("Reference rows, as COLUMN==VALUE or COLUMN!=VALUE (default: all rows)")
        .short('s')
        .long("samples")
}

fn list_arg(name: &'static str, long: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .help(help)
        .long(long)
        .value_delimiter(',')
        .num_args(1..)
}

fn cli() -> Command {
    Command::new("cyto-rs-cmd")
        .about("Image-based profiling: aggregate, annotate, normalize, select features, build consensus and evaluate")
        .subcommand_required(true)
        .arg(
            Arg::new("LOG_LEVEL")
                .help("Log level (error, warn, info, debug, trace)")
                .long("log-level")
                .global(true)
                .default_value("info")
                .value_parser(["off", "error", "warn", "info", "debug", "trace"]),
        )
        .subcommand(
            Command::new("aggregate")
                .about("Aggregate single cells of a SQLite store into well profiles")
                .arg(input("SQLITE", "CellProfiler SQLite file", 1))
                .arg(input("OUTPUT", "Output profile table", 2))
                .arg(list_arg("STRATA", "strata", "Columns identifying one profile"))
                .arg(list_arg("COMPARTMENTS", "compartments", "Compartment tables to aggregate"))
                .arg(
                    Arg::new("OPERATION")
                        .help("Aggregation operation")
                        .short('a')
                        .long("operation")
                        .value_parser(["median", "mean"]),
                )
                .arg(
                    Arg::new("SEED")
                        .help("Seed of the subsampling generator")
                        .long("seed")
                        .value_parser(value_parser!(u64)),
                )
                .arg(
                    Arg::new("COUNTS")
                        .help("Also write the cell counts per stratum to this file")
                        .long("counts")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(options_arg()),
        )
        .subcommand(
            Command::new("annotate")
                .about("Join platemap metadata onto profiles")
                .arg(input("PROFILES", "Profile table", 1))
                .arg(input("PLATEMAP", "Platemap file", 2))
                .arg(input("OUTPUT", "Output profile table", 3))
                .arg(
                    Arg::new("JOIN_ON")
                        .help("Platemap and profile join columns, as PLATEMAP_COLUMN,PROFILE_COLUMN")
                        .long("join-on")
                        .value_delimiter(',')
                        .num_args(2),
                )
                .arg(
                    Arg::new("EXTERNAL")
                        .help("Second metadata table, left-joined after the platemap")
                        .long("external")
                        .value_parser(value_parser!(PathBuf))
                        .requires("EXTERNAL_JOIN_ON"),
                )
                .arg(
                    Arg::new("EXTERNAL_JOIN_ON")
                        .help("External and profile join columns, as EXTERNAL_COLUMN,PROFILE_COLUMN")
                        .long("external-join-on")
                        .value_delimiter(',')
                        .num_args(2),
                )
                .arg(
                    Arg::new("LEFT")
                        .help("Keep profiles without a platemap row")
                        .long("left")
                        .action(ArgAction::SetTrue),
                )
                .arg(options_arg()),
        )
        .subcommand(
            Command::new("normalize")
                .about("Normalize features against a reference subset")
                .arg(input("INPUT", "Profile table", 1))
                .arg(input("OUTPUT", "Output profile table", 2))
                .arg(
                    Arg::new("METHOD")
                        .help("Normalization method")
                        .short('m')
                        .long("method")
                        .value_parser(["standardize", "robustize", "mad_robustize"]),
                )
                .arg(samples_arg())
                .arg(options_arg()),
        )
        .subcommand(
            Command::new("feature-select")
                .about("Remove uninformative features")
                .arg(input("INPUT", "Profile table", 1))
                .arg(input("OUTPUT", "Output profile table", 2))
                .arg(list_arg(
                    "OPERATIONS",
                    "operations",
                    "Selection operations in order (variance_threshold, drop_na_columns, correlation_threshold, blocklist, drop_outliers)",
                ))
                .arg(
                    Arg::new("BLOCKLIST")
                        .help("Blocklist file replacing the built-in blocklist")
                        .long("blocklist")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("REPORT")
                        .help("Write the removed features to this file")
                        .long("report")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(samples_arg())
                .arg(options_arg()),
        )
        .subcommand(
            Command::new("consensus")
                .about("Collapse replicate profiles into one consensus profile")
                .arg(input("INPUT", "Profile table", 1))
                .arg(input("OUTPUT", "Output profile table", 2))
                .arg(list_arg("REPLICATE_COLUMNS", "replicate-columns", "Columns identifying replicates"))
                .arg(
                    Arg::new("OPERATION")
                        .help("Consensus operation")
                        .short('a')
                        .long("operation")
                        .value_parser(["median", "mean", "modz"]),
                )
                .arg(options_arg()),
        )
        .subcommand(
            Command::new("evaluate")
                .about("Evaluate profile quality")
                .arg(
                    Arg::new("INPUT")
                        .help("Profile table (an http(s) URL with the remote feature)")
                        .required(true)
                        .index(1),
                )
                .arg(input("OUTPUT", "Output metric table", 2))
                .arg(options_arg().required(true))
                .arg(
                    Arg::new("STRATUM")
                        .help("Compute grit separately within each value of this column")
                        .long("stratum"),
                )
                .arg(
                    Arg::new("MEDIANS")
                        .help("Write the per-group median replicate similarity to this file")
                        .long("median-correlations")
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("pipeline")
                .about("Run every stage from single cells to consensus profiles for one plate")
                .arg(
                    Arg::new("CONFIG")
                        .help("JSON pipeline configuration")
                        .short('c')
                        .long("config")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
}

pub fn main() -> Result<(), Error> {
    let matches = cli().get_matches();

    let level = matches
        .get_one::<String>("LOG_LEVEL")
        .and_then(|l| l.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_micros()
        .init();

    match matches.subcommand() {
        Some(("aggregate", m)) => run_aggregate(m),
        Some(("annotate", m)) => run_annotate(m),
        Some(("normalize", m)) => run_normalize(m),
        Some(("feature-select", m)) => run_feature_select(m),
        Some(("consensus", m)) => run_consensus(m),
        Some(("evaluate", m)) => run_evaluate(m),
        Some(("pipeline", m)) => {
            let path: &PathBuf = required(m, "CONFIG")?;
            let config = PipelineConfig::from_json(path)?;
            let (_, outputs) = run_pipeline(&config)?;
            info!("pipeline outputs: {}", serde_json::to_string(&outputs)?);
            Ok(())
        }
        _ => bail!("no subcommand given"),
    }
}

fn required<'a, T: Clone + Send + Sync + 'static>(m: &'a ArgMatches, name: &str) -> Result<&'a T, Error> {
    m.get_one::<T>(name)
        .with_context(|| format!("missing argument {name}"))
}

fn list(m: &ArgMatches, name: &str) -> Option<Vec<String>> {
    m.get_many::<String>(name).map(|v| v.cloned().collect())
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let file = File::open(path).with_context(|| path.display().to_string())?;
    serde_json::from_reader(BufReader::new(file)).with_context(|| format!("parsing options {}", path.display()))
}

fn load_options<T: DeserializeOwned + Default>(m: &ArgMatches) -> Result<T, Error> {
    match m.get_one::<PathBuf>("OPTIONS") {
        Some(path) => load_json(path),
        None => Ok(T::default()),
    }
}

fn samples(m: &ArgMatches) -> Result<Option<RowFilter>, Error> {
    m.get_one::<String>("SAMPLES")
        .map(|s| Ok(RowFilter::Where(s.parse::<Predicate>()?)))
        .transpose()
}

fn run_aggregate(m: &ArgMatches) -> Result<(), Error> {
    let mut opts: AggregateOptions = load_options(m)?;
    if let Some(strata) = list(m, "STRATA") {
        opts.strata = strata;
    }
    if let Some(compartments) = list(m, "COMPARTMENTS") {
        opts.compartments = compartments;
    }
    if let Some(op) = m.get_one::<String>("OPERATION") {
        opts.operation = op.parse::<AggregateOperation>()?;
    }
    if let Some(seed) = m.get_one::<u64>("SEED") {
        opts.seed = Some(*seed);
    }

    let store = SqliteStore::open(required::<PathBuf>(m, "SQLITE")?)?;
    let res = aggregate(&store, &opts)?;
    let write = WriteOptions::default();
    write_table(&res.profiles, required::<PathBuf>(m, "OUTPUT")?, &write)?;
    if let Some(counts) = m.get_one::<PathBuf>("COUNTS") {
        write_table(&res.cell_counts, counts, &write)?;
    }
    Ok(())
}

fn join_on(m: &ArgMatches, name: &str) -> Option<JoinOn> {
    let cols = list(m, name)?;
    Some(JoinOn::new(cols[0].clone(), cols[1].clone()))
}

fn run_annotate(m: &ArgMatches) -> Result<(), Error> {
    let mut opts: AnnotateOptions = load_options(m)?;
    if let Some(j) = join_on(m, "JOIN_ON") {
        opts.join_on = j;
    }
    if m.get_flag("LEFT") {
        opts.join = JoinKind::Left;
    }

    let profiles = read_table(required::<PathBuf>(m, "PROFILES")?, &ReadOptions::default())?;
    let platemap = read_raw_table(required::<PathBuf>(m, "PLATEMAP")?, None)?;
    let annotated = match (m.get_one::<PathBuf>("EXTERNAL"), join_on(m, "EXTERNAL_JOIN_ON")) {
        (Some(path), Some(external_on)) => {
            let external = read_raw_table(path, None)?;
            annotate_with_external(&profiles, &platemap, &external, &external_on, &opts)?
        }
        _ => annotate(&profiles, &platemap, &opts)?,
    };
    write_table(&annotated, required::<PathBuf>(m, "OUTPUT")?, &WriteOptions::default())
}

fn run_normalize(m: &ArgMatches) -> Result<(), Error> {
    let mut opts: NormalizeOptions = load_options(m)?;
    if let Some(method) = m.get_one::<String>("METHOD") {
        opts.method = method.parse::<NormalizeMethod>()?;
    }
    if let Some(samples) = samples(m)? {
        opts.samples = samples;
    }

    let profiles = read_table(required::<PathBuf>(m, "INPUT")?, &ReadOptions::default())?;
    let res = normalize(&profiles, &opts)?;
    write_table(&res.profiles, required::<PathBuf>(m, "OUTPUT")?, &WriteOptions::default())
}

fn run_feature_select(m: &ArgMatches) -> Result<(), Error> {
    let mut opts: FeatureSelectOptions = load_options(m)?;
    if let Some(ops) = list(m, "OPERATIONS") {
        opts.operations = ops
            .iter()
            .map(|s| s.parse::<SelectionOp>())
            .collect::<Result<_, _>>()?;
    }
    if let Some(path) = m.get_one::<PathBuf>("BLOCKLIST") {
        let entries = load_blocklist(path)?;
        for op in opts.operations.iter_mut() {
            if let SelectionOp::Blocklist { entries: e } = op {
                *e = entries.clone();
            }
        }
    }
    if let Some(samples) = samples(m)? {
        opts.samples = samples;
    }

    let profiles = read_table(required::<PathBuf>(m, "INPUT")?, &ReadOptions::default())?;
    let res = feature_select(&profiles, &opts)?;
    let write = WriteOptions::default();
    write_table(&res.profiles, required::<PathBuf>(m, "OUTPUT")?, &write)?;
    if let Some(report) = m.get_one::<PathBuf>("REPORT") {
        write_selection_report(&res.report, report, &write)?;
    }
    Ok(())
}

fn run_consensus(m: &ArgMatches) -> Result<(), Error> {
    let mut opts: ConsensusOptions = load_options(m)?;
    if let Some(cols) = list(m, "REPLICATE_COLUMNS") {
        opts.replicate_columns = cols;
    }
    if let Some(op) = m.get_one::<String>("OPERATION") {
        opts.operation = op.parse::<ConsensusOperation>()?;
    }

    let profiles = read_table(required::<PathBuf>(m, "INPUT")?, &ReadOptions::default())?;
    let res = consensus(&profiles, &opts)?;
    write_table(&res, required::<PathBuf>(m, "OUTPUT")?, &WriteOptions::default())
}

#[cfg(feature = "remote")]
fn read_remote(url: &str, opts: &ReadOptions) -> Result<ProfileTable, Error> {
    use cyto_rs::io::{infer_delimiter, read_table_from};
    use flate2::read::MultiGzDecoder;

    info!("downloading {url}");
    let body = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.bytes())
        .with_context(|| format!("downloading {url}"))?;
    let delimiter = match opts.delimiter {
        Some(c) => u8::try_from(c).with_context(|| format!("delimiter must be ASCII, got {c:?}"))?,
        None => infer_delimiter(url),
    };
    let table = if url.ends_with(".gz") {
        read_table_from(MultiGzDecoder::new(&body[..]), delimiter, &opts.classifier)
    } else {
        read_table_from(&body[..], delimiter, &opts.classifier)
    };
    table.with_context(|| format!("reading {url}"))
}

#[cfg(not(feature = "remote"))]
fn read_remote(url: &str, _opts: &ReadOptions) -> Result<ProfileTable, Error> {
    bail!("cannot read {url}: built without the remote feature")
}

fn read_profiles(location: &str) -> Result<ProfileTable, Error> {
    let opts = ReadOptions::default();
    if location.starts_with("http://") || location.starts_with("https://") {
        read_remote(location, &opts)
    } else {
        read_table(location, &opts)
    }
}

fn run_evaluate(m: &ArgMatches) -> Result<(), Error> {
    let opts: EvaluateOptions = load_json(required::<PathBuf>(m, "OPTIONS")?)?;
    let profiles = read_profiles(required::<String>(m, "INPUT")?)?;
    let output: &PathBuf = required(m, "OUTPUT")?;
    let write = WriteOptions::default();

    if let Some(stratum) = m.get_one::<String>("STRATUM") {
        let res = grit_by_stratum(&profiles, stratum, &opts)?;
        info!("{} grit scores, {} undefined", res.scores.len(), res.undefined);
        return write_serialized(&res.scores, output, &write);
    }

    let res = cyto_eval::evaluate(&profiles, &opts)?;
    write_evaluation(&res, output, &write)?;
    if let Some(path) = m.get_one::<PathBuf>("MEDIANS") {
        let (Evaluation::ReplicateReproducibility(r), cyto_eval::ReplicateGroups::Columns(cols)) =
            (&res, &opts.replicate_groups)
        else {
            bail!("median correlations are only computed by replicate_reproducibility");
        };
        write_median_correlations(r, cols, path, &write)?;
    }
    Ok(())
}
