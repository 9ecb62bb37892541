use crate::store::{RawTable, Value};
use anyhow::{format_err, Context, Error};
use flate2::read::MultiGzDecoder;
use flate2::{Compression, GzBuilder};
use log::debug;
use ndarray::Array2;
use profile_types::{ColumnClass, ColumnClassifier, MetadataColumn, ProfileTable, Stage};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// How a profile table file is parsed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadOptions {
    /// field delimiter; inferred from the file name when unset
    pub delimiter: Option<char>,
    /// metadata / feature split of the header
    pub classifier: ColumnClassifier,
}

/// Text rendering of feature values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloatFormat {
    /// shortest representation that reads back to the same value
    #[default]
    Shortest,
    /// fixed number of decimals
    Decimals(usize),
}

/// How a table file is written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    /// field delimiter; inferred from the file name when unset
    pub delimiter: Option<char>,
    /// rendering of feature values
    pub float_format: FloatFormat,
    /// modification time stored in the gzip header, fixed so that outputs are reproducible
    pub gzip_mtime: u32,
    /// gzip compression level (0-9)
    pub gzip_level: u32,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            delimiter: None,
            float_format: FloatFormat::Shortest,
            gzip_mtime: 1,
            gzip_level: 6,
        }
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension().map_or(false, |e| e == "gz")
}

/// Delimiter implied by a file name: tab for `.tsv` / `.txt`, comma otherwise.
/// A trailing `.gz` is ignored.
pub fn infer_delimiter(path: impl AsRef<Path>) -> u8 {
    let path = path.as_ref();
    let inner = if is_gzip(path) {
        Path::new(path.file_stem().unwrap_or_default())
    } else {
        path
    };
    match inner.extension().and_then(|e| e.to_str()) {
        Some("tsv") | Some("txt") => b'\t',
        _ => b',',
    }
}

fn delimiter_byte(delimiter: Option<char>, path: &Path) -> Result<u8, Error> {
    match delimiter {
        None => Ok(infer_delimiter(path)),
        Some(c) if c.is_ascii() => Ok(c as u8),
        Some(c) => Err(format_err!("delimiter must be a single ASCII character, got {c:?}")),
    }
}

fn open_input(path: &Path) -> Result<Box<dyn Read>, Error> {
    let file = File::open(path).with_context(|| path.display().to_string())?;
    if is_gzip(path) {
        Ok(Box::new(MultiGzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn parse_float(field: &str) -> Option<f64> {
    let field = field.trim();
    if field.is_empty() || field == "NA" {
        return Some(f64::NAN);
    }
    field.parse::<f64>().ok()
}

/// Read a profile table from a delimited file, gzip-compressed when the name ends in `.gz`.
pub fn read_table(path: impl AsRef<Path>, opts: &ReadOptions) -> Result<ProfileTable, Error> {
    let path = path.as_ref();
    let delimiter = delimiter_byte(opts.delimiter, path)?;
    let table = read_table_from(open_input(path)?, delimiter, &opts.classifier)
        .with_context(|| format!("reading {}", path.display()))?;
    debug!(
        "read {}: {} rows, {} metadata, {} features",
        path.display(),
        table.nrows(),
        table.metadata().len(),
        table.n_features()
    );
    Ok(table)
}

/// Read a profile table from any uncompressed reader.
pub fn read_table_from<R: Read>(reader: R, delimiter: u8, classifier: &ColumnClassifier) -> Result<ProfileTable, Error> {
    let mut rdr = csv::ReaderBuilder::new().delimiter(delimiter).from_reader(reader);
    let header: Vec<String> = rdr.headers()?.iter().map(String::from).collect();
    let classes = classifier.resolve(&header, Stage::Io)?;

    let mut metadata: Vec<MetadataColumn> = vec![];
    let mut feature_names = vec![];
    for (name, class) in header.iter().zip(&classes) {
        match class {
            Some(ColumnClass::Metadata) => metadata.push(MetadataColumn::new(name.clone(), Vec::<String>::new())),
            Some(ColumnClass::Feature) => feature_names.push(name.clone()),
            _ => (),
        }
    }

    let mut values = vec![];
    let mut nrows = 0;
    for (line, record) in rdr.records().enumerate() {
        let record = record?;
        let mut m = 0;
        for ((field, class), name) in record.iter().zip(&classes).zip(&header) {
            match class {
                Some(ColumnClass::Metadata) => {
                    metadata[m].values.push(field.to_string());
                    m += 1;
                }
                Some(ColumnClass::Feature) => {
                    let v = parse_float(field).ok_or_else(|| {
                        format_err!("line {}: feature {} is not numeric: {:?}", line + 2, name, field)
                    })?;
                    values.push(v);
                }
                _ => (),
            }
        }
        nrows += 1;
    }

    let features = Array2::from_shape_vec((nrows, feature_names.len()), values)?;
    Ok(ProfileTable::new(metadata, feature_names, features)?)
}

/// Read any delimited file (a platemap, an external metadata table) as text cells.
pub fn read_raw_table(path: impl AsRef<Path>, delimiter: Option<char>) -> Result<RawTable, Error> {
    let path = path.as_ref();
    let delimiter = delimiter_byte(delimiter, path)?;
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .from_reader(open_input(path)?);
    let columns: Vec<String> = rdr
        .headers()
        .with_context(|| path.display().to_string())?
        .iter()
        .map(String::from)
        .collect();
    let mut rows = vec![];
    for record in rdr.records() {
        let record = record.with_context(|| path.display().to_string())?;
        rows.push(record.iter().map(|f| Value::Text(f.to_string())).collect());
    }
    Ok(RawTable::new(columns, rows)?)
}

/// Open `path` for writing, through a gzip encoder with a fixed header when it ends in `.gz`,
/// and hand the writer to `f`.
fn with_output<F>(path: &Path, opts: &WriteOptions, f: F) -> Result<(), Error>
where
    F: FnOnce(&mut dyn Write) -> Result<(), Error>,
{
    let file = File::create(path).with_context(|| path.display().to_string())?;
    if is_gzip(path) {
        let mut gz = GzBuilder::new()
            .mtime(opts.gzip_mtime)
            .write(BufWriter::new(file), Compression::new(opts.gzip_level));
        f(&mut gz)?;
        gz.finish()?.flush()?;
    } else {
        let mut w = BufWriter::new(file);
        f(&mut w)?;
        w.flush()?;
    }
    Ok(())
}

fn format_float(v: f64, format: FloatFormat) -> String {
    if v.is_nan() {
        return String::new();
    }
    match format {
        FloatFormat::Shortest => v.to_string(),
        FloatFormat::Decimals(n) => format!("{v:.n$}"),
    }
}

/// Write a profile table, metadata columns first.
pub fn write_table(table: &ProfileTable, path: impl AsRef<Path>, opts: &WriteOptions) -> Result<(), Error> {
    let path = path.as_ref();
    let delimiter = delimiter_byte(opts.delimiter, path)?;
    with_output(path, opts, |w| write_table_to(table, w, delimiter, opts.float_format))
        .with_context(|| format!("writing {}", path.display()))?;
    debug!("wrote {}: {} rows", path.display(), table.nrows());
    Ok(())
}

/// Write a profile table to any writer.
pub fn write_table_to<W: Write>(table: &ProfileTable, writer: W, delimiter: u8, format: FloatFormat) -> Result<(), Error> {
    let mut wtr = csv::WriterBuilder::new().delimiter(delimiter).from_writer(writer);
    wtr.write_record(
        table
            .metadata_names()
            .into_iter()
            .chain(table.feature_names().iter().map(String::as_str)),
    )?;
    let mut record: Vec<String> = Vec::with_capacity(table.metadata().len() + table.n_features());
    for (row, values) in table.features().rows().into_iter().enumerate() {
        record.clear();
        record.extend(table.metadata().iter().map(|c| c.values[row].clone()));
        record.extend(values.iter().map(|&v| format_float(v, format)));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Write serializable records (metric tables, reports) with a header row.
pub fn write_serialized<T: Serialize>(records: &[T], path: impl AsRef<Path>, opts: &WriteOptions) -> Result<(), Error> {
    let path = path.as_ref();
    let delimiter = delimiter_byte(opts.delimiter, path)?;
    with_output(path, opts, |w| {
        let mut wtr = csv::WriterBuilder::new().delimiter(delimiter).from_writer(w);
        for r in records {
            wtr.serialize(r)?;
        }
        wtr.flush()?;
        Ok(())
    })
    .with_context(|| format!("writing {}", path.display()))
}
