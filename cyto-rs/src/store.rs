use anyhow::{Context, Error};
use log::debug;
use profile_types::{PipelineError, Stage};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// A single cell of a raw table.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// missing
    Null,
    /// integer
    Integer(i64),
    /// floating point
    Real(f64),
    /// text
    Text(String),
}

impl Value {
    /// Numeric reading of the value: `Null` and unparsable text are `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Null => None,
            Value::Integer(i) => Some(*i as f64),
            Value::Real(f) => Some(*f),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    /// The value as it is written into a metadata column or used in a join key.
    pub fn to_key_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Integer(i) => i.to_string(),
            Value::Real(f) => {
                let mut s = String::new();
                // integral reals print without a fractional part so that they match integer keys
                if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 {
                    let _ = write!(s, "{}", *f as i64);
                } else {
                    let _ = write!(s, "{f}");
                }
                s
            }
            Value::Text(t) => t.clone(),
        }
    }
}

/// Rows of loosely typed values under a header, as read from a store or a delimited file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawTable {
    /// column names
    pub columns: Vec<String>,
    /// rows, each as wide as `columns`
    pub rows: Vec<Vec<Value>>,
}

impl RawTable {
    /// Build a table, checking that every row matches the header width.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<RawTable, PipelineError> {
        if let Some((i, r)) = rows.iter().enumerate().find(|(_, r)| r.len() != columns.len()) {
            return Err(PipelineError::schema(
                Stage::Load,
                format!("row {} has {} values for {} columns", i, r.len(), columns.len()),
            ));
        }
        Ok(RawTable { columns, rows })
    }

    /// Number of rows
    pub fn nrows(&self) -> usize {
        self.rows.len()
    }

    /// Position of a column
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Positions of the named columns; all must exist.
    pub fn require<S: AsRef<str>>(&self, names: &[S], stage: Stage, table: &str) -> Result<Vec<usize>, PipelineError> {
        let mut missing = vec![];
        let idx = names
            .iter()
            .filter_map(|n| {
                let found = self.column_index(n.as_ref());
                if found.is_none() {
                    missing.push(n.as_ref().to_string());
                }
                found
            })
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::schema(
                stage,
                format!("{} table is missing columns: {}", table, missing.join(", ")),
            ));
        }
        Ok(idx)
    }

    /// Join key of a row built from the given column positions.
    pub fn key(&self, row: usize, columns: &[usize]) -> Vec<String> {
        columns.iter().map(|&c| self.rows[row][c].to_key_string()).collect()
    }
}

/// Source of CellProfiler-style single-cell measurements: one image table that maps images
/// to wells, plus one table per compartment with a row per segmented object.
pub trait SingleCellSource {
    /// The per-image table
    fn image_table(&self) -> Result<RawTable, Error>;

    /// The per-object table of a compartment (`cells`, `cytoplasm`, `nuclei`, ...)
    fn compartment_table(&self, compartment: &str) -> Result<RawTable, Error>;
}

/// Single-cell source held in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemorySource {
    image: RawTable,
    compartments: BTreeMap<String, RawTable>,
}

impl InMemorySource {
    /// New source around an image table
    pub fn new(image: RawTable) -> Self {
        InMemorySource {
            image,
            compartments: BTreeMap::new(),
        }
    }

    /// Add a compartment table; names are case-insensitive.
    pub fn with_compartment(mut self, name: &str, table: RawTable) -> Self {
        self.compartments.insert(name.to_lowercase(), table);
        self
    }
}

impl SingleCellSource for InMemorySource {
    fn image_table(&self) -> Result<RawTable, Error> {
        Ok(self.image.clone())
    }

    fn compartment_table(&self, compartment: &str) -> Result<RawTable, Error> {
        self.compartments
            .get(&compartment.to_lowercase())
            .cloned()
            .ok_or_else(|| PipelineError::schema(Stage::Load, format!("no compartment table {compartment}")).into())
    }
}

/// A CellProfiler SQLite backend: an `Image` table and one table per compartment.
pub struct SqliteStore {
    path: PathBuf,
    conn: Connection,
    tables: Vec<String>,
}

impl SqliteStore {
    /// Open a store read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<SqliteStore, Error> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)
            .with_context(|| path.display().to_string())?;
        SqliteStore::from_connection(conn, path)
    }

    /// Wrap an already open connection.
    pub fn from_connection(conn: Connection, path: impl AsRef<Path>) -> Result<SqliteStore, Error> {
        let tables = {
            let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            names
        };
        debug!("{}: tables {:?}", path.as_ref().display(), tables);
        Ok(SqliteStore {
            path: path.as_ref().to_path_buf(),
            conn,
            tables,
        })
    }

    fn resolve_table(&self, name: &str) -> Result<&str, Error> {
        self.tables
            .iter()
            .find(|t| t.eq_ignore_ascii_case(name))
            .map(String::as_str)
            .ok_or_else(|| {
                PipelineError::schema(
                    Stage::Load,
                    format!(
                        "{} has no table {} (tables: {})",
                        self.path.display(),
                        name,
                        self.tables.join(", ")
                    ),
                )
                .into()
            })
    }

    fn read_table(&self, name: &str) -> Result<RawTable, Error> {
        let table = self.resolve_table(name)?;
        let mut stmt = self.conn.prepare(&format!("SELECT * FROM \"{}\"", table.replace('"', "\"\"")))?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let ncols = columns.len();
        let mut rows = vec![];
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(ncols);
            for i in 0..ncols {
                values.push(match row.get_ref(i)? {
                    ValueRef::Null | ValueRef::Blob(_) => Value::Null,
                    ValueRef::Integer(v) => Value::Integer(v),
                    ValueRef::Real(v) => Value::Real(v),
                    ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
                });
            }
            rows.push(values);
        }
        debug!("{}: read {} rows from {}", self.path.display(), rows.len(), table);
        Ok(RawTable::new(columns, rows)?)
    }
}

impl SingleCellSource for SqliteStore {
    fn image_table(&self) -> Result<RawTable, Error> {
        self.read_table("Image")
    }

    fn compartment_table(&self, compartment: &str) -> Result<RawTable, Error> {
        self.read_table(compartment)
    }
}
