use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Error, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::schema::{ColumnRole, SchemaDescriptor};
use crate::sql::ValidatedQuery;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 2_000;

/// One result cell. Array-role columns stored as serialized lists come back
/// decoded; `NaN` entries become `None`.
#[derive(Debug, Clone, PartialEq, Serialize, schemars::JsonSchema)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Array(Vec<Option<f64>>),
}

impl CellValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Real(value) => value.is_nan(),
            Self::Array(values) => values.iter().all(Option::is_none),
            Self::Integer(_) | Self::Text(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, schemars::JsonSchema)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    pub row_count: usize,

    /// The executor's own row cap stopped the fetch.
    pub truncated: bool,
}

impl ResultTable {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            truncated: false,
        }
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
    }

    pub fn column_values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a CellValue> + 'a {
        let index = self.column_index(name);
        self.rows
            .iter()
            .filter_map(move |row| index.and_then(|index| row.get(index)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, schemars::JsonSchema)]
pub struct SchemaVerification {
    pub table: String,
    pub table_present: bool,
    pub missing_columns: Vec<String>,
    pub undescribed_columns: Vec<String>,
}

impl SchemaVerification {
    #[must_use]
    pub fn is_compatible(&self) -> bool {
        self.table_present && self.missing_columns.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoreColumn {
    name: String,
    declared_type: Option<String>,
}

/// Read-only handle on the profile store. Every call opens its own
/// connection, so the handle is cheap to share across tasks.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
    descriptor: Arc<SchemaDescriptor>,
    row_cap: usize,
    busy_timeout: Duration,
}

impl ProfileStore {
    #[must_use]
    pub fn new(
        path: impl Into<PathBuf>,
        descriptor: Arc<SchemaDescriptor>,
        row_cap: usize,
        busy_timeout: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            descriptor,
            row_cap: row_cap.max(1),
            busy_timeout,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open_read_only(&self) -> Result<Connection> {
        let connection = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("unable to open profile store: {}", self.path.display()))?;
        connection
            .busy_timeout(self.busy_timeout)
            .context("failed to set busy timeout")?;
        connection
            .execute_batch("PRAGMA query_only = ON;")
            .context("failed to enable query_only")?;
        Ok(connection)
    }

    /// Blocking; run it on the blocking pool from async code.
    pub fn execute(&self, query: &ValidatedQuery) -> Result<ResultTable, PipelineError> {
        let started = Instant::now();
        let table = self
            .open_read_only()
            .and_then(|connection| {
                execute_validated(&connection, query, &self.descriptor, self.row_cap)
            })
            .map_err(|error| PipelineError::ExecutionError(format!("{error:#}")))?;

        info!(
            rows = table.row_count,
            truncated = table.truncated,
            duration_ms = started.elapsed().as_millis() as u64,
            "query executed"
        );
        Ok(table)
    }

    /// Compares the store's table with the descriptor. `rowid` is implicit
    /// in SQLite and never reported missing.
    pub fn verify_schema(&self) -> Result<SchemaVerification> {
        let connection = self.open_read_only()?;
        let store_columns = load_table_columns(&connection, &self.descriptor.table)?;
        debug!(
            table = %self.descriptor.table,
            columns = store_columns.len(),
            "loaded store columns"
        );

        let missing_columns = self
            .descriptor
            .columns
            .iter()
            .filter(|column| !column.name.eq_ignore_ascii_case("rowid"))
            .filter(|column| {
                !store_columns
                    .iter()
                    .any(|store| store.name.eq_ignore_ascii_case(&column.name))
            })
            .map(|column| column.name.clone())
            .collect();
        let undescribed_columns = store_columns
            .iter()
            .filter(|store| !self.descriptor.has_column(&store.name))
            .map(|store| match &store.declared_type {
                Some(declared) if !declared.is_empty() => format!("{} ({declared})", store.name),
                _ => store.name.clone(),
            })
            .collect();

        Ok(SchemaVerification {
            table: self.descriptor.table.clone(),
            table_present: !store_columns.is_empty(),
            missing_columns,
            undescribed_columns,
        })
    }
}

/// Runs an already validated statement and materializes at most `row_cap`
/// rows.
pub fn execute_validated(
    connection: &Connection,
    query: &ValidatedQuery,
    descriptor: &SchemaDescriptor,
    row_cap: usize,
) -> Result<ResultTable> {
    let mut statement = connection
        .prepare(query.as_str())
        .map_err(|error| Error::new(error).context("failed to prepare query"))?;
    let names = statement
        .column_names()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();

    // `*` expands to every store column; keep only the described ones.
    let undescribed = if query.has_wildcard() {
        load_table_columns(connection, &descriptor.table)?
            .into_iter()
            .filter(|column| !descriptor.has_column(&column.name))
            .map(|column| column.name.to_ascii_lowercase())
            .collect::<Vec<_>>()
    } else {
        Vec::new()
    };
    let kept = names
        .iter()
        .enumerate()
        .filter(|(_, name)| !undescribed.contains(&name.to_ascii_lowercase()))
        .map(|(index, name)| {
            let is_array = descriptor
                .column(name)
                .is_some_and(|column| column.role == ColumnRole::MeasurementArray);
            (index, is_array)
        })
        .collect::<Vec<_>>();
    if kept.len() < names.len() {
        debug!(
            dropped = names.len() - kept.len(),
            "wildcard projection dropped undescribed columns"
        );
    }
    let columns = kept
        .iter()
        .map(|(index, _)| names[*index].clone())
        .collect::<Vec<_>>();

    let mut rows = statement
        .query([])
        .map_err(|error| Error::new(error).context("failed to execute query"))?;
    let mut result_rows = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows
        .next()
        .map_err(|error| Error::new(error).context("failed to fetch query row"))?
    {
        if result_rows.len() >= row_cap {
            truncated = true;
            break;
        }

        let mut cells = Vec::with_capacity(kept.len());
        for (index, is_array) in &kept {
            let value = row
                .get::<usize, SqlValue>(*index)
                .map_err(|error| Error::new(error).context("failed to decode query column"))?;
            cells.push(cell_from_sql(value, *is_array));
        }
        result_rows.push(cells);
    }

    Ok(ResultTable {
        columns,
        row_count: result_rows.len(),
        rows: result_rows,
        truncated,
    })
}

fn cell_from_sql(value: SqlValue, array_role: bool) -> CellValue {
    match value {
        SqlValue::Null => CellValue::Null,
        SqlValue::Integer(value) => CellValue::Integer(value),
        SqlValue::Real(value) if array_role => CellValue::Array(vec![finite(value)]),
        SqlValue::Real(value) => CellValue::Real(value),
        SqlValue::Text(text) if array_role => match decode_array_text(&text) {
            Some(values) => CellValue::Array(values),
            None => CellValue::Text(text),
        },
        SqlValue::Text(text) => CellValue::Text(text),
        SqlValue::Blob(bytes) => CellValue::Text(encode_blob_hex(&bytes)),
    }
}

/// Decodes `[1.5, nan, 2]` (commas optional) into numbers; `nan`, `null`
/// and `--` become `None`. Anything else is not an array.
#[must_use]
pub fn decode_array_text(text: &str) -> Option<Vec<Option<f64>>> {
    let inner = text.trim().strip_prefix('[')?.strip_suffix(']')?;
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }

    inner
        .split(|ch: char| ch == ',' || ch.is_whitespace())
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.to_ascii_lowercase().as_str() {
            "nan" | "null" | "none" | "--" => Some(None),
            _ => item.parse::<f64>().ok().map(finite),
        })
        .collect()
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

fn load_table_columns(connection: &Connection, table: &str) -> Result<Vec<StoreColumn>> {
    let pragma_sql = format!("PRAGMA table_info({})", sqlite_single_quoted(table));
    let mut statement = connection
        .prepare(&pragma_sql)
        .with_context(|| format!("failed to prepare column introspection for `{table}`"))?;

    let column_rows = statement
        .query_map([], |row| {
            Ok(StoreColumn {
                name: row.get::<usize, String>(1)?,
                declared_type: row.get::<usize, Option<String>>(2)?,
            })
        })
        .with_context(|| format!("failed to execute column introspection for `{table}`"))?;

    column_rows
        .map(|row| row.context("failed to decode schema column row"))
        .collect()
}

fn sqlite_single_quoted(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn encode_blob_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push(HEX[(byte >> 4) as usize] as char);
        output.push(HEX[(byte & 0x0f) as usize] as char);
    }
    output
}
