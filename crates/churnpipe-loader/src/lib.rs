//! CSV extraction: reads the customer export into a typed [`Frame`] ready for staging.

use std::collections::HashSet;
use std::path::Path;

use chrono::NaiveDateTime;
use churnpipe_core::{normalize_column_name, Cell, Column, ColumnType, EtlError, Frame};
use churnpipe_storage::{sha256_hex, LoadBatch};
use serde::Serialize;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "churnpipe-loader";

/// Field values read as missing. A lone space is kept as text.
pub const NA_TOKENS: [&str; 19] = [
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

type RawRecord = Vec<Option<String>>;

pub fn is_na_token(value: &str) -> bool {
    NA_TOKENS.contains(&value)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSummary {
    pub name: String,
    pub kind: ColumnType,
    pub missing: usize,
}

/// What a load saw in the file, logged before anything is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub source_path: String,
    pub content_sha256: String,
    pub rows_read: usize,
    pub duplicates_removed: usize,
    pub rows_kept: usize,
    pub columns: Vec<ColumnSummary>,
}

impl LoadSummary {
    pub fn total_missing(&self) -> usize {
        self.columns.iter().map(|c| c.missing).sum()
    }
}

#[derive(Debug, Clone)]
pub struct ExtractedCsv {
    pub frame: Frame,
    pub summary: LoadSummary,
}

impl ExtractedCsv {
    /// Batch record that marks this exact file content as appended to `table`.
    pub fn batch_for(&self, table: &str) -> LoadBatch {
        LoadBatch {
            content_sha256: self.summary.content_sha256.clone(),
            table_name: table.to_string(),
            source_path: self.summary.source_path.clone(),
            row_count: self.summary.rows_kept as i64,
        }
    }
}

/// Read and type the CSV at `path`.
pub fn extract_csv(path: &Path) -> Result<ExtractedCsv, EtlError> {
    let name = path.display().to_string();
    let bytes = std::fs::read(path).map_err(|err| EtlError::source_unreadable(&name, err))?;
    extract_csv_bytes(&name, &bytes)
}

/// Same as [`extract_csv`], for content that has already been read.
pub fn extract_csv_bytes(source_name: &str, bytes: &[u8]) -> Result<ExtractedCsv, EtlError> {
    let content_sha256 = sha256_hex(bytes);
    let (headers, records) = read_records(source_name, bytes)?;
    let rows_read = records.len();
    let missing = (0..headers.len())
        .map(|i| records.iter().filter(|r| r[i].is_none()).count())
        .collect::<Vec<_>>();

    let columns = headers
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let kind = infer_column_type(records.iter().map(|r| r[i].as_deref()));
            Column::new(name, kind)
        })
        .collect::<Vec<_>>();

    let mut frame = Frame::new(columns.clone());
    for record in &records {
        let row = record
            .iter()
            .zip(&columns)
            .map(|(value, column)| to_cell(value.as_deref(), column.kind))
            .collect();
        frame.push_row(row)?;
    }
    // Compared on typed cells, so `1` and `1.0` in a float column are the same value.
    let duplicates_removed = frame.dedup_rows();

    let summary = LoadSummary {
        source_path: source_name.to_string(),
        content_sha256,
        rows_read,
        duplicates_removed,
        rows_kept: frame.height(),
        columns: frame
            .columns()
            .iter()
            .zip(missing)
            .map(|(column, missing)| ColumnSummary {
                name: column.name.clone(),
                kind: column.kind,
                missing,
            })
            .collect(),
    };
    info!(
        source = source_name,
        rows = summary.rows_read,
        duplicates = summary.duplicates_removed,
        missing = summary.total_missing(),
        "extracted csv"
    );
    Ok(ExtractedCsv { frame, summary })
}

fn read_records(source_name: &str, bytes: &[u8]) -> Result<(Vec<String>, Vec<RawRecord>), EtlError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let raw_headers = reader
        .headers()
        .map_err(|err| EtlError::source_unreadable(source_name, err))?
        .clone();
    if raw_headers.is_empty() || raw_headers.iter().all(|h| h.trim().is_empty()) {
        return Err(EtlError::source_unreadable(source_name, "file has no header row"));
    }
    let headers = unique_headers(raw_headers.iter());
    let width = headers.len();

    let mut records = Vec::new();
    for (line, result) in reader.records().enumerate() {
        let record = result.map_err(|err| EtlError::source_unreadable(source_name, err))?;
        if record.len() > width {
            return Err(EtlError::source_unreadable(
                source_name,
                format!(
                    "data row {} has {} fields, expected {width}",
                    line + 1,
                    record.len()
                ),
            ));
        }
        let mut values = record
            .iter()
            .map(|v| (!is_na_token(v)).then(|| v.to_string()))
            .collect::<Vec<_>>();
        values.resize(width, None);
        records.push(values);
    }

    if records.is_empty() {
        return Err(EtlError::source_unreadable(source_name, "file has no data rows"));
    }
    debug!(source = source_name, columns = width, rows = records.len(), "read csv records");
    Ok((headers, records))
}

/// Normalize headers; a name seen before gets a numeric suffix so every column stays addressable.
fn unique_headers<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.map(|header| {
        let base = normalize_column_name(header);
        let mut name = base.clone();
        let mut n = 1;
        while !seen.insert(name.clone()) {
            name = format!("{base}_{n}");
            n += 1;
        }
        name
    })
    .collect()
}

fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
}

fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Pick the storage type for one column from its raw values (`None` is missing).
///
/// Integers with gaps widen to float. Booleans and timestamps with gaps stay text.
/// A column with no values at all is text.
pub fn infer_column_type<'a>(values: impl Iterator<Item = Option<&'a str>>) -> ColumnType {
    let mut any_present = false;
    let mut any_missing = false;
    let (mut int, mut float, mut boolean, mut timestamp) = (true, true, true, true);

    for value in values {
        let Some(value) = value else {
            any_missing = true;
            continue;
        };
        any_present = true;
        if int && value.trim().parse::<i64>().is_err() {
            int = false;
        }
        if float && value.trim().parse::<f64>().is_err() {
            float = false;
        }
        if boolean && parse_bool(value.trim()).is_none() {
            boolean = false;
        }
        if timestamp && parse_timestamp(value).is_none() {
            timestamp = false;
        }
    }

    if !any_present {
        return ColumnType::Text;
    }
    match (int, float, boolean, timestamp, any_missing) {
        (true, _, _, _, false) => ColumnType::Integer,
        (true, _, _, _, true) | (_, true, _, _, _) => ColumnType::Float,
        (_, _, true, _, false) => ColumnType::Boolean,
        (_, _, _, true, false) => ColumnType::Timestamp,
        _ => ColumnType::Text,
    }
}

fn to_cell(value: Option<&str>, kind: ColumnType) -> Cell {
    let Some(value) = value else {
        return Cell::Null;
    };
    let parsed = match kind {
        ColumnType::Text => Some(Cell::Text(value.to_string())),
        ColumnType::Integer => value.trim().parse().ok().map(Cell::Integer),
        ColumnType::Float => value.trim().parse().ok().map(Cell::Float),
        ColumnType::Boolean => parse_bool(value.trim()).map(Cell::Boolean),
        ColumnType::Timestamp => parse_timestamp(value).map(Cell::Timestamp),
    };
    parsed.unwrap_or(Cell::Null)
}
