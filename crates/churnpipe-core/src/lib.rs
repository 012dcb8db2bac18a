//! Core domain model and column contract for churnpipe.

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "churnpipe-core";

/// Columns the cleaned table must carry, in this order.
pub const REQUIRED_COLUMNS: [&str; 10] = [
    "customerid",
    "age",
    "gender",
    "tenure",
    "monthlycharges",
    "contracttype",
    "internetservice",
    "totalcharges",
    "techsupport",
    "churn",
];

/// Two-valued text columns that are stored as booleans after cleaning.
pub const BINARY_COLUMNS: [&str; 2] = ["churn", "techsupport"];

pub const TOTAL_CHARGES_COLUMN: &str = "totalcharges";
pub const CONTRACT_TYPE_COLUMN: &str = "contracttype";

/// The single-space string the source uses for "no value".
pub const BLANK_SENTINEL: &str = " ";

pub const CONTRACT_TYPE_MAP: [(&str, &str); 3] = [
    ("Month-to-Month", "Monthly"),
    ("One-Year", "Yearly"),
    ("Two-Year", "2-Yearly"),
];

pub const BINARY_TRUE: &str = "Yes";
pub const BINARY_FALSE: &str = "No";

pub fn map_contract_type(value: &str) -> Option<&'static str> {
    CONTRACT_TYPE_MAP
        .iter()
        .find(|(from, _)| *from == value)
        .map(|(_, to)| *to)
}

pub fn map_binary(value: &str) -> Option<bool> {
    match value {
        BINARY_TRUE => Some(true),
        BINARY_FALSE => Some(false),
        _ => None,
    }
}

/// Lowercase a header and replace spaces with underscores.
pub fn normalize_column_name(name: &str) -> String {
    name.replace(' ', "_").to_lowercase()
}

/// Storage type a column is persisted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Float => "FLOAT",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }

    /// Map an `information_schema.columns.data_type` value back onto a column type.
    /// Anything unrecognized is read as text.
    pub fn from_catalog_name(data_type: &str) -> Self {
        match data_type.to_ascii_lowercase().as_str() {
            "smallint" | "integer" | "bigint" => ColumnType::Integer,
            "real" | "double precision" | "numeric" | "decimal" => ColumnType::Float,
            "boolean" => ColumnType::Boolean,
            "timestamp without time zone" | "timestamp with time zone" | "timestamp" => {
                ColumnType::Timestamp
            }
            _ => ColumnType::Text,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_type())
    }
}

/// One typed value of a row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Cell {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(NaiveDateTime),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Cell::Null => None,
            Cell::Text(_) => Some(ColumnType::Text),
            Cell::Integer(_) => Some(ColumnType::Integer),
            Cell::Float(_) => Some(ColumnType::Float),
            Cell::Boolean(_) => Some(ColumnType::Boolean),
            Cell::Timestamp(_) => Some(ColumnType::Timestamp),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Numeric view of a cell. Text is parsed leniently; booleans, unparsable and
    /// non-finite values are `None`.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Cell::Integer(v) => Some(*v as f64),
            Cell::Float(v) if v.is_finite() => Some(*v),
            Cell::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
    }

    fn float_bits(v: f64) -> u64 {
        if v == 0.0 {
            0.0f64.to_bits()
        } else {
            v.to_bits()
        }
    }
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Cell::Null, Cell::Null) => true,
            (Cell::Text(a), Cell::Text(b)) => a == b,
            (Cell::Integer(a), Cell::Integer(b)) => a == b,
            (Cell::Float(a), Cell::Float(b)) => Self::float_bits(*a) == Self::float_bits(*b),
            (Cell::Boolean(a), Cell::Boolean(b)) => a == b,
            (Cell::Timestamp(a), Cell::Timestamp(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Cell {}

impl Hash for Cell {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Cell::Null => {}
            Cell::Text(v) => v.hash(state),
            Cell::Integer(v) => v.hash(state),
            Cell::Float(v) => Self::float_bits(*v).hash(state),
            Cell::Boolean(v) => v.hash(state),
            Cell::Timestamp(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => Ok(()),
            Cell::Text(v) => f.write_str(v),
            Cell::Integer(v) => write!(f, "{v}"),
            Cell::Float(v) => write!(f, "{v}"),
            Cell::Boolean(v) => write!(f, "{v}"),
            Cell::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Row-major table of typed cells, the unit every pipeline stage passes around.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    columns: Vec<Column>,
    rows: Vec<Vec<Cell>>,
}

impl Frame {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn from_rows(columns: Vec<Column>, rows: Vec<Vec<Cell>>) -> Result<Self, EtlError> {
        let mut frame = Self::new(columns);
        for row in rows {
            frame.push_row(row)?;
        }
        Ok(frame)
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<(), EtlError> {
        if row.len() != self.columns.len() {
            return Err(EtlError::RowShape {
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_cells(&self, index: usize) -> impl Iterator<Item = &Cell> + '_ {
        self.rows.iter().map(move |row| &row[index])
    }

    pub fn set_column_type(&mut self, index: usize, kind: ColumnType) {
        if let Some(column) = self.columns.get_mut(index) {
            column.kind = kind;
        }
    }

    /// Rewrite every cell of one column in place.
    pub fn map_column(&mut self, index: usize, mut f: impl FnMut(Cell) -> Cell) {
        for row in &mut self.rows {
            let cell = std::mem::replace(&mut row[index], Cell::Null);
            row[index] = f(cell);
        }
    }

    /// Keep only `names`, in that order. Fails naming every absent column.
    pub fn select(&self, table: &str, names: &[&str]) -> Result<Frame, EtlError> {
        let missing = names
            .iter()
            .filter(|name| self.column_index(name).is_none())
            .map(|name| name.to_string())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(EtlError::MissingColumns {
                table: table.to_string(),
                columns: missing,
            });
        }

        let indices = names
            .iter()
            .filter_map(|name| self.column_index(name))
            .collect::<Vec<_>>();
        let columns = indices.iter().map(|&i| self.columns[i].clone()).collect();
        let rows = self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
            .collect();
        Ok(Frame { columns, rows })
    }

    /// Drop rows equal to an earlier row. Returns how many were removed.
    pub fn dedup_rows(&mut self) -> usize {
        let before = self.rows.len();
        let mut seen = HashSet::with_capacity(before);
        let rows = std::mem::take(&mut self.rows);
        self.rows = rows
            .into_iter()
            .filter(|row| seen.insert(row.clone()))
            .collect();
        before - self.rows.len()
    }

    pub fn null_counts(&self) -> Vec<(String, usize)> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), self.column_cells(i).filter(|v| v.is_null()).count()))
            .collect()
    }
}

/// Pipeline task identifiers, as they appear in `etl_logs.task_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    SetupDb,
    LoadData,
    CleanData,
}

impl PipelineStep {
    pub const ORDER: [PipelineStep; 3] = [
        PipelineStep::SetupDb,
        PipelineStep::LoadData,
        PipelineStep::CleanData,
    ];

    pub fn task_id(self) -> &'static str {
        match self {
            PipelineStep::SetupDb => "setup_db",
            PipelineStep::LoadData => "load_data",
            PipelineStep::CleanData => "clean_data",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.task_id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "running" => Some(StepStatus::Running),
            "success" => Some(StepStatus::Success),
            "failed" => Some(StepStatus::Failed),
            "skipped" => Some(StepStatus::Skipped),
            _ => None,
        }
    }
}

/// One row of `etl_logs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtlLogEntry {
    pub id: Option<i32>,
    pub task_id: String,
    pub status: StepStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl EtlLogEntry {
    pub fn started(step: PipelineStep, start_time: DateTime<Utc>) -> Self {
        Self {
            id: None,
            task_id: step.task_id().to_string(),
            status: StepStatus::Running,
            start_time,
            end_time: None,
            error_message: None,
        }
    }

    pub fn finish(&mut self, end_time: DateTime<Utc>, outcome: Result<(), &EtlError>) {
        self.end_time = Some(end_time);
        match outcome {
            Ok(()) => {
                self.status = StepStatus::Success;
                self.error_message = None;
            }
            Err(err) => {
                self.status = StepStatus::Failed;
                self.error_message = Some(format!("[{}] {err}", err.kind().as_str()));
            }
        }
    }
}

/// Typed view of one cleaned-table row, as the dashboard consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedCustomer {
    pub customer_id: String,
    pub age: Option<f64>,
    pub gender: Option<String>,
    pub tenure: Option<f64>,
    pub monthly_charges: Option<f64>,
    pub contract_type: Option<String>,
    pub internet_service: Option<String>,
    pub total_charges: Option<f64>,
    pub tech_support: Option<bool>,
    pub churn: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    SourceUnreadable,
    Connection,
    MissingColumns,
    ImputationImpossible,
    WriteFailure,
    UnmappedValue,
    Config,
    InvalidFrame,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SourceUnreadable => "source-unreadable",
            ErrorKind::Connection => "connection-failure",
            ErrorKind::MissingColumns => "schema-missing-columns",
            ErrorKind::ImputationImpossible => "imputation-impossible",
            ErrorKind::WriteFailure => "write-failure",
            ErrorKind::UnmappedValue => "unmapped-value",
            ErrorKind::Config => "config-invalid",
            ErrorKind::InvalidFrame => "invalid-frame",
        }
    }

    /// Only transient store failures are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Connection | ErrorKind::WriteFailure)
    }

    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::Config => 2,
            ErrorKind::SourceUnreadable => 3,
            ErrorKind::Connection => 4,
            ErrorKind::MissingColumns => 5,
            ErrorKind::ImputationImpossible => 6,
            ErrorKind::WriteFailure => 7,
            ErrorKind::UnmappedValue => 8,
            ErrorKind::InvalidFrame => 9,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
pub enum EtlError {
    #[error("source {source_name} is unreadable: {reason}")]
    SourceUnreadable { source_name: String, reason: String },
    #[error("database connection failed: {0}")]
    Connection(String),
    #[error("required columns missing from {table}: {}", .columns.join(", "))]
    MissingColumns { table: String, columns: Vec<String> },
    #[error("cannot impute column {column}: it has no non-null values")]
    ImputationImpossible { column: String },
    #[error("write to {table} failed: {reason}")]
    WriteFailure {
        table: String,
        reason: String,
        /// False when the store rejected the statement itself; another attempt fails the same way.
        retryable: bool,
    },
    #[error("column {column} has values outside Yes/No: {}", .values.join(", "))]
    UnmappedValues { column: String, values: Vec<String> },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("row has {found} cells but the frame has {expected} columns")]
    RowShape { expected: usize, found: usize },
}

impl EtlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EtlError::SourceUnreadable { .. } => ErrorKind::SourceUnreadable,
            EtlError::Connection(_) => ErrorKind::Connection,
            EtlError::MissingColumns { .. } => ErrorKind::MissingColumns,
            EtlError::ImputationImpossible { .. } => ErrorKind::ImputationImpossible,
            EtlError::WriteFailure { .. } => ErrorKind::WriteFailure,
            EtlError::UnmappedValues { .. } => ErrorKind::UnmappedValue,
            EtlError::Config(_) => ErrorKind::Config,
            EtlError::RowShape { .. } => ErrorKind::InvalidFrame,
        }
    }

    pub fn source_unreadable(source_name: impl Into<String>, reason: impl fmt::Display) -> Self {
        EtlError::SourceUnreadable {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn write_failure(table: impl Into<String>, reason: impl fmt::Display) -> Self {
        EtlError::WriteFailure {
            table: table.into(),
            reason: reason.to_string(),
            retryable: true,
        }
    }

    /// A write the store refused outright (undefined column, out-of-range value).
    pub fn write_rejected(table: impl Into<String>, reason: impl fmt::Display) -> Self {
        EtlError::WriteFailure {
            table: table.into(),
            reason: reason.to_string(),
            retryable: false,
        }
    }

    /// Whether another attempt can succeed. Narrower than the kind for rejected writes.
    pub fn is_retryable(&self) -> bool {
        match self {
            EtlError::WriteFailure { retryable, .. } => *retryable,
            other => other.kind().is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(v: &str) -> Cell {
        Cell::Text(v.to_string())
    }

    fn sample_frame() -> Frame {
        Frame::from_rows(
            vec![
                Column::new("customerid", ColumnType::Integer),
                Column::new("gender", ColumnType::Text),
                Column::new("totalcharges", ColumnType::Float),
            ],
            vec![
                vec![Cell::Integer(1), text("Male"), Cell::Float(10.5)],
                vec![Cell::Integer(2), text("Female"), Cell::Null],
                vec![Cell::Integer(1), text("Male"), Cell::Float(10.5)],
            ],
        )
        .unwrap()
    }

    #[test]
    fn header_normalization_lowercases_and_underscores() {
        assert_eq!(normalize_column_name("Customer ID"), "customer_id");
        assert_eq!(normalize_column_name("MonthlyCharges"), "monthlycharges");
    }

    #[test]
    fn contract_type_map_covers_three_entries_only() {
        assert_eq!(map_contract_type("Month-to-Month"), Some("Monthly"));
        assert_eq!(map_contract_type("One-Year"), Some("Yearly"));
        assert_eq!(map_contract_type("Two-Year"), Some("2-Yearly"));
        assert_eq!(map_contract_type("Weekly"), None);
    }

    #[test]
    fn binary_map_is_case_sensitive() {
        assert_eq!(map_binary("Yes"), Some(true));
        assert_eq!(map_binary("No"), Some(false));
        assert_eq!(map_binary("yes"), None);
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let mut frame = sample_frame();
        assert_eq!(frame.dedup_rows(), 1);
        assert_eq!(frame.height(), 2);
        assert_eq!(frame.rows()[0][0], Cell::Integer(1));
        assert_eq!(frame.rows()[1][0], Cell::Integer(2));
    }

    #[test]
    fn booleans_have_no_numeric_value() {
        assert_eq!(Cell::Boolean(true).to_f64(), None);
        assert_eq!(Cell::Text(" 12.5".into()).to_f64(), Some(12.5));
        assert_eq!(Cell::Integer(3).to_f64(), Some(3.0));
    }

    #[test]
    fn float_cells_treat_signed_zero_as_equal() {
        assert_eq!(Cell::Float(0.0), Cell::Float(-0.0));
        assert_ne!(Cell::Float(1.0), Cell::Integer(1));
    }

    #[test]
    fn select_reports_every_missing_column() {
        let frame = sample_frame();
        let err = frame
            .select("customer_data", &["customerid", "churn", "tenure"])
            .unwrap_err();
        match err {
            EtlError::MissingColumns { table, columns } => {
                assert_eq!(table, "customer_data");
                assert_eq!(columns, vec!["churn".to_string(), "tenure".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn select_reorders_columns() {
        let frame = sample_frame();
        let picked = frame.select("t", &["totalcharges", "customerid"]).unwrap();
        assert_eq!(picked.column_names(), vec!["totalcharges", "customerid"]);
        assert_eq!(picked.rows()[0], vec![Cell::Float(10.5), Cell::Integer(1)]);
    }

    #[test]
    fn push_row_rejects_wrong_width() {
        let mut frame = Frame::new(vec![Column::new("a", ColumnType::Text)]);
        let err = frame.push_row(vec![Cell::Null, Cell::Null]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFrame);
    }

    #[test]
    fn catalog_names_map_back_to_column_types() {
        assert_eq!(ColumnType::from_catalog_name("double precision"), ColumnType::Float);
        assert_eq!(ColumnType::from_catalog_name("integer"), ColumnType::Integer);
        assert_eq!(
            ColumnType::from_catalog_name("timestamp without time zone"),
            ColumnType::Timestamp
        );
        assert_eq!(ColumnType::from_catalog_name("character varying"), ColumnType::Text);
    }

    #[test]
    fn log_entry_records_failure_kind() {
        let start = Utc::now();
        let mut entry = EtlLogEntry::started(PipelineStep::CleanData, start);
        assert_eq!(entry.task_id, "clean_data");
        let err = EtlError::ImputationImpossible {
            column: "totalcharges".into(),
        };
        entry.finish(start, Err(&err));
        assert_eq!(entry.status, StepStatus::Failed);
        assert!(entry
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("[imputation-impossible]"));
    }

    #[test]
    fn cells_serialize_with_type_tags() {
        let json = serde_json::to_string(&Cell::Float(56.7)).unwrap();
        assert_eq!(json, r#"{"type":"float","value":56.7}"#);
    }

    #[test]
    fn retryable_kinds_are_store_failures() {
        assert!(ErrorKind::Connection.is_retryable());
        assert!(ErrorKind::WriteFailure.is_retryable());
        assert!(!ErrorKind::MissingColumns.is_retryable());
        assert!(!ErrorKind::ImputationImpossible.is_retryable());
    }

    #[test]
    fn rejected_writes_keep_their_kind_but_are_not_retried() {
        let transient = EtlError::write_failure("customer_data", "connection reset");
        let rejected = EtlError::write_rejected("customer_data", "column \"age\" does not exist");
        assert!(transient.is_retryable());
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.kind(), ErrorKind::WriteFailure);
        assert_eq!(
            rejected.to_string(),
            "write to customer_data failed: column \"age\" does not exist"
        );
        assert!(!EtlError::Config("bad".into()).is_retryable());
    }
}
