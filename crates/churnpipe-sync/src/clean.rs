//! Staging-to-cleaned transform. Pure over a [`Frame`]; the warehouse wraps it in a
//! transaction.

use std::collections::{BTreeMap, HashMap};

use churnpipe_core::{
    map_binary, map_contract_type, Cell, ColumnType, EtlError, Frame, BINARY_COLUMNS,
    BLANK_SENTINEL, CONTRACT_TYPE_COLUMN, REQUIRED_COLUMNS, TOTAL_CHARGES_COLUMN,
};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanOptions {
    /// Fail on binary values outside Yes/No instead of nulling them.
    pub strict_binary_values: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStrategy {
    Mode,
    Median,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Imputation {
    pub column: String,
    pub strategy: FillStrategy,
    pub value: String,
    pub filled: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanReport {
    pub rows_read: usize,
    pub blanks_nulled: usize,
    pub totalcharges_unparsable: usize,
    pub imputations: Vec<Imputation>,
    /// Column to unmapped value to occurrence count.
    pub unmapped: BTreeMap<String, BTreeMap<String, usize>>,
    pub duplicates_removed: usize,
    pub contract_types_remapped: usize,
    pub rows_written: usize,
}

#[derive(Debug, Clone)]
pub struct CleanOutcome {
    pub frame: Frame,
    pub report: CleanReport,
}

/// Restrict `staging` to the required columns and normalize it into the cleaned snapshot.
pub fn clean_frame(
    staging: &Frame,
    table: &str,
    options: &CleanOptions,
) -> Result<CleanOutcome, EtlError> {
    let mut frame = staging.select(table, &REQUIRED_COLUMNS)?;
    let mut report = CleanReport {
        rows_read: frame.height(),
        ..CleanReport::default()
    };

    for idx in 0..frame.width() {
        frame.map_column(idx, |cell| match cell.as_text() {
            Some(BLANK_SENTINEL) => {
                report.blanks_nulled += 1;
                Cell::Null
            }
            _ => cell,
        });
    }

    let charges = column(&frame, TOTAL_CHARGES_COLUMN)?;
    report.totalcharges_unparsable = coerce_numeric(&mut frame, charges);

    for idx in 0..frame.width() {
        if let Some(imputation) = impute_column(&mut frame, idx)? {
            report.imputations.push(imputation);
        }
    }

    for name in BINARY_COLUMNS {
        let idx = column(&frame, name)?;
        let unmapped = map_binary_column(&mut frame, idx);
        if unmapped.is_empty() {
            continue;
        }
        if options.strict_binary_values {
            return Err(EtlError::UnmappedValues {
                column: name.to_string(),
                values: unmapped.keys().cloned().collect(),
            });
        }
        warn!(
            column = name,
            values = ?unmapped,
            "binary values outside Yes/No were set to null"
        );
        report.unmapped.insert(name.to_string(), unmapped);
    }

    report.duplicates_removed = frame.dedup_rows();

    let contract = column(&frame, CONTRACT_TYPE_COLUMN)?;
    frame.map_column(contract, |cell| match cell.as_text().and_then(map_contract_type) {
        Some(mapped) => {
            report.contract_types_remapped += 1;
            Cell::Text(mapped.to_string())
        }
        None => cell,
    });

    let charges = column(&frame, TOTAL_CHARGES_COLUMN)?;
    coerce_numeric(&mut frame, charges);
    frame.map_column(charges, |cell| match cell {
        Cell::Float(v) => Cell::Float(round_cents(v)),
        other => other,
    });

    report.rows_written = frame.height();
    info!(
        rows_read = report.rows_read,
        rows_written = report.rows_written,
        duplicates = report.duplicates_removed,
        imputed_columns = report.imputations.len(),
        "cleaned staging frame"
    );
    Ok(CleanOutcome { frame, report })
}

fn column(frame: &Frame, name: &str) -> Result<usize, EtlError> {
    frame
        .column_index(name)
        .ok_or_else(|| EtlError::MissingColumns {
            table: "cleaned frame".to_string(),
            columns: vec![name.to_string()],
        })
}

/// Two decimals, ties to even.
pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round_ties_even() / 100.0
}

/// Turn a column into floats. Values that do not parse become null; returns how many did.
fn coerce_numeric(frame: &mut Frame, idx: usize) -> usize {
    let mut unparsable = 0;
    frame.map_column(idx, |cell| {
        if cell.is_null() {
            return Cell::Null;
        }
        match cell.to_f64() {
            Some(v) => Cell::Float(v),
            None => {
                unparsable += 1;
                Cell::Null
            }
        }
    });
    frame.set_column_type(idx, ColumnType::Float);
    unparsable
}

fn impute_column(frame: &mut Frame, idx: usize) -> Result<Option<Imputation>, EtlError> {
    let name = frame.columns()[idx].name.clone();
    let nulls = frame.column_cells(idx).filter(|c| c.is_null()).count();
    if nulls == 0 {
        return Ok(None);
    }
    let present = frame
        .column_cells(idx)
        .filter(|c| !c.is_null())
        .cloned()
        .collect::<Vec<_>>();
    if present.is_empty() {
        return Err(EtlError::ImputationImpossible { column: name });
    }

    let numeric = present
        .iter()
        .all(|c| matches!(c, Cell::Integer(_) | Cell::Float(_)));
    let (strategy, fill) = if numeric {
        let fill = median_fill(&present);
        if matches!(fill, Cell::Float(_)) {
            frame.map_column(idx, |cell| match cell {
                Cell::Integer(v) => Cell::Float(v as f64),
                other => other,
            });
            frame.set_column_type(idx, ColumnType::Float);
        }
        (FillStrategy::Median, fill)
    } else {
        (FillStrategy::Mode, mode(&present))
    };

    frame.map_column(idx, |cell| if cell.is_null() { fill.clone() } else { cell });
    info!(column = %name, strategy = ?strategy, value = %fill, filled = nulls, "imputed missing values");
    Ok(Some(Imputation {
        column: name,
        strategy,
        value: fill.to_string(),
        filled: nulls,
    }))
}

/// Median of numeric cells. Stays an integer only when every value is one and the
/// median is whole.
fn median_fill(values: &[Cell]) -> Cell {
    let all_integer = values.iter().all(|c| matches!(c, Cell::Integer(_)));
    let mut sorted = values.iter().filter_map(Cell::to_f64).collect::<Vec<_>>();
    sorted.sort_by(f64::total_cmp);
    if sorted.is_empty() {
        return values[0].clone();
    }
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    };
    if all_integer && median.fract() == 0.0 {
        Cell::Integer(median as i64)
    } else {
        Cell::Float(median)
    }
}

/// Most frequent value; ties go to the smallest.
fn mode(values: &[Cell]) -> Cell {
    let mut counts: HashMap<&Cell, usize> = HashMap::new();
    for value in values {
        *counts.entry(value).or_default() += 1;
    }
    let best = counts.values().copied().max().unwrap_or(0);
    counts
        .into_iter()
        .filter(|(_, count)| *count == best)
        .map(|(cell, _)| cell)
        .min_by(|a, b| a.to_string().cmp(&b.to_string()))
        .cloned()
        .unwrap_or(Cell::Null)
}

/// Yes/No to booleans. Returns the values that were neither, with counts.
fn map_binary_column(frame: &mut Frame, idx: usize) -> BTreeMap<String, usize> {
    let mut unmapped = BTreeMap::new();
    frame.map_column(idx, |cell| match cell {
        Cell::Null | Cell::Boolean(_) => cell,
        Cell::Text(ref value) => match map_binary(value) {
            Some(v) => Cell::Boolean(v),
            None => {
                *unmapped.entry(value.clone()).or_insert(0) += 1;
                Cell::Null
            }
        },
        other => {
            *unmapped.entry(other.to_string()).or_insert(0) += 1;
            Cell::Null
        }
    });
    frame.set_column_type(idx, ColumnType::Boolean);
    unmapped
}
