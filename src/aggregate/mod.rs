//! Cytometry record aggregation and tabular output.
//!
//! The aggregation engine selects which per-cell records survive into the
//! final table (every z-plane, or only each tile's best-focus plane) and
//! flattens the nested per-channel statistics into named columns. Writing the
//! table is behind the [`TableSink`] trait; the CSV sink is the default
//! implementation.

use crate::core::error::{AggregationError, PipelineResult};
use crate::core::types::{AggregationMode, AggregationSpec};
use crate::cytometry::{CytometryRecord, IntensityStats};
use indexmap::IndexSet;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// One cell of the flattened output table.
#[derive(Debug, Clone, PartialEq)]
pub enum TableValue {
    /// Integer identifier or count.
    Int(i64),
    /// Measured value.
    Float(f64),
    /// Free-form text (e.g. the neighbor list).
    Text(String),
    /// Feature not computed for this row.
    Empty,
}

impl fmt::Display for TableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableValue::Int(v) => write!(f, "{}", v),
            TableValue::Float(v) => write!(f, "{}", v),
            TableValue::Text(v) => write!(f, "{}", v),
            TableValue::Empty => Ok(()),
        }
    }
}

/// The flattened aggregation output: one row per surviving record.
#[derive(Debug, Clone)]
pub struct AggregationTable {
    /// Column names, in output order.
    pub columns: Vec<String>,
    /// Row values, one per column.
    pub rows: Vec<Vec<TableValue>>,
}

impl AggregationTable {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// Destination for the aggregated table.
pub trait TableSink {
    /// Write the whole table.
    fn write_table(&mut self, table: &AggregationTable) -> PipelineResult<()>;
}

/// CSV-writing sink over any byte writer.
pub struct CsvTableSink<W: Write> {
    writer: csv::Writer<W>,
}

impl CsvTableSink<File> {
    /// Create a sink writing to a new file at `path`.
    pub fn create(path: impl AsRef<Path>) -> PipelineResult<Self> {
        Ok(CsvTableSink {
            writer: csv::Writer::from_path(path.as_ref()).map_err(crate::core::error::PipelineError::Table)?,
        })
    }
}

impl<W: Write> CsvTableSink<W> {
    /// Create a sink over an arbitrary writer.
    pub fn from_writer(writer: W) -> Self {
        CsvTableSink {
            writer: csv::Writer::from_writer(writer),
        }
    }

    /// Flush and recover the underlying writer.
    pub fn into_inner(self) -> PipelineResult<W> {
        self.writer
            .into_inner()
            .map_err(|e| crate::core::error::PipelineError::Other(e.to_string()))
    }
}

impl<W: Write> TableSink for CsvTableSink<W> {
    fn write_table(&mut self, table: &AggregationTable) -> PipelineResult<()> {
        self.writer.write_record(&table.columns)?;
        for row in &table.rows {
            self.writer
                .write_record(row.iter().map(|v| v.to_string()))?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// Selects and flattens cytometry records into the output table.
pub struct AggregationEngine {
    spec: AggregationSpec,
}

impl AggregationEngine {
    /// Create an engine for the given policy.
    pub fn new(spec: AggregationSpec) -> Self {
        AggregationEngine { spec }
    }

    /// Aggregate records into a table.
    ///
    /// `best_z` maps `(region, tile acquisition index, cycle)` to that
    /// tile/cycle's best-focus z-plane; it is consulted only in best-z-plane
    /// mode, where records from other planes (and tile/cycles without a
    /// best-z entry) are dropped, leaving exactly one row per
    /// `(region, tile, cycle, cell)`. An empty selection is an error in
    /// every mode.
    pub fn aggregate(
        &self,
        records: Vec<CytometryRecord>,
        best_z: &HashMap<(usize, usize, usize), usize>,
    ) -> PipelineResult<AggregationTable> {
        let selected: Vec<CytometryRecord> = match self.spec.mode {
            AggregationMode::All => records,
            AggregationMode::BestZPlane => records
                .into_iter()
                .filter(|r| best_z.get(&(r.region, r.tile, r.cycle)) == Some(&r.z))
                .collect(),
        };
        if selected.is_empty() {
            return Err(AggregationError::Empty {
                mode: self.spec.mode,
            }
            .into());
        }
        Ok(flatten(&selected))
    }
}

const MORPHOLOGY_COLUMNS: [&str; 8] = [
    "area",
    "perimeter",
    "eccentricity",
    "equivalent_diameter",
    "bbox_x",
    "bbox_y",
    "bbox_w",
    "bbox_h",
];

/// Flatten records into a table with a deterministic column order.
///
/// Identifier columns come first, then morphology (when any record carries
/// it), then per-channel intensity columns in first-seen order, then the
/// neighbor list (when the cell graph ran).
fn flatten(records: &[CytometryRecord]) -> AggregationTable {
    let has_morphology = records.iter().any(|r| r.morphology.is_some());
    let has_neighbors = records.iter().any(|r| !r.neighbor_ids.is_empty());

    let mut cell_columns: IndexSet<String> = IndexSet::new();
    let mut nucleus_columns: IndexSet<String> = IndexSet::new();
    for record in records {
        collect_intensity_columns(&record.cell_intensity, "", &mut cell_columns);
        collect_intensity_columns(&record.nucleus_intensity, "nucleus_", &mut nucleus_columns);
    }

    let mut columns: Vec<String> = ["region", "tile", "z", "cycle", "cell_id", "x", "y"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if has_morphology {
        columns.extend(MORPHOLOGY_COLUMNS.iter().map(|s| s.to_string()));
    }
    columns.extend(cell_columns.iter().cloned());
    columns.extend(nucleus_columns.iter().cloned());
    if has_neighbors {
        columns.push("neighbors".to_string());
    }

    let rows = records
        .iter()
        .map(|record| {
            let mut row = vec![
                TableValue::Int(record.region as i64),
                TableValue::Int(record.tile as i64),
                TableValue::Int(record.z as i64),
                TableValue::Int(record.cycle as i64),
                TableValue::Int(i64::from(record.cell_id)),
                TableValue::Float(record.x),
                TableValue::Float(record.y),
            ];
            if has_morphology {
                match &record.morphology {
                    Some(m) => row.extend([
                        TableValue::Float(m.area),
                        TableValue::Float(m.perimeter),
                        TableValue::Float(m.eccentricity),
                        TableValue::Float(m.equivalent_diameter),
                        TableValue::Int(i64::from(m.bbox_x)),
                        TableValue::Int(i64::from(m.bbox_y)),
                        TableValue::Int(i64::from(m.bbox_w)),
                        TableValue::Int(i64::from(m.bbox_h)),
                    ]),
                    None => row.extend(std::iter::repeat(TableValue::Empty).take(8)),
                }
            }
            for column in &cell_columns {
                row.push(intensity_value(&record.cell_intensity, "", column));
            }
            for column in &nucleus_columns {
                row.push(intensity_value(&record.nucleus_intensity, "nucleus_", column));
            }
            if has_neighbors {
                let joined = record
                    .neighbor_ids
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(";");
                row.push(TableValue::Text(joined));
            }
            row
        })
        .collect();

    AggregationTable { columns, rows }
}

fn collect_intensity_columns(stats: &IntensityStats, prefix: &str, out: &mut IndexSet<String>) {
    for (channel, per_stat) in stats {
        for stat in per_stat.keys() {
            out.insert(format!("{}_{}{}", channel, prefix, stat.suffix()));
        }
    }
}

fn intensity_value(stats: &IntensityStats, prefix: &str, column: &str) -> TableValue {
    for (channel, per_stat) in stats {
        for (stat, value) in per_stat {
            if format!("{}_{}{}", channel, prefix, stat.suffix()) == column {
                return TableValue::Float(*value);
            }
        }
    }
    TableValue::Empty
}
