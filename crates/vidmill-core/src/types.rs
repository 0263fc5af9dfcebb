use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Other,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    Cpu,
    Gpu,
}

/// Placement of a produced column: device type plus a local device index
/// (GPU workers on one box shard by `local_id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub device: DeviceType,
    pub device_id: i32,
}

impl DeviceHandle {
    pub const CPU: DeviceHandle = DeviceHandle {
        device: DeviceType::Cpu,
        device_id: 0,
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub id: i32,
    pub name: String,
    pub column_type: ColumnType,
}

/// Append-once logical table: a fixed sequence of immutable items per column.
///
/// `end_rows[i]` is the exclusive row index ending item `i`, so the row count
/// of item `i` is `end_rows[i] - end_rows[i - 1]` (`end_rows[0]` for item 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub id: TableId,
    pub name: String,
    pub job_id: Option<JobId>,
    /// Creation time in Unix seconds.
    pub timestamp: i64,
    pub end_rows: Vec<i64>,
    pub columns: Vec<Column>,
}

impl TableMetadata {
    pub fn num_rows(&self) -> i64 {
        self.end_rows.last().copied().unwrap_or(0)
    }

    pub fn num_items(&self) -> usize {
        self.end_rows.len()
    }

    pub fn column_type(&self, column_id: i32) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|c| c.id == column_id)
            .map(|c| c.column_type)
    }

    pub fn column_id(&self, name: &str) -> Option<i32> {
        self.columns.iter().find(|c| c.name == name).map(|c| c.id)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_id(name).is_some()
    }
}

/// Per-item descriptor of an encoded-video column item file.
///
/// `keyframe_positions` and `keyframe_byte_offsets` are parallel and strictly
/// ascending; the sentinel tails (`frames`, file size) are appended by the
/// video-index reader, not stored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub table_id: TableId,
    pub column_id: i32,
    pub item_id: i32,
    pub width: i32,
    pub height: i32,
    pub frames: i64,
    pub keyframe_positions: Vec<i64>,
    pub keyframe_byte_offsets: Vec<i64>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatabaseMetadataError {
    #[error("table {0} already exists")]
    DuplicateTable(String),
}

/// Monotonic id counters plus the name indexes for tables and jobs.
///
/// Table ids are dense and never reused; removing a table drops the name
/// binding but does not recycle its id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    pub next_table_id: i32,
    pub next_job_id: i32,
    pub table_ids: BTreeMap<String, TableId>,
    pub job_names: BTreeSet<String>,
}

impl DatabaseMetadata {
    pub fn has_table(&self, name: &str) -> bool {
        self.table_ids.contains_key(name)
    }

    pub fn get_table_id(&self, name: &str) -> Option<TableId> {
        self.table_ids.get(name).copied()
    }

    pub fn add_table(&mut self, name: &str) -> Result<TableId, DatabaseMetadataError> {
        if self.has_table(name) {
            return Err(DatabaseMetadataError::DuplicateTable(name.to_string()));
        }
        let id = TableId(self.next_table_id);
        self.next_table_id += 1;
        self.table_ids.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn remove_table(&mut self, name: &str) -> Option<TableId> {
        self.table_ids.remove(name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.table_ids.keys().map(String::as_str)
    }

    pub fn has_job(&self, name: &str) -> bool {
        self.job_names.contains(name)
    }

    pub fn add_job(&mut self, name: &str) -> JobId {
        let id = JobId(self.next_job_id);
        self.next_job_id += 1;
        self.job_names.insert(name.to_string());
        id
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SamplingFunctionError {
    #[error("stride must be positive, got {0}")]
    NonPositiveStride(i64),
    #[error("range [{start}, {end}) is empty or inverted")]
    EmptyRange { start: i64, end: i64 },
    #[error("range end {end} exceeds table row count {num_rows}")]
    RangeOutOfBounds { end: i64, num_rows: i64 },
    #[error("gather row list must be non-empty")]
    EmptyGather,
    #[error("gather rows must be strictly ascending (saw {prev} then {next})")]
    NonAscendingGather { prev: i64, next: i64 },
    #[error("row {row} is out of bounds for table with {num_rows} rows")]
    RowOutOfBounds { row: i64, num_rows: i64 },
}

/// Client-declared enumeration of the rows a task reads from one table.
///
/// Carried on the wire as `(sampling_function, sampling_args)`; see
/// `vidmill-wire` for the encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingFunction {
    All,
    Strided { stride: i64 },
    Range { start: i64, end: i64 },
    Gather { rows: Vec<i64> },
}

impl SamplingFunction {
    pub fn name(&self) -> &'static str {
        match self {
            SamplingFunction::All => "All",
            SamplingFunction::Strided { .. } => "Strided",
            SamplingFunction::Range { .. } => "Range",
            SamplingFunction::Gather { .. } => "Gather",
        }
    }

    /// Enumerates the requested row indices, ascending and duplicate-free.
    pub fn enumerate_rows(&self, num_rows: i64) -> Result<Vec<i64>, SamplingFunctionError> {
        match self {
            SamplingFunction::All => Ok((0..num_rows).collect()),
            SamplingFunction::Strided { stride } => {
                if *stride <= 0 {
                    return Err(SamplingFunctionError::NonPositiveStride(*stride));
                }
                Ok((0..num_rows).step_by(*stride as usize).collect())
            }
            SamplingFunction::Range { start, end } => {
                if *start < 0 || start >= end {
                    return Err(SamplingFunctionError::EmptyRange {
                        start: *start,
                        end: *end,
                    });
                }
                if *end > num_rows {
                    return Err(SamplingFunctionError::RangeOutOfBounds {
                        end: *end,
                        num_rows,
                    });
                }
                Ok((*start..*end).collect())
            }
            SamplingFunction::Gather { rows } => {
                if rows.is_empty() {
                    return Err(SamplingFunctionError::EmptyGather);
                }
                let mut prev: Option<i64> = None;
                for &row in rows {
                    if row < 0 || row >= num_rows {
                        return Err(SamplingFunctionError::RowOutOfBounds { row, num_rows });
                    }
                    if let Some(p) = prev {
                        if row <= p {
                            return Err(SamplingFunctionError::NonAscendingGather {
                                prev: p,
                                next: row,
                            });
                        }
                    }
                    prev = Some(row);
                }
                Ok(rows.clone())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSample {
    pub table_name: String,
    pub column_names: Vec<String>,
    pub sampling: SamplingFunction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub output_table_name: String,
    pub samples: Vec<TableSample>,
}

pub const INPUT_TABLE_OP: &str = "InputTable";
pub const OUTPUT_TABLE_OP: &str = "OutputTable";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpInput {
    pub op_index: i32,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpNode {
    pub name: String,
    pub device: DeviceType,
    pub inputs: Vec<OpInput>,
}

impl OpNode {
    pub fn is_input_table(&self) -> bool {
        self.name == INPUT_TABLE_OP
    }

    pub fn is_output_table(&self) -> bool {
        self.name == OUTPUT_TABLE_OP
    }
}

/// The operator DAG plus the tasks it runs over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSet {
    pub tasks: Vec<Task>,
    pub ops: Vec<OpNode>,
}

/// Addressing tuple for one work unit within a job. `item_id` is the
/// task-local sequence number; `table_id` is the output table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoItem {
    pub item_id: i64,
    pub table_id: TableId,
    pub start_row: i64,
    pub end_row: i64,
}

impl IoItem {
    pub const SENTINEL_ITEM_ID: i64 = -1;

    pub fn sentinel() -> Self {
        IoItem {
            item_id: Self::SENTINEL_ITEM_ID,
            table_id: TableId(-1),
            start_row: 0,
            end_row: 0,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.item_id == Self::SENTINEL_ITEM_ID
    }

    pub fn num_rows(&self) -> i64 {
        self.end_row.saturating_sub(self.start_row)
    }
}

/// Row indices one sample contributes to a work unit. `warmup_rows` precede
/// `rows` and are loaded for evaluator context only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSampleRows {
    pub table_id: TableId,
    pub column_ids: Vec<i32>,
    pub warmup_rows: Vec<i64>,
    pub rows: Vec<i64>,
}

/// One master→worker dispatch unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub io_item: IoItem,
    pub samples: Vec<LoadSampleRows>,
}

impl WorkUnit {
    pub fn sentinel() -> Self {
        WorkUnit {
            io_item: IoItem::sentinel(),
            samples: Vec::new(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.io_item.is_sentinel()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub id: JobId,
    pub name: String,
    pub io_item_size: i32,
    pub work_item_size: i32,
    pub num_nodes: i32,
    pub tasks: Vec<Task>,
    pub columns: Vec<Column>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(end_rows: Vec<i64>) -> TableMetadata {
        TableMetadata {
            id: TableId(0),
            name: "t".to_string(),
            job_id: None,
            timestamp: 0,
            end_rows,
            columns: vec![],
        }
    }

    #[test]
    fn table_row_counts() {
        let t = table(vec![3, 7]);
        assert_eq!(t.num_rows(), 7);
        assert_eq!(t.num_items(), 2);
        assert_eq!(table(vec![]).num_rows(), 0);
    }

    #[test]
    fn strided_enumeration() {
        let rows = SamplingFunction::Strided { stride: 10 }
            .enumerate_rows(25)
            .unwrap();
        assert_eq!(rows, vec![0, 10, 20]);
    }

    #[test]
    fn gather_rejects_descending() {
        let err = SamplingFunction::Gather { rows: vec![4, 2] }
            .enumerate_rows(10)
            .unwrap_err();
        assert_eq!(err, SamplingFunctionError::NonAscendingGather { prev: 4, next: 2 });
    }

    #[test]
    fn range_bounds_checked() {
        let err = SamplingFunction::Range { start: 0, end: 11 }
            .enumerate_rows(10)
            .unwrap_err();
        assert_eq!(
            err,
            SamplingFunctionError::RangeOutOfBounds {
                end: 11,
                num_rows: 10
            }
        );
    }

    #[test]
    fn database_metadata_ids_are_dense_and_not_reused() {
        let mut meta = DatabaseMetadata::default();
        let a = meta.add_table("a").unwrap();
        let b = meta.add_table("b").unwrap();
        assert_eq!((a, b), (TableId(0), TableId(1)));
        assert!(meta.add_table("a").is_err());

        meta.remove_table("a");
        let c = meta.add_table("c").unwrap();
        assert_eq!(c, TableId(2));
    }

    #[test]
    fn sentinel_work_unit() {
        let unit = WorkUnit::sentinel();
        assert!(unit.is_sentinel());
        assert_eq!(unit.io_item.item_id, -1);
    }
}
