//! Per-task enumeration of work units.
//!
//! A `TaskSampler` wraps one task: it resolves every referenced input table,
//! enumerates each sample's row list once, and then hands out `WorkUnit`s of
//! at most `io_item_size` rows in order. Output table rows are numbered by
//! enumeration index, so the union of rows across all units equals the full
//! enumeration, in order, with no duplicates.

use std::collections::HashMap;

use thiserror::Error;

use crate::types::{
    IoItem, LoadSampleRows, SamplingFunctionError, TableId, TableMetadata, Task, WorkUnit,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskSamplerError {
    #[error("io_item_size must be positive, got {0}")]
    NonPositiveIoItemSize(i32),
    #[error("warmup_size must be non-negative, got {0}")]
    NegativeWarmupSize(i32),
    #[error("task {task} samples from non-existent table {table}")]
    MissingTable { task: String, table: String },
    #[error("task {task} samples zero columns from table {table}")]
    NoColumns { task: String, table: String },
    #[error("task {task}: table {table} has no column named {column}")]
    UnknownColumn {
        task: String,
        table: String,
        column: String,
    },
    #[error("task {task}: sampling function {function} on table {table}: {source}")]
    IllFormedSampling {
        task: String,
        table: String,
        function: &'static str,
        #[source]
        source: SamplingFunctionError,
    },
    #[error("task {task}: samples enumerate differing row counts ({expected} vs {actual})")]
    RowCountMismatch {
        task: String,
        expected: i64,
        actual: i64,
    },
}

#[derive(Debug, Clone)]
struct SampleRows {
    table_id: TableId,
    column_ids: Vec<i32>,
    rows: Vec<i64>,
}

/// Stateful enumerator of `WorkUnit`s for one task.
///
/// Construction resolves and validates everything up front; a failure latches
/// and every subsequent `validate`/`next_work` call reports it.
#[derive(Debug, Clone)]
pub struct TaskSampler {
    output_table_id: TableId,
    io_item_size: i64,
    warmup_size: i64,
    samples: Vec<SampleRows>,
    total_rows: i64,
    next_item: i64,
    state: Result<(), TaskSamplerError>,
}

impl TaskSampler {
    pub fn new(
        table_metas: &HashMap<String, TableMetadata>,
        task: &Task,
        output_table_id: TableId,
        io_item_size: i32,
        warmup_size: i32,
    ) -> Self {
        let mut sampler = TaskSampler {
            output_table_id,
            io_item_size: io_item_size as i64,
            warmup_size: warmup_size as i64,
            samples: Vec::new(),
            total_rows: 0,
            next_item: 0,
            state: Ok(()),
        };
        sampler.state = sampler.resolve(table_metas, task, io_item_size, warmup_size);
        sampler
    }

    fn resolve(
        &mut self,
        table_metas: &HashMap<String, TableMetadata>,
        task: &Task,
        io_item_size: i32,
        warmup_size: i32,
    ) -> Result<(), TaskSamplerError> {
        if io_item_size <= 0 {
            return Err(TaskSamplerError::NonPositiveIoItemSize(io_item_size));
        }
        if warmup_size < 0 {
            return Err(TaskSamplerError::NegativeWarmupSize(warmup_size));
        }

        let task_name = task.output_table_name.as_str();
        let mut total_rows: Option<i64> = None;
        for sample in &task.samples {
            let Some(meta) = table_metas.get(&sample.table_name) else {
                return Err(TaskSamplerError::MissingTable {
                    task: task_name.to_string(),
                    table: sample.table_name.clone(),
                });
            };
            if sample.column_names.is_empty() {
                return Err(TaskSamplerError::NoColumns {
                    task: task_name.to_string(),
                    table: sample.table_name.clone(),
                });
            }
            let mut column_ids = Vec::with_capacity(sample.column_names.len());
            for name in &sample.column_names {
                let Some(id) = meta.column_id(name) else {
                    return Err(TaskSamplerError::UnknownColumn {
                        task: task_name.to_string(),
                        table: sample.table_name.clone(),
                        column: name.clone(),
                    });
                };
                column_ids.push(id);
            }
            let rows = sample
                .sampling
                .enumerate_rows(meta.num_rows())
                .map_err(|source| TaskSamplerError::IllFormedSampling {
                    task: task_name.to_string(),
                    table: sample.table_name.clone(),
                    function: sample.sampling.name(),
                    source,
                })?;

            let count = rows.len() as i64;
            match total_rows {
                None => total_rows = Some(count),
                Some(expected) if expected != count => {
                    return Err(TaskSamplerError::RowCountMismatch {
                        task: task_name.to_string(),
                        expected,
                        actual: count,
                    });
                }
                Some(_) => {}
            }
            self.samples.push(SampleRows {
                table_id: meta.id,
                column_ids,
                rows,
            });
        }
        self.total_rows = total_rows.unwrap_or(0);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), TaskSamplerError> {
        self.state.clone()
    }

    /// Number of `WorkUnit`s this task will emit.
    pub fn total_samples(&self) -> i64 {
        if self.state.is_err() || self.io_item_size <= 0 {
            return 0;
        }
        (self.total_rows + self.io_item_size - 1) / self.io_item_size
    }

    /// Emits the next unit, or `Ok(None)` once the task is exhausted.
    pub fn next_work(&mut self) -> Result<Option<WorkUnit>, TaskSamplerError> {
        self.state.clone()?;
        if self.next_item >= self.total_samples() {
            return Ok(None);
        }

        let start = self.next_item * self.io_item_size;
        let end = (start + self.io_item_size).min(self.total_rows);
        let warmup_start = (start - self.warmup_size).max(0);

        let samples = self
            .samples
            .iter()
            .map(|sample| LoadSampleRows {
                table_id: sample.table_id,
                column_ids: sample.column_ids.clone(),
                warmup_rows: sample.rows[warmup_start as usize..start as usize].to_vec(),
                rows: sample.rows[start as usize..end as usize].to_vec(),
            })
            .collect();

        let unit = WorkUnit {
            io_item: IoItem {
                item_id: self.next_item,
                table_id: self.output_table_id,
                start_row: start,
                end_row: end,
            },
            samples,
        };
        self.next_item += 1;
        Ok(Some(unit))
    }
}

/// Dry-runs a task sampler and collects the `end_row` of every unit; these
/// become the output table's `end_rows`.
pub fn get_task_end_rows(
    table_metas: &HashMap<String, TableMetadata>,
    task: &Task,
    output_table_id: TableId,
    io_item_size: i32,
    warmup_size: i32,
) -> Result<Vec<i64>, TaskSamplerError> {
    let mut sampler = TaskSampler::new(table_metas, task, output_table_id, io_item_size, warmup_size);
    sampler.validate()?;
    let mut end_rows = Vec::new();
    while let Some(unit) = sampler.next_work()? {
        end_rows.push(unit.io_item.end_row);
    }
    Ok(end_rows)
}
