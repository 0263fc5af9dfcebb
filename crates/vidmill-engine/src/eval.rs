//! Evaluate stage: runs each loaded work unit through the job's op chain.
//!
//! Kernels are black boxes from the registry; this stage only splits units
//! into `work_item_size` batches, routes named columns between ops, drops the
//! warmup prefix, and keeps rows in sampler order for the save stage.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};
use tracing::debug;

use vidmill_core::types::{ColumnType, DeviceHandle, IoItem, TaskSet};
use vidmill_observe::metrics::{Counter, DurationAgg, Gauge, ScopedTimer};

use crate::error::EngineError;
use crate::ops::{BatchConfig, BatchedColumns, Kernel, Registries};

/// Output of the load stage for one work unit: parallel per-column arrays
/// plus the shared warmup prefix length.
#[derive(Debug, Clone, Default)]
pub struct EvalWorkEntry {
    pub io_item_index: i64,
    pub warmup_rows: usize,
    pub columns: Vec<Vec<Vec<u8>>>,
    pub column_types: Vec<ColumnType>,
    pub column_handles: Vec<DeviceHandle>,
}

impl EvalWorkEntry {
    pub fn payload_bytes(&self) -> u64 {
        self.columns
            .iter()
            .flatten()
            .map(|row| row.len() as u64)
            .sum()
    }
}

/// Loaded-payload accounting shared by one job's load and eval stages. The
/// bounded queues cap inflight units; this tracks the bytes they carry.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub inflight_bytes: Gauge,
    pub inflight_bytes_high_water: Gauge,
}

impl PipelineMetrics {
    pub fn on_loaded(&self, bytes: u64) {
        let now = self.inflight_bytes.add(bytes);
        self.inflight_bytes_high_water.max(now);
    }

    pub fn on_evaluated(&self, bytes: u64) {
        self.inflight_bytes.sub(bytes);
    }
}

#[derive(Debug, Default)]
struct EvalMetrics {
    units_evaluated: Counter,
    eval_time: DurationAgg,
}

impl EvalMetrics {
    fn log_snapshot(&self, node_id: i32, worker_id: usize) {
        let eval = self.eval_time.snapshot();
        tracing::info!(
            target: "vidmill_metrics",
            node_id,
            worker_id,
            units_evaluated = self.units_evaluated.get(),
            eval_avg_ns = eval.avg_ns(),
            eval_max_ns = eval.max_ns,
            "eval metrics"
        );
    }
}

#[derive(Debug, Clone)]
pub struct EvalPlanOp {
    pub name: String,
    pub device: vidmill_core::types::DeviceType,
    pub input_columns: Vec<String>,
    pub output_columns: Vec<String>,
}

/// Execution plan derived from a validated task set: the loaded column names
/// (InputTable outputs), the middle ops in order, and the columns the
/// OutputTable op selects.
#[derive(Debug, Clone)]
pub struct EvalPlan {
    pub input_columns: Vec<String>,
    pub ops: Vec<EvalPlanOp>,
    pub output_columns: Vec<String>,
}

pub fn build_eval_plan(
    task_set: &TaskSet,
    registries: &Registries,
) -> Result<EvalPlan, EngineError> {
    let ops = &task_set.ops;
    if ops.len() < 3 {
        return Err(EngineError::Validation(format!(
            "task set has {} ops but needs at least three",
            ops.len()
        )));
    }
    let input_columns: Vec<String> = ops[0]
        .inputs
        .iter()
        .flat_map(|input| input.columns.iter().cloned())
        .collect();
    let output_columns: Vec<String> = ops[ops.len() - 1]
        .inputs
        .iter()
        .flat_map(|input| input.columns.iter().cloned())
        .collect();

    let mut plan_ops = Vec::new();
    for op in &ops[1..ops.len() - 1] {
        let info = registries.ops.get_op_info(&op.name).ok_or_else(|| {
            EngineError::Validation(format!("op {} is not registered", op.name))
        })?;
        plan_ops.push(EvalPlanOp {
            name: op.name.clone(),
            device: op.device,
            input_columns: op
                .inputs
                .iter()
                .flat_map(|input| input.columns.iter().cloned())
                .collect(),
            output_columns: info.output_columns.clone(),
        });
    }
    Ok(EvalPlan {
        input_columns,
        ops: plan_ops,
        output_columns,
    })
}

pub struct EvalWorker {
    node_id: i32,
    worker_id: usize,
    plan: EvalPlan,
    kernels: Vec<Box<dyn Kernel>>,
    work_item_size: usize,
    pipeline: Arc<PipelineMetrics>,
    metrics: Arc<EvalMetrics>,
}

impl EvalWorker {
    /// `kernels` must be parallel to `plan.ops`; each is configured once here.
    pub fn new(
        node_id: i32,
        worker_id: usize,
        plan: EvalPlan,
        mut kernels: Vec<Box<dyn Kernel>>,
        config: BatchConfig,
        pipeline: Arc<PipelineMetrics>,
    ) -> Result<Self, EngineError> {
        if kernels.len() != plan.ops.len() {
            return Err(EngineError::Pipeline(format!(
                "{} kernels for {} ops",
                kernels.len(),
                plan.ops.len()
            )));
        }
        for kernel in &mut kernels {
            kernel.configure(&config);
        }
        Ok(Self {
            node_id,
            worker_id,
            plan,
            kernels,
            work_item_size: config.work_item_size.max(1) as usize,
            pipeline,
            metrics: Arc::new(EvalMetrics::default()),
        })
    }

    pub fn run(
        mut self,
        work: Receiver<(u64, IoItem, EvalWorkEntry)>,
        save: Sender<(u64, IoItem, Vec<Vec<Vec<u8>>>)>,
    ) -> Result<(), EngineError> {
        let metrics = Arc::clone(&self.metrics);
        let pipeline = Arc::clone(&self.pipeline);
        while let Ok((seq, io_item, entry)) = work.recv() {
            debug!(
                node_id = self.node_id,
                worker_id = self.worker_id,
                io_item_index = entry.io_item_index,
                "evaluating item"
            );
            for kernel in &mut self.kernels {
                kernel.reset();
            }
            let loaded_bytes = entry.payload_bytes();
            let columns = {
                let _timer = ScopedTimer::new(&metrics.eval_time);
                self.evaluate(entry)?
            };
            pipeline.on_evaluated(loaded_bytes);
            metrics.units_evaluated.inc();
            save.send((seq, io_item, columns))
                .map_err(|_| EngineError::Disconnected)?;
        }
        self.metrics.log_snapshot(self.node_id, self.worker_id);
        debug!(
            node_id = self.node_id,
            worker_id = self.worker_id,
            "eval worker finished"
        );
        Ok(())
    }

    fn evaluate(&mut self, entry: EvalWorkEntry) -> Result<Vec<Vec<Vec<u8>>>, EngineError> {
        if entry.columns.len() != self.plan.input_columns.len() {
            return Err(EngineError::Pipeline(format!(
                "loaded {} columns but the op chain declares {} inputs",
                entry.columns.len(),
                self.plan.input_columns.len()
            )));
        }

        // Units are split into work_item_size batches only when every loaded
        // column has the same row count; a video column's DecodeArgs rows are
        // interval-granular, so such units run as a single batch.
        let row_count = entry.columns.first().map(Vec::len).unwrap_or(0);
        let uniform = entry.columns.iter().all(|column| column.len() == row_count);
        let batch = if uniform && row_count > 0 {
            self.work_item_size
        } else {
            row_count.max(1)
        };

        let mut final_columns: Vec<Vec<Vec<u8>>> =
            vec![Vec::new(); self.plan.output_columns.len()];
        let mut start = 0usize;
        loop {
            let end = (start + batch).min(row_count);
            let mut env: HashMap<&str, Vec<Vec<u8>>> = HashMap::new();
            for (name, column) in self.plan.input_columns.iter().zip(&entry.columns) {
                let slice = if uniform {
                    column[start..end].to_vec()
                } else {
                    column.clone()
                };
                env.insert(name.as_str(), slice);
            }

            for (op, kernel) in self.plan.ops.iter().zip(&mut self.kernels) {
                let mut input = BatchedColumns::default();
                for name in &op.input_columns {
                    let column = env.get(name.as_str()).cloned().ok_or_else(|| {
                        EngineError::Kernel {
                            op: op.name.clone(),
                            msg: format!("input column {name} is not available"),
                        }
                    })?;
                    input.columns.push(column);
                }
                let mut output = BatchedColumns::default();
                kernel
                    .execute(&input, &mut output)
                    .map_err(|err| EngineError::Kernel {
                        op: op.name.clone(),
                        msg: err.to_string(),
                    })?;
                if output.num_columns() != op.output_columns.len() {
                    return Err(EngineError::Kernel {
                        op: op.name.clone(),
                        msg: format!(
                            "produced {} columns but declares {}",
                            output.num_columns(),
                            op.output_columns.len()
                        ),
                    });
                }
                for (name, column) in op.output_columns.iter().zip(output.columns) {
                    env.insert(name.as_str(), column);
                }
            }

            for (idx, name) in self.plan.output_columns.iter().enumerate() {
                let column = env.remove(name.as_str()).ok_or_else(|| {
                    EngineError::Pipeline(format!("output column {name} was never produced"))
                })?;
                final_columns[idx].extend(column);
            }

            if end >= row_count {
                break;
            }
            start = end;
        }

        // Warmup rows were loaded for context only; their outputs are dropped.
        for column in &mut final_columns {
            let warmup = entry.warmup_rows.min(column.len());
            column.drain(..warmup);
        }
        Ok(final_columns)
    }
}
