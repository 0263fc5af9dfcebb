//! Master service: job validation, descriptor persistence, work dispatch,
//! worker registration, and progress tracking.
//!
//! `NextWork` and the scheduler state share one mutex; `NewJob` initializes
//! that state before any worker RPC goes out, then fans `NewJob` out to every
//! registered worker with structured concurrency and waits for all replies.
//! The database-metadata commit is deferred until every worker reports
//! success, and a failed job deletes the descriptors it wrote, so failures
//! leave the database untouched.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinSet;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use vidmill_core::task_sampler::{get_task_end_rows, TaskSampler, TaskSamplerError};
use vidmill_core::types::{
    Column, ColumnType, DatabaseMetadata, JobId, JobMetadata, TableId, TableMetadata, Task,
    TaskSet, WorkUnit,
};
use vidmill_observe::metrics::Counter;
use vidmill_proto::v1::master_server::Master;
use vidmill_proto::v1::worker_client::WorkerClient;
use vidmill_proto::v1::{
    Empty, IngestParameters, IngestResult, JobParameters, NewWork, NodeInfo, OpInfo, OpResult,
    Registration, WorkerInfo,
};
use vidmill_store::{meta, open_from_root, StorageBackend};
use vidmill_wire::{ToWire, TryToCore};

use crate::error::EngineError;
use crate::ingest::VideoIngest;
use crate::ops::{OpLibraryLoader, Registries};

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub db_root: String,
}

#[derive(Clone)]
struct WorkerHandle {
    address: String,
    client: WorkerClient<Channel>,
}

struct ActiveJob {
    tasks: Vec<Task>,
    output_table_ids: Vec<TableId>,
    table_metas: HashMap<String, TableMetadata>,
    io_item_size: i32,
    warmup_size: i32,
}

struct Scheduler {
    job: Option<ActiveJob>,
    next_task: usize,
    num_tasks: usize,
    samples_left: i64,
    total_samples: i64,
    total_samples_used: i64,
    sampler: Option<TaskSampler>,
    task_result: Result<(), TaskSamplerError>,
}

impl Scheduler {
    fn idle() -> Self {
        Self {
            job: None,
            next_task: 0,
            num_tasks: 0,
            samples_left: 0,
            total_samples: 0,
            total_samples_used: 0,
            sampler: None,
            task_result: Ok(()),
        }
    }

    fn for_job(job: ActiveJob, total_samples: i64) -> Self {
        Self {
            num_tasks: job.tasks.len(),
            total_samples,
            job: Some(job),
            next_task: 0,
            samples_left: 0,
            total_samples_used: 0,
            sampler: None,
            task_result: Ok(()),
        }
    }

    /// The `NextWork` state machine: advance to the next task when the
    /// current one is exhausted, emit the next unit, or fall through to the
    /// sentinel on completion or any latched failure.
    fn next_unit(&mut self) -> WorkUnit {
        loop {
            if self.task_result.is_err() {
                return WorkUnit::sentinel();
            }
            if self.samples_left <= 0 {
                let Some(job) = self.job.as_ref() else {
                    return WorkUnit::sentinel();
                };
                if self.next_task >= self.num_tasks {
                    return WorkUnit::sentinel();
                }
                let task = &job.tasks[self.next_task];
                let sampler = TaskSampler::new(
                    &job.table_metas,
                    task,
                    job.output_table_ids[self.next_task],
                    job.io_item_size,
                    job.warmup_size,
                );
                if let Err(err) = sampler.validate() {
                    self.task_result = Err(err);
                    return WorkUnit::sentinel();
                }
                self.samples_left = sampler.total_samples();
                self.sampler = Some(sampler);
                self.next_task += 1;
                debug!(tasks_left = self.num_tasks - self.next_task, "advanced task");
                continue;
            }
            let Some(sampler) = self.sampler.as_mut() else {
                return WorkUnit::sentinel();
            };
            match sampler.next_work() {
                Ok(Some(unit)) => {
                    self.samples_left -= 1;
                    self.total_samples_used += 1;
                    return unit;
                }
                Ok(None) => {
                    self.samples_left = 0;
                }
                Err(err) => {
                    self.task_result = Err(err);
                    return WorkUnit::sentinel();
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct MasterMetrics {
    jobs_started: Counter,
    jobs_failed: Counter,
    work_units_dispatched: Counter,
}

pub struct MasterService {
    storage: Arc<dyn StorageBackend>,
    registries: Arc<Mutex<Registries>>,
    loader: Arc<dyn OpLibraryLoader>,
    ingest: Arc<dyn VideoIngest>,
    workers: tokio::sync::Mutex<Vec<WorkerHandle>>,
    scheduler: Mutex<Scheduler>,
    metrics: MasterMetrics,
}

impl MasterService {
    pub fn new(
        config: MasterConfig,
        registries: Arc<Mutex<Registries>>,
        loader: Arc<dyn OpLibraryLoader>,
        ingest: Arc<dyn VideoIngest>,
    ) -> Result<Self, EngineError> {
        let storage: Arc<dyn StorageBackend> = Arc::from(open_from_root(&config.db_root)?);
        Ok(Self {
            storage,
            registries,
            loader,
            ingest,
            workers: tokio::sync::Mutex::new(Vec::new()),
            scheduler: Mutex::new(Scheduler::idle()),
            metrics: MasterMetrics::default(),
        })
    }

    fn lock_scheduler(&self) -> Result<MutexGuard<'_, Scheduler>, Status> {
        self.scheduler
            .lock()
            .map_err(|_| Status::internal("scheduler mutex poisoned"))
    }

    fn fast_drain(&self) {
        if let Ok(mut scheduler) = self.scheduler.lock() {
            scheduler.next_task = scheduler.num_tasks;
            scheduler.samples_left = 0;
            scheduler.sampler = None;
        }
    }

    fn cleanup_job_descriptors(&self, written_tables: &[TableId], job_id: JobId) {
        for &table_id in written_tables {
            if let Err(err) = meta::delete_table_metadata(self.storage.as_ref(), table_id) {
                warn!(table_id = table_id.0, error = %err, "failed to delete orphaned table descriptor");
            }
        }
        if let Err(err) = meta::delete_job_metadata(self.storage.as_ref(), job_id) {
            warn!(job_id = job_id.0, error = %err, "failed to delete orphaned job descriptor");
        }
    }

    async fn handle_new_job(&self, params: JobParameters) -> Result<(), EngineError> {
        if params.io_item_size <= 0 {
            return Err(EngineError::Validation(format!(
                "io_item_size must be positive, got {}",
                params.io_item_size
            )));
        }
        if params.work_item_size <= 0 {
            return Err(EngineError::Validation(format!(
                "work_item_size must be positive, got {}",
                params.work_item_size
            )));
        }
        let task_set: TaskSet = params
            .task_set
            .as_ref()
            .ok_or_else(|| EngineError::Validation("job parameters carry no task set".to_string()))?
            .try_to_core()?;

        let mut db_meta = meta::read_or_init_database_metadata(self.storage.as_ref())?;
        let warmup_size = {
            let registries = self
                .registries
                .lock()
                .map_err(|_| EngineError::Pipeline("registry mutex poisoned".to_string()))?;
            validate_task_set(&db_meta, &task_set, &registries)?;
            job_warmup_size(&task_set, &registries)
        };

        let workers_snapshot = self.workers.lock().await.clone();
        if workers_snapshot.is_empty() {
            return Err(EngineError::Validation(
                "no workers are registered with this master".to_string(),
            ));
        }

        // Resolve every existing table for input lookup; tables are small in
        // count and the descriptors are tiny.
        let mut table_metas: HashMap<String, TableMetadata> = HashMap::new();
        let table_names: Vec<String> = db_meta.table_names().map(str::to_string).collect();
        for name in table_names {
            let Some(table_id) = db_meta.get_table_id(&name) else {
                continue;
            };
            let table_meta = meta::read_table_metadata(self.storage.as_ref(), table_id)?;
            table_metas.insert(name, table_meta);
        }

        let columns = output_columns(&task_set);
        let job_id = db_meta.add_job(&params.job_name);
        let timestamp = vidmill_observe::time::unix_time_s();

        let mut total_samples: i64 = 0;
        let mut output_table_ids: Vec<TableId> = Vec::new();
        let mut written_tables: Vec<TableId> = Vec::new();
        for task in &task_set.tasks {
            let table_id = match db_meta.add_table(&task.output_table_name) {
                Ok(id) => id,
                Err(err) => {
                    self.cleanup_job_descriptors(&written_tables, job_id);
                    return Err(EngineError::Validation(err.to_string()));
                }
            };
            let mut table_meta = TableMetadata {
                id: table_id,
                name: task.output_table_name.clone(),
                job_id: Some(job_id),
                timestamp,
                end_rows: Vec::new(),
                columns: columns.clone(),
            };
            // Visible to later tasks even before end_rows are known, the same
            // way inputs resolve for chained tasks.
            table_metas.insert(task.output_table_name.clone(), table_meta.clone());

            let end_rows = match get_task_end_rows(
                &table_metas,
                task,
                table_id,
                params.io_item_size,
                warmup_size,
            ) {
                Ok(end_rows) => end_rows,
                Err(err) => {
                    self.cleanup_job_descriptors(&written_tables, job_id);
                    return Err(err.into());
                }
            };
            total_samples += end_rows.len() as i64;
            table_meta.end_rows = end_rows;

            if let Err(err) = meta::write_table_metadata(self.storage.as_ref(), &table_meta) {
                self.cleanup_job_descriptors(&written_tables, job_id);
                return Err(err.into());
            }
            written_tables.push(table_id);
            table_metas.insert(task.output_table_name.clone(), table_meta);
            output_table_ids.push(table_id);
        }

        let job_meta = JobMetadata {
            id: job_id,
            name: params.job_name.clone(),
            io_item_size: params.io_item_size,
            work_item_size: params.work_item_size,
            num_nodes: workers_snapshot.len() as i32,
            tasks: task_set.tasks.clone(),
            columns,
        };
        if let Err(err) = meta::write_job_metadata(self.storage.as_ref(), &job_meta) {
            self.cleanup_job_descriptors(&written_tables, job_id);
            return Err(err.into());
        }

        // Scheduler state must be live before the first worker can call
        // NextWork.
        {
            let mut scheduler = self
                .scheduler
                .lock()
                .map_err(|_| EngineError::Pipeline("scheduler mutex poisoned".to_string()))?;
            *scheduler = Scheduler::for_job(
                ActiveJob {
                    tasks: task_set.tasks.clone(),
                    output_table_ids,
                    table_metas,
                    io_item_size: params.io_item_size,
                    warmup_size,
                },
                total_samples,
            );
        }
        self.metrics.jobs_started.inc();
        info!(
            job_id = job_id.0,
            total_samples,
            workers = workers_snapshot.len(),
            "dispatching job"
        );

        // One NewJob RPC per worker, joined together. An 8-GPU box gets
        // local ids 0..7 so workers can shard local resources.
        let mut local_totals: HashMap<String, i32> = HashMap::new();
        for handle in &workers_snapshot {
            *local_totals.entry(handle.address.clone()).or_insert(0) += 1;
        }
        let mut local_ids: HashMap<String, i32> = HashMap::new();
        let mut join_set = JoinSet::new();
        for handle in &workers_snapshot {
            let local_id = {
                let counter = local_ids.entry(handle.address.clone()).or_insert(0);
                let id = *counter;
                *counter += 1;
                id
            };
            let mut worker_params = params.clone();
            worker_params.local_id = local_id;
            worker_params.local_total = *local_totals.get(&handle.address).unwrap_or(&1);

            let mut client = handle.client.clone();
            let address = handle.address.clone();
            join_set.spawn(async move {
                match client.new_job(worker_params).await {
                    Ok(response) => {
                        let reply = response.into_inner();
                        if reply.success {
                            Ok(())
                        } else {
                            Err((address, reply.msg))
                        }
                    }
                    Err(status) => Err((address, status.to_string())),
                }
            });
        }

        let mut failure: Option<EngineError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err((address, msg))) => {
                    warn!(%address, %msg, "worker returned error");
                    if failure.is_none() {
                        failure = Some(EngineError::Worker { address, msg });
                    }
                    self.fast_drain();
                }
                Err(join_err) => {
                    if failure.is_none() {
                        failure = Some(EngineError::Pipeline(format!(
                            "worker dispatch task failed: {join_err}"
                        )));
                    }
                    self.fast_drain();
                }
            }
        }

        if failure.is_none() {
            let task_result = self
                .scheduler
                .lock()
                .map(|scheduler| scheduler.task_result.clone())
                .unwrap_or(Ok(()));
            if let Err(err) = task_result {
                failure = Some(err.into());
            }
        }

        if let Some(err) = failure {
            self.cleanup_job_descriptors(&written_tables, job_id);
            return Err(err);
        }

        // Deferred commit: the name→id index only learns about the new
        // tables once every worker has succeeded.
        meta::write_database_metadata(self.storage.as_ref(), &db_meta)?;
        info!(job_id = job_id.0, total_samples, "job complete");
        Ok(())
    }

    async fn handle_load_op(&self, op_info: &OpInfo) -> Result<(), EngineError> {
        let path = Path::new(&op_info.so_path);
        if !path.exists() {
            return Err(EngineError::OpLibrary {
                path: op_info.so_path.clone(),
                msg: "op library was not found".to_string(),
            });
        }
        {
            let mut registries = self
                .registries
                .lock()
                .map_err(|_| EngineError::Pipeline("registry mutex poisoned".to_string()))?;
            self.loader.load(path, &mut registries)?;
        }
        let workers_snapshot = self.workers.lock().await.clone();
        for handle in workers_snapshot {
            let mut client = handle.client;
            match client.load_op(op_info.clone()).await {
                Ok(response) => {
                    let reply = response.into_inner();
                    if !reply.success {
                        return Err(EngineError::Worker {
                            address: handle.address,
                            msg: reply.msg,
                        });
                    }
                }
                Err(status) => {
                    return Err(EngineError::Worker {
                        address: handle.address,
                        msg: status.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Warmup for a job is the largest warmup any of its ops asks for.
fn job_warmup_size(task_set: &TaskSet, registries: &Registries) -> i32 {
    task_set
        .ops
        .iter()
        .filter(|op| !op.is_input_table() && !op.is_output_table())
        .filter_map(|op| registries.ops.get_op_info(&op.name))
        .map(|info| info.warmup_size)
        .max()
        .unwrap_or(0)
}

/// Output table columns are the columns the OutputTable op selects, in order.
fn output_columns(task_set: &TaskSet) -> Vec<Column> {
    let Some(last_op) = task_set.ops.last() else {
        return Vec::new();
    };
    last_op
        .inputs
        .iter()
        .flat_map(|input| input.columns.iter())
        .enumerate()
        .map(|(id, name)| Column {
            id: id as i32,
            name: name.clone(),
            column_type: ColumnType::Other,
        })
        .collect()
}

/// Rejects a task set before anything is persisted. All failing conditions
/// are collected so the client sees every problem at once.
fn validate_task_set(
    db_meta: &DatabaseMetadata,
    task_set: &TaskSet,
    registries: &Registries,
) -> Result<(), EngineError> {
    let mut errors: Vec<String> = Vec::new();

    let mut output_names: HashSet<&str> = HashSet::new();
    for task in &task_set.tasks {
        let name = task.output_table_name.as_str();
        if name.is_empty() {
            errors.push("task specified with empty output table name".to_string());
        }
        if db_meta.has_table(name) {
            errors.push(format!("a table with name {name} already exists"));
        }
        if !output_names.insert(name) {
            errors.push(format!(
                "multiple tasks specified with output table name {name}; table names must be unique"
            ));
        }
        if task.samples.is_empty() {
            errors.push(format!(
                "task {name} does not sample from any table; tasks must sample from at least one"
            ));
        } else {
            for sample in &task.samples {
                if !db_meta.has_table(&sample.table_name) {
                    errors.push(format!(
                        "task {name} samples from non-existent table {}",
                        sample.table_name
                    ));
                }
                if sample.column_names.is_empty() {
                    errors.push(format!(
                        "task {name} samples zero columns from table {}",
                        sample.table_name
                    ));
                }
            }
        }
    }

    let ops = &task_set.ops;
    if ops.len() < 3 {
        errors.push(format!(
            "task set must specify at least three ops (InputTable, any op, OutputTable) but only {} were specified",
            ops.len()
        ));
    } else {
        if !ops[0].is_input_table() {
            errors.push(format!(
                "first op is {} but must be InputTable",
                ops[0].name
            ));
        }
        if !ops[ops.len() - 1].is_output_table() {
            errors.push(format!(
                "last op is {} but must be OutputTable",
                ops[ops.len() - 1].name
            ));
        }
    }

    let mut op_names: Vec<&str> = Vec::new();
    let mut op_outputs: Vec<Vec<String>> = Vec::new();
    for (op_idx, op) in ops.iter().enumerate() {
        op_names.push(op.name.as_str());
        if op_idx == 0 {
            // The synthetic InputTable op exposes the sampled columns.
            op_outputs.push(
                op.inputs
                    .iter()
                    .flat_map(|input| input.columns.iter().cloned())
                    .collect(),
            );
            continue;
        }
        if !op.is_output_table() {
            let mut outputs = Vec::new();
            match registries.ops.get_op_info(&op.name) {
                Some(info) => outputs = info.output_columns.clone(),
                None => errors.push(format!("op {} is not registered", op.name)),
            }
            if !registries.kernels.has_kernel(&op.name, op.device) {
                errors.push(format!(
                    "op {} at index {op_idx} requested a kernel with device type {:?} but no such kernel exists",
                    op.name, op.device
                ));
            }
            op_outputs.push(outputs);
        } else {
            op_outputs.push(Vec::new());
        }

        for input in &op.inputs {
            if input.op_index < 0 || input.op_index as usize >= op_idx {
                errors.push(format!(
                    "op {} at index {op_idx} referenced input index {}; ops must be specified in topological order",
                    op.name, input.op_index
                ));
                continue;
            }
            let source_idx = input.op_index as usize;
            let available = &op_outputs[source_idx];
            for column in &input.columns {
                if !available.contains(column) {
                    errors.push(format!(
                        "op {} at index {op_idx} requested column {column} from op {} at index {source_idx} but that op does not have the requested column",
                        op.name, op_names[source_idx]
                    ));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation(errors.join("; ")))
    }
}

#[tonic::async_trait]
impl Master for MasterService {
    async fn register_worker(
        &self,
        request: Request<WorkerInfo>,
    ) -> Result<Response<Registration>, Status> {
        let info = request.into_inner();
        // Lazy channel: the dial happens at the first RPC, so workers may
        // register before their own server is accepting connections.
        let endpoint = tonic::transport::Endpoint::from_shared(info.address.clone())
            .map_err(|err| {
                Status::invalid_argument(format!("bad worker address {}: {err}", info.address))
            })?;
        let client = WorkerClient::new(endpoint.connect_lazy());
        let mut workers = self.workers.lock().await;
        workers.push(WorkerHandle {
            address: info.address.clone(),
            client,
        });
        let node_id = workers.len() as i32 - 1;
        info!(node_id, address = %info.address, "registered worker");
        Ok(Response::new(Registration { node_id }))
    }

    async fn ingest_videos(
        &self,
        request: Request<IngestParameters>,
    ) -> Result<Response<IngestResult>, Status> {
        let params = request.into_inner();
        let reply = match self.ingest.ingest(&params.table_names, &params.video_paths) {
            Ok(failures) => IngestResult {
                result: Some(OpResult {
                    success: true,
                    msg: String::new(),
                }),
                failed_paths: failures.iter().map(|f| f.path.clone()).collect(),
                failed_messages: failures.into_iter().map(|f| f.message).collect(),
            },
            Err(err) => IngestResult {
                result: Some(OpResult {
                    success: false,
                    msg: err.to_string(),
                }),
                failed_paths: Vec::new(),
                failed_messages: Vec::new(),
            },
        };
        Ok(Response::new(reply))
    }

    async fn new_job(
        &self,
        request: Request<JobParameters>,
    ) -> Result<Response<OpResult>, Status> {
        let params = request.into_inner();
        info!(job = %params.job_name, "received job");
        let reply = match self.handle_new_job(params).await {
            Ok(()) => OpResult {
                success: true,
                msg: String::new(),
            },
            Err(err) => {
                self.metrics.jobs_failed.inc();
                warn!(error = %err, "job rejected or failed");
                OpResult {
                    success: false,
                    msg: err.to_string(),
                }
            }
        };
        Ok(Response::new(reply))
    }

    async fn next_work(&self, _request: Request<NodeInfo>) -> Result<Response<NewWork>, Status> {
        let (unit, used, total) = {
            let mut scheduler = self.lock_scheduler()?;
            let unit = scheduler.next_unit();
            (unit, scheduler.total_samples_used, scheduler.total_samples)
        };
        if !unit.is_sentinel() {
            self.metrics.work_units_dispatched.inc();
            debug!(used, total, io_item_index = unit.io_item.item_id, "dispatched work unit");
        }
        Ok(Response::new(unit.to_wire()))
    }

    async fn load_op(&self, request: Request<OpInfo>) -> Result<Response<OpResult>, Status> {
        let op_info = request.into_inner();
        let reply = match self.handle_load_op(&op_info).await {
            Ok(()) => OpResult {
                success: true,
                msg: String::new(),
            },
            Err(err) => OpResult {
                success: false,
                msg: err.to_string(),
            },
        };
        Ok(Response::new(reply))
    }

    async fn ping(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        Ok(Response::new(Empty {}))
    }
}
