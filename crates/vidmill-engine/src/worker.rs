//! Worker service: hosts the load→evaluate→save pipeline for one node.
//!
//! `NewJob` builds the pipeline as OS threads joined by bounded channels,
//! pulls units from the master one at a time until the sentinel, then fans
//! the sentinel to every load thread and blocks until the pipeline drains.
//! tokio is only the RPC boundary; the stages themselves are synchronous.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crossbeam::channel::bounded;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use vidmill_core::types::{DeviceHandle, IoItem, TaskSet, WorkUnit};
use vidmill_proto::v1::master_client::MasterClient;
use vidmill_proto::v1::worker_server::Worker;
use vidmill_proto::v1::{JobParameters, NodeInfo, OpInfo, OpResult};
use vidmill_store::open_from_root;
use vidmill_wire::TryToCore;

use crate::error::EngineError;
use crate::eval::{build_eval_plan, EvalWorkEntry, EvalWorker, PipelineMetrics};
use crate::load::LoadWorker;
use crate::ops::{BatchConfig, Kernel, OpLibraryLoader, Registries};
use crate::save::SaveWorker;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub db_root: String,
    pub node_id: i32,
    pub load_threads: usize,
    pub eval_threads: usize,
    /// Bound on every inter-stage queue, in work units.
    pub queue_size: usize,
}

pub struct WorkerService {
    config: WorkerConfig,
    master: MasterClient<Channel>,
    registries: Arc<Mutex<Registries>>,
    loader: Arc<dyn OpLibraryLoader>,
}

impl WorkerService {
    pub fn new(
        config: WorkerConfig,
        master: MasterClient<Channel>,
        registries: Arc<Mutex<Registries>>,
        loader: Arc<dyn OpLibraryLoader>,
    ) -> Self {
        Self {
            config,
            master,
            registries,
            loader,
        }
    }

    fn lock_registries(&self) -> Result<MutexGuard<'_, Registries>, EngineError> {
        self.registries
            .lock()
            .map_err(|_| EngineError::Pipeline("registry mutex poisoned".to_string()))
    }

    async fn run_job(&self, params: JobParameters) -> Result<(), EngineError> {
        let task_set: TaskSet = params
            .task_set
            .as_ref()
            .ok_or_else(|| EngineError::Validation("job parameters carry no task set".to_string()))?
            .try_to_core()?;

        let config = self.config.clone();
        let load_threads = config.load_threads.max(1);
        let eval_threads = config.eval_threads.max(1);
        let batch_config = BatchConfig {
            work_item_size: params.work_item_size,
            device: DeviceHandle::CPU,
            local_id: params.local_id,
            local_total: params.local_total,
        };

        // Resolve the plan and instantiate every kernel before spawning
        // anything, so a bad job fails without touching the pipeline.
        let (plan, kernel_sets) = {
            let registries = self.lock_registries()?;
            let plan = build_eval_plan(&task_set, &registries)?;
            let mut kernel_sets: Vec<Vec<Box<dyn Kernel>>> = Vec::new();
            for _ in 0..eval_threads {
                let mut kernels = Vec::new();
                for op in &plan.ops {
                    let kernel = registries
                        .kernels
                        .make_kernel(&op.name, op.device)
                        .ok_or_else(|| {
                            EngineError::Validation(format!(
                                "op {} has no kernel for device type {:?}",
                                op.name, op.device
                            ))
                        })?;
                    kernels.push(kernel);
                }
                kernel_sets.push(kernels);
            }
            (plan, kernel_sets)
        };

        let (load_tx, load_rx) = bounded::<(u64, WorkUnit)>(config.queue_size);
        let (eval_tx, eval_rx) = bounded::<(u64, IoItem, EvalWorkEntry)>(config.queue_size);
        let (save_tx, save_rx) = bounded::<(u64, IoItem, Vec<Vec<Vec<u8>>>)>(config.queue_size);
        let pipeline_metrics = Arc::new(PipelineMetrics::default());

        let mut handles: Vec<JoinHandle<Result<(), EngineError>>> = Vec::new();
        for worker_id in 0..load_threads {
            // Each load thread owns its storage handle and caches.
            let storage = open_from_root(&config.db_root)?;
            let rx = load_rx.clone();
            let tx = eval_tx.clone();
            let node_id = config.node_id;
            let pipeline = Arc::clone(&pipeline_metrics);
            handles.push(std::thread::spawn(move || {
                LoadWorker::new(node_id, worker_id, storage, pipeline).run(rx, tx)
            }));
        }
        for (worker_id, kernels) in kernel_sets.into_iter().enumerate() {
            let worker = EvalWorker::new(
                config.node_id,
                worker_id,
                plan.clone(),
                kernels,
                batch_config,
                Arc::clone(&pipeline_metrics),
            )?;
            let rx = eval_rx.clone();
            let tx = save_tx.clone();
            handles.push(std::thread::spawn(move || worker.run(rx, tx)));
        }
        {
            let storage = open_from_root(&config.db_root)?;
            let node_id = config.node_id;
            handles.push(std::thread::spawn(move || {
                SaveWorker::new(node_id, storage).run(save_rx)
            }));
        }
        drop(load_rx);
        drop(eval_tx);
        drop(eval_rx);
        drop(save_tx);

        let pull_result = self.pull_work(&load_tx).await;

        // Fan the sentinel to every load thread regardless of how pulling
        // ended; a dead queue just means the threads are already gone.
        for _ in 0..load_threads {
            let tx = load_tx.clone();
            let _ = tokio::task::spawn_blocking(move || tx.send((0, WorkUnit::sentinel()))).await;
        }
        drop(load_tx);

        let joined = tokio::task::spawn_blocking(move || {
            handles
                .into_iter()
                .map(|handle| handle.join())
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|err| EngineError::Pipeline(format!("join task failed: {err}")))?;

        for result in joined {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(EngineError::Pipeline("pipeline thread panicked".to_string())),
            }
        }
        info!(
            node_id = config.node_id,
            inflight_bytes_high_water = pipeline_metrics.inflight_bytes_high_water.get(),
            "pipeline drained"
        );
        pull_result
    }

    /// Pulls units until the sentinel, stamping a dense local sequence so the
    /// save stage can restore pull order.
    async fn pull_work(
        &self,
        load_tx: &crossbeam::channel::Sender<(u64, WorkUnit)>,
    ) -> Result<(), EngineError> {
        let mut client = self.master.clone();
        let node_id = self.config.node_id;
        let mut seq = 0u64;
        loop {
            let response = client
                .next_work(NodeInfo { node_id })
                .await
                .map_err(|status| EngineError::Transport(status.to_string()))?;
            let unit: WorkUnit = response.into_inner().try_to_core()?;
            if unit.is_sentinel() {
                info!(node_id, pulled = seq, "work drained");
                return Ok(());
            }
            let tx = load_tx.clone();
            let stamped = (seq, unit);
            tokio::task::spawn_blocking(move || tx.send(stamped))
                .await
                .map_err(|err| EngineError::Pipeline(format!("send task failed: {err}")))?
                .map_err(|_| EngineError::Disconnected)?;
            seq += 1;
        }
    }
}

#[tonic::async_trait]
impl Worker for WorkerService {
    async fn new_job(
        &self,
        request: Request<JobParameters>,
    ) -> Result<Response<OpResult>, Status> {
        let params = request.into_inner();
        info!(
            node_id = self.config.node_id,
            job = %params.job_name,
            local_id = params.local_id,
            local_total = params.local_total,
            "starting job"
        );
        let reply = match self.run_job(params).await {
            Ok(()) => OpResult {
                success: true,
                msg: String::new(),
            },
            Err(err) => {
                warn!(node_id = self.config.node_id, error = %err, "job failed");
                OpResult {
                    success: false,
                    msg: err.to_string(),
                }
            }
        };
        Ok(Response::new(reply))
    }

    async fn load_op(&self, request: Request<OpInfo>) -> Result<Response<OpResult>, Status> {
        let info = request.into_inner();
        let result = self
            .lock_registries()
            .and_then(|mut registries| self.loader.load(Path::new(&info.so_path), &mut registries));
        let reply = match result {
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
}
