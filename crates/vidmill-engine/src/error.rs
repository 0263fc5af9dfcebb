use thiserror::Error;

use vidmill_core::sampling::SamplingError;
use vidmill_core::task_sampler::TaskSamplerError;
use vidmill_store::StoreError;
use vidmill_wire::ConvertError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sampling(#[from] SamplingError),
    #[error(transparent)]
    TaskSampler(#[from] TaskSamplerError),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error("invalid job: {0}")]
    Validation(String),
    #[error("op {op}: {msg}")]
    Kernel { op: String, msg: String },
    #[error("op library {path}: {msg}")]
    OpLibrary { path: String, msg: String },
    #[error("worker {address}: {msg}")]
    Worker { address: String, msg: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("pipeline: {0}")]
    Pipeline(String),
    #[error("pipeline queue disconnected")]
    Disconnected,
}
