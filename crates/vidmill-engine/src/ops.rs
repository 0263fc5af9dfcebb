//! Job-scoped operator and kernel registries.
//!
//! Registries are plain values owned by the master/worker and passed by
//! reference into validation and pipeline construction; there is no
//! process-wide mutable state. The dynamic-loading mechanism itself stays
//! external behind [`OpLibraryLoader`], so tests and embedders inject ops
//! without touching the loader at all.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use vidmill_core::types::{DeviceHandle, DeviceType};

use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct OpInfo {
    pub name: String,
    pub input_columns: Vec<String>,
    pub output_columns: Vec<String>,
    pub is_stateful: bool,
    /// Rows of context the evaluator wants before each work unit.
    pub warmup_size: i32,
}

#[derive(Debug, Default)]
pub struct OpRegistry {
    ops: HashMap<String, OpInfo>,
}

impl OpRegistry {
    pub fn register_op(&mut self, info: OpInfo) {
        self.ops.insert(info.name.clone(), info);
    }

    pub fn has_op(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    pub fn get_op_info(&self, name: &str) -> Option<&OpInfo> {
        self.ops.get(name)
    }
}

/// Batch shape handed to every kernel once per job.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub work_item_size: i32,
    pub device: DeviceHandle,
    pub local_id: i32,
    pub local_total: i32,
}

/// Column-major rows: `columns[c][r]` is one serialized row blob.
#[derive(Debug, Clone, Default)]
pub struct BatchedColumns {
    pub columns: Vec<Vec<Vec<u8>>>,
}

impl BatchedColumns {
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("{0}")]
    Execution(String),
}

/// Compute kernel contract. Kernels are opaque to the engine; the evaluate
/// stage only moves batches through them.
pub trait Kernel: Send {
    fn configure(&mut self, config: &BatchConfig);
    fn execute(
        &mut self,
        input: &BatchedColumns,
        output: &mut BatchedColumns,
    ) -> Result<(), KernelError>;
    /// Called at every work-unit boundary so stateful kernels drop history.
    fn reset(&mut self);
}

pub type KernelFactory = Arc<dyn Fn() -> Box<dyn Kernel> + Send + Sync>;

#[derive(Default)]
pub struct KernelRegistry {
    kernels: HashMap<(String, DeviceType), KernelFactory>,
}

impl KernelRegistry {
    pub fn register_kernel(&mut self, name: &str, device: DeviceType, factory: KernelFactory) {
        self.kernels.insert((name.to_string(), device), factory);
    }

    pub fn has_kernel(&self, name: &str, device: DeviceType) -> bool {
        self.kernels.contains_key(&(name.to_string(), device))
    }

    pub fn factory(&self, name: &str, device: DeviceType) -> Option<KernelFactory> {
        self.kernels.get(&(name.to_string(), device)).cloned()
    }

    pub fn make_kernel(&self, name: &str, device: DeviceType) -> Option<Box<dyn Kernel>> {
        self.factory(name, device).map(|factory| factory())
    }
}

/// Everything a job looks ops up in.
#[derive(Default)]
pub struct Registries {
    pub ops: OpRegistry,
    pub kernels: KernelRegistry,
}

/// Loads an op library into the given registries. The real shared-object
/// host lives outside the engine; what the engine needs is only that a path
/// resolves to a set of registrations or a non-success result.
pub trait OpLibraryLoader: Send + Sync {
    fn load(&self, so_path: &Path, registries: &mut Registries) -> Result<(), EngineError>;
}

/// Loader for builds without a dynamic-loading host: every load fails as a
/// non-success result, never a crash.
pub struct DisabledOpLoader;

impl OpLibraryLoader for DisabledOpLoader {
    fn load(&self, so_path: &Path, _registries: &mut Registries) -> Result<(), EngineError> {
        Err(EngineError::OpLibrary {
            path: so_path.display().to_string(),
            msg: "dynamic op libraries are not supported by this loader".to_string(),
        })
    }
}

pub type OpBundle = Arc<dyn Fn(&mut Registries) + Send + Sync>;

/// Loader backed by in-process registration bundles keyed by path. Embedders
/// and tests pre-register bundles; `load` then behaves like the real thing.
#[derive(Default)]
pub struct StaticOpLibraries {
    bundles: Mutex<HashMap<String, OpBundle>>,
}

impl StaticOpLibraries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, bundle: OpBundle) {
        if let Ok(mut bundles) = self.bundles.lock() {
            bundles.insert(path.to_string(), bundle);
        }
    }
}

impl OpLibraryLoader for StaticOpLibraries {
    fn load(&self, so_path: &Path, registries: &mut Registries) -> Result<(), EngineError> {
        let key = so_path.display().to_string();
        let bundle = self
            .bundles
            .lock()
            .ok()
            .and_then(|bundles| bundles.get(&key).cloned())
            .ok_or_else(|| EngineError::OpLibrary {
                path: key.clone(),
                msg: "no op bundle registered for this path".to_string(),
            })?;
        bundle(registries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_lookup_is_per_device() {
        let mut registry = KernelRegistry::default();
        registry.register_kernel(
            "Blur",
            DeviceType::Cpu,
            Arc::new(|| -> Box<dyn Kernel> { unimplemented!("not constructed in this test") }),
        );
        assert!(registry.has_kernel("Blur", DeviceType::Cpu));
        assert!(!registry.has_kernel("Blur", DeviceType::Gpu));
        assert!(!registry.has_kernel("Sharpen", DeviceType::Cpu));
    }

    #[test]
    fn disabled_loader_reports_non_success() {
        let loader = DisabledOpLoader;
        let mut registries = Registries::default();
        let err = loader
            .load(Path::new("/tmp/libfoo.so"), &mut registries)
            .unwrap_err();
        assert!(matches!(err, EngineError::OpLibrary { .. }));
    }

    #[test]
    fn static_op_libraries_resolve_registered_bundles() {
        let loader = StaticOpLibraries::new();
        loader.insert(
            "/opt/ops/libblur.so",
            Arc::new(|registries: &mut Registries| {
                registries.ops.register_op(OpInfo {
                    name: "Blur".to_string(),
                    input_columns: vec!["frame".to_string()],
                    output_columns: vec!["blurred".to_string()],
                    is_stateful: false,
                    warmup_size: 0,
                });
            }),
        );

        let mut registries = Registries::default();
        loader
            .load(Path::new("/opt/ops/libblur.so"), &mut registries)
            .unwrap();
        assert!(registries.ops.has_op("Blur"));

        let err = loader
            .load(Path::new("/opt/ops/libother.so"), &mut registries)
            .unwrap_err();
        assert!(matches!(err, EngineError::OpLibrary { .. }));
    }
}
