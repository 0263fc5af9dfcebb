use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tonic::Request;

use vidmill_core::types::{
    Column, ColumnType, DeviceType, OpInput, OpNode, SamplingFunction, TableId, TableMetadata,
    TableSample, Task, TaskSet, INPUT_TABLE_OP, OUTPUT_TABLE_OP,
};
use vidmill_engine::ingest::DisabledIngest;
use vidmill_engine::master::{MasterConfig, MasterService};
use vidmill_engine::ops::{
    BatchConfig, BatchedColumns, DisabledOpLoader, Kernel, KernelError, OpInfo, Registries,
};
use vidmill_proto::v1::master_server::Master;
use vidmill_proto::v1::{JobParameters, NodeInfo};
use vidmill_store::fs::PosixStorage;
use vidmill_store::meta;
use vidmill_wire::ToWire;

struct NopKernel;

impl Kernel for NopKernel {
    fn configure(&mut self, _config: &BatchConfig) {}

    fn execute(
        &mut self,
        input: &BatchedColumns,
        output: &mut BatchedColumns,
    ) -> Result<(), KernelError> {
        output.columns.push(input.columns.first().cloned().unwrap_or_default());
        Ok(())
    }

    fn reset(&mut self) {}
}

fn temp_root(test_name: &str) -> anyhow::Result<PathBuf> {
    let mut root = std::env::temp_dir();
    root.push(format!(
        "vidmill-master-{}-{}-{}",
        test_name,
        std::process::id(),
        vidmill_observe::time::unix_time_ms()
    ));
    std::fs::create_dir_all(&root)?;
    Ok(root)
}

/// Database with one existing table `clips` exposing an `image` column, and
/// a registry with one CPU op `Foo` producing `out`.
fn setup_master(root: &PathBuf) -> anyhow::Result<MasterService> {
    let storage = PosixStorage::new(root.clone());
    let mut db_meta = vidmill_core::types::DatabaseMetadata::default();
    let table_id = db_meta.add_table("clips")?;
    assert_eq!(table_id, TableId(0));
    meta::write_table_metadata(
        &storage,
        &TableMetadata {
            id: table_id,
            name: "clips".to_string(),
            job_id: None,
            timestamp: 0,
            end_rows: vec![10],
            columns: vec![Column {
                id: 0,
                name: "image".to_string(),
                column_type: ColumnType::Other,
            }],
        },
    )?;
    meta::write_database_metadata(&storage, &db_meta)?;

    let mut registries = Registries::default();
    registries.ops.register_op(OpInfo {
        name: "Foo".to_string(),
        input_columns: vec!["image".to_string()],
        output_columns: vec!["out".to_string()],
        is_stateful: false,
        warmup_size: 0,
    });
    registries.kernels.register_kernel(
        "Foo",
        DeviceType::Cpu,
        Arc::new(|| Box::new(NopKernel) as Box<dyn Kernel>),
    );

    Ok(MasterService::new(
        MasterConfig {
            db_root: root.display().to_string(),
        },
        Arc::new(Mutex::new(registries)),
        Arc::new(DisabledOpLoader),
        Arc::new(DisabledIngest),
    )?)
}

fn job_params(tasks: Vec<Task>, foo_input_column: &str) -> JobParameters {
    let task_set = TaskSet {
        tasks,
        ops: vec![
            OpNode {
                name: INPUT_TABLE_OP.to_string(),
                device: DeviceType::Cpu,
                inputs: vec![OpInput {
                    op_index: 0,
                    columns: vec!["image".to_string()],
                }],
            },
            OpNode {
                name: "Foo".to_string(),
                device: DeviceType::Cpu,
                inputs: vec![OpInput {
                    op_index: 0,
                    columns: vec![foo_input_column.to_string()],
                }],
            },
            OpNode {
                name: OUTPUT_TABLE_OP.to_string(),
                device: DeviceType::Cpu,
                inputs: vec![OpInput {
                    op_index: 1,
                    columns: vec!["out".to_string()],
                }],
            },
        ],
    };
    JobParameters {
        job_name: "test-job".to_string(),
        io_item_size: 4,
        work_item_size: 2,
        task_set: Some(task_set.to_wire()),
        local_id: 0,
        local_total: 0,
    }
}

fn sample_clips() -> TableSample {
    TableSample {
        table_name: "clips".to_string(),
        column_names: vec!["image".to_string()],
        sampling: SamplingFunction::All,
    }
}

#[tokio::test]
async fn dag_with_unknown_input_column_is_rejected() -> anyhow::Result<()> {
    let root = temp_root("bad-column")?;
    let master = setup_master(&root)?;

    let params = job_params(
        vec![Task {
            output_table_name: "edges".to_string(),
            samples: vec![sample_clips()],
        }],
        "nope",
    );
    let reply = master.new_job(Request::new(params)).await?.into_inner();
    assert!(!reply.success);
    assert!(
        reply.msg.contains("does not have the requested column"),
        "unexpected message: {}",
        reply.msg
    );

    // Nothing was persisted: the database still only knows `clips`.
    let storage = PosixStorage::new(root.clone());
    let db_meta = meta::read_database_metadata(&storage)?;
    assert_eq!(db_meta.next_table_id, 1);
    assert!(!db_meta.has_table("edges"));
    assert!(meta::read_table_metadata(&storage, TableId(1)).is_err());
    Ok(())
}

#[tokio::test]
async fn duplicate_output_table_names_are_rejected() -> anyhow::Result<()> {
    let root = temp_root("dup-table")?;
    let master = setup_master(&root)?;

    let params = job_params(
        vec![
            Task {
                output_table_name: "dup".to_string(),
                samples: vec![sample_clips()],
            },
            Task {
                output_table_name: "dup".to_string(),
                samples: vec![sample_clips()],
            },
        ],
        "image",
    );
    let reply = master.new_job(Request::new(params)).await?.into_inner();
    assert!(!reply.success);
    assert!(
        reply.msg.contains("must be unique"),
        "unexpected message: {}",
        reply.msg
    );

    let storage = PosixStorage::new(root.clone());
    let db_meta = meta::read_database_metadata(&storage)?;
    assert_eq!(db_meta.next_table_id, 1);
    assert!(!db_meta.has_table("dup"));
    Ok(())
}

#[tokio::test]
async fn short_op_chain_is_rejected() -> anyhow::Result<()> {
    let root = temp_root("short-chain")?;
    let master = setup_master(&root)?;

    let mut params = job_params(
        vec![Task {
            output_table_name: "edges".to_string(),
            samples: vec![sample_clips()],
        }],
        "image",
    );
    if let Some(task_set) = params.task_set.as_mut() {
        task_set.ops.truncate(2);
    }
    let reply = master.new_job(Request::new(params)).await?.into_inner();
    assert!(!reply.success);
    assert!(
        reply.msg.contains("at least three ops"),
        "unexpected message: {}",
        reply.msg
    );
    Ok(())
}

#[tokio::test]
async fn next_work_without_a_job_returns_sentinel() -> anyhow::Result<()> {
    let root = temp_root("no-job")?;
    let master = setup_master(&root)?;

    let work = master
        .next_work(Request::new(NodeInfo { node_id: 0 }))
        .await?
        .into_inner();
    assert_eq!(work.io_item.map(|item| item.item_id), Some(-1));
    Ok(())
}

#[tokio::test]
async fn load_op_with_missing_library_fails_without_crashing() -> anyhow::Result<()> {
    let root = temp_root("load-op")?;
    let master = setup_master(&root)?;

    let reply = master
        .load_op(Request::new(vidmill_proto::v1::OpInfo {
            so_path: root.join("libmissing.so").display().to_string(),
        }))
        .await?
        .into_inner();
    assert!(!reply.success);
    assert!(
        reply.msg.contains("was not found"),
        "unexpected message: {}",
        reply.msg
    );
    Ok(())
}
