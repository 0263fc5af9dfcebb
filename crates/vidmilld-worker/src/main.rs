#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tonic::transport::Server;
use tracing::{info, warn};

use vidmill_engine::ops::{DisabledOpLoader, Registries};
use vidmill_engine::worker::{WorkerConfig, WorkerService};
use vidmill_proto::v1::master_client::MasterClient;
use vidmill_proto::v1::worker_server::WorkerServer;
use vidmill_proto::v1::WorkerInfo;

const REGISTER_ATTEMPTS: u32 = 10;

#[derive(Debug, Parser)]
#[command(name = "vidmilld-worker")]
struct Args {
    /// Master address, e.g. http://127.0.0.1:50051
    #[arg(long, env = "VIDMILL_MASTER_URL", default_value = "http://127.0.0.1:50051")]
    master_url: String,

    /// Address to bind the worker gRPC server.
    #[arg(long, env = "VIDMILL_WORKER_BIND_ADDR", default_value = "0.0.0.0:50052")]
    addr: SocketAddr,

    /// Address the master dials back, e.g. http://10.0.0.5:50052.
    #[arg(
        long,
        env = "VIDMILL_WORKER_ADVERTISE_URL",
        default_value = "http://127.0.0.1:50052"
    )]
    advertise_url: String,

    /// Database root directory; must be the same storage the master uses.
    #[arg(long, env = "VIDMILL_DB_PATH", default_value = "/var/lib/vidmill/db")]
    db_path: String,

    #[arg(long, env = "VIDMILL_LOAD_THREADS", default_value_t = 4)]
    load_threads: usize,

    #[arg(long, env = "VIDMILL_EVAL_THREADS", default_value_t = 2)]
    eval_threads: usize,

    /// Bound on every inter-stage queue, in work units.
    #[arg(long, env = "VIDMILL_QUEUE_SIZE", default_value_t = 16)]
    queue_size: usize,
}

async fn connect_master(url: &str) -> Result<MasterClient<tonic::transport::Channel>> {
    let mut attempt = 1;
    loop {
        match MasterClient::connect(url.to_string()).await {
            Ok(client) => return Ok(client),
            Err(err) if attempt < REGISTER_ATTEMPTS => {
                warn!(attempt, error = %err, "master not reachable yet, retrying");
                tokio::time::sleep(Duration::from_millis(500)).await;
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    vidmill_observe::logging::init_tracing();
    let args = Args::parse();

    let mut master = connect_master(&args.master_url).await?;
    let registration = master
        .register_worker(WorkerInfo {
            address: args.advertise_url.clone(),
        })
        .await?
        .into_inner();
    let node_id = registration.node_id;
    info!(node_id, master = %args.master_url, "registered with master");

    let service = WorkerService::new(
        WorkerConfig {
            db_root: args.db_path.clone(),
            node_id,
            load_threads: args.load_threads,
            eval_threads: args.eval_threads,
            queue_size: args.queue_size,
        },
        master,
        Arc::new(Mutex::new(Registries::default())),
        Arc::new(DisabledOpLoader),
    );

    info!(addr = %args.addr, db_path = %args.db_path, "starting worker");
    Server::builder()
        .add_service(WorkerServer::new(service))
        .serve(args.addr)
        .await?;
    Ok(())
}
