#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::Parser;
use tonic::transport::Server;
use tracing::info;

use vidmill_engine::ingest::DisabledIngest;
use vidmill_engine::master::{MasterConfig, MasterService};
use vidmill_engine::ops::{DisabledOpLoader, Registries};
use vidmill_proto::v1::master_server::MasterServer;

#[derive(Debug, Parser)]
#[command(name = "vidmill-master")]
struct Args {
    /// Address to bind the master gRPC server.
    #[arg(long, env = "VIDMILL_MASTER_BIND_ADDR", default_value = "0.0.0.0:50051")]
    addr: SocketAddr,

    /// Database root directory.
    #[arg(long, env = "VIDMILL_DB_PATH", default_value = "/var/lib/vidmill/db")]
    db_path: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    vidmill_observe::logging::init_tracing();
    let args = Args::parse();

    // The stock daemon starts with empty registries; embedders register ops
    // through the library API or a LoadOp-capable loader.
    let service = MasterService::new(
        MasterConfig {
            db_root: args.db_path.clone(),
        },
        Arc::new(Mutex::new(Registries::default())),
        Arc::new(DisabledOpLoader),
        Arc::new(DisabledIngest),
    )?;

    info!(addr = %args.addr, db_path = %args.db_path, "starting master");
    Server::builder()
        .add_service(MasterServer::new(service))
        .serve(args.addr)
        .await?;
    Ok(())
}
