use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `VIDMILL_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for vidmill daemons:
/// - Always include `job_id` and `node_id` when available.
/// - Include `table_id` on any metadata or item-file event.
/// - Include `io_item_index` on any per-work-unit event.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("VIDMILL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
