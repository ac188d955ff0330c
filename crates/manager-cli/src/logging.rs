use tracing_subscriber::EnvFilter;

/// Initializes `tracing` with `RUST_LOG`-driven filtering, defaulting to
/// `info` when unset. Kept as its own tiny module so `main.rs` stays a
/// single straight-line startup path, matching the teacher's habit of one
/// module per startup concern (`terminal.rs`, `shutdown.rs`).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
