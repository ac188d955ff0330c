use std::time::Duration;

use crate::category::AllocationMode;
use crate::scheduler::SchedulingPolicy;

/// Runtime tunables (§6 "Configuration"). Built by `manager-cli`'s clap
/// parser and handed in whole; this crate never reads CLI flags or
/// environment variables itself, matching the split between
/// `client/src/cli.rs` (parses) and `client-engine::EngineConfig`
/// (consumes) in the teacher.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub listen_addr: std::net::SocketAddr,
    pub project_name: String,

    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub short_timeout: Duration,
    pub long_timeout: Duration,
    pub min_transfer_timeout: Duration,
    pub foreman_transfer_timeout: Duration,
    pub default_transfer_rate_bytes_per_sec: f64,
    pub transfer_outlier_factor: f64,

    pub resource_overcommit_multiplier: f64,
    pub hungry_minimum: u32,
    pub wait_for_workers: u32,
    pub fast_abort_multiplier: Option<f64>,

    pub proportional_resources: bool,
    pub proportional_whole_tasks: bool,
    pub category_steady_n_tasks: u32,
    pub default_allocation_mode: AllocationMode,

    pub attempt_schedule_depth: u32,
    pub temp_replica_count: u32,
    pub worker_source_max_transfers: u32,
    pub file_source_max_transfers: u32,
    /// §4.I: reschedule a temp artifact's producing task when every replica
    /// of it is lost and none can be reconstructed by replication alone.
    pub recovery_enabled: bool,
    /// §4.I optional checkpointing budget, in bytes; `0` disables it.
    pub checkpoint_budget_bytes: u64,

    pub scheduling_policy: SchedulingPolicy,
    pub catalog_hosts: Vec<String>,
    pub catalog_update_interval: Duration,
    pub txn_log_path: Option<std::path::PathBuf>,
    pub queue_stats_log_path: Option<std::path::PathBuf>,
    pub password: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9123".parse().expect("valid default listen address"),
            project_name: "manager".to_string(),
            keepalive_interval: Duration::from_secs(120),
            keepalive_timeout: Duration::from_secs(30),
            short_timeout: Duration::from_secs(5),
            long_timeout: Duration::from_secs(60),
            min_transfer_timeout: Duration::from_secs(10),
            foreman_transfer_timeout: Duration::from_secs(60),
            default_transfer_rate_bytes_per_sec: 1_000_000.0,
            transfer_outlier_factor: 10.0,
            resource_overcommit_multiplier: 1.0,
            hungry_minimum: 10,
            wait_for_workers: 0,
            fast_abort_multiplier: None,
            proportional_resources: true,
            proportional_whole_tasks: false,
            category_steady_n_tasks: 25,
            default_allocation_mode: AllocationMode::default(),
            attempt_schedule_depth: 10,
            temp_replica_count: 1,
            worker_source_max_transfers: 3,
            file_source_max_transfers: 1,
            recovery_enabled: true,
            checkpoint_budget_bytes: 0,
            scheduling_policy: SchedulingPolicy::default(),
            catalog_hosts: Vec::new(),
            catalog_update_interval: Duration::from_secs(300),
            txn_log_path: None,
            queue_stats_log_path: None,
            password: None,
        }
    }
}
