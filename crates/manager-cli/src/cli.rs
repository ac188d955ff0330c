use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use manager_core::{AllocationMode, ManagerConfig, SchedulingPolicy};

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:9123".parse().expect("valid default listen address")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliSchedulingPolicy {
    Files,
    Time,
    WorstFit,
    Fcfs,
    Rand,
}

impl From<CliSchedulingPolicy> for SchedulingPolicy {
    fn from(value: CliSchedulingPolicy) -> Self {
        match value {
            CliSchedulingPolicy::Files => SchedulingPolicy::Files,
            CliSchedulingPolicy::Time => SchedulingPolicy::Time,
            CliSchedulingPolicy::WorstFit => SchedulingPolicy::WorstFit,
            CliSchedulingPolicy::Fcfs => SchedulingPolicy::Fcfs,
            CliSchedulingPolicy::Rand => SchedulingPolicy::Rand,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliAllocationMode {
    Fixed,
    Max,
    MinWaste,
    MaxThroughput,
    GreedyBucketing,
    ExhaustiveBucketing,
}

impl From<CliAllocationMode> for AllocationMode {
    fn from(value: CliAllocationMode) -> Self {
        match value {
            CliAllocationMode::Fixed => AllocationMode::Fixed,
            CliAllocationMode::Max => AllocationMode::Max,
            CliAllocationMode::MinWaste => AllocationMode::MinWaste,
            CliAllocationMode::MaxThroughput => AllocationMode::MaxThroughput,
            CliAllocationMode::GreedyBucketing => AllocationMode::GreedyBucketing,
            CliAllocationMode::ExhaustiveBucketing => AllocationMode::ExhaustiveBucketing,
        }
    }
}

/// Command-line surface for the manager binary. One flag per
/// `ManagerConfig` tunable (§6), `env` attributes so a deployment can be
/// driven entirely from the environment the way `client/src/cli.rs` does
/// for its `BBR_*` variables.
#[derive(Debug, Clone, Parser)]
#[command(name = "manager", version, about = "Distributed task-execution manager")]
pub struct Cli {
    #[arg(long, env = "MGR_LISTEN_ADDR", default_value_t = default_listen_addr())]
    pub listen_addr: SocketAddr,

    #[arg(long, env = "MGR_PROJECT_NAME", default_value = "manager")]
    pub project_name: String,

    #[arg(long, env = "MGR_KEEPALIVE_INTERVAL_SECS", default_value_t = 120)]
    pub keepalive_interval_secs: u64,

    #[arg(long, env = "MGR_KEEPALIVE_TIMEOUT_SECS", default_value_t = 30)]
    pub keepalive_timeout_secs: u64,

    #[arg(long, env = "MGR_SHORT_TIMEOUT_SECS", default_value_t = 5)]
    pub short_timeout_secs: u64,

    #[arg(long, env = "MGR_LONG_TIMEOUT_SECS", default_value_t = 60)]
    pub long_timeout_secs: u64,

    #[arg(long, env = "MGR_MIN_TRANSFER_TIMEOUT_SECS", default_value_t = 10)]
    pub min_transfer_timeout_secs: u64,

    #[arg(long, env = "MGR_FOREMAN_TRANSFER_TIMEOUT_SECS", default_value_t = 60)]
    pub foreman_transfer_timeout_secs: u64,

    #[arg(long, env = "MGR_DEFAULT_TRANSFER_RATE_BPS", default_value_t = 1_000_000.0)]
    pub default_transfer_rate_bytes_per_sec: f64,

    #[arg(long, env = "MGR_TRANSFER_OUTLIER_FACTOR", default_value_t = 10.0)]
    pub transfer_outlier_factor: f64,

    #[arg(long, env = "MGR_RESOURCE_OVERCOMMIT", default_value_t = 1.0)]
    pub resource_overcommit_multiplier: f64,

    #[arg(long, env = "MGR_HUNGRY_MINIMUM", default_value_t = 10)]
    pub hungry_minimum: u32,

    #[arg(long, env = "MGR_WAIT_FOR_WORKERS", default_value_t = 0)]
    pub wait_for_workers: u32,

    /// Fast-abort multiplier; unset disables fast-abort entirely.
    #[arg(long, env = "MGR_FAST_ABORT_MULTIPLIER")]
    pub fast_abort_multiplier: Option<f64>,

    #[arg(long, env = "MGR_PROPORTIONAL_RESOURCES", default_value_t = true)]
    pub proportional_resources: bool,

    #[arg(long, env = "MGR_PROPORTIONAL_WHOLE_TASKS", default_value_t = false)]
    pub proportional_whole_tasks: bool,

    #[arg(long, env = "MGR_CATEGORY_STEADY_N_TASKS", default_value_t = 25)]
    pub category_steady_n_tasks: u32,

    #[arg(long, env = "MGR_DEFAULT_ALLOCATION_MODE", value_enum, default_value_t = CliAllocationMode::GreedyBucketing)]
    pub default_allocation_mode: CliAllocationMode,

    #[arg(long, env = "MGR_ATTEMPT_SCHEDULE_DEPTH", default_value_t = 10)]
    pub attempt_schedule_depth: u32,

    #[arg(long, env = "MGR_TEMP_REPLICA_COUNT", default_value_t = 1)]
    pub temp_replica_count: u32,

    #[arg(long, env = "MGR_WORKER_SOURCE_MAX_TRANSFERS", default_value_t = 3)]
    pub worker_source_max_transfers: u32,

    #[arg(long, env = "MGR_FILE_SOURCE_MAX_TRANSFERS", default_value_t = 1)]
    pub file_source_max_transfers: u32,

    /// Reschedule a temp artifact's producing task when every replica is lost.
    #[arg(long, env = "MGR_RECOVERY_ENABLED", default_value_t = true)]
    pub recovery_enabled: bool,

    /// Checkpoint budget in bytes; `0` disables checkpointing.
    #[arg(long, env = "MGR_CHECKPOINT_BUDGET_BYTES", default_value_t = 0)]
    pub checkpoint_budget_bytes: u64,

    #[arg(long, env = "MGR_SCHEDULING_POLICY", value_enum, default_value_t = CliSchedulingPolicy::Fcfs)]
    pub scheduling_policy: CliSchedulingPolicy,

    /// Catalog hosts to PUT periodic summaries to (repeatable).
    #[arg(long = "catalog-host", env = "MGR_CATALOG_HOSTS", value_delimiter = ',')]
    pub catalog_hosts: Vec<String>,

    #[arg(long, env = "MGR_CATALOG_UPDATE_INTERVAL_SECS", default_value_t = 300)]
    pub catalog_update_interval_secs: u64,

    #[arg(long, env = "MGR_TXN_LOG_PATH")]
    pub txn_log_path: Option<PathBuf>,

    #[arg(long, env = "MGR_QUEUE_STATS_LOG_PATH")]
    pub queue_stats_log_path: Option<PathBuf>,

    #[arg(long, env = "MGR_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

impl Cli {
    pub fn into_manager_config(self) -> ManagerConfig {
        ManagerConfig {
            listen_addr: self.listen_addr,
            project_name: self.project_name,
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            keepalive_timeout: Duration::from_secs(self.keepalive_timeout_secs),
            short_timeout: Duration::from_secs(self.short_timeout_secs),
            long_timeout: Duration::from_secs(self.long_timeout_secs),
            min_transfer_timeout: Duration::from_secs(self.min_transfer_timeout_secs),
            foreman_transfer_timeout: Duration::from_secs(self.foreman_transfer_timeout_secs),
            default_transfer_rate_bytes_per_sec: self.default_transfer_rate_bytes_per_sec,
            transfer_outlier_factor: self.transfer_outlier_factor,
            resource_overcommit_multiplier: self.resource_overcommit_multiplier,
            hungry_minimum: self.hungry_minimum,
            wait_for_workers: self.wait_for_workers,
            fast_abort_multiplier: self.fast_abort_multiplier,
            proportional_resources: self.proportional_resources,
            proportional_whole_tasks: self.proportional_whole_tasks,
            category_steady_n_tasks: self.category_steady_n_tasks,
            default_allocation_mode: self.default_allocation_mode.into(),
            attempt_schedule_depth: self.attempt_schedule_depth,
            temp_replica_count: self.temp_replica_count,
            worker_source_max_transfers: self.worker_source_max_transfers,
            file_source_max_transfers: self.file_source_max_transfers,
            recovery_enabled: self.recovery_enabled,
            checkpoint_budget_bytes: self.checkpoint_budget_bytes,
            scheduling_policy: self.scheduling_policy.into(),
            catalog_hosts: self.catalog_hosts,
            catalog_update_interval: Duration::from_secs(self.catalog_update_interval_secs),
            txn_log_path: self.txn_log_path,
            queue_stats_log_path: self.queue_stats_log_path,
            password: self.password,
        }
    }
}
