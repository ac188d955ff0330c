use std::collections::HashMap;

use crate::error::ResultCode;
use crate::task::{AllocationLabel, ResourceBox};

/// §4.H allocation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationMode {
    Fixed,
    Max,
    MinWaste,
    MaxThroughput,
    #[default]
    GreedyBucketing,
    ExhaustiveBucketing,
}

#[derive(Debug, Clone, Default)]
struct ResourceStats {
    max_observed: f64,
    sum_observed: f64,
    samples: u64,
}

impl ResourceStats {
    fn observe(&mut self, value: f64) {
        self.max_observed = self.max_observed.max(value);
        self.sum_observed += value;
        self.samples += 1;
    }

    fn mean(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.sum_observed / self.samples as f64
        }
    }
}

/// Per-category learned resource model and fast-abort configuration
/// (§3 "Category", §4.H).
#[derive(Debug, Clone)]
pub struct Category {
    pub name: String,
    pub mode: AllocationMode,
    pub explicit_min: ResourceBox,
    pub explicit_max: Option<ResourceBox>,
    pub fast_abort_multiplier: Option<f64>,
    /// Running count of fast-aborts triggered in this category so far; the
    /// wall-time limit grows with it (§4.H), so a category that keeps
    /// tripping fast-abort loosens its own threshold instead of repeatedly
    /// killing the same slow-but-legitimate shape of task.
    pub fast_abort_count: u64,
    cores_stats: ResourceStats,
    memory_stats: ResourceStats,
    disk_stats: ResourceStats,
    gpus_stats: ResourceStats,
    task_time_stats: ResourceStats,
    pub tasks_submitted: u64,
    pub tasks_waiting: u64,
    pub tasks_on_workers: u64,
    pub tasks_done: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
}

impl Category {
    pub fn new(name: String) -> Self {
        Self {
            name,
            mode: AllocationMode::default(),
            explicit_min: ResourceBox::default(),
            explicit_max: None,
            fast_abort_multiplier: None,
            fast_abort_count: 0,
            cores_stats: ResourceStats::default(),
            memory_stats: ResourceStats::default(),
            disk_stats: ResourceStats::default(),
            gpus_stats: ResourceStats::default(),
            task_time_stats: ResourceStats::default(),
            tasks_submitted: 0,
            tasks_waiting: 0,
            tasks_on_workers: 0,
            tasks_done: 0,
            tasks_failed: 0,
            tasks_cancelled: 0,
        }
    }

    /// §4.H: only meaningful outcomes feed the learned model.
    pub fn observe_outcome(&mut self, measured: ResourceBox, exec_secs: f64, result: ResultCode) {
        let meaningful = matches!(
            result,
            ResultCode::Success
                | ResultCode::Signal
                | ResultCode::ResourceExhaustion
                | ResultCode::TaskMaxRunTime
                | ResultCode::DiskAllocFull
                | ResultCode::OutputTransferError
        );
        if !meaningful {
            return;
        }
        self.cores_stats.observe(measured.cores);
        self.memory_stats.observe(measured.memory_mb);
        self.disk_stats.observe(measured.disk_mb);
        self.gpus_stats.observe(measured.gpus);
        self.task_time_stats.observe(exec_secs);
    }

    pub fn average_task_time_secs(&self) -> f64 {
        self.task_time_stats.mean()
    }

    /// First-allocation guess, shaped by `mode` (§4.H). `Fixed` always uses
    /// the user-declared minimum and never learns; `MinWaste`/
    /// `MaxThroughput` bias toward the learned mean so more tasks pack
    /// onto a worker at once, accepting a higher exhaustion-retry chance
    /// in exchange; the rest request the learned maximum outright. The two
    /// bucketing modes are approximated with the same maximum-observed
    /// guess as `Max` — the retrieved pack carries the bucketing *flag
    /// names* (`vine_txn_log.c`'s `CATEGORY_ALLOCATION_MODE_*`) but not
    /// `category.c`'s bucket-partitioning bodies to reproduce exactly.
    pub fn first_allocation(&self) -> ResourceBox {
        match self.mode {
            AllocationMode::Fixed => self.explicit_min,
            AllocationMode::MinWaste => ResourceBox {
                cores: self.cores_stats.mean().max(self.explicit_min.cores),
                memory_mb: self.memory_stats.mean().max(self.explicit_min.memory_mb),
                disk_mb: self.disk_stats.mean().max(self.explicit_min.disk_mb),
                gpus: self.gpus_stats.max_observed.max(self.explicit_min.gpus),
            },
            AllocationMode::MaxThroughput => ResourceBox {
                cores: (self.cores_stats.mean() * 0.75).max(self.explicit_min.cores),
                memory_mb: (self.memory_stats.mean() * 0.75).max(self.explicit_min.memory_mb),
                disk_mb: (self.disk_stats.mean() * 0.75).max(self.explicit_min.disk_mb),
                gpus: self.gpus_stats.max_observed.max(self.explicit_min.gpus),
            },
            AllocationMode::Max | AllocationMode::GreedyBucketing | AllocationMode::ExhaustiveBucketing => {
                ResourceBox {
                    cores: self.cores_stats.max_observed.max(self.explicit_min.cores),
                    memory_mb: self.memory_stats.max_observed.max(self.explicit_min.memory_mb),
                    disk_mb: self.disk_stats.max_observed.max(self.explicit_min.disk_mb),
                    gpus: self.gpus_stats.max_observed.max(self.explicit_min.gpus),
                }
            }
        }
    }

    /// Max-allocation cap used after the first RESOURCE_EXHAUSTION.
    /// `Fixed` categories never grow past their own declared ceiling
    /// (or minimum, if no ceiling was declared) — a fixed category that
    /// keeps exhausting is a misconfiguration, not something to paper
    /// over by handing it the whole worker.
    pub fn max_allocation(&self, worker_totals: ResourceBox) -> ResourceBox {
        match self.mode {
            AllocationMode::Fixed => self.explicit_max.unwrap_or(self.explicit_min),
            _ => self.explicit_max.unwrap_or(worker_totals),
        }
    }

    /// §4.F escalation: FIRST -> MAX -> ERROR.
    pub fn next_label(&self, current: AllocationLabel) -> AllocationLabel {
        match current {
            AllocationLabel::First => AllocationLabel::Max,
            AllocationLabel::Max => AllocationLabel::Error,
            AllocationLabel::Error => AllocationLabel::Error,
        }
    }
}

#[derive(Default)]
pub struct CategoryTable {
    categories: HashMap<String, Category>,
}

impl CategoryTable {
    pub fn get_or_create(&mut self, name: &str) -> &mut Category {
        self.categories
            .entry(name.to_string())
            .or_insert_with(|| Category::new(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&Category> {
        self.categories.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Category> {
        self.categories.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_order_is_first_max_error() {
        let cat = Category::new("c".into());
        assert_eq!(cat.next_label(AllocationLabel::First), AllocationLabel::Max);
        assert_eq!(cat.next_label(AllocationLabel::Max), AllocationLabel::Error);
        assert_eq!(cat.next_label(AllocationLabel::Error), AllocationLabel::Error);
    }

    #[test]
    fn resource_exhaustion_observation_is_kept() {
        let mut cat = Category::new("c".into());
        cat.observe_outcome(
            ResourceBox { cores: 2.0, memory_mb: 512.0, disk_mb: 100.0, gpus: 0.0 },
            1.0,
            ResultCode::ResourceExhaustion,
        );
        assert!(cat.first_allocation().memory_mb >= 512.0);
    }

    #[test]
    fn fixed_mode_ignores_learned_stats() {
        let mut cat = Category::new("c".into());
        cat.mode = AllocationMode::Fixed;
        cat.explicit_min = ResourceBox { cores: 1.0, memory_mb: 256.0, disk_mb: 0.0, gpus: 0.0 };
        cat.observe_outcome(
            ResourceBox { cores: 8.0, memory_mb: 8192.0, disk_mb: 0.0, gpus: 0.0 },
            1.0,
            ResultCode::Success,
        );
        assert_eq!(cat.first_allocation().memory_mb, 256.0);
        let totals = ResourceBox { cores: 16.0, memory_mb: 16384.0, disk_mb: 0.0, gpus: 0.0 };
        assert_eq!(cat.max_allocation(totals).memory_mb, 256.0);
    }

    #[test]
    fn min_waste_and_max_throughput_undercut_the_observed_max() {
        let mut cat = Category::new("c".into());
        cat.observe_outcome(
            ResourceBox { cores: 2.0, memory_mb: 1000.0, disk_mb: 0.0, gpus: 0.0 },
            1.0,
            ResultCode::Success,
        );
        cat.observe_outcome(
            ResourceBox { cores: 8.0, memory_mb: 4000.0, disk_mb: 0.0, gpus: 0.0 },
            1.0,
            ResultCode::Success,
        );
        cat.mode = AllocationMode::MinWaste;
        let min_waste = cat.first_allocation().memory_mb;
        cat.mode = AllocationMode::MaxThroughput;
        let max_throughput = cat.first_allocation().memory_mb;
        assert!(min_waste < 4000.0, "min-waste should undercut the observed max");
        assert!(max_throughput < min_waste, "max-throughput packs tighter than min-waste");
    }

    #[test]
    fn stdout_missing_does_not_feed_the_model() {
        let mut cat = Category::new("c".into());
        cat.observe_outcome(
            ResourceBox { cores: 99.0, memory_mb: 99.0, disk_mb: 99.0, gpus: 99.0 },
            1.0,
            ResultCode::StdoutMissing,
        );
        assert_eq!(cat.first_allocation().cores, 0.0);
    }
}
