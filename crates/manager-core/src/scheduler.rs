use crate::category::Category;
use crate::task::{AllocationLabel, ResourceBox, Task};
use crate::worker::{WorkerId, WorkerInfo, WorkerRegistry};

/// §4.G scheduling policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingPolicy {
    Files,
    Time,
    WorstFit,
    #[default]
    Fcfs,
    Rand,
}

/// §4.G "check_worker_against_task" compatibility rules, grounded in
/// `original_source/taskvine/src/manager/vine_schedule.c`.
pub fn is_worker_compatible(
    worker: &WorkerInfo,
    task: &Task,
    box_: ResourceBox,
    overcommit_multiplier: f64,
    now_unix: i64,
) -> bool {
    if worker.resources.cores.total == 0.0 && worker.resources.memory_mb.total == 0.0 {
        return false; // resources never declared
    }
    if worker.draining {
        return false;
    }
    if worker.is_blocked(now_unix) {
        return false;
    }
    if let Some(min_running) = task.request.min_running_time_secs {
        if let Some(end) = task.request.end_time_unix {
            if end - now_unix < min_running as i64 {
                return false;
            }
        }
    }
    if !task.required_features.iter().all(|f| worker.features.contains(f)) {
        return false;
    }

    let cores_ok = worker.resources.cores.inuse + box_.cores <= worker.resources.cores.total * overcommit_multiplier;
    let mem_ok =
        worker.resources.memory_mb.inuse + box_.memory_mb <= worker.resources.memory_mb.total * overcommit_multiplier;
    let gpus_ok = worker.resources.gpus.inuse + box_.gpus <= worker.resources.gpus.total * overcommit_multiplier;
    // Disk is never overcommitted (§4.G).
    let disk_ok = worker.resources.disk_mb.inuse + box_.disk_mb <= worker.resources.disk_mb.total;

    cores_ok && mem_ok && gpus_ok && disk_ok
}

/// §4.G resource-box computation, resolving Open Question 1 (see
/// DESIGN.md): proportional scaling happens first, then an explicit
/// per-dimension minimum clamp is applied afterward and always wins.
pub fn compute_resource_box(
    task: &Task,
    category: &Category,
    worker_totals: ResourceBox,
    proportional: bool,
    proportional_whole_tasks: bool,
) -> ResourceBox {
    let first = category.first_allocation();

    let mut box_ = ResourceBox {
        cores: task.request.cores.unwrap_or(first.cores),
        memory_mb: task.request.memory_mb.unwrap_or(first.memory_mb),
        disk_mb: task.request.disk_mb.unwrap_or(first.disk_mb),
        gpus: task.request.gpus.unwrap_or(first.gpus),
    };

    let any_explicit = task.request.cores.is_some()
        || task.request.memory_mb.is_some()
        || task.request.disk_mb.is_some()
        || task.request.gpus.is_some();

    if proportional && any_explicit {
        let ratios = [
            ratio(box_.cores, worker_totals.cores),
            ratio(box_.memory_mb, worker_totals.memory_mb),
            ratio(box_.disk_mb, worker_totals.disk_mb),
        ];
        let mut dominant = ratios.into_iter().fold(0.0_f64, f64::max);
        if proportional_whole_tasks && dominant > 0.0 {
            let tasks_that_fit = (1.0 / dominant).floor().max(1.0);
            dominant = 1.0 / tasks_that_fit;
        }
        if dominant > 0.0 {
            if task.request.cores.is_none() {
                box_.cores = worker_totals.cores * dominant;
            }
            if task.request.memory_mb.is_none() {
                box_.memory_mb = worker_totals.memory_mb * dominant;
            }
            if task.request.disk_mb.is_none() {
                box_.disk_mb = worker_totals.disk_mb * dominant;
            }
        }
    } else if !any_explicit {
        box_ = worker_totals;
        box_.gpus = 0.0;
    }

    // Floor clamp always wins, even over a whole-tasks rounded proportion
    // (DESIGN.md Open Question 1).
    box_.cores = box_.cores.max(category.explicit_min.cores);
    box_.memory_mb = box_.memory_mb.max(category.explicit_min.memory_mb);
    box_.disk_mb = box_.disk_mb.max(category.explicit_min.disk_mb);
    box_.gpus = box_.gpus.max(category.explicit_min.gpus);

    // §4.H: once the category has escalated past FIRST, the box must grow
    // to at least MAX on every dimension — otherwise a task pinned to an
    // explicit (too-small) request would be handed the exact box that
    // just triggered RESOURCE_EXHAUSTION, over and over.
    if task.current_allocation_label != AllocationLabel::First {
        let ceiling = category.max_allocation(worker_totals);
        box_.cores = box_.cores.max(ceiling.cores);
        box_.memory_mb = box_.memory_mb.max(ceiling.memory_mb);
        box_.disk_mb = box_.disk_mb.max(ceiling.disk_mb);
        box_.gpus = box_.gpus.max(ceiling.gpus);
    }

    box_
}

fn ratio(requested: f64, total: f64) -> f64 {
    if total <= 0.0 {
        0.0
    } else {
        (requested / total).clamp(0.0, 1.0)
    }
}

/// §4.G policy dispatch. `candidates` must already be compatibility
/// filtered.
pub fn pick_worker(
    policy: SchedulingPolicy,
    registry: &WorkerRegistry,
    candidates: &[WorkerId],
    task: &Task,
) -> Option<WorkerId> {
    match policy {
        SchedulingPolicy::Fcfs => candidates.first().copied(),
        SchedulingPolicy::Rand => {
            if candidates.is_empty() {
                None
            } else {
                use rand::Rng;
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                Some(candidates[idx])
            }
        }
        SchedulingPolicy::Files => candidates
            .iter()
            .max_by_key(|id| {
                let worker = registry.get(**id)?;
                Some(
                    task.inputs
                        .iter()
                        .filter(|m| m.flags.cacheable)
                        .filter(|m| {
                            let name = crate::artifact::cache_name(&m.artifact, m.flags, Some(task));
                            worker.current_files.contains_key(&name)
                        })
                        .count(),
                )
            })
            .copied(),
        SchedulingPolicy::WorstFit => candidates
            .iter()
            .max_by(|a, b| {
                let wa = registry.get(**a).unwrap();
                let wb = registry.get(**b).unwrap();
                worst_fit_key(wa).partial_cmp(&worst_fit_key(wb)).unwrap()
            })
            .copied(),
        SchedulingPolicy::Time => candidates.first().copied(), // FCFS fallback when no history is wired in here
    }
}

/// Worst-fit tie-break order: cores, then memory, then disk, then gpus
/// (grounded in `vine_schedule.c`'s `compare_worst_fit`).
fn worst_fit_key(worker: &WorkerInfo) -> (f64, f64, f64, f64) {
    (
        worker.resources.cores.free(),
        worker.resources.memory_mb.free(),
        worker.resources.disk_mb.free(),
        worker.resources.gpus.free(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::Category;
    use crate::task::Task;

    #[test]
    fn resource_box_defaults_to_whole_worker_when_unspecified() {
        let task = Task::new_for_test(1);
        let cat = Category::new("default".into());
        let totals = ResourceBox { cores: 4.0, memory_mb: 8192.0, disk_mb: 100_000.0, gpus: 2.0 };
        let box_ = compute_resource_box(&task, &cat, totals, false, false);
        assert_eq!(box_.cores, 4.0);
        assert_eq!(box_.memory_mb, 8192.0);
        assert_eq!(box_.gpus, 0.0);
    }

    #[test]
    fn explicit_minimum_wins_over_proportional_share() {
        let mut task = Task::new_for_test(1);
        task.request.cores = Some(1.0);
        let mut cat = Category::new("c".into());
        cat.explicit_min.memory_mb = 4096.0;
        let totals = ResourceBox { cores: 4.0, memory_mb: 8192.0, disk_mb: 100_000.0, gpus: 0.0 };
        let box_ = compute_resource_box(&task, &cat, totals, true, true);
        assert!(box_.memory_mb >= 4096.0);
    }

    #[test]
    fn escalated_label_grows_the_box_past_an_explicit_request() {
        let mut task = Task::new_for_test(1);
        task.request.memory_mb = Some(1024.0);
        task.current_allocation_label = crate::task::AllocationLabel::Max;
        let cat = Category::new("c".into());
        let totals = ResourceBox { cores: 4.0, memory_mb: 8192.0, disk_mb: 100_000.0, gpus: 0.0 };
        let box_ = compute_resource_box(&task, &cat, totals, true, true);
        assert!(box_.memory_mb > 1024.0, "box should grow past the pinned request once escalated past FIRST");
    }

    #[test]
    fn worst_fit_tie_breaks_cores_then_memory() {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let mut registry = WorkerRegistry::default();
        let mut w1 = make_worker(WorkerId(1), tx.clone());
        w1.resources.cores.total = 8.0;
        w1.resources.cores.inuse = 0.0;
        let mut w2 = make_worker(WorkerId(2), tx);
        w2.resources.cores.total = 8.0;
        w2.resources.cores.inuse = 4.0;
        registry.insert(w1);
        registry.insert(w2);
        let task = Task::new_for_test(1);
        let winner = pick_worker(SchedulingPolicy::WorstFit, &registry, &[WorkerId(1), WorkerId(2)], &task);
        assert_eq!(winner, Some(WorkerId(1)));
    }

    fn make_worker(id: WorkerId, tx: tokio::sync::mpsc::Sender<crate::events::ConnectionCommand>) -> WorkerInfo {
        WorkerInfo {
            id,
            host: "h".into(),
            os: "linux".into(),
            arch: "x86_64".into(),
            version: "1".into(),
            factory_name: None,
            declared_worker_id: None,
            kind: crate::worker::WorkerKind::Regular,
            resources: crate::worker::WorkerResources::default(),
            features: Default::default(),
            current_files: Default::default(),
            current_tasks: Default::default(),
            transfer_port: None,
            draining: false,
            blocked_until_unix: None,
            fast_abort_strikes: 0,
            connected_at_unix: 0,
            last_recv_at_unix: 0,
            last_send_at_unix: 0,
            bytes_sent_cumulative: 0,
            bytes_received_cumulative: 0,
            outgoing_transfers: 0,
            incoming_transfers: 0,
            cmd_tx: tx,
        }
    }
}
