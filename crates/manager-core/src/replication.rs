use std::collections::{HashMap, VecDeque};

use crate::worker::{WorkerId, WorkerRegistry};

/// §4.I replication queue entry.
#[derive(Debug, Clone)]
pub struct ReplicationRequest {
    pub cache_name: String,
    pub target_replicas: u32,
}

#[derive(Default)]
pub struct ReplicationQueue {
    queue: VecDeque<ReplicationRequest>,
}

impl ReplicationQueue {
    pub fn enqueue(&mut self, req: ReplicationRequest) {
        self.queue.push_back(req);
    }

    pub fn requeue_low_priority(&mut self, req: ReplicationRequest) {
        self.queue.push_back(req);
    }

    pub fn pop_front(&mut self) -> Option<ReplicationRequest> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReplicationCaps {
    pub outgoing_max: u32,
    pub incoming_max: u32,
}

impl Default for ReplicationCaps {
    fn default() -> Self {
        Self { outgoing_max: 3, incoming_max: 3 }
    }
}

pub enum ReplicationDecision {
    Transfer { source: WorkerId, destination: WorkerId },
    NoSource,
    NoDestination,
}

/// §4.I steps 1-2: choose a READY source under its outgoing cap (ties
/// broken by fewest outgoing transfers — the stable tie-break chosen for
/// Open Question 3, see DESIGN.md), then a destination with the most free
/// disk that isn't already holding the artifact, under its incoming cap,
/// on a different host than the source.
pub fn plan_replication(
    registry: &WorkerRegistry,
    cache_name: &str,
    caps: ReplicationCaps,
) -> ReplicationDecision {
    let mut holders = registry.ready_holders_of(cache_name);
    holders.sort_by_key(|id| registry.get(*id).map(|w| w.outgoing_transfers).unwrap_or(u32::MAX));
    let source = holders
        .into_iter()
        .find(|id| registry.get(*id).map(|w| w.outgoing_transfers < caps.outgoing_max).unwrap_or(false));

    let Some(source) = source else {
        return ReplicationDecision::NoSource;
    };
    let source_host = registry.get(source).map(|w| w.host.clone()).unwrap_or_default();

    let mut candidates: Vec<(WorkerId, f64)> = registry
        .iter()
        .filter(|(id, w)| {
            **id != source
                && w.host != source_host
                && !w.current_files.contains_key(cache_name)
                && w.incoming_transfers < caps.incoming_max
        })
        .map(|(id, w)| (*id, w.resources.disk_mb.free()))
        .collect();
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

    match candidates.first() {
        Some((destination, _)) => ReplicationDecision::Transfer { source, destination: *destination },
        None => ReplicationDecision::NoDestination,
    }
}

/// §4.I "Redundant-replica cleanup": workers to drop replicas from when
/// the live count exceeds the target, heaviest-loaded first.
pub fn excess_replica_holders(
    registry: &WorkerRegistry,
    cache_name: &str,
    target_replicas: usize,
    in_use_by: &[WorkerId],
) -> Vec<WorkerId> {
    let mut holders: Vec<WorkerId> = registry
        .ready_holders_of(cache_name)
        .into_iter()
        .filter(|id| !in_use_by.contains(id))
        .collect();
    if holders.len() <= target_replicas {
        return Vec::new();
    }
    holders.sort_by(|a, b| {
        let load_a = registry.get(*a).map(load_fraction).unwrap_or(0.0);
        let load_b = registry.get(*b).map(load_fraction).unwrap_or(0.0);
        load_b.total_cmp(&load_a)
    });
    let excess = holders.len() - target_replicas;
    holders.into_iter().take(excess).collect()
}

/// §4.I "Disk-load shifting": among a temp artifact's READY holders, find
/// one more heavily disk-loaded than some peer that could accept a copy
/// without ending up heavier than the source will be after giving it up.
/// Returns the first such `(source, destination)` pair found; the old
/// replica is reclaimed afterward by the redundancy sweep once the new
/// one lands.
pub fn plan_disk_load_shift(
    registry: &WorkerRegistry,
    cache_name: &str,
    size_bytes: u64,
    caps: ReplicationCaps,
) -> Option<(WorkerId, WorkerId)> {
    let size_mb = size_bytes as f64 / (1024.0 * 1024.0);
    for source in registry.ready_holders_of(cache_name) {
        let Some(source_worker) = registry.get(source) else { continue };
        if source_worker.outgoing_transfers >= caps.outgoing_max {
            continue;
        }
        let source_host = source_worker.host.clone();
        let source_disk_after = disk_fraction(
            source_worker.resources.disk_mb.total,
            source_worker.resources.disk_mb.inuse - size_mb,
        );

        let mut candidates: Vec<(WorkerId, f64)> = registry
            .iter()
            .filter(|(id, w)| {
                **id != source
                    && w.host != source_host
                    && !w.current_files.contains_key(cache_name)
                    && w.incoming_transfers < caps.incoming_max
            })
            .filter_map(|(id, w)| {
                let disk_after = w.resources.disk_mb.inuse + size_mb;
                if disk_after > w.resources.disk_mb.total {
                    return None;
                }
                let load_after = disk_fraction(w.resources.disk_mb.total, disk_after);
                (load_after < source_disk_after).then_some((*id, load_after))
            })
            .collect();
        candidates.sort_by(|a, b| a.1.total_cmp(&b.1));

        if let Some((destination, _)) = candidates.first() {
            return Some((source, *destination));
        }
    }
    None
}

fn disk_fraction(total: f64, inuse: f64) -> f64 {
    if total > 0.0 {
        (inuse / total).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn load_fraction(w: &crate::worker::WorkerInfo) -> f64 {
    let cores = if w.resources.cores.total > 0.0 {
        w.resources.cores.inuse / w.resources.cores.total
    } else {
        0.0
    };
    let disk = if w.resources.disk_mb.total > 0.0 {
        w.resources.disk_mb.inuse / w.resources.disk_mb.total
    } else {
        0.0
    };
    (cores + disk) / 2.0
}

/// §4.I checkpoint penalty: 0.5 * critical-path recovery time + 0.5 *
/// total recovery time, computed over the producer sub-DAG.
#[derive(Debug, Clone, Default)]
pub struct CheckpointArtifact {
    pub cache_name: String,
    pub size_bytes: u64,
    pub producer_exec_secs: f64,
    pub parents: Vec<String>,
}

pub fn recovery_times(
    artifacts: &HashMap<String, CheckpointArtifact>,
    name: &str,
) -> (f64, f64) {
    let Some(artifact) = artifacts.get(name) else {
        return (0.0, 0.0);
    };
    if artifact.parents.is_empty() {
        return (artifact.producer_exec_secs, artifact.producer_exec_secs);
    }
    let mut critical = 0.0_f64;
    let mut total = 0.0_f64;
    for parent in &artifact.parents {
        let (p_critical, p_total) = recovery_times(artifacts, parent);
        critical = critical.max(p_critical);
        total += p_total;
    }
    (critical + artifact.producer_exec_secs, total + artifact.producer_exec_secs)
}

pub fn penalty(artifacts: &HashMap<String, CheckpointArtifact>, name: &str) -> f64 {
    let (critical, total) = recovery_times(artifacts, name);
    0.5 * critical + 0.5 * total
}

pub fn efficiency(artifacts: &HashMap<String, CheckpointArtifact>, name: &str) -> f64 {
    let Some(artifact) = artifacts.get(name) else {
        return 0.0;
    };
    if artifact.size_bytes == 0 {
        return f64::INFINITY;
    }
    penalty(artifacts, name) / artifact.size_bytes as f64
}

/// §4.I checkpoint eviction: evict the lowest-efficiency checkpointed
/// artifacts until `needed_bytes` is freed, but only if doing so is a net
/// efficiency improvement versus keeping `candidate` instead.
pub fn plan_checkpoint_eviction(
    artifacts: &HashMap<String, CheckpointArtifact>,
    checkpointed: &[String],
    candidate: &str,
    needed_bytes: u64,
) -> Vec<String> {
    let candidate_efficiency = efficiency(artifacts, candidate);
    let mut ranked: Vec<(&String, f64, u64)> = checkpointed
        .iter()
        .map(|name| (name, efficiency(artifacts, name), artifacts.get(name).map(|a| a.size_bytes).unwrap_or(0)))
        .collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

    let mut freed = 0u64;
    let mut evict = Vec::new();
    for (name, eff, size) in ranked {
        if freed >= needed_bytes {
            break;
        }
        if eff >= candidate_efficiency {
            break; // evicting this would not improve overall efficiency
        }
        evict.push(name.clone());
        freed += size;
    }

    if freed < needed_bytes {
        Vec::new()
    } else {
        evict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_artifact_recovery_time_is_its_own_exec_time() {
        let mut artifacts = HashMap::new();
        artifacts.insert(
            "a".to_string(),
            CheckpointArtifact { cache_name: "a".into(), size_bytes: 100, producer_exec_secs: 5.0, parents: vec![] },
        );
        assert_eq!(recovery_times(&artifacts, "a"), (5.0, 5.0));
    }

    #[test]
    fn eviction_refuses_if_it_does_not_free_enough() {
        let mut artifacts = HashMap::new();
        artifacts.insert(
            "keep".to_string(),
            CheckpointArtifact { cache_name: "keep".into(), size_bytes: 10, producer_exec_secs: 100.0, parents: vec![] },
        );
        artifacts.insert(
            "candidate".to_string(),
            CheckpointArtifact { cache_name: "candidate".into(), size_bytes: 10, producer_exec_secs: 1.0, parents: vec![] },
        );
        let evict = plan_checkpoint_eviction(&artifacts, &["keep".to_string()], "candidate", 1_000_000);
        assert!(evict.is_empty());
    }

    fn worker_with_disk(id: WorkerId, host: &str, total_mb: f64, inuse_mb: f64) -> crate::worker::WorkerInfo {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        crate::worker::WorkerInfo {
            id,
            host: host.to_string(),
            os: "linux".into(),
            arch: "x86_64".into(),
            version: "1".into(),
            factory_name: None,
            declared_worker_id: None,
            kind: crate::worker::WorkerKind::Regular,
            resources: crate::worker::WorkerResources {
                disk_mb: crate::worker::ResourceCounters { total: total_mb, inuse: inuse_mb, ..Default::default() },
                ..Default::default()
            },
            features: Default::default(),
            current_files: Default::default(),
            current_tasks: Default::default(),
            transfer_port: Some(9000),
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

    #[test]
    fn excess_replica_holders_keeps_target_and_drops_heaviest_first() {
        let mut registry = WorkerRegistry::default();
        for (id, host, inuse) in [(1u64, "h1", 90.0), (2u64, "h2", 10.0), (3u64, "h3", 50.0)] {
            let w = worker_with_disk(WorkerId(id), host, 100.0, inuse);
            registry.insert(w);
            registry.record_cache_update(
                WorkerId(id),
                "art".into(),
                crate::worker::ReplicaRecord { size: 10, mtime: 0, state: crate::worker::ReplicaState::Ready },
            );
        }
        let victims = excess_replica_holders(&registry, "art", 1, &[]);
        assert_eq!(victims, vec![WorkerId(1), WorkerId(3)]);
    }

    #[test]
    fn excess_replica_holders_excludes_in_use_workers() {
        let mut registry = WorkerRegistry::default();
        for (id, host, inuse) in [(1u64, "h1", 90.0), (2u64, "h2", 10.0)] {
            let w = worker_with_disk(WorkerId(id), host, 100.0, inuse);
            registry.insert(w);
            registry.record_cache_update(
                WorkerId(id),
                "art".into(),
                crate::worker::ReplicaRecord { size: 10, mtime: 0, state: crate::worker::ReplicaState::Ready },
            );
        }
        let victims = excess_replica_holders(&registry, "art", 1, &[WorkerId(1)]);
        assert!(victims.is_empty(), "the only over-target holder is in use, so nothing should be dropped");
    }

    #[test]
    fn disk_load_shift_moves_from_heavy_to_light_peer() {
        let mut registry = WorkerRegistry::default();
        registry.insert(worker_with_disk(WorkerId(1), "heavy", 100.0, 90.0));
        registry.insert(worker_with_disk(WorkerId(2), "light", 100.0, 5.0));
        registry.record_cache_update(
            WorkerId(1),
            "art".into(),
            crate::worker::ReplicaRecord { size: 1024 * 1024, mtime: 0, state: crate::worker::ReplicaState::Ready },
        );
        let plan = plan_disk_load_shift(&registry, "art", 1024 * 1024, ReplicationCaps::default());
        assert_eq!(plan, Some((WorkerId(1), WorkerId(2))));
    }

    #[test]
    fn disk_load_shift_refuses_when_no_peer_is_lighter() {
        let mut registry = WorkerRegistry::default();
        registry.insert(worker_with_disk(WorkerId(1), "h1", 100.0, 20.0));
        registry.insert(worker_with_disk(WorkerId(2), "h2", 100.0, 50.0));
        registry.record_cache_update(
            WorkerId(1),
            "art".into(),
            crate::worker::ReplicaRecord { size: 1024 * 1024, mtime: 0, state: crate::worker::ReplicaState::Ready },
        );
        let plan = plan_disk_load_shift(&registry, "art", 1024 * 1024, ReplicationCaps::default());
        assert!(plan.is_none());
    }
}
