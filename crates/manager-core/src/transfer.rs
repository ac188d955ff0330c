use wire_proto::ManagerToWorker;

use crate::artifact::{cache_name, Artifact, Mount};
use crate::task::Task;
use crate::worker::{WorkerId, WorkerRegistry};

/// Outcome of deciding how to stage one input mount onto a destination
/// worker (§4.E "Input staging").
pub enum StagingPlan {
    /// Destination already holds a READY replica; nothing to do.
    AlreadyCached,
    /// Send a `puturl` pointing at `source`'s transfer endpoint.
    FetchFromPeer { source: WorkerId, url: String },
    /// Ship directly from the manager (local file, URL, or buffer).
    FromManager,
    /// No holder exists anywhere and the artifact isn't otherwise
    /// fetchable; the task should fail with INPUT_MISSING.
    Missing,
}

/// Per-source/destination concurrency caps (§6 configuration:
/// `worker-source-max-transfers`, `file-source-max-transfers`).
#[derive(Debug, Clone, Copy)]
pub struct TransferCaps {
    pub worker_source_max_transfers: u32,
    pub file_source_max_transfers: u32,
}

impl Default for TransferCaps {
    fn default() -> Self {
        Self { worker_source_max_transfers: 3, file_source_max_transfers: 1 }
    }
}

/// Decides how to stage one input mount of `task` onto `destination`.
/// Grounded in `original_source/taskvine/src/manager/vine_redundancy.c`'s
/// `get_valid_sources`: prefer the original non-peer source under its cap;
/// otherwise any READY peer holder under the per-worker outgoing cap, tie
/// -broken by fewest outgoing transfers (the same rule replication uses).
pub fn plan_input_staging(
    registry: &WorkerRegistry,
    destination: WorkerId,
    task: &Task,
    mount: &Mount,
    caps: TransferCaps,
) -> StagingPlan {
    let name = cache_name(&mount.artifact, mount.flags, Some(task));

    if registry
        .get(destination)
        .map(|w| w.current_files.contains_key(&name))
        .unwrap_or(false)
    {
        return StagingPlan::AlreadyCached;
    }

    match &mount.artifact {
        Artifact::LocalFile { .. } | Artifact::Url { .. } | Artifact::Buffer { .. } | Artifact::EmptyDir => {
            StagingPlan::FromManager
        }
        Artifact::MiniTask { .. } | Artifact::Temp { .. } => {
            let mut holders: Vec<WorkerId> = registry.ready_holders_of(&name);
            holders.sort_by_key(|id| registry.get(*id).map(|w| w.outgoing_transfers).unwrap_or(u32::MAX));
            let chosen = holders.into_iter().find(|id| {
                registry
                    .get(*id)
                    .map(|w| w.outgoing_transfers < caps.worker_source_max_transfers)
                    .unwrap_or(false)
            });
            match chosen {
                Some(source) => {
                    let url = peer_transfer_url(registry, source, &name);
                    match url {
                        Some(url) => StagingPlan::FetchFromPeer { source, url },
                        None => StagingPlan::Missing,
                    }
                }
                None => StagingPlan::Missing,
            }
        }
    }
}

/// §9 "Peer transfer" URL format, grounded in
/// `original_source/taskvine/src/manager/vine_redundancy.c`:
/// `"{transfer_url}/{cached_name}"`.
pub fn peer_transfer_url(registry: &WorkerRegistry, source: WorkerId, cache_name: &str) -> Option<String> {
    let worker = registry.get(source)?;
    let port = worker.transfer_port?;
    Some(format!("http://{}:{}/{}", worker.host, port, cache_name))
}

pub fn puturl_directive(url: String, cache_name: String, length: u64, flags: u32) -> ManagerToWorker {
    ManagerToWorker::PutUrl { url, cache_name, length, mode: 0o644, flags }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{ReplicaRecord, ReplicaState, WorkerInfo, WorkerKind, WorkerResources};
    use std::collections::{HashMap, HashSet};

    fn worker_with_transfer_port(id: WorkerId, port: u16) -> WorkerInfo {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        WorkerInfo {
            id,
            host: "10.0.0.1".into(),
            os: "linux".into(),
            arch: "x86_64".into(),
            version: "1".into(),
            factory_name: None,
            declared_worker_id: None,
            kind: WorkerKind::Regular,
            resources: WorkerResources::default(),
            features: HashSet::new(),
            current_files: HashMap::new(),
            current_tasks: HashSet::new(),
            transfer_port: Some(port),
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
    fn temp_artifact_with_no_holders_is_missing() {
        let mut registry = WorkerRegistry::default();
        registry.insert(worker_with_transfer_port(WorkerId(1), 9000));
        let task = Task::new_for_test(1);
        let mount = Mount {
            artifact: Artifact::Temp { cache_name: "temp-xyz".into() },
            remote_name: "out.bin".into(),
            flags: crate::artifact::ArtifactFlags { cacheable: true, ..Default::default() },
        };
        let plan = plan_input_staging(&registry, WorkerId(1), &task, &mount, TransferCaps::default());
        assert!(matches!(plan, StagingPlan::Missing));
    }

    #[test]
    fn temp_artifact_stages_from_ready_peer() {
        let mut registry = WorkerRegistry::default();
        registry.insert(worker_with_transfer_port(WorkerId(1), 9000));
        registry.insert(worker_with_transfer_port(WorkerId(2), 9001));
        registry.record_cache_update(
            WorkerId(2),
            "temp-xyz".into(),
            ReplicaRecord { size: 1024, mtime: 0, state: ReplicaState::Ready },
        );
        let task = Task::new_for_test(1);
        let mount = Mount {
            artifact: Artifact::Temp { cache_name: "temp-xyz".into() },
            remote_name: "out.bin".into(),
            flags: crate::artifact::ArtifactFlags { cacheable: true, ..Default::default() },
        };
        let plan = plan_input_staging(&registry, WorkerId(1), &task, &mount, TransferCaps::default());
        assert!(matches!(plan, StagingPlan::FetchFromPeer { source: WorkerId(2), .. }));
    }
}
