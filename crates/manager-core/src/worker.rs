use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::events::ConnectionCommand;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Stable handle to a connected worker. §9 "Cyclic references" replaces
/// the source's `struct vine_worker_info *` back-pointers with this
/// index, looked up through `WorkerRegistry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

pub fn next_worker_id() -> WorkerId {
    WorkerId(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceCounters {
    pub total: f64,
    pub inuse: f64,
    pub smallest: f64,
    pub largest: f64,
}

impl ResourceCounters {
    pub fn free(&self) -> f64 {
        (self.total - self.inuse).max(0.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerResources {
    pub cores: ResourceCounters,
    pub memory_mb: ResourceCounters,
    pub disk_mb: ResourceCounters,
    pub gpus: ResourceCounters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaRecord {
    pub size: u64,
    pub mtime: i64,
    pub state: ReplicaState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Creating,
    Ready,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Regular,
    Forwarding,
}

/// §3 "Worker".
pub struct WorkerInfo {
    pub id: WorkerId,
    pub host: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub factory_name: Option<String>,
    pub declared_worker_id: Option<String>,
    pub kind: WorkerKind,
    pub resources: WorkerResources,
    pub features: HashSet<String>,
    pub current_files: HashMap<String, ReplicaRecord>,
    pub current_tasks: HashSet<u64>,
    pub transfer_port: Option<u16>,
    pub draining: bool,
    pub blocked_until_unix: Option<i64>,
    pub fast_abort_strikes: u32,
    pub connected_at_unix: i64,
    pub last_recv_at_unix: i64,
    pub last_send_at_unix: i64,
    pub bytes_sent_cumulative: u64,
    pub bytes_received_cumulative: u64,
    pub outgoing_transfers: u32,
    pub incoming_transfers: u32,
    pub cmd_tx: mpsc::Sender<ConnectionCommand>,
}

impl WorkerInfo {
    pub fn inuse_cache_bytes(&self) -> u64 {
        self.current_files.values().map(|r| r.size).sum()
    }

    pub fn is_forwarding(&self) -> bool {
        matches!(self.kind, WorkerKind::Forwarding)
    }

    pub fn is_blocked(&self, now_unix: i64) -> bool {
        self.blocked_until_unix.map(|t| t > now_unix).unwrap_or(false)
    }
}

/// Index of connected workers plus the derived cache-name -> holders map
/// (§4.D). Kept in lockstep: every insert/remove into a worker's
/// `current_files` is mirrored here.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, WorkerInfo>,
    cache_index: HashMap<String, HashSet<WorkerId>>,
    blocked_hosts: HashMap<String, i64>,
}

impl WorkerRegistry {
    pub fn insert(&mut self, worker: WorkerInfo) {
        self.workers.insert(worker.id, worker);
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerInfo> {
        self.workers.get(&id)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut WorkerInfo> {
        self.workers.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&WorkerId, &WorkerInfo)> {
        self.workers.iter()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Removes a worker, returning the set of task-ids that were running
    /// on it so the caller can re-queue them to READY (§4.B removal
    /// policy). Also tears down the worker's entries from the cache index.
    pub fn remove(&mut self, id: WorkerId) -> Option<(WorkerInfo, HashSet<u64>)> {
        let worker = self.workers.remove(&id)?;
        for cache_name in worker.current_files.keys() {
            if let Some(holders) = self.cache_index.get_mut(cache_name) {
                holders.remove(&id);
                if holders.is_empty() {
                    self.cache_index.remove(cache_name);
                }
            }
        }
        let tasks = worker.current_tasks.clone();
        Some((worker, tasks))
    }

    pub fn record_cache_update(&mut self, worker_id: WorkerId, cache_name: String, replica: ReplicaRecord) {
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.current_files.insert(cache_name.clone(), replica);
        }
        self.cache_index.entry(cache_name).or_default().insert(worker_id);
    }

    pub fn record_cache_invalid(&mut self, worker_id: WorkerId, cache_name: &str) {
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.current_files.remove(cache_name);
        }
        if let Some(holders) = self.cache_index.get_mut(cache_name) {
            holders.remove(&worker_id);
            if holders.is_empty() {
                self.cache_index.remove(cache_name);
            }
        }
    }

    pub fn holders_of(&self, cache_name: &str) -> impl Iterator<Item = WorkerId> + '_ {
        self.cache_index.get(cache_name).into_iter().flatten().copied()
    }

    pub fn ready_holders_of(&self, cache_name: &str) -> Vec<WorkerId> {
        self.holders_of(cache_name)
            .filter(|id| {
                self.workers
                    .get(id)
                    .and_then(|w| w.current_files.get(cache_name))
                    .map(|r| r.state == ReplicaState::Ready)
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn replica_count(&self, cache_name: &str) -> usize {
        self.cache_index.get(cache_name).map(|s| s.len()).unwrap_or(0)
    }

    /// Every cache-name currently held by at least one worker, for sweeps
    /// that walk the whole cache rather than one request at a time
    /// (redundant-replica cleanup, disk-load shifting).
    pub fn cache_names(&self) -> impl Iterator<Item = &String> {
        self.cache_index.keys()
    }

    pub fn block_host(&mut self, host: String, until_unix: i64) {
        self.blocked_hosts.insert(host, until_unix);
    }

    pub fn is_host_blocked(&self, host: &str, now_unix: i64) -> bool {
        self.blocked_hosts.get(host).map(|t| *t > now_unix).unwrap_or(false)
    }

    /// §5 "the largest-worker cache is recomputed" — exposed for the
    /// FILES/WORST-FIT scheduler policies and replication destination
    /// selection, which both want the single most-free-disk worker.
    pub fn worker_with_most_free_disk(&self) -> Option<WorkerId> {
        self.workers
            .values()
            .max_by(|a, b| a.resources.disk_mb.free().total_cmp(&b.resources.disk_mb.free()))
            .map(|w| w.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_worker(id: WorkerId) -> WorkerInfo {
        let (tx, _rx) = mpsc::channel(1);
        WorkerInfo {
            id,
            host: "h".into(),
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
    fn cache_index_mirrors_worker_current_files() {
        let mut reg = WorkerRegistry::default();
        let id = WorkerId(1);
        reg.insert(test_worker(id));
        reg.record_cache_update(
            id,
            "abc".into(),
            ReplicaRecord { size: 10, mtime: 0, state: ReplicaState::Ready },
        );
        assert_eq!(reg.replica_count("abc"), 1);
        assert_eq!(reg.get(id).unwrap().current_files.len(), 1);

        reg.record_cache_invalid(id, "abc");
        assert_eq!(reg.replica_count("abc"), 0);
        assert!(reg.get(id).unwrap().current_files.is_empty());
    }

    #[test]
    fn removing_worker_clears_cache_index_entries() {
        let mut reg = WorkerRegistry::default();
        let id = WorkerId(1);
        reg.insert(test_worker(id));
        reg.record_cache_update(
            id,
            "abc".into(),
            ReplicaRecord { size: 10, mtime: 0, state: ReplicaState::Ready },
        );
        let (_, tasks) = reg.remove(id).unwrap();
        assert!(tasks.is_empty());
        assert_eq!(reg.replica_count("abc"), 0);
    }
}
