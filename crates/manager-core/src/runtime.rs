use std::collections::{HashMap, HashSet};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use wire_proto::{Connection as WireConnection, ManagerToWorker, WorkerToManager};

use crate::artifact::cache_name;
use crate::catalog::{CatalogPublisher, CatalogSummary};
use crate::category::CategoryTable;
use crate::config::ManagerConfig;
use crate::connection::run_connection;
use crate::error::ResultCode;
use crate::events::{ConnectionCommand, ManagerEvent};
use crate::log::{QueueStatsLog, TransactionLog};
use crate::replication::{
    excess_replica_holders, plan_checkpoint_eviction, plan_disk_load_shift, plan_replication, CheckpointArtifact,
    ReplicationCaps, ReplicationDecision, ReplicationQueue, ReplicationRequest,
};
use crate::scheduler::{compute_resource_box, is_worker_compatible, pick_worker};
use crate::task::{AllocationLabel, ReadyQueue, ResourceBox, Task, TaskState};
use crate::transfer::{plan_input_staging, puturl_directive, StagingPlan, TransferCaps};
use crate::worker::{
    next_worker_id, ReplicaRecord, ReplicaState, WorkerId, WorkerInfo, WorkerKind, WorkerRegistry, WorkerResources,
};

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// A point-in-time view of queue state, analogous to
/// `client-engine::api::StatusSnapshot`, published over a `watch` channel
/// so HTTP-introspection callers never block the runtime.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatusSnapshot {
    pub workers_connected: usize,
    pub tasks_ready: usize,
    pub tasks_running: usize,
    pub tasks_waiting_retrieval: usize,
    pub tasks_done: usize,
}

struct PendingConnection {
    cmd_tx: mpsc::Sender<ConnectionCommand>,
}

/// Per `(task_id, remote_name)` progress of a watched output (§4.F "Watch
/// protocol"). `Downgraded` means a shrinking update was seen and further
/// `update` lines for this file are ignored, matching the spec's "shrinking
/// size downgrades the file to no-longer-watched without failing".
enum WatchState {
    Tracking(u64),
    Downgraded,
}

/// Owns every piece of mutable core state. Single-owner, not
/// single-threaded: per-connection tasks never touch these tables
/// directly (§5, §9 "Global mutable state").
pub struct ManagerRuntime {
    config: ManagerConfig,
    registry: WorkerRegistry,
    connections: HashMap<WorkerId, PendingConnection>,
    tasks: HashMap<u64, Task>,
    ready: ReadyQueue,
    categories: CategoryTable,
    replication_queue: ReplicationQueue,
    next_task_id: u64,
    events_tx: mpsc::UnboundedSender<ManagerEvent>,
    events_rx: mpsc::UnboundedReceiver<ManagerEvent>,
    connection_tasks: JoinSet<()>,
    txn_log: Option<Arc<TransactionLog>>,
    queue_stats_log: Option<Arc<QueueStatsLog>>,
    catalog: Arc<dyn CatalogPublisher>,
    stop_requested: Arc<AtomicBool>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    output_root: PathBuf,
    watch_progress: HashMap<(u64, String), WatchState>,
    /// cache-name -> id of the task whose declared output produced it
    /// (§4.I recovery: which task to reschedule when every replica is lost).
    artifact_producers: HashMap<String, u64>,
    checkpoint_artifacts: HashMap<String, CheckpointArtifact>,
    checkpointed: HashSet<String>,
}

impl ManagerRuntime {
    pub async fn new(config: ManagerConfig, catalog: Arc<dyn CatalogPublisher>) -> std::io::Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _snapshot_rx) = watch::channel(StatusSnapshot::default());
        let txn_log = match &config.txn_log_path {
            Some(path) => Some(Arc::new(TransactionLog::open(path).await?)),
            None => None,
        };
        let queue_stats_log = match &config.queue_stats_log_path {
            Some(path) => Some(Arc::new(QueueStatsLog::open(path).await?)),
            None => None,
        };
        Ok(Self {
            config,
            registry: WorkerRegistry::default(),
            connections: HashMap::new(),
            tasks: HashMap::new(),
            ready: ReadyQueue::default(),
            categories: CategoryTable::default(),
            replication_queue: ReplicationQueue::default(),
            next_task_id: 1,
            events_tx,
            events_rx,
            connection_tasks: JoinSet::new(),
            txn_log,
            queue_stats_log,
            catalog,
            stop_requested: Arc::new(AtomicBool::new(false)),
            snapshot_tx,
            output_root: std::env::temp_dir().join("manager-core-outputs"),
            watch_progress: HashMap::new(),
            artifact_producers: HashMap::new(),
            checkpoint_artifacts: HashMap::new(),
            checkpointed: HashSet::new(),
        })
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<StatusSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// A cloned handle a caller can hold onto after `run()` has taken
    /// ownership of the runtime, so an external signal (ctrl-c) can still
    /// request a graceful drain.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop_requested.clone()
    }

    /// Submits a task, assigning it a fresh monotonic id and enqueuing it
    /// READY (§3 "Submission").
    pub fn submit(&mut self, mut task: Task) -> u64 {
        let id = self.next_task_id;
        self.next_task_id += 1;
        task.id = id;
        task.state = TaskState::Ready;
        task.timings.submitted_at = Some(now_unix());
        {
            let cat = self.categories.get_or_create(&task.category);
            cat.tasks_submitted += 1;
            cat.tasks_waiting += 1;
        }
        for mount in &task.outputs {
            let name = cache_name(&mount.artifact, mount.flags, Some(&task));
            self.artifact_producers.insert(name, id);
        }
        self.ready.push_back(id, task.priority);
        self.tasks.insert(id, task);
        self.log_task(id, "READY", None);
        id
    }

    /// Marks a worker as draining (§4.J step 9): it keeps running whatever
    /// it already has, is skipped by the scheduler (`is_worker_compatible`
    /// already checks `draining`), and is shut down once idle.
    pub fn drain_worker(&mut self, worker_id: WorkerId) {
        if let Some(w) = self.registry.get_mut(worker_id) {
            w.draining = true;
        }
    }

    /// Removes a task from any state (§4.J "Cancellation").
    pub fn cancel(&mut self, task_id: u64) {
        let Some(task) = self.tasks.get_mut(&task_id) else { return };
        if task.state == TaskState::Running {
            if let Some(worker_id) = task.assigned_worker {
                if let Some(worker) = self.registry.get_mut(worker_id) {
                    worker.current_tasks.remove(&task_id);
                }
                self.send_to(worker_id, ConnectionCommand::Send(ManagerToWorker::Kill { task_id }));
            }
        }
        task.state = TaskState::Canceled;
        self.log_task(task_id, "CANCELED", None);
    }

    /// Removes and returns a DONE/CANCELED task for the caller to reap.
    pub fn reap(&mut self, task_id: u64) -> Option<Task> {
        let is_terminal = self.tasks.get(&task_id).map(|t| t.is_terminal()).unwrap_or(false);
        if !is_terminal {
            return None;
        }
        let mut task = self.tasks.remove(&task_id)?;
        if task.state != TaskState::Canceled {
            task.state = TaskState::Done;
        }
        Some(task)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let mut s = StatusSnapshot { workers_connected: self.registry.len(), ..Default::default() };
        for task in self.tasks.values() {
            match task.state {
                TaskState::Ready => s.tasks_ready += 1,
                TaskState::Running => s.tasks_running += 1,
                TaskState::WaitingRetrieval => s.tasks_waiting_retrieval += 1,
                TaskState::Retrieved | TaskState::Done | TaskState::Canceled => s.tasks_done += 1,
            }
        }
        s
    }

    /// The main event loop (§4.J), restructured for the per-connection
    /// -task architecture described in §9: accept, drain the inbound
    /// event channel, and run the periodic sweeps (dispatch, keepalive,
    /// expiry, fast-abort, replication, catalog) on a fixed tick.
    pub async fn run(mut self, listener: TcpListener) {
        let mut tick = tokio::time::interval(Duration::from_millis(250));
        let mut catalog_tick = tokio::time::interval(self.config.catalog_update_interval);

        loop {
            if self.stop_requested.load(Ordering::SeqCst) && self.registry.is_empty() && self.ready.is_empty() {
                break;
            }

            tokio::select! {
                accepted = listener.accept() => {
                    if let Ok((stream, _addr)) = accepted {
                        self.spawn_connection(stream);
                    }
                }
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                }
                _ = tick.tick() => {
                    self.on_tick();
                }
                _ = catalog_tick.tick() => {
                    self.publish_catalog().await;
                }
                Some(_) = self.connection_tasks.join_next(), if !self.connection_tasks.is_empty() => {}
            }

            let snap = self.snapshot();
            let _ = self.snapshot_tx.send(snap);
        }
    }

    fn spawn_connection(&mut self, stream: tokio::net::TcpStream) {
        let worker_id = next_worker_id();
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        self.connections.insert(worker_id, PendingConnection { cmd_tx });
        let conn = WireConnection::from_stream(stream);
        let events_tx = self.events_tx.clone();
        self.connection_tasks
            .spawn(run_connection(worker_id, conn, events_tx, cmd_rx, self.config.keepalive_timeout));
    }

    fn send_to(&self, worker_id: WorkerId, cmd: ConnectionCommand) {
        if let Some(conn) = self.connections.get(&worker_id) {
            let _ = conn.cmd_tx.try_send(cmd);
        }
    }

    async fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Message { worker_id, message, payload } => self.handle_message(worker_id, message, payload),
            ManagerEvent::Disconnected { worker_id, reason } => self.handle_disconnect(worker_id, reason),
            ManagerEvent::OutputsRetrieved { worker_id, task_id, bytes, missing } => {
                self.handle_outputs_retrieved(worker_id, task_id, bytes, missing)
            }
            ManagerEvent::TransferFailed { task_id, reason, .. } => {
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.merge_result(ResultCode::OutputTransferError);
                    tracing::warn!(task_id, %reason, "output transfer failed");
                }
            }
        }
    }

    fn handle_message(&mut self, worker_id: WorkerId, message: WorkerToManager, payload: Option<Vec<u8>>) {
        match message {
            WorkerToManager::Handshake { protocol: _, host, os, arch, version } => {
                self.admit_worker(worker_id, host, os, arch, version);
            }
            WorkerToManager::AsyncAlive => {
                if let Some(w) = self.registry.get_mut(worker_id) {
                    w.last_recv_at_unix = now_unix();
                }
            }
            WorkerToManager::AsyncInfo { field, value } => {
                if let Some(w) = self.registry.get_mut(worker_id) {
                    match field.as_str() {
                        "worker-id" => w.declared_worker_id = Some(value),
                        "from-factory" => w.factory_name = Some(value),
                        _ => {}
                    }
                }
            }
            WorkerToManager::AsyncResource { name, total, smallest, largest } => {
                self.update_resource(worker_id, &name, total as f64, smallest as f64, largest as f64);
            }
            WorkerToManager::AsyncFeature { name } => {
                if let Some(w) = self.registry.get_mut(worker_id) {
                    if name == "forwarding" {
                        w.kind = WorkerKind::Forwarding;
                    }
                    w.features.insert(name);
                }
            }
            WorkerToManager::AsyncCacheUpdate { cache_name, size, transfer_usec: _ } => {
                self.registry.record_cache_update(
                    worker_id,
                    cache_name.clone(),
                    ReplicaRecord { size, mtime: now_unix(), state: ReplicaState::Ready },
                );
                self.maybe_enqueue_replication(&cache_name);
            }
            WorkerToManager::AsyncCacheInvalid { cache_name, .. } => {
                self.registry.record_cache_invalid(worker_id, &cache_name);
            }
            WorkerToManager::Result { status, exit_code, stdout_len: _, exec_usec, task_id } => {
                self.handle_task_result(worker_id, task_id, status, exit_code, exec_usec, payload);
            }
            WorkerToManager::Update { task_id, remote, offset, len } => {
                self.apply_watch_update(task_id, remote, offset, len, payload);
            }
            WorkerToManager::AvailableResults | WorkerToManager::EndBatch => {}
        }
    }

    fn admit_worker(&mut self, worker_id: WorkerId, host: String, os: String, arch: String, version: String) {
        if self.registry.is_host_blocked(&host, now_unix()) {
            self.connections.remove(&worker_id);
            return;
        }
        let Some(conn) = self.connections.get(&worker_id) else { return };
        let worker = WorkerInfo {
            id: worker_id,
            host,
            os,
            arch,
            version,
            factory_name: None,
            declared_worker_id: None,
            kind: WorkerKind::Regular,
            resources: WorkerResources::default(),
            features: Default::default(),
            current_files: Default::default(),
            current_tasks: Default::default(),
            transfer_port: Some(self.config.listen_addr.port()),
            draining: false,
            blocked_until_unix: None,
            fast_abort_strikes: 0,
            connected_at_unix: now_unix(),
            last_recv_at_unix: now_unix(),
            last_send_at_unix: now_unix(),
            bytes_sent_cumulative: 0,
            bytes_received_cumulative: 0,
            outgoing_transfers: 0,
            incoming_transfers: 0,
            cmd_tx: conn.cmd_tx.clone(),
        };
        self.registry.insert(worker);
        self.log_worker_connection(worker_id);
    }

    fn update_resource(&mut self, worker_id: WorkerId, name: &str, total: f64, smallest: f64, largest: f64) {
        let Some(w) = self.registry.get_mut(worker_id) else { return };
        let counters = match name {
            "cores" => &mut w.resources.cores,
            "memory" => &mut w.resources.memory_mb,
            "disk" => &mut w.resources.disk_mb,
            "gpus" => &mut w.resources.gpus,
            _ => return,
        };
        counters.total = total;
        counters.smallest = smallest;
        counters.largest = largest;
    }

    fn handle_disconnect(&mut self, worker_id: WorkerId, reason: String) {
        self.connections.remove(&worker_id);
        if let Some((_, task_ids)) = self.registry.remove(worker_id) {
            for task_id in task_ids {
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.state = TaskState::Ready;
                    task.assigned_worker = None;
                    self.ready.push_back(task_id, task.priority);
                }
            }
            self.log_worker_disconnection(worker_id, &reason);
        }
    }

    fn handle_task_result(
        &mut self,
        worker_id: WorkerId,
        task_id: u64,
        status: i32,
        exit_code: i32,
        exec_usec: u64,
        payload: Option<Vec<u8>>,
    ) {
        let Some(task) = self.tasks.get_mut(&task_id) else { return };
        task.timings.execute_last_usec = exec_usec;
        task.timings.execute_all_usec += exec_usec;
        task.exit_code = Some(exit_code);
        task.stdout = payload.map(|b| String::from_utf8_lossy(&b).into_owned());

        const STATUS_RESOURCE_EXHAUSTION: i32 = 1;
        const STATUS_SIGNAL: i32 = 2;

        if status == STATUS_RESOURCE_EXHAUSTION {
            task.timings.execute_exhaustion_usec += exec_usec;
            let label = {
                let cat = self.categories.get_or_create(&task.category);
                cat.next_label(task.current_allocation_label)
            };
            task.current_allocation_label = label;
            if label == AllocationLabel::Error {
                task.merge_result(ResultCode::ResourceExhaustion);
                self.finalize_task(task_id, worker_id);
            } else {
                task.state = TaskState::Ready;
                task.assigned_worker = None;
                self.ready.push_front(task_id, task.priority); // §4.F: resource-exhaustion retries go to the head
            }
            return;
        }

        if status == STATUS_SIGNAL {
            task.merge_result(ResultCode::Signal);
        } else if exit_code == 0 {
            task.merge_result(ResultCode::Success);
        } else {
            task.merge_result(ResultCode::Success); // nonzero exit is still a successful execution
        }

        task.state = TaskState::WaitingRetrieval;
        // A clean finish breaks a fast-abort streak (§4.H "in a row").
        if let Some(w) = self.registry.get_mut(worker_id) {
            w.fast_abort_strikes = 0;
        }
        self.begin_output_retrieval(worker_id, task_id);
    }

    /// §4.F "Watch protocol": appends incremental bytes to the watched
    /// output's local copy at `offset`, unless this file has already
    /// shrunk once (`Downgraded`) or this update itself is a shrink.
    fn apply_watch_update(&mut self, task_id: u64, remote: String, offset: u64, len: usize, payload: Option<Vec<u8>>) {
        let key = (task_id, remote.clone());
        let end = offset + len as u64;
        match self.watch_progress.get(&key) {
            Some(WatchState::Downgraded) => return,
            Some(WatchState::Tracking(prev_end)) if end < *prev_end => {
                self.watch_progress.insert(key, WatchState::Downgraded);
                tracing::trace!(task_id, remote, "watched output shrank; no longer watched");
                return;
            }
            _ => {}
        }
        self.watch_progress.insert(key, WatchState::Tracking(end));
        let Some(bytes) = payload else { return };
        if bytes.is_empty() {
            return;
        }
        let path = self.output_root.join(format!("task-{task_id}")).join(&remote);
        let _ = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new().create(true).write(true).open(&path)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&bytes)
        });
    }

    fn begin_output_retrieval(&mut self, worker_id: WorkerId, task_id: u64) {
        let Some(task) = self.tasks.get(&task_id) else { return };
        if task.outputs.is_empty() {
            self.finalize_task(task_id, worker_id);
            return;
        }
        let local_dir = self.output_root.join(format!("task-{task_id}"));
        // Only one `get` cycle is modeled per task; individual output
        // mounts are addressed by the recursive dir/file grammar under
        // this root, matching §4.E "Output retrieval".
        let combined_cache_name = format!("task-{task_id}-outputs");
        self.send_to(
            worker_id,
            ConnectionCommand::RetrieveOutputs { task_id, cache_name: combined_cache_name, local_dir },
        );
    }

    fn handle_outputs_retrieved(&mut self, worker_id: WorkerId, task_id: u64, bytes: u64, missing: Vec<String>) {
        let Some(task) = self.tasks.get_mut(&task_id) else { return };
        task.stats.bytes_received += bytes;
        if !missing.is_empty() {
            task.merge_result(ResultCode::OutputMissing);
        }
        task.state = TaskState::Retrieved;
        task.timings.retrieval_at = Some(now_unix());
        self.finalize_task(task_id, worker_id);
    }

    fn finalize_task(&mut self, task_id: u64, worker_id: WorkerId) {
        if let Some(worker) = self.registry.get_mut(worker_id) {
            worker.current_tasks.remove(&task_id);
        }
        self.watch_progress.retain(|(tid, _), _| *tid != task_id);
        let mut checkpoint_candidates: Vec<CheckpointArtifact> = Vec::new();
        if let Some(task) = self.tasks.get_mut(&task_id) {
            if task.state != TaskState::Ready {
                task.state = TaskState::Retrieved;
            }
            let cat = self.categories.get_or_create(&task.category);
            cat.tasks_waiting = cat.tasks_waiting.saturating_sub(1);
            if matches!(task.result, Some(ResultCode::Success) | None) {
                cat.tasks_done += 1;
            } else {
                cat.tasks_failed += 1;
            }
            let measured = task.measured_resources.unwrap_or_default();
            let exec_secs = task.timings.execute_last_usec as f64 / 1_000_000.0;
            if let Some(result) = task.result {
                self.categories.get_or_create(&task.category).observe_outcome(measured, exec_secs, result);
            }
            self.log_task(task_id, "RETRIEVED", task.result.map(|r| format!("{r:?}")).as_deref());

            // §4.I checkpointing: a cleanly produced, cacheable temp output
            // becomes a checkpoint candidate, its penalty chained off
            // whichever of its own inputs are themselves cacheable.
            if matches!(task.result, Some(ResultCode::Success)) {
                let parents: Vec<String> = task
                    .inputs
                    .iter()
                    .filter(|m| m.flags.cacheable)
                    .map(|m| cache_name(&m.artifact, m.flags, Some(task)))
                    .collect();
                for mount in task.outputs.iter().filter(|m| m.flags.cacheable) {
                    checkpoint_candidates.push(CheckpointArtifact {
                        cache_name: cache_name(&mount.artifact, mount.flags, Some(task)),
                        size_bytes: task.stats.bytes_received,
                        producer_exec_secs: exec_secs,
                        parents: parents.clone(),
                    });
                }
            }
        }
        for artifact in checkpoint_candidates {
            self.maybe_checkpoint_artifact(artifact);
        }
    }

    /// §4.I optional checkpointing: admits `artifact` if the budget has
    /// room; otherwise evicts lower-efficiency checkpointed artifacts to
    /// make room, or drops the candidate if evicting wouldn't pay off.
    fn maybe_checkpoint_artifact(&mut self, artifact: CheckpointArtifact) {
        if self.config.checkpoint_budget_bytes == 0 {
            return;
        }
        let name = artifact.cache_name.clone();
        let size = artifact.size_bytes;
        self.checkpoint_artifacts.insert(name.clone(), artifact);

        let used: u64 =
            self.checkpointed.iter().filter_map(|n| self.checkpoint_artifacts.get(n)).map(|a| a.size_bytes).sum();
        if used + size <= self.config.checkpoint_budget_bytes {
            self.checkpointed.insert(name);
            return;
        }

        let needed = used + size - self.config.checkpoint_budget_bytes;
        let checkpointed_list: Vec<String> = self.checkpointed.iter().cloned().collect();
        let evict = plan_checkpoint_eviction(&self.checkpoint_artifacts, &checkpointed_list, &name, needed);
        if evict.is_empty() {
            self.checkpoint_artifacts.remove(&name);
            return;
        }
        for victim in &evict {
            self.checkpointed.remove(victim);
            let holders = self.registry.ready_holders_of(victim);
            for holder in holders {
                self.send_to(holder, ConnectionCommand::Send(ManagerToWorker::Unlink { cache_name: victim.clone() }));
            }
            self.checkpoint_artifacts.remove(victim);
        }
        self.checkpointed.insert(name);
    }

    /// Workers currently running a task that lists `cache_name` among its
    /// cacheable inputs (§4.I redundant-replica cleanup's "not actively in
    /// use" exclusion).
    fn workers_using_artifact(&self, target_cache_name: &str) -> Vec<WorkerId> {
        self.tasks
            .values()
            .filter(|t| t.state == TaskState::Running)
            .filter(|t| {
                t.inputs
                    .iter()
                    .filter(|m| m.flags.cacheable)
                    .any(|m| cache_name(&m.artifact, m.flags, Some(t)) == target_cache_name)
            })
            .filter_map(|t| t.assigned_worker)
            .collect()
    }

    /// §4.I "Redundant-replica cleanup".
    fn run_redundant_replica_cleanup(&mut self) {
        let names: Vec<String> = self.registry.cache_names().cloned().collect();
        for name in names {
            let in_use = self.workers_using_artifact(&name);
            let victims = excess_replica_holders(&self.registry, &name, self.config.temp_replica_count as usize, &in_use);
            for worker_id in victims {
                self.send_to(worker_id, ConnectionCommand::Send(ManagerToWorker::Unlink { cache_name: name.clone() }));
                self.registry.record_cache_invalid(worker_id, &name);
            }
        }
    }

    /// §4.I "Disk-load shifting".
    fn run_disk_load_shift_sweep(&mut self) {
        let names: Vec<String> = self.registry.cache_names().cloned().collect();
        let caps = ReplicationCaps::default();
        let mut shifted = 0u32;
        for name in names {
            if shifted >= self.config.attempt_schedule_depth {
                break;
            }
            let size = self
                .registry
                .ready_holders_of(&name)
                .into_iter()
                .filter_map(|id| self.registry.get(id).and_then(|w| w.current_files.get(&name)).map(|r| r.size))
                .max()
                .unwrap_or(0);
            if size == 0 {
                continue;
            }
            let Some((source, destination)) = plan_disk_load_shift(&self.registry, &name, size, caps) else { continue };
            let Some(url) = crate::transfer::peer_transfer_url(&self.registry, source, &name) else { continue };
            self.send_to(destination, ConnectionCommand::Send(puturl_directive(url, name.clone(), 0, 0)));
            if let Some(w) = self.registry.get_mut(source) {
                w.outgoing_transfers += 1;
            }
            if let Some(w) = self.registry.get_mut(destination) {
                w.incoming_transfers += 1;
            }
            shifted += 1;
        }
    }

    /// §4.I: an artifact with no ready holders anywhere can't be replicated
    /// from; drop it, and if recovery is enabled and its producing task is
    /// known and already finished, resubmit that task to regenerate it.
    fn prune_unreachable_artifact(&mut self, cache_name: &str) {
        tracing::warn!(cache_name, "artifact has no ready holders anywhere; pruning");
        if !self.config.recovery_enabled {
            return;
        }
        let Some(producer_id) = self.artifact_producers.get(cache_name).copied() else { return };
        let (priority, category) = {
            let Some(task) = self.tasks.get_mut(&producer_id) else { return };
            if !task.is_terminal() {
                return;
            }
            task.reset_for_resubmission();
            (task.priority, task.category.clone())
        };
        self.categories.get_or_create(&category).tasks_waiting += 1;
        self.ready.push_back(producer_id, priority);
        self.log_task(producer_id, "READY", Some("RECOVERY"));
    }

    /// §4.H/§4.J "fast-abort": a running task whose wall-time has outgrown
    /// its category's average is killed and reassigned; a worker that does
    /// this twice in a row is blocked and removed.
    fn run_fast_abort_scan(&mut self) {
        let now = now_unix();
        let mut offenders: Vec<(u64, WorkerId)> = Vec::new();
        for (task_id, task) in self.tasks.iter() {
            if task.state != TaskState::Running {
                continue;
            }
            let Some(worker_id) = task.assigned_worker else { continue };
            let Some(cat) = self.categories.get(&task.category) else { continue };
            let Some(k) = cat.fast_abort_multiplier.or(self.config.fast_abort_multiplier) else { continue };
            let avg = cat.average_task_time_secs();
            if avg <= 0.0 {
                continue;
            }
            let Some(start) = task.timings.commit_start_at else { continue };
            let running_secs = (now - start) as f64;
            let limit = k * avg + cat.fast_abort_count as f64;
            if running_secs > limit {
                offenders.push((*task_id, worker_id));
            }
        }

        for (task_id, worker_id) in offenders {
            let Some(category) = self.tasks.get(&task_id).map(|t| t.category.clone()) else { continue };
            self.categories.get_or_create(&category).fast_abort_count += 1;

            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.state = TaskState::Ready;
                task.assigned_worker = None;
                self.ready.push_front(task_id, task.priority);
            }
            if let Some(worker) = self.registry.get_mut(worker_id) {
                worker.current_tasks.remove(&task_id);
            }
            self.send_to(worker_id, ConnectionCommand::Send(ManagerToWorker::Kill { task_id }));
            self.log_task(task_id, "READY", Some("FAST_ABORT"));

            let strikes = self.registry.get_mut(worker_id).map(|w| {
                w.fast_abort_strikes += 1;
                w.fast_abort_strikes
            });
            if strikes.unwrap_or(0) >= 2 {
                if let Some(host) = self.registry.get(worker_id).map(|w| w.host.clone()) {
                    self.registry.block_host(host, now + self.config.keepalive_timeout.as_secs() as i64);
                }
                self.send_to(worker_id, ConnectionCommand::Send(ManagerToWorker::Exit));
                self.handle_disconnect(worker_id, "fast-abort: repeated slow tasks".to_string());
            }
        }
    }

    /// §4.J step 9 "shut down drained idle workers".
    fn shut_down_drained_workers(&mut self) {
        let idle_drained: Vec<WorkerId> = self
            .registry
            .iter()
            .filter(|(_, w)| w.draining && w.current_tasks.is_empty())
            .map(|(id, _)| *id)
            .collect();
        for worker_id in idle_drained {
            self.send_to(worker_id, ConnectionCommand::Send(ManagerToWorker::Exit));
            self.handle_disconnect(worker_id, "drained".to_string());
        }
    }

    fn maybe_enqueue_replication(&mut self, cache_name: &str) {
        let live = self.registry.replica_count(cache_name);
        if live < self.config.temp_replica_count as usize && live > 0 {
            self.replication_queue.enqueue(ReplicationRequest {
                cache_name: cache_name.to_string(),
                target_replicas: self.config.temp_replica_count,
            });
        }
    }

    /// §4.J steps 6-11, run once per tick.
    fn on_tick(&mut self) {
        self.expire_tasks();
        self.dispatch_ready();
        self.run_keepalive_sweep();
        self.run_fast_abort_scan();
        self.run_replication_sweep();
        self.run_redundant_replica_cleanup();
        self.run_disk_load_shift_sweep();
        self.shut_down_drained_workers();
    }

    fn expire_tasks(&mut self) {
        let now = now_unix();
        let expired: Vec<u64> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.state == TaskState::Ready)
            .filter(|(_, t)| {
                t.request.end_time_unix.map(|end| end <= now).unwrap_or(false)
                    || t.try_count > t.max_retries
            })
            .map(|(id, _)| *id)
            .collect();
        for task_id in expired {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                let code = if task.try_count > task.max_retries { ResultCode::MaxRetries } else { ResultCode::TaskTimeout };
                task.merge_result(code);
                task.state = TaskState::Retrieved;
                let cat = self.categories.get_or_create(&task.category);
                cat.tasks_waiting = cat.tasks_waiting.saturating_sub(1);
                cat.tasks_failed += 1;
            }
            self.log_task(task_id, "RETRIEVED", Some("EXPIRED"));
        }
    }

    /// §4.G: commit at most one READY task per tick so the loop stays
    /// responsive, gated on `wait_for_workers`.
    fn dispatch_ready(&mut self) {
        if self.registry.len() < self.config.wait_for_workers as usize {
            return;
        }
        let Some(task_id) = self.ready.pop_front() else { return };
        let Some(task) = self.tasks.get(&task_id) else { return };

        let policy = task.scheduling_policy_override.unwrap_or(self.config.scheduling_policy);
        let now = now_unix();
        let candidates: Vec<WorkerId> = self
            .registry
            .iter()
            .filter(|(_, w)| {
                let category = self.categories.get(&task.category);
                let totals = ResourceBox {
                    cores: w.resources.cores.total,
                    memory_mb: w.resources.memory_mb.total,
                    disk_mb: w.resources.disk_mb.total,
                    gpus: w.resources.gpus.total,
                };
                let box_ = category
                    .map(|c| {
                        compute_resource_box(
                            task,
                            c,
                            totals,
                            self.config.proportional_resources,
                            self.config.proportional_whole_tasks,
                        )
                    })
                    .unwrap_or_default();
                is_worker_compatible(w, task, box_, self.config.resource_overcommit_multiplier, now)
            })
            .map(|(id, _)| *id)
            .collect();

        let priority = task.priority;
        match pick_worker(policy, &self.registry, &candidates, task) {
            Some(worker_id) => self.commit_task(task_id, worker_id),
            None => self.ready.push_back(task_id, priority), // no compatible worker yet; try again next tick
        }
    }

    fn commit_task(&mut self, task_id: u64, worker_id: WorkerId) {
        let default_box = ResourceBox::default();
        let box_ = {
            let task = match self.tasks.get(&task_id) {
                Some(t) => t,
                None => return,
            };
            let totals = self
                .registry
                .get(worker_id)
                .map(|w| ResourceBox {
                    cores: w.resources.cores.total,
                    memory_mb: w.resources.memory_mb.total,
                    disk_mb: w.resources.disk_mb.total,
                    gpus: w.resources.gpus.total,
                })
                .unwrap_or_default();
            self.categories
                .get(&task.category)
                .map(|c| {
                    compute_resource_box(
                        task,
                        c,
                        totals,
                        self.config.proportional_resources,
                        self.config.proportional_whole_tasks,
                    )
                })
                .unwrap_or(default_box)
        };

        let inputs: Vec<_> = self.tasks.get(&task_id).map(|t| t.inputs.clone()).unwrap_or_default();

        // §4.E: resolve every mount's staging plan up front, before any
        // worker directive is sent or any resource is reserved, so a
        // missing input fails the task promptly instead of leaving it
        // wedged in RUNNING with a worker that was never told to start it.
        let mut plans: Vec<(String, StagingPlan)> = Vec::with_capacity(inputs.len());
        {
            let Some(task) = self.tasks.get(&task_id) else { return };
            for mount in &inputs {
                let name = cache_name(&mount.artifact, mount.flags, Some(task));
                let plan = plan_input_staging(&self.registry, worker_id, task, mount, TransferCaps::default());
                plans.push((name, plan));
            }
        }
        if plans.iter().any(|(_, p)| matches!(p, StagingPlan::Missing)) {
            self.fail_task_input_missing(task_id);
            return;
        }

        let command_line;
        let env_lines: Vec<String>;
        {
            let Some(task) = self.tasks.get_mut(&task_id) else { return };
            task.state = TaskState::Running;
            task.assigned_worker = Some(worker_id);
            task.try_count += 1;
            task.allocated_resources = Some(box_);
            task.timings.commit_start_at = Some(now_unix());
            command_line = task.command_line.clone();
            env_lines = task.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        }

        if let Some(w) = self.registry.get_mut(worker_id) {
            w.current_tasks.insert(task_id);
            w.resources.cores.inuse += box_.cores;
            w.resources.memory_mb.inuse += box_.memory_mb;
            w.resources.disk_mb.inuse += box_.disk_mb;
            w.resources.gpus.inuse += box_.gpus;
        }

        self.send_to(worker_id, ConnectionCommand::Send(ManagerToWorker::Task { task_id }));
        for line in &env_lines {
            self.send_to(
                worker_id,
                ConnectionCommand::SendWithPayload(
                    ManagerToWorker::Env { len: line.len() },
                    line.clone().into_bytes(),
                ),
            );
        }
        self.send_to(
            worker_id,
            ConnectionCommand::SendWithPayload(
                ManagerToWorker::Cmd { len: command_line.len() },
                command_line.clone().into_bytes(),
            ),
        );
        self.send_to(worker_id, ConnectionCommand::Send(ManagerToWorker::Cores(box_.cores as u64)));
        self.send_to(worker_id, ConnectionCommand::Send(ManagerToWorker::Memory(box_.memory_mb as u64)));
        self.send_to(worker_id, ConnectionCommand::Send(ManagerToWorker::Disk(box_.disk_mb as u64)));
        self.send_to(worker_id, ConnectionCommand::Send(ManagerToWorker::Gpus(box_.gpus as u64)));

        for (mount, (name, plan)) in inputs.iter().zip(plans.into_iter()) {
            match plan {
                StagingPlan::AlreadyCached | StagingPlan::FromManager => {
                    self.send_to(
                        worker_id,
                        ConnectionCommand::Send(ManagerToWorker::InFile {
                            cache_name: name,
                            remote: mount.remote_name.clone(),
                            flags: 0,
                        }),
                    );
                }
                StagingPlan::FetchFromPeer { url, .. } => {
                    self.send_to(
                        worker_id,
                        ConnectionCommand::Send(puturl_directive(url, name, 0, 0)),
                    );
                }
                StagingPlan::Missing => unreachable!("filtered out above"),
            }
        }

        if let Some(w) = self.registry.get_mut(worker_id) {
            w.outgoing_transfers += 1;
        }

        self.log_task(task_id, "RUNNING", None);
    }

    /// §4.E: a task whose input staging plan came back `Missing` fails
    /// promptly with `INPUT_MISSING` instead of proceeding to dispatch.
    /// Retries like any other failure: back to READY if retries remain,
    /// otherwise finalized as RETRIEVED with the terminal result code.
    fn fail_task_input_missing(&mut self, task_id: u64) {
        let Some(task) = self.tasks.get_mut(&task_id) else { return };
        task.merge_result(ResultCode::InputMissing);
        task.try_count += 1;
        if task.try_count > task.max_retries {
            task.state = TaskState::Retrieved;
            let cat = self.categories.get_or_create(&task.category);
            cat.tasks_waiting = cat.tasks_waiting.saturating_sub(1);
            cat.tasks_failed += 1;
            self.log_task(task_id, "RETRIEVED", Some("INPUT_MISSING"));
        } else {
            task.state = TaskState::Ready;
            let priority = task.priority;
            self.ready.push_back(task_id, priority);
            self.log_task(task_id, "READY", Some("INPUT_MISSING"));
        }
    }

    fn run_keepalive_sweep(&mut self) {
        let now = now_unix();
        let timeout = self.config.keepalive_timeout.as_secs() as i64;
        let dead: Vec<WorkerId> = self
            .registry
            .iter()
            .filter(|(_, w)| now - w.last_recv_at_unix > timeout)
            .map(|(id, _)| *id)
            .collect();
        for worker_id in dead {
            self.handle_disconnect(worker_id, "keepalive timeout".to_string());
        }

        let interval = self.config.keepalive_interval.as_secs() as i64;
        let ids: Vec<WorkerId> = self
            .registry
            .iter()
            .filter(|(_, w)| now - w.last_send_at_unix > interval)
            .map(|(id, _)| *id)
            .collect();
        for worker_id in ids {
            self.send_to(worker_id, ConnectionCommand::Send(ManagerToWorker::Check));
            if let Some(w) = self.registry.get_mut(worker_id) {
                w.last_send_at_unix = now;
            }
        }
    }

    fn run_replication_sweep(&mut self) {
        for _ in 0..self.config.attempt_schedule_depth {
            let Some(req) = self.replication_queue.pop_front() else { break };
            let caps = ReplicationCaps::default();
            match plan_replication(&self.registry, &req.cache_name, caps) {
                ReplicationDecision::Transfer { source, destination } => {
                    if let Some(url) = crate::transfer::peer_transfer_url(&self.registry, source, &req.cache_name) {
                        self.send_to(
                            destination,
                            ConnectionCommand::Send(puturl_directive(url, req.cache_name.clone(), 0, 0)),
                        );
                        if let Some(w) = self.registry.get_mut(source) {
                            w.outgoing_transfers += 1;
                        }
                        if let Some(w) = self.registry.get_mut(destination) {
                            w.incoming_transfers += 1;
                        }
                    }
                }
                ReplicationDecision::NoSource => {
                    self.prune_unreachable_artifact(&req.cache_name);
                }
                ReplicationDecision::NoDestination => {
                    self.replication_queue.requeue_low_priority(req);
                }
            }
        }
    }

    async fn publish_catalog(&self) {
        if self.config.catalog_hosts.is_empty() {
            return;
        }
        let snap = self.snapshot();
        let summary = CatalogSummary {
            address: self.config.listen_addr.ip().to_string(),
            port: self.config.listen_addr.port(),
            ssl: false,
            project: self.config.project_name.clone(),
            owner: "manager".to_string(),
            workers: snap.workers_connected as u32,
            tasks_running: snap.tasks_running as u32,
            tasks_waiting: snap.tasks_ready as u32,
            total_cores: self.registry.iter().map(|(_, w)| w.resources.cores.total).sum(),
            committed_cores: self.registry.iter().map(|(_, w)| w.resources.cores.inuse).sum(),
            categories: self.categories.iter().map(|c| c.name.clone()).collect(),
        };
        for host in &self.config.catalog_hosts {
            if let Err(err) = self.catalog.publish(host, &summary).await {
                tracing::warn!(%host, %err, "catalog publish failed");
            }
        }
    }

    fn log_task(&self, task_id: u64, state: &str, detail: Option<&str>) {
        let Some(log) = self.txn_log.clone() else { return };
        let line = TransactionLog::task_line(task_id, state, detail);
        tokio::spawn(async move {
            let _ = log.append(chrono::Utc::now().timestamp_micros(), std::process::id(), line).await;
        });
    }

    fn log_worker_connection(&self, worker_id: WorkerId) {
        let Some(log) = self.txn_log.clone() else { return };
        let line = TransactionLog::worker_connection_line(&worker_id.to_string());
        tokio::spawn(async move {
            let _ = log.append(chrono::Utc::now().timestamp_micros(), std::process::id(), line).await;
        });
    }

    fn log_worker_disconnection(&self, worker_id: WorkerId, reason: &str) {
        let Some(log) = self.txn_log.clone() else { return };
        let line = TransactionLog::worker_disconnection_line(&worker_id.to_string(), reason);
        tokio::spawn(async move {
            let _ = log.append(chrono::Utc::now().timestamp_micros(), std::process::id(), line).await;
        });
    }
}
