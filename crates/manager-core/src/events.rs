use std::path::PathBuf;

use wire_proto::{ManagerToWorker, WorkerToManager};

use crate::worker::WorkerId;

/// Commands the `ManagerRuntime` sends down a worker's per-connection
/// task. Most are a single wire line (`Send`); `RetrieveOutputs` hands the
/// connection task a short bidirectional exchange (`get` + the recursive
/// receive grammar) to run on its own socket, since the runtime itself
/// never touches a worker's `TcpStream` directly (§5 "Scheduling model").
#[derive(Debug)]
pub enum ConnectionCommand {
    Send(ManagerToWorker),
    /// A line whose declared length (`cmd N`, `env N`) is immediately
    /// followed by `payload` raw bytes, e.g. the task's command text.
    SendWithPayload(ManagerToWorker, Vec<u8>),
    RetrieveOutputs { task_id: u64, cache_name: String, local_dir: PathBuf },
}

/// Internal events a per-worker `ConnectionTask` forwards to the
/// `ManagerRuntime`, mirroring the shape of
/// `client-engine::worker::WorkerInternalEvent` (stage/progress/warning
/// events sent up from a worker task to the engine runtime) generalized
/// to this manager's worker-connection split.
#[derive(Debug)]
pub enum ManagerEvent {
    /// `payload` carries the bytes that follow a length-prefixed message
    /// (`Result`'s stdout, `Update`'s chunk, `AsyncCacheInvalid`'s body).
    Message { worker_id: WorkerId, message: WorkerToManager, payload: Option<Vec<u8>> },
    OutputsRetrieved { worker_id: WorkerId, task_id: u64, bytes: u64, missing: Vec<String> },
    TransferFailed { worker_id: WorkerId, task_id: u64, reason: String },
    Disconnected { worker_id: WorkerId, reason: String },
}
