use std::time::Duration;

use tokio::sync::mpsc;

use wire_proto::{receive_tree, Connection as WireConnection, ManagerToWorker, WorkerToManager};

use crate::events::{ConnectionCommand, ManagerEvent};
use crate::worker::WorkerId;

/// Per-worker connection task. Owns the socket exclusively; holds no core
/// manager state. Decodes inbound lines and forwards them as
/// `ManagerEvent`s, and executes outbound `ConnectionCommand`s it
/// receives on `cmd_rx`. This is the Rust realization of §9's "task per
/// worker over a shared channel" design note, mirrored on
/// `client-engine::worker::run_worker_task`'s channel-receive loop.
pub async fn run_connection(
    worker_id: WorkerId,
    mut conn: WireConnection,
    events_tx: mpsc::UnboundedSender<ManagerEvent>,
    mut cmd_rx: mpsc::Receiver<ConnectionCommand>,
    recv_timeout: Duration,
) {
    loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ConnectionCommand::Send(msg)) => {
                        if let Err(err) = conn.send_line(&msg).await {
                            let _ = events_tx.send(ManagerEvent::Disconnected { worker_id, reason: err.to_string() });
                            return;
                        }
                    }
                    Some(ConnectionCommand::SendWithPayload(msg, payload)) => {
                        let sent = conn.send_line(&msg).await.and(conn.send_payload(&payload).await);
                        if let Err(err) = sent {
                            let _ = events_tx.send(ManagerEvent::Disconnected { worker_id, reason: err.to_string() });
                            return;
                        }
                    }
                    Some(ConnectionCommand::RetrieveOutputs { task_id, cache_name, local_dir }) => {
                        if let Err(err) = conn.send_line(&ManagerToWorker::Get { cache_name }).await {
                            let _ = events_tx.send(ManagerEvent::Disconnected { worker_id, reason: err.to_string() });
                            return;
                        }
                        let mut missing = Vec::new();
                        match receive_tree(&mut conn, &local_dir, recv_timeout, &mut missing).await {
                            Ok(bytes) => {
                                let _ = events_tx.send(ManagerEvent::OutputsRetrieved { worker_id, task_id, bytes, missing });
                            }
                            Err(err) => {
                                let _ = events_tx.send(ManagerEvent::TransferFailed {
                                    worker_id,
                                    task_id,
                                    reason: err.to_string(),
                                });
                                if err.is_link_fatal() {
                                    let _ = events_tx.send(ManagerEvent::Disconnected { worker_id, reason: err.to_string() });
                                    return;
                                }
                            }
                        }
                    }
                    None => return, // manager dropped us; connection is being torn down
                }
            }

            line = conn.recv_line(recv_timeout) => {
                match line {
                    Ok(message) => {
                        let payload = match fetch_payload_len(&message) {
                            Some(len) => match conn.read_payload(len, recv_timeout).await {
                                Ok(bytes) => Some(bytes),
                                Err(err) => {
                                    let _ = events_tx.send(ManagerEvent::Disconnected { worker_id, reason: err.to_string() });
                                    return;
                                }
                            },
                            None => None,
                        };
                        if events_tx.send(ManagerEvent::Message { worker_id, message, payload }).is_err() {
                            return; // manager runtime is gone
                        }
                    }
                    Err(err) => {
                        let _ = events_tx.send(ManagerEvent::Disconnected { worker_id, reason: err.to_string() });
                        return;
                    }
                }
            }
        }
    }
}

fn fetch_payload_len(message: &WorkerToManager) -> Option<usize> {
    match message {
        WorkerToManager::Result { stdout_len, .. } => Some(*stdout_len),
        WorkerToManager::Update { len, .. } => Some(*len),
        WorkerToManager::AsyncCacheInvalid { payload_len, .. } => Some(*payload_len),
        _ => None,
    }
}
