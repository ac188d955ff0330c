//! End-to-end scenarios driven against a real `TcpListener`, with a fake
//! worker on the other end speaking the wire protocol directly. Mirrors
//! the teacher's plain `#[tokio::test]` integration style (no custom
//! harness) — see `client-engine`'s own test modules.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use manager_core::{
    Artifact, ArtifactFlags, HttpCatalogPublisher, ManagerConfig, ManagerRuntime, Mount, StatusSnapshot, Task,
};

/// A hand-rolled stand-in for the real worker binary (not part of this
/// crate): speaks just enough of the line protocol to drive each
/// scenario, reading `ManagerToWorker` lines and writing `WorkerToManager`
/// lines by hand rather than through `wire_proto::Connection`, since that
/// type only implements the manager side of the wire.
struct FakeWorker {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FakeWorker {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to manager");
        let (r, w) = stream.into_split();
        Self { reader: BufReader::new(r), writer: w }
    }

    async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.expect("write line");
        self.writer.write_all(b"\n").await.expect("write newline");
    }

    async fn recv_line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line from the manager")
            .expect("read line from manager");
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    async fn recv_payload(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await.expect("read payload from manager");
        buf
    }

    async fn handshake(&mut self, host: &str) {
        self.send_line(&format!("workqueue 1 {host} linux x86_64 5.4.0")).await;
    }

    async fn report_resources(&mut self, cores: i64, memory_mb: i64, disk_mb: i64, gpus: i64) {
        self.send_line(&format!("resource cores {cores} {cores} {cores}")).await;
        self.send_line(&format!("resource memory {memory_mb} {memory_mb} {memory_mb}")).await;
        self.send_line(&format!("resource disk {disk_mb} {disk_mb} {disk_mb}")).await;
        self.send_line(&format!("resource gpus {gpus} {gpus} {gpus}")).await;
    }

    /// Drains lines until it has consumed a `cmd <len>` directive and its
    /// payload, returning the command text. Any `env <len>` directive seen
    /// first is drained but discarded.
    async fn recv_command(&mut self) -> String {
        loop {
            let line = self.recv_line().await;
            if let Some(len) = line.strip_prefix("cmd ") {
                let len: usize = len.parse().expect("cmd length is numeric");
                let bytes = self.recv_payload(len).await;
                return String::from_utf8(bytes).expect("command text is utf8");
            }
            if let Some(len) = line.strip_prefix("env ") {
                let len: usize = len.parse().expect("env length is numeric");
                self.recv_payload(len).await;
            }
        }
    }

    async fn send_task_result(&mut self, task_id: u64, status: i32, exit_code: i32) {
        self.send_line(&format!("result {status} {exit_code} 0 1000 {task_id}")).await;
    }
}

async fn new_runtime(addr: SocketAddr, configure: impl FnOnce(&mut ManagerConfig)) -> ManagerRuntime {
    let mut config = ManagerConfig::default();
    config.listen_addr = addr;
    configure(&mut config);
    ManagerRuntime::new(config, Arc::new(HttpCatalogPublisher::new()))
        .await
        .expect("runtime construction binds no sockets and only opens optional log files")
}

async fn wait_for(rx: &mut watch::Receiver<StatusSnapshot>, mut pred: impl FnMut(&StatusSnapshot) -> bool) {
    if pred(&rx.borrow()) {
        return;
    }
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            rx.changed().await.expect("manager runtime dropped its snapshot sender");
            if pred(&rx.borrow()) {
                return;
            }
        }
    })
    .await
    .expect("condition was not reached before the timeout");
}

#[tokio::test]
async fn s1_happy_path_runs_and_completes_a_task() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut rt = new_runtime(addr, |_| {}).await;
    let mut snapshot = rt.subscribe_snapshot();
    let task_id = rt.submit(Task::new(0, "echo hello".to_string(), "default".to_string()));
    tokio::spawn(rt.run(listener));

    let mut worker = FakeWorker::connect(addr).await;
    worker.handshake("worker-a").await;
    worker.report_resources(4, 4096, 10_000, 0).await;

    let command = worker.recv_command().await;
    assert_eq!(command, "echo hello");
    worker.send_task_result(task_id, 0, 0).await;

    wait_for(&mut snapshot, |s| s.tasks_done == 1).await;
}

#[tokio::test]
async fn s3_worker_failure_mid_run_requeues_and_a_second_worker_finishes_it() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut rt = new_runtime(addr, |_| {}).await;
    let mut snapshot = rt.subscribe_snapshot();
    let task_id = rt.submit(Task::new(0, "render frame".to_string(), "default".to_string()));
    tokio::spawn(rt.run(listener));

    {
        let mut first = FakeWorker::connect(addr).await;
        first.handshake("worker-a").await;
        first.report_resources(4, 4096, 10_000, 0).await;
        let command = first.recv_command().await;
        assert_eq!(command, "render frame");
        // Drop the connection without ever sending a result: the manager
        // sees EOF, tears down the worker, and must requeue the task.
    }

    let mut second = FakeWorker::connect(addr).await;
    second.handshake("worker-b").await;
    second.report_resources(4, 4096, 10_000, 0).await;
    let command = second.recv_command().await;
    assert_eq!(command, "render frame");
    second.send_task_result(task_id, 0, 0).await;

    wait_for(&mut snapshot, |s| s.tasks_done == 1).await;
}

#[tokio::test]
async fn s4_resource_exhaustion_escalates_first_then_max_then_finalizes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut rt = new_runtime(addr, |_| {}).await;
    let mut snapshot = rt.subscribe_snapshot();
    let task_id = rt.submit(Task::new(0, "run_big_job".to_string(), "squeezed".to_string()));
    tokio::spawn(rt.run(listener));

    let mut worker = FakeWorker::connect(addr).await;
    worker.handshake("worker-a").await;
    worker.report_resources(2, 2048, 5_000, 0).await;

    const STATUS_RESOURCE_EXHAUSTION: i32 = 1;

    // FIRST allocation fails: escalate to MAX and retry on the same worker.
    let _first_attempt = worker.recv_command().await;
    worker.send_task_result(task_id, STATUS_RESOURCE_EXHAUSTION, 0).await;

    // MAX allocation fails too: escalate to ERROR and finalize.
    let _second_attempt = worker.recv_command().await;
    worker.send_task_result(task_id, STATUS_RESOURCE_EXHAUSTION, 0).await;

    wait_for(&mut snapshot, |s| s.tasks_done == 1).await;
}

#[tokio::test]
async fn s5_missing_output_is_recorded_and_the_task_still_finalizes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut rt = new_runtime(addr, |_| {}).await;
    let mut snapshot = rt.subscribe_snapshot();
    let mut task = Task::new(0, "produce_report".to_string(), "default".to_string());
    task.outputs.push(Mount {
        artifact: Artifact::LocalFile { path: "report.csv".to_string(), range: None },
        remote_name: "report.csv".to_string(),
        flags: ArtifactFlags { cacheable: false, ..Default::default() },
    });
    let task_id = rt.submit(task);
    tokio::spawn(rt.run(listener));

    let mut worker = FakeWorker::connect(addr).await;
    worker.handshake("worker-a").await;
    worker.report_resources(4, 4096, 10_000, 0).await;

    let command = worker.recv_command().await;
    assert_eq!(command, "produce_report");
    worker.send_task_result(task_id, 0, 0).await;

    // The manager now issues a `get` for the combined output tree; the
    // worker reports the one expected file missing, then ends the batch.
    let get_line = worker.recv_line().await;
    assert!(get_line.starts_with("get "), "expected a get directive, saw {get_line:?}");
    worker.send_line("error report.csv 2").await;
    worker.send_line("end").await;

    wait_for(&mut snapshot, |s| s.tasks_done == 1).await;
}

#[tokio::test]
async fn s6_replication_routes_a_cached_artifact_to_the_roomiest_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let rt = new_runtime(addr, |cfg| cfg.temp_replica_count = 3).await;

    tokio::spawn(rt.run(listener));

    let mut source = FakeWorker::connect(addr).await;
    source.handshake("host-a").await;
    source.report_resources(4, 4096, 10_000, 0).await;
    source.send_line("cache-update blob1 2048 100").await;

    let mut cramped = FakeWorker::connect(addr).await;
    cramped.handshake("host-b").await;
    cramped.report_resources(4, 4096, 5_000, 0).await;

    let mut roomy = FakeWorker::connect(addr).await;
    roomy.handshake("host-c").await;
    roomy.report_resources(4, 4096, 50_000, 0).await;

    let (winner, line) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::select! {
            line = cramped.recv_line() => ("host-b", line),
            line = roomy.recv_line() => ("host-c", line),
        }
    })
    .await
    .expect("replication did not issue a puturl directive in time");

    assert_eq!(winner, "host-c", "replication should prefer the peer with more free disk");
    assert!(line.starts_with("puturl "), "expected a puturl directive, saw {line:?}");
    assert!(line.contains("blob1"));
}

#[tokio::test]
async fn stop_handle_drains_before_the_run_loop_exits() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let rt = new_runtime(addr, |_| {}).await;
    let stop = rt.stop_handle();

    assert!(!stop.load(Ordering::SeqCst));
    let handle = tokio::spawn(rt.run(listener));
    stop.store(true, Ordering::SeqCst);

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run() did not exit after stop was requested with no workers or tasks outstanding")
        .expect("run() task panicked");
}
