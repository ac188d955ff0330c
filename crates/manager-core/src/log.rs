use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::task::spawn_blocking;

/// Append-only transaction log writer, grounded in
/// `original_source/taskvine/src/manager/vine_txn_log.c`: each line is
/// `<unix-micros> <pid> <record>`, a `#`-prefixed header block is written
/// once, and the file is kept line-buffered so a crash never loses a
/// half-written record. Writes are done on a blocking thread the same way
/// `client-engine/src/inflight.rs::persist` offloads its file I/O.
pub struct TransactionLog {
    path: PathBuf,
}

const HEADER: &[&str] = &[
    "# time pid TASK taskid (READY|RUNNING|WAITING_RETRIEVAL|RETRIEVED|DONE) [detail]",
    "# time pid WORKER workerid (CONNECTION|DISCONNECTION reason|RESOURCES {...})",
    "# time pid CATEGORY name (MAX|MIN|FIRST) {...}",
    "# time pid TRANSFER (INPUT|OUTPUT) taskid cachename MB seconds name",
];

impl TransactionLog {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let header_path = path.clone();
        spawn_blocking(move || {
            let exists = header_path.exists();
            let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&header_path)?;
            if !exists {
                for line in HEADER {
                    writeln!(file, "{line}")?;
                }
            }
            Ok::<_, std::io::Error>(())
        })
        .await
        .expect("blocking task panicked")?;
        Ok(Self { path })
    }

    pub async fn append(&self, unix_micros: i64, pid: u32, record: String) -> std::io::Result<()> {
        let path = self.path.clone();
        spawn_blocking(move || {
            let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{unix_micros} {pid} {record}")
        })
        .await
        .expect("blocking task panicked")
    }

    pub fn task_line(task_id: u64, state: &str, detail: Option<&str>) -> String {
        match detail {
            Some(d) => format!("TASK {task_id} {state} {d}"),
            None => format!("TASK {task_id} {state}"),
        }
    }

    pub fn worker_connection_line(worker_id: &str) -> String {
        format!("WORKER {worker_id} CONNECTION")
    }

    pub fn worker_disconnection_line(worker_id: &str, reason: &str) -> String {
        format!("WORKER {worker_id} DISCONNECTION {reason}")
    }

    pub fn category_line(name: &str, label: &str, detail: &str) -> String {
        format!("CATEGORY {name} {label} {detail}")
    }

    pub fn transfer_line(direction: &str, task_id: u64, cache_name: &str, mb: f64, secs: f64, name: &str) -> String {
        format!("TRANSFER {direction} {task_id} {cache_name} {mb:.3} {secs:.3} {name}")
    }
}

/// Append-only queue-stats snapshot log, written whenever a meaningful
/// event (worker joined/left, task state change, resource totals updated)
/// occurs. One tab-separated line per event.
pub struct QueueStatsLog {
    path: PathBuf,
}

impl QueueStatsLog {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self { path: path.as_ref().to_path_buf() })
    }

    pub async fn append(&self, fields: &[String]) -> std::io::Result<()> {
        let path = self.path.clone();
        let line = fields.join("\t");
        spawn_blocking(move || {
            let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{line}")
        })
        .await
        .expect("blocking task panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_line_without_detail() {
        assert_eq!(TransactionLog::task_line(1, "READY", None), "TASK 1 READY");
    }

    #[test]
    fn task_line_with_detail() {
        assert_eq!(TransactionLog::task_line(1, "RETRIEVED", Some("SUCCESS")), "TASK 1 RETRIEVED SUCCESS");
    }

    #[tokio::test]
    async fn opening_writes_header_once() {
        let dir = std::env::temp_dir().join(format!("txnlog-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&dir);
        let log = TransactionLog::open(&dir).await.unwrap();
        log.append(1, 1, "TASK 1 READY".into()).await.unwrap();
        drop(log);
        let contents = std::fs::read_to_string(&dir).unwrap();
        assert_eq!(contents.lines().filter(|l| l.starts_with('#')).count(), HEADER.len());
        let _ = std::fs::remove_file(&dir);
    }
}
