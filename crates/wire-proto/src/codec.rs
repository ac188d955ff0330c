use std::path::Path;
use std::time::Duration;

use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{Result, WireError};
use crate::message::{decode_name, encode_name, parse_line, ManagerToWorker, WorkerToManager};

/// One connected worker's framed line/byte stream, matching the recursive
/// `dir`/`file`/`symlink`/`end` transfer grammar used by both `puturl`
/// staging and output retrieval (§4.A/§4.E of the expanded spec).
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    pub fn from_stream(stream: TcpStream) -> Self {
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    pub async fn send_line(&mut self, msg: &ManagerToWorker) -> Result<()> {
        let mut line = msg.to_line();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    pub async fn send_payload(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;
        Ok(())
    }

    /// Reads and parses one line, applying `timeout`. Async status lines
    /// (alive/info/resource/feature/cache-update/cache-invalid) are
    /// returned like any other message; the caller (the per-worker
    /// connection task) decides whether to act locally or forward it.
    pub async fn recv_line(&mut self, timeout: Duration) -> Result<WorkerToManager> {
        let mut line = String::new();
        let read = tokio::time::timeout(timeout, self.reader.read_line(&mut line));
        match read.await {
            Err(_) => {
                tracing::trace!(timeout_ms = %timeout.as_millis(), "timed out waiting for a line");
                Err(WireError::Timeout)
            }
            Ok(Err(e)) => Err(WireError::Io(e)),
            Ok(Ok(0)) => Err(WireError::UnexpectedEof),
            Ok(Ok(_)) => parse_line(&line),
        }
    }

    pub async fn read_payload(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(timeout, self.reader.read_exact(&mut buf))
            .await
            .map_err(|_| WireError::Timeout)??;
        Ok(buf)
    }

    /// Recursively ships `local_path` to the worker under `remote_name`,
    /// following the top-level symlink (if any) but not inner ones, as
    /// `vine_manager_put.c` does.
    pub async fn put_item(&mut self, local_path: &Path, remote_name: &str) -> Result<u64> {
        let meta = fs::symlink_metadata(local_path).await?;
        let mut sent = 0u64;
        if meta.is_dir() {
            self.send_line(&ManagerToWorker::Dir { remote: remote_name.to_string() }).await?;
            let mut entries = fs::read_dir(local_path).await?;
            while let Some(entry) = entries.next_entry().await? {
                let child_name = entry.file_name();
                let child_name = child_name.to_string_lossy();
                let child_remote = format!("{remote_name}/{child_name}");
                sent += Box::pin(self.put_item(&entry.path(), &child_remote)).await?;
            }
            self.send_line(&ManagerToWorker::End).await?;
        } else if meta.is_symlink() {
            let target = fs::read_link(local_path).await?;
            let target = target.to_string_lossy();
            self.send_line(&ManagerToWorker::Symlink { name: remote_name.to_string(), length: target.len() })
                .await?;
            self.send_payload(target.as_bytes()).await?;
            sent += target.len() as u64;
        } else {
            let bytes = fs::read(local_path).await?;
            #[cfg(unix)]
            let mode = {
                use std::os::unix::fs::PermissionsExt;
                meta.permissions().mode() & 0o777
            };
            #[cfg(not(unix))]
            let mode = 0o644u32;
            self.send_line(&ManagerToWorker::File {
                name: remote_name.to_string(),
                length: bytes.len() as u64,
                mode,
            })
            .await?;
            self.send_payload(&bytes).await?;
            sent += bytes.len() as u64;
        }
        Ok(sent)
    }

    pub async fn recv_raw_line(&mut self, timeout: Duration) -> Result<String> {
        let mut line = String::new();
        match tokio::time::timeout(timeout, self.reader.read_line(&mut line)).await {
            Err(_) => Err(WireError::Timeout),
            Ok(Err(e)) => Err(WireError::Io(e)),
            Ok(Ok(0)) => Err(WireError::UnexpectedEof),
            Ok(Ok(_)) => Ok(line),
        }
    }
}

/// Receive side of the recursive transfer grammar (dir/file/symlink/
/// error/end), operated on raw lines rather than `WorkerToManager` since
/// those keywords only ever appear nested inside a `get` response and are
/// not valid top-level async status lines. An `error <name> <errno>`
/// child is appended to `missing` rather than failing the whole transfer,
/// matching §4.E's OUTPUT_MISSING handling.
pub async fn receive_tree(
    conn: &mut Connection,
    local_path: &Path,
    timeout: Duration,
    missing: &mut Vec<String>,
) -> Result<u64> {
    let mut total = 0u64;
    loop {
        let line = conn.recv_raw_line(timeout).await?;
        let line = line.trim_end_matches(['\r', '\n']);
        let malformed = || WireError::Malformed { line: line.to_string() };
        let mut parts = line.split(' ');
        match parts.next().ok_or_else(malformed)? {
            "end" => return Ok(total),
            "dir" => {
                let name = decode_name(parts.next().ok_or_else(malformed)?)?;
                let child_path = local_path.join(&name);
                fs::create_dir_all(&child_path).await?;
                total += Box::pin(receive_tree(conn, &child_path, timeout, missing)).await?;
            }
            "file" => {
                let name = decode_name(parts.next().ok_or_else(malformed)?)?;
                let length: usize = parts.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
                let _mode = parts.next();
                let bytes = conn.read_payload(length, timeout).await?;
                let child_path = local_path.join(&name);
                if let Some(parent) = child_path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(&child_path, &bytes).await?;
                total += length as u64;
            }
            "symlink" => {
                let name = decode_name(parts.next().ok_or_else(malformed)?)?;
                let length: usize = parts.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
                let target_bytes = conn.read_payload(length, timeout).await?;
                let target = String::from_utf8_lossy(&target_bytes).into_owned();
                let child_path = local_path.join(&name);
                #[cfg(unix)]
                {
                    let _ = fs::symlink(&target, &child_path).await;
                }
                #[cfg(not(unix))]
                {
                    let _ = (&target, &child_path);
                }
                total += length as u64;
            }
            "error" => {
                let name = decode_name(parts.next().ok_or_else(malformed)?)?;
                missing.push(name);
            }
            _ => return Err(malformed()),
        }
    }
}

pub use encode_name as encode_remote_name;
