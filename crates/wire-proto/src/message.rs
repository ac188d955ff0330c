use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::error::{Result, WireError};

const NAME_ENCODE: &AsciiSet = &CONTROLS.add(b' ').add(b'%').add(b'\n').add(b'\r');

pub fn encode_name(name: &str) -> String {
    utf8_percent_encode(name, NAME_ENCODE).to_string()
}

pub fn decode_name(name: &str) -> Result<String> {
    percent_decode_str(name)
        .decode_utf8()
        .map(|cow| cow.into_owned())
        .map_err(|_| WireError::Malformed {
            line: name.to_string(),
        })
}

/// Directives the manager sends to a worker. Each variant is one line; the
/// four payload-bearing variants (`Cmd`, `Env`, `File`, `Symlink`) are
/// followed on the wire by their raw byte payload, written separately by
/// the codec's transfer routines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerToWorker {
    Task { task_id: u64 },
    Cmd { len: usize },
    Category { name: String },
    Cores(u64),
    Memory(u64),
    Disk(u64),
    Gpus(u64),
    EndTime(i64),
    WallTime(u64),
    Env { len: usize },
    InFile { cache_name: String, remote: String, flags: u32 },
    OutFile { cache_name: String, remote: String, flags: u32 },
    Dir { remote: String },
    End,
    PutUrl { url: String, cache_name: String, length: u64, mode: u32, flags: u32 },
    File { name: String, length: u64, mode: u32 },
    Symlink { name: String, length: usize },
    Get { cache_name: String },
    GetFile { cache_name: String },
    Kill { task_id: u64 },
    Unlink { cache_name: String },
    InvalidateFile { cache_name: String },
    Check,
    Release,
    Exit,
    SendResults { n: u64 },
}

impl ManagerToWorker {
    pub fn to_line(&self) -> String {
        use ManagerToWorker::*;
        match self {
            Task { task_id } => format!("task {task_id}"),
            Cmd { len } => format!("cmd {len}"),
            Category { name } => format!("category {}", encode_name(name)),
            Cores(n) => format!("cores {n}"),
            Memory(n) => format!("memory {n}"),
            Disk(n) => format!("disk {n}"),
            Gpus(n) => format!("gpus {n}"),
            EndTime(t) => format!("end_time {t}"),
            WallTime(t) => format!("wall_time {t}"),
            Env { len } => format!("env {len}"),
            InFile { cache_name, remote, flags } => {
                format!("infile {} {} {flags}", cache_name, encode_name(remote))
            }
            OutFile { cache_name, remote, flags } => {
                format!("outfile {} {} {flags}", cache_name, encode_name(remote))
            }
            Dir { remote } => format!("dir {}", encode_name(remote)),
            End => "end".to_string(),
            PutUrl { url, cache_name, length, mode, flags } => {
                format!("puturl {url} {cache_name} {length} {mode} {flags}")
            }
            File { name, length, mode } => format!("file {} {length} {mode:o}", encode_name(name)),
            Symlink { name, length } => format!("symlink {} {length}", encode_name(name)),
            Get { cache_name } => format!("get {cache_name}"),
            GetFile { cache_name } => format!("getfile {cache_name}"),
            Kill { task_id } => format!("kill {task_id}"),
            Unlink { cache_name } => format!("unlink {cache_name}"),
            InvalidateFile { cache_name } => format!("invalidate-file {cache_name}"),
            Check => "check".to_string(),
            Release => "release".to_string(),
            Exit => "exit".to_string(),
            SendResults { n } => format!("send_results {n}"),
        }
    }
}

/// Messages a worker sends to the manager. Variants prefixed `Async*` are
/// fully consumed inside the codec (`recv_line`) and never surfaced past
/// it; the rest are handed up to the manager runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerToManager {
    Handshake { protocol: u32, host: String, os: String, arch: String, version: String },
    AsyncAlive,
    AsyncInfo { field: String, value: String },
    AsyncResource { name: String, total: i64, smallest: i64, largest: i64 },
    AsyncFeature { name: String },
    AsyncCacheUpdate { cache_name: String, size: u64, transfer_usec: u64 },
    AsyncCacheInvalid { cache_name: String, payload_len: usize },
    Result { status: i32, exit_code: i32, stdout_len: usize, exec_usec: u64, task_id: u64 },
    Update { task_id: u64, remote: String, offset: u64, len: usize },
    AvailableResults,
    EndBatch,
}

impl WorkerToManager {
    pub fn is_async(&self) -> bool {
        matches!(
            self,
            WorkerToManager::AsyncAlive
                | WorkerToManager::AsyncInfo { .. }
                | WorkerToManager::AsyncResource { .. }
                | WorkerToManager::AsyncFeature { .. }
                | WorkerToManager::AsyncCacheUpdate { .. }
                | WorkerToManager::AsyncCacheInvalid { .. }
        )
    }
}

/// Parses one received line (without trailing payload bytes, which the
/// caller reads separately once it knows the declared length).
pub fn parse_line(line: &str) -> Result<WorkerToManager> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut parts = line.split(' ');
    let keyword = parts.next().unwrap_or("");

    let malformed = || WireError::Malformed { line: line.to_string() };
    let next_str = |parts: &mut std::str::Split<'_, char>| parts.next().ok_or_else(malformed);
    let next_num = |parts: &mut std::str::Split<'_, char>| -> Result<i64> {
        next_str(parts)?.parse().map_err(|_| malformed())
    };

    match keyword {
        "workqueue" => Ok(WorkerToManager::Handshake {
            protocol: next_num(&mut parts)? as u32,
            host: next_str(&mut parts)?.to_string(),
            os: next_str(&mut parts)?.to_string(),
            arch: next_str(&mut parts)?.to_string(),
            version: next_str(&mut parts)?.to_string(),
        }),
        "alive" => Ok(WorkerToManager::AsyncAlive),
        "info" => Ok(WorkerToManager::AsyncInfo {
            field: next_str(&mut parts)?.to_string(),
            value: parts.collect::<Vec<_>>().join(" "),
        }),
        "resource" => Ok(WorkerToManager::AsyncResource {
            name: next_str(&mut parts)?.to_string(),
            total: next_num(&mut parts)?,
            smallest: next_num(&mut parts)?,
            largest: next_num(&mut parts)?,
        }),
        "feature" => Ok(WorkerToManager::AsyncFeature {
            name: decode_name(next_str(&mut parts)?)?,
        }),
        "cache-update" => Ok(WorkerToManager::AsyncCacheUpdate {
            cache_name: next_str(&mut parts)?.to_string(),
            size: next_num(&mut parts)? as u64,
            transfer_usec: next_num(&mut parts)? as u64,
        }),
        "cache-invalid" => Ok(WorkerToManager::AsyncCacheInvalid {
            cache_name: next_str(&mut parts)?.to_string(),
            payload_len: next_num(&mut parts)? as usize,
        }),
        "result" => Ok(WorkerToManager::Result {
            status: next_num(&mut parts)? as i32,
            exit_code: next_num(&mut parts)? as i32,
            stdout_len: next_num(&mut parts)? as usize,
            exec_usec: next_num(&mut parts)? as u64,
            task_id: next_num(&mut parts)? as u64,
        }),
        "update" => Ok(WorkerToManager::Update {
            task_id: next_num(&mut parts)? as u64,
            remote: decode_name(next_str(&mut parts)?)?,
            offset: next_num(&mut parts)? as u64,
            len: next_num(&mut parts)? as usize,
        }),
        "available_results" => Ok(WorkerToManager::AvailableResults),
        "end" => Ok(WorkerToManager::EndBatch),
        _ => Err(malformed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_resource_line() {
        let parsed = parse_line("resource cores 8 1 8").unwrap();
        assert_eq!(
            parsed,
            WorkerToManager::AsyncResource { name: "cores".into(), total: 8, smallest: 1, largest: 8 }
        );
    }

    #[test]
    fn encodes_and_decodes_names_with_spaces() {
        let encoded = encode_name("a file with spaces.txt");
        assert!(!encoded.contains(' '));
        assert_eq!(decode_name(&encoded).unwrap(), "a file with spaces.txt");
    }

    #[test]
    fn rejects_malformed_line() {
        assert!(parse_line("bogus").is_err());
    }

    #[test]
    fn handshake_parses_all_fields() {
        let parsed = parse_line("workqueue 1 host.example linux x86_64 1.2.3").unwrap();
        assert_eq!(
            parsed,
            WorkerToManager::Handshake {
                protocol: 1,
                host: "host.example".into(),
                os: "linux".into(),
                arch: "x86_64".into(),
                version: "1.2.3".into(),
            }
        );
    }
}
