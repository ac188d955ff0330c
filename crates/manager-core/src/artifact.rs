use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::task::Task;

static UNIQUE_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// A typed description of a byte payload that can be mounted into a task
/// sandbox. §3 "Artifact" / §4.C.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Artifact {
    LocalFile { path: String, range: Option<(u64, u64)> },
    Url { url: String },
    Buffer { bytes: Vec<u8>, unique_id: u64 },
    MiniTask { command: String },
    EmptyDir,
    Temp { cache_name: String },
}

/// Per-artifact flags carried alongside a cache-name.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ArtifactFlags {
    pub cacheable: bool,
    pub success_only: bool,
    pub failure_only: bool,
    pub watch: bool,
    pub fixed_location: bool,
}

/// Binds an artifact to a relative path inside a task's sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub artifact: Artifact,
    pub remote_name: String,
    pub flags: ArtifactFlags,
}

impl Mount {
    /// Input mounts with an absolute `remote_name` are a user error; the
    /// caller should reject the task at submission time rather than let it
    /// reach the scheduler.
    pub fn is_valid_remote_name(&self) -> bool {
        !self.remote_name.starts_with('/')
    }
}

fn hash64(parts: &[&[u8]]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for part in parts {
        part.hash(&mut hasher);
        0u8.hash(&mut hasher); // separator so adjacent fields can't alias
    }
    hasher.finish()
}

/// Derives the deterministic cache-name for an artifact. Two artifacts
/// with the same fingerprint always produce the same cache-name (§3
/// invariant); an uncacheable mount gets a name unique to one task
/// instance so the worker discards it after the task completes.
pub fn cache_name(artifact: &Artifact, flags: ArtifactFlags, owning_task: Option<&Task>) -> String {
    let base = match artifact {
        Artifact::LocalFile { path, range } => match range {
            Some((offset, length)) => format!(
                "file-{:016x}-{offset}-{length}-{}",
                hash64(&[b"localfile", path.as_bytes()]),
                basename(path)
            ),
            None => format!("file-{:016x}-{}", hash64(&[b"localfile", path.as_bytes()]), basename(path)),
        },
        Artifact::Url { url } => format!("url-{:016x}", hash64(&[b"url", url.as_bytes()])),
        Artifact::MiniTask { command } => {
            format!("minitask-{:016x}", hash64(&[b"minitask", command.as_bytes()]))
        }
        Artifact::EmptyDir => "emptydir".to_string(),
        Artifact::Temp { cache_name } => cache_name.clone(),
        Artifact::Buffer { unique_id, .. } => format!("buffer-{unique_id:016x}"),
    };

    if flags.cacheable {
        base
    } else {
        let task_id = owning_task.map(|t| t.id).unwrap_or(0);
        format!("{base}-uncached-task{task_id}")
    }
}

pub fn fresh_buffer_id() -> u64 {
    UNIQUE_BUFFER_ID.fetch_add(1, Ordering::Relaxed)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_local_files_share_a_cache_name() {
        let flags = ArtifactFlags { cacheable: true, ..Default::default() };
        let a = Artifact::LocalFile { path: "/data/in.csv".into(), range: None };
        let b = Artifact::LocalFile { path: "/data/in.csv".into(), range: None };
        assert_eq!(cache_name(&a, flags, None), cache_name(&b, flags, None));
    }

    #[test]
    fn distinct_byte_ranges_of_same_file_do_not_alias() {
        let flags = ArtifactFlags { cacheable: true, ..Default::default() };
        let a = Artifact::LocalFile { path: "/data/in.csv".into(), range: Some((0, 100)) };
        let b = Artifact::LocalFile { path: "/data/in.csv".into(), range: Some((100, 100)) };
        assert_ne!(cache_name(&a, flags, None), cache_name(&b, flags, None));
    }

    #[test]
    fn uncacheable_mount_is_unique_per_task() {
        let flags = ArtifactFlags { cacheable: false, ..Default::default() };
        let artifact = Artifact::LocalFile { path: "/data/in.csv".into(), range: None };
        let t1 = Task::new_for_test(1);
        let t2 = Task::new_for_test(2);
        let n1 = cache_name(&artifact, flags, Some(&t1));
        let n2 = cache_name(&artifact, flags, Some(&t2));
        assert_ne!(n1, n2);
    }
}
