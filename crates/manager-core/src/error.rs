use thiserror::Error;

/// The result code a task finalizes with, surfaced to the caller on
/// `wait()`. Mirrors §7's result-code list one for one; `Unknown` is the
/// catch-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Success,
    InputMissing,
    OutputMissing,
    StdoutMissing,
    Signal,
    ResourceExhaustion,
    TaskTimeout,
    Forsaken,
    MaxRetries,
    TaskMaxRunTime,
    DiskAllocFull,
    RmonitorError,
    OutputTransferError,
    Unknown,
}

impl ResultCode {
    /// Update priority used when more than one condition is observed for
    /// the same task: input-missing and output-missing both clobber
    /// stdout-missing; a non-missing code only overwrites if nothing else
    /// is set yet. See §7 "Update policy is monotone-with-priority".
    fn rank(self) -> u8 {
        match self {
            ResultCode::Success | ResultCode::Unknown => 0,
            ResultCode::StdoutMissing => 1,
            ResultCode::OutputMissing => 2,
            ResultCode::InputMissing => 3,
            _ => 2,
        }
    }

    pub fn merge(self, incoming: ResultCode) -> ResultCode {
        if incoming.rank() >= self.rank() {
            incoming
        } else {
            self
        }
    }
}

/// Local manager-side failure classification; matches §7's four error
/// kinds minus `AppFailure`, which is represented directly as a
/// `ResultCode` on the task rather than a separate error type since it
/// never aborts an operation, only finalizes one task.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("worker {worker} failed: {source}")]
    WorkerFailure { worker: crate::worker::WorkerId, #[source] source: wire_proto::WireError },

    #[error("local filesystem error: {0}")]
    ManagerFailure(#[from] std::io::Error),

    #[error("policy terminated task {task_id}: {reason}")]
    PolicyTermination { task_id: u64, reason: &'static str },
}

pub type Result<T> = std::result::Result<T, ManagerError>;
