use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::artifact::Mount;
use crate::error::ResultCode;
use crate::worker::WorkerId;

/// §3 "Task lifecycle (states)".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Ready,
    Running,
    WaitingRetrieval,
    Retrieved,
    Done,
    Canceled,
}

/// A task's declared resource request; any field left `None` is filled in
/// by the category engine and scheduler (§4.G resource box).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cores: Option<f64>,
    pub memory_mb: Option<f64>,
    pub disk_mb: Option<f64>,
    pub gpus: Option<f64>,
    pub wall_time_secs: Option<u64>,
    pub end_time_unix: Option<i64>,
    pub min_running_time_secs: Option<u64>,
}

/// The concrete envelope allocated to a task at dispatch time (§ GLOSSARY
/// "Resource box").
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceBox {
    pub cores: f64,
    pub memory_mb: f64,
    pub disk_mb: f64,
    pub gpus: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Timings {
    pub submitted_at: Option<i64>,
    pub commit_start_at: Option<i64>,
    pub commit_end_at: Option<i64>,
    pub retrieval_at: Option<i64>,
    pub done_at: Option<i64>,
    pub execute_last_usec: u64,
    pub execute_all_usec: u64,
    pub execute_exhaustion_usec: u64,
    pub execute_failure_usec: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: u64,
    pub command_line: String,
    pub category: String,
    pub tag: Option<String>,
    pub library_needed: Option<String>,
    pub library_provided: Option<String>,
    pub inputs: Vec<Mount>,
    pub outputs: Vec<Mount>,
    pub env: Vec<(String, String)>,
    pub required_features: Vec<String>,
    pub request: ResourceRequest,
    pub scheduling_policy_override: Option<crate::scheduler::SchedulingPolicy>,
    pub priority: i64,
    pub max_retries: u32,

    pub state: TaskState,
    pub assigned_worker: Option<WorkerId>,
    pub try_count: u32,
    pub current_allocation_label: AllocationLabel,
    pub timings: Timings,
    pub stats: TaskStats,
    pub stdout: Option<String>,
    pub exit_code: Option<i32>,
    pub result: Option<ResultCode>,
    pub measured_resources: Option<ResourceBox>,
    pub allocated_resources: Option<ResourceBox>,
}

/// Per-category escalation label: `FIRST -> MAX -> ERROR` (§4.H / §4.F
/// resource-exhaustion handling).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationLabel {
    #[default]
    First,
    Max,
    Error,
}

impl Task {
    pub fn new(id: u64, command_line: String, category: String) -> Self {
        Self {
            id,
            command_line,
            category,
            tag: None,
            library_needed: None,
            library_provided: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            env: Vec::new(),
            required_features: Vec::new(),
            request: ResourceRequest::default(),
            scheduling_policy_override: None,
            priority: 0,
            max_retries: 0,
            state: TaskState::Ready,
            assigned_worker: None,
            try_count: 0,
            current_allocation_label: AllocationLabel::First,
            timings: Timings::default(),
            stats: TaskStats::default(),
            stdout: None,
            exit_code: None,
            result: None,
            measured_resources: None,
            allocated_resources: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(id: u64) -> Self {
        Self::new(id, "true".to_string(), "default".to_string())
    }

    /// A task is reapable once the manager has nothing left to do with it:
    /// either its result and outputs are in (`Retrieved`) or it was
    /// cancelled outright. `Done` is not listed here — it is the state
    /// `reap()` itself moves a `Retrieved` task into, never one the
    /// runtime sets on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, TaskState::Retrieved | TaskState::Canceled)
    }

    /// §3 "Resubmission ... must first be reset".
    pub fn reset_for_resubmission(&mut self) {
        self.state = TaskState::Ready;
        self.assigned_worker = None;
        self.try_count = 0;
        self.current_allocation_label = AllocationLabel::First;
        self.timings = Timings::default();
        self.stats = TaskStats::default();
        self.stdout = None;
        self.exit_code = None;
        self.result = None;
        self.measured_resources = None;
        self.allocated_resources = None;
    }

    /// §7 "Update policy is monotone-with-priority".
    pub fn merge_result(&mut self, incoming: ResultCode) {
        self.result = Some(match self.result {
            Some(existing) => existing.merge(incoming),
            None => incoming,
        });
    }
}

/// Priority-ordered ready queue (§5 "Ready queue is ordered by task
/// priority, higher first"); resource-exhaustion retries are pushed to the
/// head instead (§4.F), bypassing priority entirely, to avoid starving
/// large tasks behind a flood of small ones that keep succeeding.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    items: VecDeque<(i64, u64)>,
}

impl ReadyQueue {
    /// Inserts ahead of every lower-priority item already queued; ties
    /// keep arrival order (stable), matching a plain FIFO when every task
    /// shares the same priority.
    pub fn push_back(&mut self, task_id: u64, priority: i64) {
        let pos = self.items.iter().position(|(p, _)| *p < priority).unwrap_or(self.items.len());
        self.items.insert(pos, (priority, task_id));
    }

    pub fn push_front(&mut self, task_id: u64, priority: i64) {
        self.items.push_front((priority, task_id));
    }

    pub fn pop_front(&mut self) -> Option<u64> {
        self.items.pop_front().map(|(_, task_id)| task_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &u64> {
        self.items.iter().map(|(_, task_id)| task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_terminal_fields() {
        let mut t = Task::new_for_test(1);
        t.state = TaskState::Done;
        t.result = Some(ResultCode::Success);
        t.try_count = 3;
        t.reset_for_resubmission();
        assert_eq!(t.state, TaskState::Ready);
        assert!(t.result.is_none());
        assert_eq!(t.try_count, 0);
    }

    #[test]
    fn input_missing_clobbers_stdout_missing() {
        let mut t = Task::new_for_test(1);
        t.merge_result(ResultCode::StdoutMissing);
        t.merge_result(ResultCode::InputMissing);
        assert_eq!(t.result, Some(ResultCode::InputMissing));
    }

    #[test]
    fn ready_queue_resource_exhaustion_goes_to_head() {
        let mut q = ReadyQueue::default();
        q.push_back(1, 0);
        q.push_back(2, 0);
        q.push_front(3, 0);
        assert_eq!(q.pop_front(), Some(3));
    }

    #[test]
    fn ready_queue_orders_by_priority_then_arrival() {
        let mut q = ReadyQueue::default();
        q.push_back(1, 0);
        q.push_back(2, 5);
        q.push_back(3, 5);
        q.push_back(4, 0);
        assert_eq!(q.pop_front(), Some(2));
        assert_eq!(q.pop_front(), Some(3));
        assert_eq!(q.pop_front(), Some(1));
        assert_eq!(q.pop_front(), Some(4));
    }
}
