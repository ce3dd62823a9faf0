use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Monotonic id assigned to each frame when it enters the queue.
pub type RequestId = u64;

/// One client-submitted unit of work. Immutable once queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePayload {
    pub request_id: RequestId,
    pub tokens: Vec<String>,
}

impl FramePayload {
    pub fn new(request_id: RequestId, tokens: Vec<String>) -> Self {
        Self { request_id, tokens }
    }

    /// Line written to the worker's stdin: tokens joined by commas, newline terminated.
    pub fn to_wire_line(&self) -> String {
        let mut line = self.tokens.join(",");
        line.push('\n');
        line
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Unstarted,
    Running,
    Exited,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Unstarted => "unstarted",
            WorkerState::Running => "running",
            WorkerState::Exited => "exited",
        };
        f.write_str(name)
    }
}

/// A chunk of worker output, fanned out to every connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// Request that was in flight when the chunk arrived, if any.
    pub request_id: Option<RequestId>,
    pub text: String,
}

/// Returned to a submitter once its frame is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub request_id: RequestId,
    /// Frames still waiting after this submission (0 when it went straight to the worker).
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchCounters {
    pub queued: u64,
    pub dispatched: u64,
    pub results: u64,
    pub dropped: u64,
    pub write_failures: u64,
    pub result_timeouts: u64,
    /// Results that arrived for frames already abandoned by a timeout.
    pub late_results: u64,
    pub restarts: u32,
}

/// Point-in-time view of the dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchSnapshot {
    pub worker_state: WorkerState,
    pub in_flight: Option<RequestId>,
    pub queue_depth: usize,
    pub counters: DispatchCounters,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    #[serde(flatten)]
    pub dispatch: DispatchSnapshot,
    pub connected_clients: usize,
    pub started_at: DateTime<Utc>,
}
