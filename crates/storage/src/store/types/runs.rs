#![forbid(unsafe_code)]

use envrun_core::RunStatus;

#[derive(Clone, Debug, PartialEq)]
pub struct RunRow {
    pub id: String,
    pub tenant: String,
    pub resource: String,
    pub input_ref: Option<String>,
    pub validate_only: bool,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub summary: Option<String>,
    pub error_message: Option<String>,
    pub build_id: Option<String>,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct RunCreateRequest {
    pub id: String,
    pub input_ref: Option<String>,
    pub validate_only: bool,
    /// Admission ceiling on QUEUED + RUNNING runs for the (tenant, resource).
    pub max_queue: u32,
    pub now_ms: i64,
}

#[derive(Clone, Debug)]
pub struct RunFinishRequest {
    pub id: String,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub summary: Option<String>,
    pub error_message: Option<String>,
    pub now_ms: i64,
}

#[derive(Clone, Debug)]
pub struct RunFinishResult {
    pub run: RunRow,
    /// `false` when another writer already moved the run to a terminal state.
    pub applied: bool,
}

#[derive(Clone, Debug)]
pub struct RunsListRequest {
    pub status: Option<RunStatus>,
    pub limit: usize,
}
