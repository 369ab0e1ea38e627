#![forbid(unsafe_code)]

#[derive(Clone, Debug, PartialEq)]
pub struct PendingInputRow {
    pub id: i64,
    pub tenant: String,
    pub resource: String,
    pub input_ref: String,
    pub queued: bool,
    pub run_id: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct BackfillRequest {
    pub max_queue: u32,
    pub now_ms: i64,
}
