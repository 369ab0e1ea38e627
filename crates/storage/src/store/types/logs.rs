#![forbid(unsafe_code)]

use envrun_core::LogStream;

#[derive(Clone, Debug, PartialEq)]
pub struct LogEntryRow {
    pub id: i64,
    pub stream: LogStream,
    pub message: String,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct LogPage {
    pub entries: Vec<LogEntryRow>,
    /// Last returned id, or `None` once a page comes back empty.
    pub next_after_id: Option<i64>,
    pub has_more: bool,
}
