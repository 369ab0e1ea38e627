#![forbid(unsafe_code)]

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("unknown id")]
    UnknownId,
    #[error("a build is already in progress for {tenant}/{resource}")]
    BuildInProgress { tenant: String, resource: String },
    #[error("build {build_id} is {status}, expected BUILDING")]
    BuildNotBuilding { build_id: String, status: String },
    #[error("run {run_id} is {status}, expected {expected}")]
    RunStatusMismatch {
        run_id: String,
        status: String,
        expected: &'static str,
    },
    #[error("queue is full ({active} active, limit {limit})")]
    QueueFull { limit: u32, active: u32 },
}
