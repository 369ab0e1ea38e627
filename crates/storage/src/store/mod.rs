#![forbid(unsafe_code)]

mod env_pointers;
mod error;
mod logs;
mod pending_inputs;
mod runs;
mod schema;
mod types;

pub use error::StoreError;
pub use types::*;

use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DB_FILENAME: &str = "envrun.db";

/// Single relational store shared by both orchestrators. Every method is one
/// transaction; callers never keep it open across a suspension point.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    storage_dir: PathBuf,
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;

        let conn = Connection::open(storage_dir.join(DB_FILENAME))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::install_schema(&conn)?;

        Ok(Self { conn, storage_dir })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, message) => {
            code.code == ErrorCode::ConstraintViolation
                || message.as_deref().is_some_and(|value| {
                    value.contains("UNIQUE constraint failed")
                        || value.contains("PRIMARY KEY constraint failed")
                })
        }
        _ => false,
    }
}

fn to_sqlite_i64(value: usize) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::InvalidInput("numeric overflow"))
}

/// Reads a TEXT column into one of the core status enums.
fn parse_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> Result<T, rusqlite::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}
