#![forbid(unsafe_code)]

use super::*;
use envrun_core::{LogScope, LogStream};
use rusqlite::params;

const MAX_PAGE_LIMIT: usize = 1_000;
const MAX_MESSAGE_LEN: usize = 16_000;

impl SqliteStore {
    /// Appends one line to a run or build log. Ids come from a single
    /// AUTOINCREMENT sequence, so they strictly increase within every scope.
    pub fn log_append(
        &mut self,
        scope: &LogScope,
        stream: LogStream,
        message: &str,
        now_ms: i64,
    ) -> Result<LogEntryRow, StoreError> {
        let message: String = message.chars().take(MAX_MESSAGE_LEN).collect();
        self.conn.execute(
            r#"
            INSERT INTO log_entries(scope_kind, scope_id, stream, message, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![scope.kind(), scope.id(), stream.as_str(), message, now_ms],
        )?;
        Ok(LogEntryRow {
            id: self.conn.last_insert_rowid(),
            stream,
            message,
            created_at_ms: now_ms,
        })
    }

    /// Cursor page of entries with `id > after_id`, ascending.
    pub fn logs_list(
        &self,
        scope: &LogScope,
        after_id: i64,
        limit: usize,
    ) -> Result<LogPage, StoreError> {
        if after_id < 0 {
            return Err(StoreError::InvalidInput("after_id must be >= 0"));
        }
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);

        let mut entries = Vec::<LogEntryRow>::new();
        {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT id, stream, message, created_at_ms
                FROM log_entries
                WHERE scope_kind=?1 AND scope_id=?2 AND id > ?3
                ORDER BY id ASC
                LIMIT ?4
                "#,
            )?;
            let rows = stmt.query_map(
                params![scope.kind(), scope.id(), after_id, to_sqlite_i64(limit + 1)?],
                |row| {
                    Ok(LogEntryRow {
                        id: row.get(0)?,
                        stream: parse_column(row, 1)?,
                        message: row.get(2)?,
                        created_at_ms: row.get(3)?,
                    })
                },
            )?;
            for row in rows {
                entries.push(row?);
            }
        }

        let has_more = entries.len() > limit;
        if has_more {
            entries.truncate(limit);
        }
        let next_after_id = entries.last().map(|entry| entry.id);
        Ok(LogPage {
            entries,
            next_after_id,
            has_more,
        })
    }
}
