#![forbid(unsafe_code)]

use super::*;
use envrun_core::RunStatus;
use envrun_core::ids::{ResourceId, TenantId};
use rusqlite::{OptionalExtension, params};

const MAX_LIST_LIMIT: usize = 200;
const MAX_SUMMARY_LEN: usize = 64_000;
const MAX_ERROR_LEN: usize = 4_000;
const MAX_INPUT_REF_LEN: usize = 1_024;

const RUN_COLUMNS: &str = r#"
  id, tenant, resource, input_ref, validate_only, status, exit_code, summary,
  error_message, build_id, created_at_ms, started_at_ms, finished_at_ms
"#;

fn read_run_row(row: &rusqlite::Row<'_>) -> Result<RunRow, rusqlite::Error> {
    Ok(RunRow {
        id: row.get(0)?,
        tenant: row.get(1)?,
        resource: row.get(2)?,
        input_ref: row.get(3)?,
        validate_only: row.get(4)?,
        status: parse_column(row, 5)?,
        exit_code: row.get(6)?,
        summary: row.get(7)?,
        error_message: row.get(8)?,
        build_id: row.get(9)?,
        created_at_ms: row.get(10)?,
        started_at_ms: row.get(11)?,
        finished_at_ms: row.get(12)?,
    })
}

pub(super) fn run_by_id(conn: &Connection, id: &str) -> Result<Option<RunRow>, StoreError> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id=?1");
    Ok(conn.query_row(&sql, params![id], read_run_row).optional()?)
}

pub(super) fn active_run_count(
    conn: &Connection,
    tenant: &str,
    resource: &str,
) -> Result<u32, StoreError> {
    let count: i64 = conn.query_row(
        r#"
        SELECT COUNT(*) FROM runs
        WHERE tenant=?1 AND resource=?2 AND status IN ('QUEUED','RUNNING')
        "#,
        params![tenant, resource],
        |row| row.get(0),
    )?;
    Ok(u32::try_from(count.max(0)).unwrap_or(u32::MAX))
}

pub(super) struct InsertRunArgs<'a> {
    pub(super) id: &'a str,
    pub(super) tenant: &'a str,
    pub(super) resource: &'a str,
    pub(super) input_ref: Option<&'a str>,
    pub(super) validate_only: bool,
    pub(super) now_ms: i64,
}

pub(super) fn insert_queued_run(conn: &Connection, args: InsertRunArgs<'_>) -> Result<RunRow, StoreError> {
    conn.execute(
        r#"
        INSERT INTO runs(id, tenant, resource, input_ref, validate_only, status, created_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, 'QUEUED', ?6)
        "#,
        params![
            args.id,
            args.tenant,
            args.resource,
            args.input_ref,
            args.validate_only,
            args.now_ms
        ],
    )?;
    run_by_id(conn, args.id)?.ok_or(StoreError::UnknownId)
}

fn normalize_input_ref(raw: Option<String>) -> Result<Option<String>, StoreError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.len() > MAX_INPUT_REF_LEN {
        return Err(StoreError::InvalidInput("input_ref is too long"));
    }
    Ok(Some(trimmed.to_string()))
}

fn clip(raw: Option<String>, max: usize) -> Option<String> {
    raw.map(|s| s.trim().chars().take(max).collect::<String>())
        .filter(|s| !s.is_empty())
}

impl SqliteStore {
    /// Inserts a QUEUED run unless the admission ceiling is already reached;
    /// a rejected request leaves no row behind.
    pub fn run_create(
        &mut self,
        tenant: &TenantId,
        resource: &ResourceId,
        request: RunCreateRequest,
    ) -> Result<RunRow, StoreError> {
        if request.id.trim().is_empty() {
            return Err(StoreError::InvalidInput("run id must not be empty"));
        }
        let input_ref = normalize_input_ref(request.input_ref)?;
        let tx = self.conn.transaction()?;

        let active = active_run_count(&tx, tenant.as_str(), resource.as_str())?;
        if active >= request.max_queue {
            return Err(StoreError::QueueFull {
                limit: request.max_queue,
                active,
            });
        }

        let run = insert_queued_run(
            &tx,
            InsertRunArgs {
                id: &request.id,
                tenant: tenant.as_str(),
                resource: resource.as_str(),
                input_ref: input_ref.as_deref(),
                validate_only: request.validate_only,
                now_ms: request.now_ms,
            },
        )?;
        tx.commit()?;
        Ok(run)
    }

    pub fn run_get(&self, id: &str) -> Result<Option<RunRow>, StoreError> {
        run_by_id(&self.conn, id)
    }

    pub fn runs_list(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
        request: RunsListRequest,
    ) -> Result<Vec<RunRow>, StoreError> {
        let limit = to_sqlite_i64(request.limit.clamp(1, MAX_LIST_LIMIT))?;
        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS} FROM runs
            WHERE tenant=?1 AND resource=?2 AND (?3 IS NULL OR status=?3)
            ORDER BY created_at_ms DESC, rowid DESC
            LIMIT ?4
            "#
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                tenant.as_str(),
                resource.as_str(),
                request.status.map(RunStatus::as_str),
                limit
            ],
            read_run_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// QUEUED + RUNNING runs for (tenant, resource).
    pub fn runs_active_count(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
    ) -> Result<u32, StoreError> {
        active_run_count(&self.conn, tenant.as_str(), resource.as_str())
    }

    /// QUEUED -> RUNNING.
    pub fn run_start(&mut self, id: &str, now_ms: i64) -> Result<RunRow, StoreError> {
        let tx = self.conn.transaction()?;
        let Some(current) = run_by_id(&tx, id)? else {
            return Err(StoreError::UnknownId);
        };
        let changed = tx.execute(
            "UPDATE runs SET status='RUNNING', started_at_ms=?2 WHERE id=?1 AND status='QUEUED'",
            params![id, now_ms],
        )?;
        if changed != 1 {
            return Err(StoreError::RunStatusMismatch {
                run_id: id.to_string(),
                status: current.status.as_str().to_string(),
                expected: "QUEUED",
            });
        }
        let run = run_by_id(&tx, id)?.ok_or(StoreError::UnknownId)?;
        tx.commit()?;
        Ok(run)
    }

    /// Records which environment a run executes against.
    pub fn run_set_build(&mut self, id: &str, build_id: &str) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE runs SET build_id=?2 WHERE id=?1",
            params![id, build_id],
        )?;
        if changed != 1 {
            return Err(StoreError::UnknownId);
        }
        Ok(())
    }

    /// Applies the single terminal transition. A second attempt (for example a
    /// cancellation racing a normal completion) observes `applied == false` and
    /// leaves the first outcome untouched.
    pub fn run_finish(&mut self, request: RunFinishRequest) -> Result<RunFinishResult, StoreError> {
        if !request.status.is_terminal() {
            return Err(StoreError::InvalidInput("run_finish status must be terminal"));
        }
        let summary = clip(request.summary, MAX_SUMMARY_LEN);
        let error_message = clip(request.error_message, MAX_ERROR_LEN);

        let tx = self.conn.transaction()?;
        let Some(current) = run_by_id(&tx, &request.id)? else {
            return Err(StoreError::UnknownId);
        };
        if current.status.is_terminal() {
            return Ok(RunFinishResult {
                run: current,
                applied: false,
            });
        }

        let changed = tx.execute(
            r#"
            UPDATE runs
            SET status=?2, exit_code=?3, summary=COALESCE(?4, summary), error_message=?5,
                finished_at_ms=?6
            WHERE id=?1 AND status IN ('QUEUED','RUNNING')
            "#,
            params![
                request.id,
                request.status.as_str(),
                request.exit_code,
                summary,
                error_message,
                request.now_ms
            ],
        )?;
        let run = run_by_id(&tx, &request.id)?.ok_or(StoreError::UnknownId)?;
        tx.commit()?;
        Ok(RunFinishResult {
            run,
            applied: changed == 1,
        })
    }
}
