#![forbid(unsafe_code)]

use super::runs::{InsertRunArgs, active_run_count, insert_queued_run};
use super::*;
use envrun_core::ids::{ResourceId, TenantId};
use rusqlite::params;

const MAX_INPUT_REF_LEN: usize = 1_024;
const MAX_LIST_LIMIT: usize = 200;

fn read_pending_row(row: &rusqlite::Row<'_>) -> Result<PendingInputRow, rusqlite::Error> {
    let status: String = row.get(4)?;
    Ok(PendingInputRow {
        id: row.get(0)?,
        tenant: row.get(1)?,
        resource: row.get(2)?,
        input_ref: row.get(3)?,
        queued: status == "QUEUED",
        run_id: row.get(5)?,
        created_at_ms: row.get(6)?,
    })
}

impl SqliteStore {
    /// Registers an input that should eventually run against (tenant, resource)
    /// once queue capacity allows.
    pub fn pending_input_add(
        &mut self,
        tenant: &TenantId,
        resource: &ResourceId,
        input_ref: &str,
        now_ms: i64,
    ) -> Result<PendingInputRow, StoreError> {
        let input_ref = input_ref.trim();
        if input_ref.is_empty() {
            return Err(StoreError::InvalidInput("input_ref must not be empty"));
        }
        if input_ref.len() > MAX_INPUT_REF_LEN {
            return Err(StoreError::InvalidInput("input_ref is too long"));
        }
        self.conn.execute(
            r#"
            INSERT INTO pending_inputs(tenant, resource, input_ref, status, created_at_ms)
            VALUES (?1, ?2, ?3, 'PENDING', ?4)
            "#,
            params![tenant.as_str(), resource.as_str(), input_ref, now_ms],
        )?;
        Ok(PendingInputRow {
            id: self.conn.last_insert_rowid(),
            tenant: tenant.as_str().to_string(),
            resource: resource.as_str().to_string(),
            input_ref: input_ref.to_string(),
            queued: false,
            run_id: None,
            created_at_ms: now_ms,
        })
    }

    pub fn pending_inputs_list(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
        include_queued: bool,
        limit: usize,
    ) -> Result<Vec<PendingInputRow>, StoreError> {
        let limit = to_sqlite_i64(limit.clamp(1, MAX_LIST_LIMIT))?;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, tenant, resource, input_ref, status, run_id, created_at_ms
            FROM pending_inputs
            WHERE tenant=?1 AND resource=?2 AND (?3 OR status='PENDING')
            ORDER BY id ASC
            LIMIT ?4
            "#,
        )?;
        let rows = stmt.query_map(
            params![tenant.as_str(), resource.as_str(), include_queued, limit],
            read_pending_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Converts the oldest PENDING inputs into QUEUED runs, as many as the
    /// remaining queue capacity allows. Capacity check and inserts share one
    /// transaction.
    pub fn pending_inputs_backfill(
        &mut self,
        tenant: &TenantId,
        resource: &ResourceId,
        request: BackfillRequest,
        mut next_run_id: impl FnMut() -> String,
    ) -> Result<Vec<RunRow>, StoreError> {
        let tx = self.conn.transaction()?;
        let active = active_run_count(&tx, tenant.as_str(), resource.as_str())?;
        let capacity = request.max_queue.saturating_sub(active);
        if capacity == 0 {
            return Ok(Vec::new());
        }

        let pending: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id, input_ref FROM pending_inputs
                WHERE tenant=?1 AND resource=?2 AND status='PENDING'
                ORDER BY id ASC
                LIMIT ?3
                "#,
            )?;
            let rows = stmt.query_map(
                params![tenant.as_str(), resource.as_str(), i64::from(capacity)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        let mut queued = Vec::with_capacity(pending.len());
        for (pending_id, input_ref) in pending {
            let run_id = next_run_id();
            let run = insert_queued_run(
                &tx,
                InsertRunArgs {
                    id: &run_id,
                    tenant: tenant.as_str(),
                    resource: resource.as_str(),
                    input_ref: Some(&input_ref),
                    validate_only: false,
                    now_ms: request.now_ms,
                },
            )?;
            tx.execute(
                "UPDATE pending_inputs SET status='QUEUED', run_id=?2 WHERE id=?1 AND status='PENDING'",
                params![pending_id, run_id],
            )?;
            queued.push(run);
        }
        tx.commit()?;
        Ok(queued)
    }
}
