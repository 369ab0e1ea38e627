#![forbid(unsafe_code)]

use super::*;
use envrun_core::ids::{ResourceId, TenantId};
use envrun_core::{BuildStatus, Fingerprint};
use rusqlite::{OptionalExtension, params};

const MAX_LIST_LIMIT: usize = 200;
const MAX_ERROR_LEN: usize = 4_000;
const STALE_BUILD_ERROR: &str = "timeout";

const POINTER_COLUMNS: &str = r#"
  build_id, tenant, resource, status,
  resource_version, content_digest, engine_spec, engine_version, interpreter_path,
  env_path, python_path, python_version, error,
  started_at_ms, built_at_ms, expires_at_ms, last_used_at_ms, retired_at_ms
"#;

fn read_pointer_row(row: &rusqlite::Row<'_>) -> Result<EnvPointerRow, rusqlite::Error> {
    Ok(EnvPointerRow {
        build_id: row.get(0)?,
        tenant: row.get(1)?,
        resource: row.get(2)?,
        status: parse_column(row, 3)?,
        fingerprint: Fingerprint {
            resource_version: row.get(4)?,
            content_digest: row.get(5)?,
            engine_spec: row.get(6)?,
            engine_version: row.get(7)?,
            interpreter_path: row.get(8)?,
        },
        env_path: row.get(9)?,
        python_path: row.get(10)?,
        python_version: row.get(11)?,
        error: row.get(12)?,
        started_at_ms: row.get(13)?,
        built_at_ms: row.get(14)?,
        expires_at_ms: row.get(15)?,
        last_used_at_ms: row.get(16)?,
        retired_at_ms: row.get(17)?,
    })
}

fn pointer_by_id(conn: &Connection, build_id: &str) -> Result<Option<EnvPointerRow>, StoreError> {
    let sql = format!("SELECT {POINTER_COLUMNS} FROM env_pointers WHERE build_id=?1");
    Ok(conn
        .query_row(&sql, params![build_id], read_pointer_row)
        .optional()?)
}

fn pointer_by_status(
    conn: &Connection,
    tenant: &str,
    resource: &str,
    status: BuildStatus,
) -> Result<Option<EnvPointerRow>, StoreError> {
    let sql = format!(
        "SELECT {POINTER_COLUMNS} FROM env_pointers WHERE tenant=?1 AND resource=?2 AND status=?3"
    );
    Ok(conn
        .query_row(
            &sql,
            params![tenant, resource, status.as_str()],
            read_pointer_row,
        )
        .optional()?)
}

fn query_pointers(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<EnvPointerRow>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, read_pointer_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn normalize_error(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "build failed".to_string();
    }
    trimmed.chars().take(MAX_ERROR_LEN).collect()
}

fn require_building(row: Option<EnvPointerRow>, build_id: &str) -> Result<EnvPointerRow, StoreError> {
    let Some(row) = row else {
        return Err(StoreError::UnknownId);
    };
    if row.status != BuildStatus::Building {
        return Err(StoreError::BuildNotBuilding {
            build_id: build_id.to_string(),
            status: row.status.as_str().to_string(),
        });
    }
    Ok(row)
}

impl SqliteStore {
    /// Claims the single BUILDING slot for (tenant, resource). A concurrent
    /// claimant surfaces as `BuildInProgress`.
    pub fn pointer_insert_building(
        &mut self,
        tenant: &TenantId,
        resource: &ResourceId,
        request: PointerInsertRequest,
    ) -> Result<EnvPointerRow, StoreError> {
        if request.build_id.trim().is_empty() {
            return Err(StoreError::InvalidInput("build_id must not be empty"));
        }
        let fp = &request.fingerprint;
        let tx = self.conn.transaction()?;
        let insert = tx.execute(
            r#"
            INSERT INTO env_pointers(
              build_id, tenant, resource, status,
              resource_version, content_digest, engine_spec, engine_version, interpreter_path,
              env_path, started_at_ms
            )
            VALUES (?1, ?2, ?3, 'BUILDING', ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                request.build_id,
                tenant.as_str(),
                resource.as_str(),
                fp.resource_version,
                fp.content_digest,
                fp.engine_spec,
                fp.engine_version,
                fp.interpreter_path,
                request.env_path,
                request.now_ms,
            ],
        );
        if let Err(err) = insert {
            if is_constraint_violation(&err) {
                return Err(StoreError::BuildInProgress {
                    tenant: tenant.as_str().to_string(),
                    resource: resource.as_str().to_string(),
                });
            }
            return Err(StoreError::Sql(err));
        }
        let row = pointer_by_id(&tx, &request.build_id)?.ok_or(StoreError::UnknownId)?;
        tx.commit()?;
        Ok(row)
    }

    pub fn pointer_get(&self, build_id: &str) -> Result<Option<EnvPointerRow>, StoreError> {
        pointer_by_id(&self.conn, build_id)
    }

    pub fn pointer_active(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
    ) -> Result<Option<EnvPointerRow>, StoreError> {
        pointer_by_status(
            &self.conn,
            tenant.as_str(),
            resource.as_str(),
            BuildStatus::Active,
        )
    }

    pub fn pointer_building(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
    ) -> Result<Option<EnvPointerRow>, StoreError> {
        pointer_by_status(
            &self.conn,
            tenant.as_str(),
            resource.as_str(),
            BuildStatus::Building,
        )
    }

    /// Most recently started row for (tenant, resource), whatever its status.
    pub fn pointer_latest(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
    ) -> Result<Option<EnvPointerRow>, StoreError> {
        let sql = format!(
            r#"
            SELECT {POINTER_COLUMNS} FROM env_pointers
            WHERE tenant=?1 AND resource=?2
            ORDER BY started_at_ms DESC, rowid DESC
            LIMIT 1
            "#
        );
        Ok(self
            .conn
            .query_row(
                &sql,
                params![tenant.as_str(), resource.as_str()],
                read_pointer_row,
            )
            .optional()?)
    }

    pub fn pointers_list(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
        limit: usize,
    ) -> Result<Vec<EnvPointerRow>, StoreError> {
        let limit = to_sqlite_i64(limit.clamp(1, MAX_LIST_LIMIT))?;
        let sql = format!(
            r#"
            SELECT {POINTER_COLUMNS} FROM env_pointers
            WHERE tenant=?1 AND resource=?2
            ORDER BY started_at_ms DESC, rowid DESC
            LIMIT ?3
            "#
        );
        query_pointers(
            &self.conn,
            &sql,
            params![tenant.as_str(), resource.as_str(), limit],
        )
    }

    /// Advances `last_used_at_ms` on an ACTIVE row. `None` when the row is no
    /// longer ACTIVE (it was superseded in the meantime).
    pub fn pointer_touch(
        &mut self,
        build_id: &str,
        now_ms: i64,
    ) -> Result<Option<EnvPointerRow>, StoreError> {
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            r#"
            UPDATE env_pointers
            SET last_used_at_ms=MAX(COALESCE(last_used_at_ms, 0), ?2)
            WHERE build_id=?1 AND status='ACTIVE'
            "#,
            params![build_id, now_ms],
        )?;
        if changed != 1 {
            return Ok(None);
        }
        let row = pointer_by_id(&tx, build_id)?;
        tx.commit()?;
        Ok(row)
    }

    /// BUILDING -> ACTIVE. Any other ACTIVE row for the same key is demoted to
    /// INACTIVE in the same transaction, before the promotion, so the partial
    /// unique index never sees two ACTIVE rows.
    pub fn pointer_activate(
        &mut self,
        request: PointerActivateRequest,
    ) -> Result<PointerActivateResult, StoreError> {
        let now_ms = request.now_ms;
        let tx = self.conn.transaction()?;
        let current = require_building(pointer_by_id(&tx, &request.build_id)?, &request.build_id)?;

        let mut demoted = Vec::new();
        {
            let mut stmt = tx.prepare(
                r#"
                SELECT build_id FROM env_pointers
                WHERE tenant=?1 AND resource=?2 AND status='ACTIVE' AND build_id<>?3
                "#,
            )?;
            let rows = stmt.query_map(
                params![current.tenant, current.resource, current.build_id],
                |row| row.get::<_, String>(0),
            )?;
            for row in rows {
                demoted.push(row?);
            }
        }
        for build_id in &demoted {
            tx.execute(
                r#"
                UPDATE env_pointers
                SET status='INACTIVE', retired_at_ms=?2
                WHERE build_id=?1 AND status='ACTIVE'
                "#,
                params![build_id, now_ms],
            )?;
        }

        let artifacts = &request.artifacts;
        let changed = tx.execute(
            r#"
            UPDATE env_pointers
            SET status='ACTIVE', engine_version=?2, python_path=?3, python_version=?4,
                error=NULL, built_at_ms=?5, expires_at_ms=?6, last_used_at_ms=?5
            WHERE build_id=?1 AND status='BUILDING'
            "#,
            params![
                request.build_id,
                artifacts.engine_version,
                artifacts.python_path,
                artifacts.python_version,
                now_ms,
                request.expires_at_ms,
            ],
        )?;
        if changed != 1 {
            return Err(StoreError::BuildNotBuilding {
                build_id: request.build_id,
                status: current.status.as_str().to_string(),
            });
        }

        let pointer = pointer_by_id(&tx, &request.build_id)?.ok_or(StoreError::UnknownId)?;
        tx.commit()?;
        Ok(PointerActivateResult { pointer, demoted })
    }

    /// BUILDING -> FAILED with the error message and retirement time.
    pub fn pointer_fail(&mut self, request: PointerFailRequest) -> Result<EnvPointerRow, StoreError> {
        let error = normalize_error(&request.error);
        let tx = self.conn.transaction()?;
        require_building(pointer_by_id(&tx, &request.build_id)?, &request.build_id)?;
        tx.execute(
            r#"
            UPDATE env_pointers
            SET status='FAILED', error=?2, retired_at_ms=?3
            WHERE build_id=?1 AND status='BUILDING'
            "#,
            params![request.build_id, error, request.now_ms],
        )?;
        let row = pointer_by_id(&tx, &request.build_id)?.ok_or(StoreError::UnknownId)?;
        tx.commit()?;
        Ok(row)
    }

    /// Fails BUILDING rows that started before `cutoff_ms`; their builder is
    /// presumed dead. Returns the healed rows so the caller can drop their
    /// directories.
    pub fn pointers_heal_stale(
        &mut self,
        tenant: &TenantId,
        resource: &ResourceId,
        cutoff_ms: i64,
        now_ms: i64,
    ) -> Result<Vec<EnvPointerRow>, StoreError> {
        let tx = self.conn.transaction()?;
        let sql = format!(
            r#"
            SELECT {POINTER_COLUMNS} FROM env_pointers
            WHERE tenant=?1 AND resource=?2 AND status='BUILDING' AND started_at_ms < ?3
            "#
        );
        let stale = query_pointers(
            &tx,
            &sql,
            params![tenant.as_str(), resource.as_str(), cutoff_ms],
        )?;
        let mut healed = Vec::with_capacity(stale.len());
        for row in stale {
            tx.execute(
                r#"
                UPDATE env_pointers
                SET status='FAILED', error=?2, retired_at_ms=?3
                WHERE build_id=?1 AND status='BUILDING'
                "#,
                params![row.build_id, STALE_BUILD_ERROR, now_ms],
            )?;
            if let Some(updated) = pointer_by_id(&tx, &row.build_id)? {
                healed.push(updated);
            }
        }
        tx.commit()?;
        Ok(healed)
    }

    /// Deletes INACTIVE/FAILED rows retired before `cutoff_ms` and returns them.
    pub fn pointers_prune(
        &mut self,
        tenant: &TenantId,
        resource: &ResourceId,
        cutoff_ms: i64,
    ) -> Result<Vec<EnvPointerRow>, StoreError> {
        let tx = self.conn.transaction()?;
        let sql = format!(
            r#"
            SELECT {POINTER_COLUMNS} FROM env_pointers
            WHERE tenant=?1 AND resource=?2
              AND status IN ('INACTIVE','FAILED')
              AND COALESCE(retired_at_ms, started_at_ms) < ?3
            ORDER BY started_at_ms ASC
            "#
        );
        let doomed = query_pointers(
            &tx,
            &sql,
            params![tenant.as_str(), resource.as_str(), cutoff_ms],
        )?;
        for row in &doomed {
            tx.execute(
                "DELETE FROM env_pointers WHERE build_id=?1 AND status IN ('INACTIVE','FAILED')",
                params![row.build_id],
            )?;
            tx.execute(
                "DELETE FROM log_entries WHERE scope_kind='build' AND scope_id=?1",
                params![row.build_id],
            )?;
        }
        tx.commit()?;
        Ok(doomed)
    }
}
