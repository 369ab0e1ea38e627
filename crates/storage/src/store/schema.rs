#![forbid(unsafe_code)]

use super::StoreError;
use rusqlite::{Connection, params};

const SCHEMA_VERSION: &str = "1";

pub(super) fn install_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS env_pointers (
          build_id TEXT PRIMARY KEY,
          tenant TEXT NOT NULL,
          resource TEXT NOT NULL,
          status TEXT NOT NULL
            CHECK(status IN ('BUILDING','ACTIVE','INACTIVE','FAILED')),
          resource_version TEXT NOT NULL,
          content_digest TEXT NOT NULL,
          engine_spec TEXT NOT NULL,
          engine_version TEXT,
          interpreter_path TEXT NOT NULL,
          env_path TEXT NOT NULL,
          python_path TEXT,
          python_version TEXT,
          error TEXT,
          started_at_ms INTEGER NOT NULL,
          built_at_ms INTEGER,
          expires_at_ms INTEGER,
          last_used_at_ms INTEGER,
          retired_at_ms INTEGER
        );

        -- At most one ACTIVE and at most one BUILDING row per (tenant, resource).
        CREATE UNIQUE INDEX IF NOT EXISTS ux_env_pointers_active
          ON env_pointers(tenant, resource) WHERE status='ACTIVE';
        CREATE UNIQUE INDEX IF NOT EXISTS ux_env_pointers_building
          ON env_pointers(tenant, resource) WHERE status='BUILDING';
        CREATE INDEX IF NOT EXISTS idx_env_pointers_key_started
          ON env_pointers(tenant, resource, started_at_ms);

        CREATE TABLE IF NOT EXISTS runs (
          id TEXT PRIMARY KEY,
          tenant TEXT NOT NULL,
          resource TEXT NOT NULL,
          input_ref TEXT,
          validate_only INTEGER NOT NULL DEFAULT 0,
          status TEXT NOT NULL
            CHECK(status IN ('QUEUED','RUNNING','SUCCEEDED','FAILED','CANCELED')),
          exit_code INTEGER,
          summary TEXT,
          error_message TEXT,
          build_id TEXT,
          created_at_ms INTEGER NOT NULL,
          started_at_ms INTEGER,
          finished_at_ms INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_runs_key_status
          ON runs(tenant, resource, status);

        CREATE TABLE IF NOT EXISTS log_entries (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          scope_kind TEXT NOT NULL CHECK(scope_kind IN ('run','build')),
          scope_id TEXT NOT NULL,
          stream TEXT NOT NULL CHECK(stream IN ('stdout','stderr')),
          message TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_log_entries_scope
          ON log_entries(scope_kind, scope_id, id);

        CREATE TABLE IF NOT EXISTS pending_inputs (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          tenant TEXT NOT NULL,
          resource TEXT NOT NULL,
          input_ref TEXT NOT NULL,
          status TEXT NOT NULL CHECK(status IN ('PENDING','QUEUED')),
          run_id TEXT,
          created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_pending_inputs_key
          ON pending_inputs(tenant, resource, status, id);
        "#,
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
        params!["schema_version", SCHEMA_VERSION],
    )?;
    Ok(())
}
