#![forbid(unsafe_code)]

//! JSON shapes printed by the CLI.

use crate::build_orchestrator::EnsureOutcome;
use crate::clock::ms_to_rfc3339;
use envrun_storage::{EnvPointerRow, LogPage, PendingInputRow, RunRow};
use serde_json::{Value, json};

fn ts(ms: Option<i64>) -> Value {
    ms.map_or(Value::Null, |ms| Value::String(ms_to_rfc3339(ms)))
}

pub fn pointer_json(row: &EnvPointerRow) -> Value {
    json!({
        "build_id": row.build_id,
        "tenant": row.tenant,
        "resource": row.resource,
        "status": row.status.as_str(),
        "environment_ref": row.environment_ref(),
        "fingerprint": {
            "resource_version": row.fingerprint.resource_version,
            "content_digest": row.fingerprint.content_digest,
            "engine_spec": row.fingerprint.engine_spec,
            "engine_version": row.fingerprint.engine_version,
            "interpreter_path": row.fingerprint.interpreter_path,
        },
        "env_path": row.env_path,
        "python_path": row.python_path,
        "python_version": row.python_version,
        "error": row.error,
        "started_at": ts(Some(row.started_at_ms)),
        "built_at": ts(row.built_at_ms),
        "expires_at": ts(row.expires_at_ms),
        "last_used_at": ts(row.last_used_at_ms),
        "retired_at": ts(row.retired_at_ms),
    })
}

pub fn ensure_json(outcome: &EnsureOutcome) -> Value {
    match outcome {
        EnsureOutcome::Active { pointer, reused } => json!({
            "status": "ACTIVE",
            "reused": reused,
            "pointer": pointer_json(pointer),
        }),
        EnsureOutcome::Building => json!({ "status": "BUILDING", "pointer": null }),
    }
}

pub fn run_json(row: &RunRow) -> Value {
    json!({
        "id": row.id,
        "tenant": row.tenant,
        "resource": row.resource,
        "input_ref": row.input_ref,
        "validate_only": row.validate_only,
        "status": row.status.as_str(),
        "exit_code": row.exit_code,
        "summary": row.summary,
        "error_message": row.error_message,
        "build_id": row.build_id,
        "created_at": ts(Some(row.created_at_ms)),
        "started_at": ts(row.started_at_ms),
        "finished_at": ts(row.finished_at_ms),
    })
}

pub fn logs_json(page: &LogPage) -> Value {
    let entries: Vec<Value> = page
        .entries
        .iter()
        .map(|entry| {
            json!({
                "id": entry.id,
                "stream": entry.stream.as_str(),
                "message": entry.message,
                "created_at": ts(Some(entry.created_at_ms)),
            })
        })
        .collect();
    json!({
        "entries": entries,
        "next_after_id": page.next_after_id,
        "has_more": page.has_more,
    })
}

pub fn pending_json(row: &PendingInputRow) -> Value {
    json!({
        "id": row.id,
        "input_ref": row.input_ref,
        "status": if row.queued { "QUEUED" } else { "PENDING" },
        "run_id": row.run_id,
        "created_at": ts(Some(row.created_at_ms)),
    })
}
