#![forbid(unsafe_code)]

//! Run lifecycle: admission, execution against the active environment,
//! event streaming with persisted logs, cancellation and queue backfill.

use crate::build_orchestrator::{BuildOrchestrator, EnsureOptions};
use crate::clock::Clock;
use crate::collaborators::{InputResolver, run_blocking};
use crate::error::OrchestratorError;
use crate::process::ProcessLines;
use crate::store::StoreHandle;
use envrun_core::ids::{ResourceId, TenantId};
use envrun_core::{Event, EventPayload, LogScope, LogStream, RunStatus};
use envrun_storage::{
    BackfillRequest, LogPage, PendingInputRow, RunCreateRequest, RunFinishRequest, RunRow,
    RunsListRequest,
};
use futures::StreamExt as _;
use futures::stream::BoxStream;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CANCELED_MESSAGE: &str = "run canceled by caller";
const RUNS_DIRNAME: &str = "runs";
const SUMMARY_EVENT: &str = "summary";

pub type RunStream = BoxStream<'static, Result<Event, OrchestratorError>>;

/// How the engine process is launched. `program` defaults to the active
/// environment's interpreter.
#[derive(Clone, Debug)]
pub struct EngineCommand {
    pub program: Option<String>,
    pub args: Vec<String>,
}

impl EngineCommand {
    pub fn python_module(module: &str) -> Self {
        Self {
            program: None,
            args: vec!["-m".to_string(), module.to_string()],
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunSettings {
    /// Ceiling on QUEUED + RUNNING runs per (tenant, resource).
    pub max_queue: u32,
    /// Skip engine execution entirely; runs still complete SUCCEEDED.
    pub safe_mode: bool,
    pub engine: EngineCommand,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_queue: 10,
            safe_mode: false,
            engine: EngineCommand::python_module("envrun_engine"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PrepareOptions {
    pub input_ref: Option<String>,
    pub validate_only: bool,
}

#[derive(Clone, Debug, Default)]
pub struct StreamOptions {
    pub cancel: CancellationToken,
}

/// Everything needed to execute a prepared run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: String,
    pub tenant: TenantId,
    pub resource: ResourceId,
    pub input_ref: Option<String>,
    pub validate_only: bool,
}

impl RunContext {
    pub fn from_row(row: &RunRow) -> Result<Self, OrchestratorError> {
        Ok(Self {
            run_id: row.id.clone(),
            tenant: TenantId::try_new(row.tenant.clone())?,
            resource: ResourceId::try_new(row.resource.clone())?,
            input_ref: row.input_ref.clone(),
            validate_only: row.validate_only,
        })
    }
}

enum ExecItem {
    Log { stream: LogStream, message: String },
    Summary(String),
    Finished { exit_code: Option<i32> },
    Failed(String),
}

struct Outcome {
    status: RunStatus,
    exit_code: Option<i32>,
    error: Option<String>,
}

impl Outcome {
    fn exited(exit_code: Option<i32>) -> Self {
        let error = match exit_code {
            Some(0) => None,
            Some(code) => Some(format!("engine exited with code {code}")),
            None => Some("engine terminated by signal".to_string()),
        };
        Self {
            status: RunStatus::from_exit_code(exit_code),
            exit_code,
            error,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            status: RunStatus::Failed,
            exit_code: None,
            error: Some(message),
        }
    }

    fn canceled() -> Self {
        Self {
            status: RunStatus::Canceled,
            exit_code: None,
            error: Some(CANCELED_MESSAGE.to_string()),
        }
    }
}

struct Launched {
    child: Child,
    env_ref: String,
}

#[derive(Clone)]
pub struct RunOrchestrator {
    store: StoreHandle,
    builds: BuildOrchestrator,
    inputs: Arc<dyn InputResolver>,
    clock: Arc<dyn Clock>,
    settings: RunSettings,
    dispatch: Option<mpsc::UnboundedSender<RunContext>>,
}

/// Finalizes the run as CANCELED when the stream goes away before it did.
struct TerminalGuard {
    orch: RunOrchestrator,
    ctx: RunContext,
    armed: bool,
}

impl TerminalGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(run_id = %self.ctx.run_id, "run stream dropped before completion");
        // A stream dropped before its first poll never started the run; it
        // still passes through RUNNING on the way to CANCELED.
        let now_ms = self.orch.clock.now_ms();
        if let Err(err) = self
            .orch
            .store
            .with(|s| s.run_start(&self.ctx.run_id, now_ms))
        {
            debug!(run_id = %self.ctx.run_id, error = %err, "run already left QUEUED");
        }
        self.orch
            .append_log(&self.ctx.run_id, LogStream::Stderr, CANCELED_MESSAGE);
        self.orch.finish(&self.ctx, Outcome::canceled(), None);
    }
}

impl RunOrchestrator {
    pub fn new(
        store: StoreHandle,
        builds: BuildOrchestrator,
        inputs: Arc<dyn InputResolver>,
        clock: Arc<dyn Clock>,
        settings: RunSettings,
    ) -> Self {
        Self {
            store,
            builds,
            inputs,
            clock,
            settings,
            dispatch: None,
        }
    }

    /// Backfilled runs are handed to `dispatch`; whoever owns the receiver
    /// decides when to execute them.
    pub fn with_dispatch(mut self, dispatch: mpsc::UnboundedSender<RunContext>) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Admits a new QUEUED run, or rejects it with `QueueFull` without
    /// inserting anything.
    pub fn prepare(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
        options: PrepareOptions,
    ) -> Result<(RunRow, RunContext), OrchestratorError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let now_ms = self.clock.now_ms();
        let run = self.store.with(|s| {
            s.run_create(
                tenant,
                resource,
                RunCreateRequest {
                    id: run_id.clone(),
                    input_ref: options.input_ref.clone(),
                    validate_only: options.validate_only,
                    max_queue: self.settings.max_queue,
                    now_ms,
                },
            )
        })?;
        info!(%tenant, %resource, run_id = %run.id, validate_only = run.validate_only, "run queued");
        let ctx = RunContext::from_row(&run)?;
        Ok((run, ctx))
    }

    /// created, started, log*, completed. Cancelling through the token
    /// persists CANCELED and then yields `Err(Canceled)` as the last item;
    /// dropping the stream persists CANCELED as well, moving a never-polled
    /// run through RUNNING first.
    ///
    /// A run that is no longer QUEUED cannot start again: its stream is
    /// created, one stderr log, completed, with no `started`. The terminal
    /// transition only applies once, so an already finished record is
    /// reported unchanged.
    pub fn stream(&self, ctx: RunContext, options: StreamOptions) -> RunStream {
        let guard = TerminalGuard {
            orch: self.clone(),
            ctx: ctx.clone(),
            armed: true,
        };
        Box::pin(run_stream(self.clone(), ctx, options.cancel, guard))
    }

    pub async fn run_to_completion(
        &self,
        ctx: RunContext,
        options: StreamOptions,
    ) -> Result<RunRow, OrchestratorError> {
        let run_id = ctx.run_id.clone();
        let mut events = self.stream(ctx, options);
        while let Some(item) = events.next().await {
            item?;
        }
        self.get_run(&run_id)
    }

    pub fn get_run(&self, run_id: &str) -> Result<RunRow, OrchestratorError> {
        self.store
            .with(|s| s.run_get(run_id))?
            .ok_or_else(|| OrchestratorError::NotFound(format!("run {run_id}")))
    }

    pub fn list_runs(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<Vec<RunRow>, OrchestratorError> {
        Ok(self
            .store
            .with(|s| s.runs_list(tenant, resource, RunsListRequest { status, limit }))?)
    }

    pub fn list_run_logs(
        &self,
        run_id: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<LogPage, OrchestratorError> {
        self.get_run(run_id)?;
        let scope = LogScope::Run(run_id.to_string());
        Ok(self.store.with(|s| s.logs_list(&scope, after_id, limit))?)
    }

    /// Registers an input for later execution and immediately tops up the
    /// queue.
    pub fn enqueue_input(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
        input_ref: &str,
    ) -> Result<(PendingInputRow, Vec<RunRow>), OrchestratorError> {
        let now_ms = self.clock.now_ms();
        let pending = self
            .store
            .with(|s| s.pending_input_add(tenant, resource, input_ref, now_ms))?;
        let queued = self.backfill(tenant, resource)?;
        Ok((pending, queued))
    }

    /// Converts pending inputs into QUEUED runs while capacity allows and
    /// hands each new run to the dispatch channel.
    pub fn backfill(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
    ) -> Result<Vec<RunRow>, OrchestratorError> {
        let request = BackfillRequest {
            max_queue: self.settings.max_queue,
            now_ms: self.clock.now_ms(),
        };
        let queued = self.store.with(|s| {
            s.pending_inputs_backfill(tenant, resource, request, || {
                uuid::Uuid::new_v4().to_string()
            })
        })?;
        for run in &queued {
            info!(%tenant, %resource, run_id = %run.id, "backfilled pending input");
            if let Some(dispatch) = &self.dispatch {
                let ctx = RunContext {
                    run_id: run.id.clone(),
                    tenant: tenant.clone(),
                    resource: resource.clone(),
                    input_ref: run.input_ref.clone(),
                    validate_only: run.validate_only,
                };
                if dispatch.send(ctx).is_err() {
                    debug!(run_id = %run.id, "dispatch receiver is gone");
                }
            }
        }
        Ok(queued)
    }

    fn event(&self, run_id: &str, payload: EventPayload) -> Event {
        Event::new(run_id, self.clock.now_ms(), payload)
    }

    /// Persists one log line and returns the text as stored, so streamed and
    /// persisted logs agree even when the store clips a long line.
    fn append_log(&self, run_id: &str, stream: LogStream, message: &str) -> String {
        let scope = LogScope::Run(run_id.to_string());
        let now_ms = self.clock.now_ms();
        match self
            .store
            .with(|s| s.log_append(&scope, stream, message, now_ms))
        {
            Ok(entry) => entry.message,
            Err(err) => {
                warn!(%run_id, error = %err, "failed to persist run log");
                message.to_string()
            }
        }
    }

    /// Applies the terminal transition, backfills, and returns the completed
    /// event built from the persisted record.
    fn finish(&self, ctx: &RunContext, outcome: Outcome, summary: Option<String>) -> Event {
        let now_ms = self.clock.now_ms();
        let finished = self.store.with(|s| {
            s.run_finish(RunFinishRequest {
                id: ctx.run_id.clone(),
                status: outcome.status,
                exit_code: outcome.exit_code,
                summary,
                error_message: outcome.error.clone(),
                now_ms,
            })
        });
        let completed = match finished {
            Ok(finished) => {
                if finished.applied {
                    info!(run_id = %ctx.run_id, status = %finished.run.status, exit_code = ?finished.run.exit_code, "run finished");
                } else {
                    debug!(run_id = %ctx.run_id, status = %finished.run.status, "run was already terminal");
                }
                EventPayload::Completed {
                    status: finished.run.status.as_str().to_string(),
                    exit_code: finished.run.exit_code,
                    error: finished.run.error_message,
                }
            }
            Err(err) => {
                warn!(run_id = %ctx.run_id, error = %err, "failed to persist run outcome");
                EventPayload::Completed {
                    status: outcome.status.as_str().to_string(),
                    exit_code: outcome.exit_code,
                    error: outcome.error,
                }
            }
        };
        if let Err(err) = self.backfill(&ctx.tenant, &ctx.resource) {
            warn!(run_id = %ctx.run_id, error = %err, "backfill failed");
        }
        self.event(&ctx.run_id, completed)
    }

    async fn launch(&self, ctx: &RunContext) -> Result<Launched, OrchestratorError> {
        let (ensured, descriptor) = self
            .builds
            .ensure_described(&ctx.tenant, &ctx.resource, EnsureOptions::default())
            .await?;
        let Some(pointer) = ensured.pointer().cloned() else {
            return Err(OrchestratorError::AlreadyInProgress {
                tenant: ctx.tenant.to_string(),
                resource: ctx.resource.to_string(),
            });
        };
        self.store
            .with(|s| s.run_set_build(&ctx.run_id, &pointer.build_id))?;

        let work_dir = self
            .store
            .storage_dir()
            .join(RUNS_DIRNAME)
            .join(&ctx.run_id);
        let output_dir = work_dir.join("output");
        tokio::fs::create_dir_all(&output_dir).await?;

        let input_path = match ctx.input_ref.as_deref() {
            Some(input_ref) => Some(self.stage_input(ctx, input_ref, &work_dir).await?),
            None => None,
        };

        let program = self
            .settings
            .engine
            .program
            .clone()
            .or_else(|| pointer.python_path.clone())
            .ok_or_else(|| OrchestratorError::Execution {
                id: pointer.build_id.clone(),
                message: "environment has no interpreter".to_string(),
            })?;

        let mut cmd = Command::new(&program);
        cmd.args(&self.settings.engine.args)
            .arg("--resource")
            .arg(&descriptor.resource_dir);
        if let Some(input_path) = &input_path {
            cmd.arg("--input").arg(input_path);
        }
        cmd.arg("--output")
            .arg(&output_dir)
            .current_dir(&work_dir)
            .env("ENVRUN_RUN_ID", &ctx.run_id)
            .env("ENVRUN_ENV_REF", pointer.environment_ref())
            .env("VIRTUAL_ENV", &pointer.env_path)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd.spawn().map_err(|err| OrchestratorError::Execution {
            id: ctx.run_id.clone(),
            message: format!("failed to spawn engine ({program}): {err}"),
        })?;
        debug!(run_id = %ctx.run_id, %program, "engine spawned");

        Ok(Launched {
            child,
            env_ref: pointer.environment_ref(),
        })
    }

    async fn stage_input(
        &self,
        ctx: &RunContext,
        input_ref: &str,
        work_dir: &Path,
    ) -> Result<PathBuf, OrchestratorError> {
        let inputs = self.inputs.clone();
        let (tenant, owned_ref) = (ctx.tenant.clone(), input_ref.to_string());
        let bytes = run_blocking(move || inputs.resolve(&tenant, &owned_ref)).await?;
        let name = Path::new(input_ref)
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "input".into());
        let input_dir = work_dir.join("input");
        tokio::fs::create_dir_all(&input_dir).await?;
        let path = input_dir.join(name);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

/// Text of a `{"event": "summary", "data": ...}` telemetry frame.
fn telemetry_summary(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let frame: Value = serde_json::from_str(trimmed).ok()?;
    if frame.get("event")?.as_str()? != SUMMARY_EVENT {
        return None;
    }
    match frame.get("data") {
        Some(Value::String(text)) => Some(text.clone()),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    }
}

fn execute(orch: RunOrchestrator, ctx: RunContext) -> BoxStream<'static, ExecItem> {
    Box::pin(async_stream::stream! {
        if ctx.validate_only {
            yield ExecItem::Log {
                stream: LogStream::Stdout,
                message: "validate-only run: engine not invoked".to_string(),
            };
            yield ExecItem::Finished { exit_code: Some(0) };
        } else if orch.settings.safe_mode {
            yield ExecItem::Log {
                stream: LogStream::Stdout,
                message: "safe mode is on: execution skipped".to_string(),
            };
            yield ExecItem::Finished { exit_code: Some(0) };
        } else {
            match orch.launch(&ctx).await {
                Err(err) => {
                    yield ExecItem::Failed(err.to_string());
                }
                Ok(launched) => {
                    yield ExecItem::Log {
                        stream: LogStream::Stdout,
                        message: format!("using environment {}", launched.env_ref),
                    };
                    let mut child = launched.child;
                    let mut lines = ProcessLines::new(&mut child);
                    let mut read_error: Option<String> = None;
                    loop {
                        match lines.next_line().await {
                            Ok(Some((stream, line))) => {
                                if stream == LogStream::Stdout {
                                    if let Some(summary) = telemetry_summary(&line) {
                                        yield ExecItem::Summary(summary);
                                    }
                                }
                                yield ExecItem::Log { stream, message: line };
                            }
                            Ok(None) => break,
                            Err(err) => {
                                read_error = Some(format!("read engine output: {err}"));
                                break;
                            }
                        }
                    }
                    match read_error {
                        Some(message) => {
                            yield ExecItem::Failed(message);
                        }
                        None => match child.wait().await {
                            Ok(status) => {
                                yield ExecItem::Finished { exit_code: status.code() };
                            }
                            Err(err) => {
                                yield ExecItem::Failed(format!("wait for engine: {err}"));
                            }
                        },
                    }
                }
            }
        }
    })
}

fn run_stream(
    orch: RunOrchestrator,
    ctx: RunContext,
    cancel: CancellationToken,
    guard: TerminalGuard,
) -> impl futures::Stream<Item = Result<Event, OrchestratorError>> + Send + 'static {
    async_stream::stream! {
        let mut guard = guard;
        let run_id = ctx.run_id.clone();
        yield Ok(orch.event(&run_id, EventPayload::Created));

        let now_ms = orch.clock.now_ms();
        let started = orch.store.with(|s| s.run_start(&run_id, now_ms));
        let mut summary: Option<String> = None;

        let outcome = match started {
            Err(err) => {
                let message = format!("run could not start: {err}");
                let logged = orch.append_log(&run_id, LogStream::Stderr, &message);
                yield Ok(orch.event(&run_id, EventPayload::Log {
                    stream: LogStream::Stderr,
                    message: logged,
                }));
                Outcome::failed(message)
            }
            Ok(_) => {
                yield Ok(orch.event(&run_id, EventPayload::Started));
                let mut exec = execute(orch.clone(), ctx.clone());
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        item = exec.next() => Some(item),
                    };
                    match next {
                        None => {
                            orch.append_log(&run_id, LogStream::Stderr, CANCELED_MESSAGE);
                            break Outcome::canceled();
                        }
                        Some(None) => {
                            break Outcome::failed("execution ended without an outcome".to_string());
                        }
                        Some(Some(ExecItem::Log { stream, message })) => {
                            let message = orch.append_log(&run_id, stream, &message);
                            yield Ok(orch.event(&run_id, EventPayload::Log { stream, message }));
                        }
                        Some(Some(ExecItem::Summary(text))) => {
                            summary = Some(text);
                        }
                        Some(Some(ExecItem::Finished { exit_code })) => {
                            break Outcome::exited(exit_code);
                        }
                        Some(Some(ExecItem::Failed(message))) => {
                            let logged = orch.append_log(&run_id, LogStream::Stderr, &message);
                            yield Ok(orch.event(&run_id, EventPayload::Log {
                                stream: LogStream::Stderr,
                                message: logged,
                            }));
                            break Outcome::failed(message);
                        }
                    }
                }
            }
        };

        let canceled = outcome.status == RunStatus::Canceled;
        let completed = orch.finish(&ctx, outcome, summary);
        guard.disarm();
        if canceled {
            yield Err(OrchestratorError::Canceled);
        } else {
            yield Ok(completed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_frames_are_recognized() {
        assert_eq!(
            telemetry_summary(r#"{"event": "summary", "data": {"rows": 3}}"#).as_deref(),
            Some(r#"{"rows":3}"#)
        );
        assert_eq!(
            telemetry_summary(r#"{"event":"summary","data":"ok"}"#).as_deref(),
            Some("ok")
        );
        assert_eq!(telemetry_summary(r#"{"event":"progress","data":1}"#), None);
        assert_eq!(telemetry_summary("plain text"), None);
        assert_eq!(telemetry_summary("{not json"), None);
    }

    #[test]
    fn outcomes_map_exit_codes() {
        let ok = Outcome::exited(Some(0));
        assert_eq!(ok.status, RunStatus::Succeeded);
        assert_eq!(ok.error, None);

        let bad = Outcome::exited(Some(3));
        assert_eq!(bad.status, RunStatus::Failed);
        assert_eq!(bad.error.as_deref(), Some("engine exited with code 3"));

        let killed = Outcome::exited(None);
        assert_eq!(killed.status, RunStatus::Failed);
        assert!(killed.error.is_some());

        let canceled = Outcome::canceled();
        assert_eq!(canceled.status, RunStatus::Canceled);
        assert_eq!(canceled.error.as_deref(), Some(CANCELED_MESSAGE));
    }
}
