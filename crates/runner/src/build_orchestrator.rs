#![forbid(unsafe_code)]

//! Cached environment lifecycle: reuse, single-flight rebuild, stale-build
//! healing and retention pruning for one (tenant, resource) at a time.

use crate::builder::{BuildRequest, BuilderEvent, EnvironmentBuilder};
use crate::clock::{Clock, duration_ms};
use crate::collaborators::{ResourceCatalog, ResourceDescriptor, run_blocking};
use crate::error::OrchestratorError;
use crate::store::StoreHandle;
use envrun_core::ids::{ResourceId, TenantId};
use envrun_core::{
    BuildArtifacts, BuildStatus, Event, EventPayload, Fingerprint, LogScope, LogStream,
};
use envrun_storage::{
    EnvPointerRow, LogPage, PointerActivateRequest, PointerFailRequest, PointerInsertRequest,
    StoreError,
};
use futures::StreamExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const ENVS_DIRNAME: &str = "envs";
const MAX_DECISION_ATTEMPTS: usize = 3;
const MAX_BUILD_LIST: usize = 200;

#[derive(Clone, Debug)]
pub struct BuildSettings {
    /// Base interpreter used to create environments.
    pub interpreter: String,
    pub engine_spec: String,
    pub engine_module: String,
    /// Bounds one build and marks BUILDING rows older than it as crashed.
    pub build_timeout: Duration,
    pub ttl: Option<Duration>,
    pub retention: Duration,
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            engine_spec: "envrun-engine".to_string(),
            engine_module: "envrun_engine".to_string(),
            build_timeout: Duration::from_secs(600),
            ttl: None,
            retention: Duration::from_secs(86_400),
            wait_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WaitMode {
    /// Return `Building` instead of waiting on a build.
    Interactive,
    #[default]
    Blocking,
}

#[derive(Clone, Debug, Default)]
pub struct EnsureOptions {
    pub force: bool,
    pub wait: WaitMode,
    /// Receives the build's events when this call starts the build.
    pub progress: Option<mpsc::UnboundedSender<Event>>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EnsureOutcome {
    /// `reused` is true when the existing environment was still valid and no
    /// build ran on behalf of this call.
    Active { pointer: EnvPointerRow, reused: bool },
    Building,
}

impl EnsureOutcome {
    pub fn pointer(&self) -> Option<&EnvPointerRow> {
        match self {
            Self::Active { pointer, .. } => Some(pointer),
            Self::Building => None,
        }
    }
}

#[derive(Clone)]
pub struct BuildOrchestrator {
    store: StoreHandle,
    catalog: Arc<dyn ResourceCatalog>,
    builder: Arc<dyn EnvironmentBuilder>,
    clock: Arc<dyn Clock>,
    settings: BuildSettings,
}

/// Persists a build's log lines and forwards its events to an optional
/// progress listener.
struct BuildEmitter {
    store: StoreHandle,
    clock: Arc<dyn Clock>,
    build_id: String,
    progress: Option<mpsc::UnboundedSender<Event>>,
}

impl BuildEmitter {
    fn send(&self, payload: EventPayload) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(Event::new(
                self.build_id.clone(),
                self.clock.now_ms(),
                payload,
            ));
        }
    }

    /// Returns the line as stored, which may be clipped.
    fn log(&self, stream: LogStream, message: &str) -> String {
        let scope = LogScope::Build(self.build_id.clone());
        let now_ms = self.clock.now_ms();
        match self
            .store
            .with(|store| store.log_append(&scope, stream, message, now_ms))
        {
            Ok(entry) => entry.message,
            Err(err) => {
                warn!(build_id = %self.build_id, error = %err, "failed to persist build log");
                message.to_string()
            }
        }
    }

    fn log_event(&self, stream: LogStream, message: String) {
        let message = self.log(stream, &message);
        self.send(EventPayload::Log { stream, message });
    }

    fn completed(&self, status: BuildStatus, error: Option<String>) {
        self.send(EventPayload::Completed {
            status: status.as_str().to_string(),
            exit_code: None,
            error,
        });
    }
}

impl BuildOrchestrator {
    pub fn new(
        store: StoreHandle,
        catalog: Arc<dyn ResourceCatalog>,
        builder: Arc<dyn EnvironmentBuilder>,
        clock: Arc<dyn Clock>,
        settings: BuildSettings,
    ) -> Self {
        Self {
            store,
            catalog,
            builder,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    fn envs_root(&self) -> PathBuf {
        self.store.storage_dir().join(ENVS_DIRNAME)
    }

    pub fn env_dir(&self, tenant: &TenantId, resource: &ResourceId, build_id: &str) -> PathBuf {
        self.envs_root()
            .join(tenant.as_str())
            .join(resource.as_str())
            .join(build_id)
    }

    /// Asks the catalog about a resource on the blocking pool; describing
    /// walks and hashes the whole resource tree.
    pub async fn describe(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
    ) -> Result<ResourceDescriptor, OrchestratorError> {
        let catalog = self.catalog.clone();
        let (tenant, resource) = (tenant.clone(), resource.clone());
        run_blocking(move || catalog.describe(&tenant, &resource)).await
    }

    fn desired_fingerprint(&self, descriptor: &ResourceDescriptor) -> Fingerprint {
        Fingerprint {
            resource_version: descriptor.resource_version.clone(),
            content_digest: descriptor.content_digest.clone(),
            engine_spec: descriptor
                .engine_spec
                .clone()
                .unwrap_or_else(|| self.settings.engine_spec.clone()),
            engine_version: descriptor.engine_version.clone(),
            interpreter_path: self.settings.interpreter.clone(),
        }
    }

    /// Empty when the active pointer may be reused as is.
    fn rebuild_reasons(
        &self,
        force: bool,
        active: Option<&EnvPointerRow>,
        desired: &Fingerprint,
        now_ms: i64,
    ) -> Vec<&'static str> {
        let mut reasons = Vec::new();
        if force {
            reasons.push("force");
        }
        let Some(active) = active else {
            reasons.push("no_active");
            return reasons;
        };
        reasons.extend(active.fingerprint.mismatches(desired));
        if let Some(ttl) = self.settings.ttl {
            let built_at = active.built_at_ms.unwrap_or(active.started_at_ms);
            if built_at.saturating_add(duration_ms(ttl)) <= now_ms {
                reasons.push("ttl_expired");
            }
        }
        reasons
    }

    /// Returns a valid environment for (tenant, resource), building one when
    /// needed. Concurrent callers share a single builder invocation.
    pub async fn ensure(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
        options: EnsureOptions,
    ) -> Result<EnsureOutcome, OrchestratorError> {
        self.ensure_described(tenant, resource, options)
            .await
            .map(|(outcome, _)| outcome)
    }

    /// `ensure`, also handing back the descriptor it validated against so run
    /// launches do not digest the resource a second time.
    pub(crate) async fn ensure_described(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
        options: EnsureOptions,
    ) -> Result<(EnsureOutcome, ResourceDescriptor), OrchestratorError> {
        self.heal_stale(tenant, resource).await?;

        let descriptor = self.describe(tenant, resource).await?;
        let outcome = self.decide(tenant, resource, &descriptor, options).await?;
        Ok((outcome, descriptor))
    }

    async fn decide(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
        descriptor: &ResourceDescriptor,
        options: EnsureOptions,
    ) -> Result<EnsureOutcome, OrchestratorError> {
        let desired = self.desired_fingerprint(descriptor);

        for _ in 0..MAX_DECISION_ATTEMPTS {
            let now_ms = self.clock.now_ms();
            let active = self.store.with(|s| s.pointer_active(tenant, resource))?;
            let reasons = self.rebuild_reasons(options.force, active.as_ref(), &desired, now_ms);

            if reasons.is_empty()
                && let Some(active) = active
            {
                let touched = self
                    .store
                    .with(|s| s.pointer_touch(&active.build_id, now_ms))?;
                if let Some(pointer) = touched {
                    debug!(%tenant, %resource, build_id = %pointer.build_id, "reusing active environment");
                    return Ok(EnsureOutcome::Active {
                        pointer,
                        reused: true,
                    });
                }
                // Superseded between the read and the touch.
                continue;
            }

            if let Some(building) = self.store.with(|s| s.pointer_building(tenant, resource))? {
                debug!(%tenant, %resource, build_id = %building.build_id, "joining build in progress");
                return self
                    .join_in_progress(tenant, resource, &building.build_id, options.wait)
                    .await;
            }

            let build_id = uuid::Uuid::new_v4().to_string();
            let env_dir = self.env_dir(tenant, resource, &build_id);
            let inserted = self.store.with(|s| {
                s.pointer_insert_building(
                    tenant,
                    resource,
                    PointerInsertRequest {
                        build_id: build_id.clone(),
                        fingerprint: desired.clone(),
                        env_path: env_dir.to_string_lossy().into_owned(),
                        now_ms,
                    },
                )
            });
            match inserted {
                Ok(row) => {
                    info!(%tenant, %resource, %build_id, reasons = ?reasons, "starting environment build");
                    return self
                        .start_build(tenant, resource, row, descriptor.clone(), options)
                        .await;
                }
                Err(StoreError::BuildInProgress { .. }) => {
                    debug!(%tenant, %resource, "lost BUILDING insert race; joining the winner");
                    return self
                        .coalesce_after_conflict(tenant, resource, options.wait)
                        .await;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(OrchestratorError::AlreadyInProgress {
            tenant: tenant.to_string(),
            resource: resource.to_string(),
        })
    }

    /// Fails BUILDING rows older than the build timeout and drops their
    /// directories.
    pub async fn heal_stale(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
    ) -> Result<Vec<EnvPointerRow>, OrchestratorError> {
        let now_ms = self.clock.now_ms();
        let cutoff_ms = now_ms.saturating_sub(duration_ms(self.settings.build_timeout));
        let healed = self
            .store
            .with(|s| s.pointers_heal_stale(tenant, resource, cutoff_ms, now_ms))?;
        for row in &healed {
            warn!(%tenant, %resource, build_id = %row.build_id, "healed stale build");
            self.remove_env_dir(&row.env_path).await;
        }
        Ok(healed)
    }

    /// Deletes retired rows older than the retention window together with
    /// their directories.
    pub async fn prune(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
    ) -> Result<Vec<EnvPointerRow>, OrchestratorError> {
        let now_ms = self.clock.now_ms();
        let cutoff_ms = now_ms.saturating_sub(duration_ms(self.settings.retention));
        let pruned = self
            .store
            .with(|s| s.pointers_prune(tenant, resource, cutoff_ms))?;
        for row in &pruned {
            info!(%tenant, %resource, build_id = %row.build_id, status = %row.status, "pruned environment");
            self.remove_env_dir(&row.env_path).await;
        }
        Ok(pruned)
    }

    async fn join_in_progress(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
        build_id: &str,
        wait: WaitMode,
    ) -> Result<EnsureOutcome, OrchestratorError> {
        if wait == WaitMode::Interactive {
            return Ok(EnsureOutcome::Building);
        }

        let deadline = tokio::time::Instant::now() + self.settings.wait_timeout;
        loop {
            let row = self.store.with(|s| s.pointer_get(build_id))?;
            match row {
                Some(row) if row.status == BuildStatus::Active => {
                    return Ok(EnsureOutcome::Active {
                        pointer: row,
                        reused: false,
                    });
                }
                Some(row) if row.status == BuildStatus::Failed => {
                    return Err(OrchestratorError::Execution {
                        id: row.build_id,
                        message: row.error.unwrap_or_else(|| "build failed".to_string()),
                    });
                }
                Some(row) if row.status == BuildStatus::Building => {}
                _ => return self.resolve_vanished(tenant, resource),
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(OrchestratorError::AlreadyInProgress {
                    tenant: tenant.to_string(),
                    resource: resource.to_string(),
                });
            }
            let pause = self.settings.poll_interval.min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }

    /// Another caller inserted the BUILDING row first. Share its build: wait on
    /// it while it runs, or take its outcome when it already settled.
    async fn coalesce_after_conflict(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
        wait: WaitMode,
    ) -> Result<EnsureOutcome, OrchestratorError> {
        match self.store.with(|s| s.pointer_building(tenant, resource))? {
            Some(building) => {
                self.join_in_progress(tenant, resource, &building.build_id, wait)
                    .await
            }
            None => self.resolve_vanished(tenant, resource),
        }
    }

    /// The awaited row is gone or was superseded; settle on whatever the key
    /// currently looks like. The newest row wins, so a failed rebuild is not
    /// masked by the older environment it would have replaced.
    fn resolve_vanished(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
    ) -> Result<EnsureOutcome, OrchestratorError> {
        match self.store.with(|s| s.pointer_latest(tenant, resource))? {
            Some(latest) if latest.status == BuildStatus::Active => {
                return Ok(EnsureOutcome::Active {
                    pointer: latest,
                    reused: false,
                });
            }
            Some(latest) if latest.status == BuildStatus::Failed => {
                return Err(OrchestratorError::Execution {
                    id: latest.build_id,
                    message: latest.error.unwrap_or_else(|| "build failed".to_string()),
                });
            }
            _ => {}
        }
        match self.store.with(|s| s.pointer_active(tenant, resource))? {
            Some(pointer) => Ok(EnsureOutcome::Active {
                pointer,
                reused: false,
            }),
            None => Err(OrchestratorError::NotFound(format!(
                "environment for {tenant}/{resource}"
            ))),
        }
    }

    /// Waits until no build of (tenant, resource) is in flight and returns the
    /// newest row. Bounded by the build timeout, after which a leftover
    /// BUILDING row counts as stale.
    pub async fn wait_settled(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
    ) -> Result<Option<EnvPointerRow>, OrchestratorError> {
        let deadline = tokio::time::Instant::now()
            + self.settings.build_timeout
            + self.settings.poll_interval;
        loop {
            if self
                .store
                .with(|s| s.pointer_building(tenant, resource))?
                .is_none()
            {
                return Ok(self.store.with(|s| s.pointer_latest(tenant, resource))?);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(OrchestratorError::AlreadyInProgress {
                    tenant: tenant.to_string(),
                    resource: resource.to_string(),
                });
            }
            tokio::time::sleep(self.settings.poll_interval.min(deadline - now)).await;
        }
    }

    async fn start_build(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
        row: EnvPointerRow,
        descriptor: ResourceDescriptor,
        options: EnsureOptions,
    ) -> Result<EnsureOutcome, OrchestratorError> {
        let build_id = row.build_id.clone();
        // The build owns its task so it completes even if this caller goes away.
        let task = tokio::spawn(self.clone().drive_build(
            tenant.clone(),
            resource.clone(),
            row,
            descriptor,
            options.progress,
        ));
        match options.wait {
            WaitMode::Interactive => Ok(EnsureOutcome::Building),
            WaitMode::Blocking => match task.await {
                Ok(Ok(pointer)) => Ok(EnsureOutcome::Active {
                    pointer,
                    reused: false,
                }),
                Ok(Err(err)) => Err(err),
                Err(join) => Err(OrchestratorError::Execution {
                    id: build_id,
                    message: format!("build task aborted: {join}"),
                }),
            },
        }
    }

    async fn drive_build(
        self,
        tenant: TenantId,
        resource: ResourceId,
        row: EnvPointerRow,
        descriptor: ResourceDescriptor,
        progress: Option<mpsc::UnboundedSender<Event>>,
    ) -> Result<EnvPointerRow, OrchestratorError> {
        let build_id = row.build_id.clone();
        let emitter = BuildEmitter {
            store: self.store.clone(),
            clock: self.clock.clone(),
            build_id: build_id.clone(),
            progress,
        };
        emitter.send(EventPayload::Created);
        emitter.send(EventPayload::Started);

        let request = BuildRequest {
            build_id: build_id.clone(),
            target_dir: PathBuf::from(&row.env_path),
            resource_dir: descriptor.resource_dir,
            interpreter: row.fingerprint.interpreter_path.clone(),
            engine_spec: row.fingerprint.engine_spec.clone(),
            engine_module: self.settings.engine_module.clone(),
            timeout: self.settings.build_timeout,
        };

        let mut outcome: Result<BuildArtifacts, String> =
            Err("builder finished without artifacts".to_string());
        {
            let mut events = self.builder.build(request);
            while let Some(item) = events.next().await {
                match item {
                    Ok(BuilderEvent::Step { name, message }) => {
                        emitter.log(LogStream::Stdout, &format!("[{name}] {message}"));
                        emitter.send(EventPayload::Step { name, message });
                    }
                    Ok(BuilderEvent::Log { stream, message }) => emitter.log_event(stream, message),
                    Ok(BuilderEvent::Artifacts(artifacts)) => {
                        outcome = Ok(artifacts);
                        break;
                    }
                    Err(err) => {
                        outcome = Err(err.message);
                        break;
                    }
                }
            }
        }

        let artifacts = match outcome {
            Ok(artifacts) => artifacts,
            Err(message) => return Err(self.fail_build(&emitter, &row, message).await),
        };

        let now_ms = self.clock.now_ms();
        let activated = self.store.with(|s| {
            s.pointer_activate(PointerActivateRequest {
                build_id: build_id.clone(),
                artifacts: artifacts.clone(),
                expires_at_ms: self
                    .settings
                    .ttl
                    .map(|ttl| now_ms.saturating_add(duration_ms(ttl))),
                now_ms,
            })
        });
        let activated = match activated {
            Ok(activated) => activated,
            Err(err) => {
                let message = format!("activation failed: {err}");
                return Err(self.fail_build(&emitter, &row, message).await);
            }
        };

        emitter.send(EventPayload::Artifacts(artifacts));
        emitter.completed(BuildStatus::Active, None);
        info!(
            %tenant,
            %resource,
            %build_id,
            demoted = ?activated.demoted,
            "environment activated"
        );

        if let Err(err) = self.prune(&tenant, &resource).await {
            warn!(%tenant, %resource, error = %err, "retention prune failed");
        }
        Ok(activated.pointer)
    }

    async fn fail_build(
        &self,
        emitter: &BuildEmitter,
        row: &EnvPointerRow,
        message: String,
    ) -> OrchestratorError {
        let now_ms = self.clock.now_ms();
        let failed = self.store.with(|s| {
            s.pointer_fail(PointerFailRequest {
                build_id: row.build_id.clone(),
                error: message.clone(),
                now_ms,
            })
        });
        if let Err(err) = failed {
            warn!(build_id = %row.build_id, error = %err, "could not mark build FAILED");
        }
        self.remove_env_dir(&row.env_path).await;

        emitter.log(LogStream::Stderr, &message);
        emitter.completed(BuildStatus::Failed, Some(message.clone()));
        warn!(build_id = %row.build_id, error = %message, "environment build failed");
        OrchestratorError::Execution {
            id: row.build_id.clone(),
            message,
        }
    }

    async fn remove_env_dir(&self, env_path: &str) {
        let path = Path::new(env_path);
        if !path.starts_with(self.envs_root()) {
            warn!(path = %path.display(), "refusing to remove directory outside the envs root");
            return;
        }
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove environment dir"),
        }
    }

    pub fn active_build(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
    ) -> Result<Option<EnvPointerRow>, OrchestratorError> {
        Ok(self.store.with(|s| s.pointer_active(tenant, resource))?)
    }

    pub fn get_build(&self, build_id: &str) -> Result<EnvPointerRow, OrchestratorError> {
        self.store
            .with(|s| s.pointer_get(build_id))?
            .ok_or_else(|| OrchestratorError::NotFound(format!("build {build_id}")))
    }

    pub fn list_builds(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
        limit: usize,
    ) -> Result<Vec<EnvPointerRow>, OrchestratorError> {
        let limit = limit.min(MAX_BUILD_LIST);
        Ok(self
            .store
            .with(|s| s.pointers_list(tenant, resource, limit))?)
    }

    pub fn list_build_logs(
        &self,
        build_id: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<LogPage, OrchestratorError> {
        self.get_build(build_id)?;
        let scope = LogScope::Build(build_id.to_string());
        Ok(self.store.with(|s| s.logs_list(&scope, after_id, limit))?)
    }
}
