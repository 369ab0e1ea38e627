#![forbid(unsafe_code)]

use crate::bin_detect::resolve_command;
use crate::build_orchestrator::BuildSettings;
use crate::defaults::default_storage_dir_from_start;
use crate::error::OrchestratorError;
use crate::run_orchestrator::{EngineCommand, RunSettings};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process-wide settings. Every flag falls back to an `ENVRUN_*` variable.
#[derive(Clone, Debug, clap::Args)]
pub struct SettingsArgs {
    /// Store directory (database, environments, run work dirs).
    #[arg(long, env = "ENVRUN_STORAGE_DIR", global = true)]
    pub storage_dir: Option<PathBuf>,
    /// Resource tree root, `<root>/<tenant>/<resource>/`.
    #[arg(long, env = "ENVRUN_RESOURCES_DIR", global = true)]
    pub resources_dir: Option<PathBuf>,
    /// Input documents root, `<root>/<tenant>/<input_ref>`.
    #[arg(long, env = "ENVRUN_DOCUMENTS_DIR", global = true)]
    pub documents_dir: Option<PathBuf>,
    /// Base interpreter used to create environments.
    #[arg(long, env = "ENVRUN_PYTHON", default_value = "python3", global = true)]
    pub python: String,
    #[arg(long, env = "ENVRUN_ENGINE_SPEC", default_value = "envrun-engine", global = true)]
    pub engine_spec: String,
    #[arg(long, env = "ENVRUN_ENGINE_MODULE", default_value = "envrun_engine", global = true)]
    pub engine_module: String,
    /// Runs this program instead of `<env python> -m <engine module>`.
    #[arg(long, env = "ENVRUN_ENGINE_PROGRAM", global = true)]
    pub engine_program: Option<String>,
    #[arg(long = "build-timeout-s", env = "ENVRUN_BUILD_TIMEOUT_S", default_value_t = 600, global = true)]
    pub build_timeout_s: u64,
    /// 0 disables TTL expiry.
    #[arg(long = "build-ttl-s", env = "ENVRUN_BUILD_TTL_S", default_value_t = 0, global = true)]
    pub build_ttl_s: u64,
    #[arg(long = "retention-s", env = "ENVRUN_RETENTION_S", default_value_t = 86_400, global = true)]
    pub retention_s: u64,
    #[arg(long = "wait-timeout-s", env = "ENVRUN_WAIT_TIMEOUT_S", default_value_t = 600, global = true)]
    pub wait_timeout_s: u64,
    #[arg(long = "poll-ms", env = "ENVRUN_POLL_MS", default_value_t = 1_000, global = true)]
    pub poll_ms: u64,
    #[arg(long = "max-queue", env = "ENVRUN_MAX_QUEUE", default_value_t = 10, global = true)]
    pub max_queue: u32,
    /// Complete runs without invoking the engine.
    #[arg(long, env = "ENVRUN_SAFE_MODE", global = true)]
    pub safe_mode: bool,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub storage_dir: PathBuf,
    pub resources_dir: PathBuf,
    pub documents_dir: PathBuf,
    pub build: BuildSettings,
    pub run: RunSettings,
}

fn non_empty(field: &str, value: &str) -> Result<String, OrchestratorError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(OrchestratorError::ValidationFailed(format!(
            "{field} must not be empty"
        )));
    }
    Ok(trimmed.to_string())
}

impl SettingsArgs {
    /// Applies defaults relative to `cwd` and validates ranges.
    pub fn resolve(&self, cwd: &Path) -> Result<Settings, OrchestratorError> {
        if self.poll_ms == 0 {
            return Err(OrchestratorError::ValidationFailed(
                "--poll-ms must be > 0".to_string(),
            ));
        }
        if self.max_queue == 0 {
            return Err(OrchestratorError::ValidationFailed(
                "--max-queue must be > 0".to_string(),
            ));
        }
        if self.build_timeout_s == 0 {
            return Err(OrchestratorError::ValidationFailed(
                "--build-timeout-s must be > 0".to_string(),
            ));
        }

        let python = non_empty("--python", &self.python)?;
        if resolve_command(&python).is_none() {
            tracing::warn!(%python, "base interpreter not found; builds will fail");
        }
        let engine_module = non_empty("--engine-module", &self.engine_module)?;

        let storage_dir = self
            .storage_dir
            .clone()
            .unwrap_or_else(|| default_storage_dir_from_start(cwd));
        let resources_dir = self
            .resources_dir
            .clone()
            .unwrap_or_else(|| storage_dir.join("resources"));
        let documents_dir = self
            .documents_dir
            .clone()
            .unwrap_or_else(|| storage_dir.join("documents"));

        let mut engine = EngineCommand::python_module(&engine_module);
        engine.program = self
            .engine_program
            .as_deref()
            .map(str::trim)
            .filter(|program| !program.is_empty())
            .map(str::to_string);
        if engine.program.is_some() {
            engine.args.clear();
        }

        Ok(Settings {
            storage_dir,
            resources_dir,
            documents_dir,
            build: BuildSettings {
                interpreter: python,
                engine_spec: non_empty("--engine-spec", &self.engine_spec)?,
                engine_module,
                build_timeout: Duration::from_secs(self.build_timeout_s),
                ttl: (self.build_ttl_s > 0).then(|| Duration::from_secs(self.build_ttl_s)),
                retention: Duration::from_secs(self.retention_s),
                wait_timeout: Duration::from_secs(self.wait_timeout_s),
                poll_interval: Duration::from_millis(self.poll_ms),
            },
            run: RunSettings {
                max_queue: self.max_queue,
                safe_mode: self.safe_mode,
                engine,
            },
        })
    }
}
