#![forbid(unsafe_code)]

use crate::error::BuildError;
use crate::process::ProcessLines;
use envrun_core::{BuildArtifacts, LogStream};
use futures::stream::BoxStream;
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::process::Command;
use tokio::time::{Instant, timeout_at};

pub const MANIFEST_FILENAME: &str = "envrun-manifest.json";

const VERSION_SCRIPT: &str = r#"
import importlib, importlib.metadata, json, platform, sys
module = importlib.import_module(sys.argv[1])
try:
    version = importlib.metadata.version(sys.argv[2])
except Exception:
    version = getattr(module, "__version__", "unknown")
print(json.dumps({"python": platform.python_version(), "engine": str(version)}))
"#;

#[derive(Clone, Debug)]
pub struct BuildRequest {
    pub build_id: String,
    pub target_dir: PathBuf,
    pub resource_dir: PathBuf,
    pub interpreter: String,
    pub engine_spec: String,
    pub engine_module: String,
    /// Shared by every step.
    pub timeout: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub enum BuilderEvent {
    Step { name: String, message: String },
    Log { stream: LogStream, message: String },
    Artifacts(BuildArtifacts),
}

pub type BuilderStream = BoxStream<'static, Result<BuilderEvent, BuildError>>;

/// Produces one environment. The stream is finite and ends either with a
/// single `Artifacts` item or with a single `Err`, after which the target
/// directory no longer exists.
pub trait EnvironmentBuilder: Send + Sync + 'static {
    fn build(&self, request: BuildRequest) -> BuilderStream;
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum StepAction {
    Exec { program: String, args: Vec<String> },
    CaptureVersions { program: String, args: Vec<String> },
    WriteManifest,
    Skip(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct PlannedStep {
    name: &'static str,
    message: String,
    action: StepAction,
}

#[derive(Debug, Deserialize)]
struct VersionReport {
    python: String,
    engine: String,
}

pub fn venv_python(target_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        target_dir.join("Scripts").join("python.exe")
    } else {
        target_dir.join("bin").join("python")
    }
}

/// Distribution name of a pip requirement (`pkg[extra]>=1.0` -> `pkg`).
fn distribution_name(spec: &str) -> &str {
    let spec = spec.trim();
    let end = spec
        .find(|ch: char| matches!(ch, '=' | '<' | '>' | '!' | '~' | '[' | ';' | '@' | ' '))
        .unwrap_or(spec.len());
    spec[..end].trim()
}

fn has_local_package(resource_dir: &Path) -> bool {
    resource_dir.join("pyproject.toml").is_file() || resource_dir.join("setup.py").is_file()
}

fn plan(request: &BuildRequest) -> Vec<PlannedStep> {
    let python = venv_python(&request.target_dir).to_string_lossy().into_owned();
    let pip = |args: &[&str]| -> Vec<String> {
        let mut out = vec!["-m".to_string(), "pip".to_string()];
        out.extend(args.iter().map(|arg| (*arg).to_string()));
        out
    };

    let install_resource = if has_local_package(&request.resource_dir) {
        let dir = request.resource_dir.to_string_lossy().into_owned();
        StepAction::Exec {
            program: python.clone(),
            args: pip(&["install", "--disable-pip-version-check", dir.as_str()]),
        }
    } else {
        StepAction::Skip("resource has no local package".to_string())
    };

    vec![
        PlannedStep {
            name: "create_env",
            message: format!("creating environment with {}", request.interpreter),
            action: StepAction::Exec {
                program: request.interpreter.clone(),
                args: vec![
                    "-m".to_string(),
                    "venv".to_string(),
                    request.target_dir.to_string_lossy().into_owned(),
                ],
            },
        },
        PlannedStep {
            name: "upgrade_tooling",
            message: "upgrading pip, setuptools and wheel".to_string(),
            action: StepAction::Exec {
                program: python.clone(),
                args: pip(&[
                    "install",
                    "--disable-pip-version-check",
                    "--upgrade",
                    "pip",
                    "setuptools",
                    "wheel",
                ]),
            },
        },
        PlannedStep {
            name: "install_engine",
            message: format!("installing {}", request.engine_spec),
            action: StepAction::Exec {
                program: python.clone(),
                args: pip(&[
                    "install",
                    "--disable-pip-version-check",
                    request.engine_spec.as_str(),
                ]),
            },
        },
        PlannedStep {
            name: "install_resource",
            message: "installing resource package".to_string(),
            action: install_resource,
        },
        PlannedStep {
            name: "import_check",
            message: format!("importing {}", request.engine_module),
            action: StepAction::Exec {
                program: python.clone(),
                args: vec![
                    "-c".to_string(),
                    format!("import {}", request.engine_module),
                ],
            },
        },
        PlannedStep {
            name: "capture_versions",
            message: "capturing interpreter and engine versions".to_string(),
            action: StepAction::CaptureVersions {
                program: python,
                args: vec![
                    "-c".to_string(),
                    VERSION_SCRIPT.to_string(),
                    request.engine_module.clone(),
                    distribution_name(&request.engine_spec).to_string(),
                ],
            },
        },
        PlannedStep {
            name: "write_manifest",
            message: format!("writing {MANIFEST_FILENAME}"),
            action: StepAction::WriteManifest,
        },
    ]
}

fn parse_versions(stdout: &[String]) -> Result<VersionReport, String> {
    let line = stdout
        .iter()
        .rev()
        .map(|line| line.trim())
        .find(|line| line.starts_with('{'))
        .ok_or_else(|| "version capture printed no JSON".to_string())?;
    serde_json::from_str(line).map_err(|err| format!("version capture output: {err}"))
}

async fn write_manifest(
    request: &BuildRequest,
    artifacts: &BuildArtifacts,
) -> Result<(), std::io::Error> {
    let created_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string());
    let manifest = json!({
        "build_id": request.build_id,
        "interpreter": request.interpreter,
        "python_path": artifacts.python_path,
        "python_version": artifacts.python_version,
        "engine_spec": request.engine_spec,
        "engine_module": request.engine_module,
        "engine_version": artifacts.engine_version,
        "resource_dir": request.resource_dir.to_string_lossy(),
        "created_at": created_at,
    });
    let bytes = serde_json::to_vec_pretty(&manifest).map_err(std::io::Error::other)?;
    tokio::fs::write(&artifacts.manifest_path, bytes).await
}

async fn remove_target(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(dir = %dir.display(), error = %err, "failed to remove partial environment"),
    }
}

fn spawn_step(program: &str, args: &[String], cwd: &Path) -> Result<tokio::process::Child, String> {
    Command::new(program)
        .args(args)
        .current_dir(cwd)
        .env("PIP_NO_INPUT", "1")
        .env("PYTHONUNBUFFERED", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| format!("failed to spawn {program}: {err}"))
}

/// Python virtualenv builder driven through `tokio::process`.
#[derive(Clone, Debug, Default)]
pub struct VenvBuilder;

impl VenvBuilder {
    pub fn new() -> Self {
        Self
    }
}

impl EnvironmentBuilder for VenvBuilder {
    fn build(&self, request: BuildRequest) -> BuilderStream {
        Box::pin(async_stream::stream! {
            let deadline = Instant::now() + request.timeout;
            let cwd = request
                .target_dir
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(std::env::temp_dir);
            let mut failure: Option<String> = None;
            let mut version_stdout: Vec<String> = Vec::new();
            let mut artifacts: Option<BuildArtifacts> = None;

            if let Err(err) = tokio::fs::create_dir_all(&cwd).await {
                failure = Some(format!("create {}: {err}", cwd.display()));
            }

            'steps: for step in plan(&request) {
                if failure.is_some() {
                    break;
                }
                yield Ok(BuilderEvent::Step {
                    name: step.name.to_string(),
                    message: step.message.clone(),
                });

                let (program, args, capture) = match step.action {
                    StepAction::Exec { program, args } => (program, args, false),
                    StepAction::CaptureVersions { program, args } => (program, args, true),
                    StepAction::Skip(reason) => {
                        yield Ok(BuilderEvent::Log {
                            stream: LogStream::Stdout,
                            message: format!("{}: skipped ({reason})", step.name),
                        });
                        continue;
                    }
                    StepAction::WriteManifest => {
                        let versions = match parse_versions(&version_stdout) {
                            Ok(versions) => versions,
                            Err(message) => {
                                failure = Some(message);
                                break;
                            }
                        };
                        let built = BuildArtifacts {
                            python_path: venv_python(&request.target_dir).to_string_lossy().into_owned(),
                            python_version: versions.python,
                            engine_version: versions.engine,
                            manifest_path: request
                                .target_dir
                                .join(MANIFEST_FILENAME)
                                .to_string_lossy()
                                .into_owned(),
                        };
                        if let Err(err) = write_manifest(&request, &built).await {
                            failure = Some(format!("write manifest: {err}"));
                            break;
                        }
                        artifacts = Some(built);
                        continue;
                    }
                };

                let mut child = match spawn_step(&program, &args, &cwd) {
                    Ok(child) => child,
                    Err(message) => {
                        failure = Some(message);
                        break;
                    }
                };
                let mut lines = ProcessLines::new(&mut child);
                loop {
                    match timeout_at(deadline, lines.next_line()).await {
                        Err(_) => {
                            failure = Some(format!("{} timed out", step.name));
                            break 'steps;
                        }
                        Ok(Err(err)) => {
                            failure = Some(format!("{}: read output: {err}", step.name));
                            break 'steps;
                        }
                        Ok(Ok(None)) => break,
                        Ok(Ok(Some((stream, line)))) => {
                            if capture && stream == LogStream::Stdout {
                                version_stdout.push(line.clone());
                            }
                            yield Ok(BuilderEvent::Log { stream, message: line });
                        }
                    }
                }
                match timeout_at(deadline, child.wait()).await {
                    Err(_) => {
                        failure = Some(format!("{} timed out", step.name));
                        break;
                    }
                    Ok(Err(err)) => {
                        failure = Some(format!("{}: wait: {err}", step.name));
                        break;
                    }
                    Ok(Ok(status)) if !status.success() => {
                        failure = Some(format!("{} failed ({status})", step.name));
                        break;
                    }
                    Ok(Ok(_)) => {}
                }
            }

            match (failure, artifacts) {
                (None, Some(artifacts)) => {
                    yield Ok(BuilderEvent::Artifacts(artifacts));
                }
                (failure, _) => {
                    remove_target(&request.target_dir).await;
                    let message = failure.unwrap_or_else(|| "build produced no artifacts".to_string());
                    yield Err(BuildError::new(request.build_id.clone(), message));
                }
            }
        })
    }
}
