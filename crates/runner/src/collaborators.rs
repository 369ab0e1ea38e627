#![forbid(unsafe_code)]

//! Lookups the orchestrators consume but do not own: resource descriptions and
//! input documents. The filesystem implementations back the CLI and tests.

use crate::error::OrchestratorError;
use envrun_core::ids::{ResourceId, TenantId};
use serde::Deserialize;
use sha2::Digest as _;
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};

const RESOURCE_MANIFEST: &str = "manifest.json";
const UNVERSIONED: &str = "0";

/// What the catalog knows about one resource revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub resource_dir: PathBuf,
    pub resource_version: String,
    pub content_digest: String,
    /// Overrides the default engine package spec when set.
    pub engine_spec: Option<String>,
    /// Pins the engine version the environment must report.
    pub engine_version: Option<String>,
}

pub trait ResourceCatalog: Send + Sync + 'static {
    fn describe(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
    ) -> Result<ResourceDescriptor, OrchestratorError>;
}

pub trait InputResolver: Send + Sync + 'static {
    fn resolve(&self, tenant: &TenantId, input_ref: &str) -> Result<Vec<u8>, OrchestratorError>;
}

#[derive(Debug, Default, Deserialize)]
struct ResourceManifest {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    engine_spec: Option<String>,
    #[serde(default)]
    engine_version: Option<String>,
}

/// Resources laid out as `<root>/<tenant>/<resource>/`, with an optional
/// `manifest.json` carrying the version and engine pins.
#[derive(Clone, Debug)]
pub struct FsCatalog {
    root: PathBuf,
}

impl FsCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resource_dir(&self, tenant: &TenantId, resource: &ResourceId) -> PathBuf {
        self.root.join(tenant.as_str()).join(resource.as_str())
    }
}

impl ResourceCatalog for FsCatalog {
    fn describe(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
    ) -> Result<ResourceDescriptor, OrchestratorError> {
        let dir = self.resource_dir(tenant, resource);
        if !dir.is_dir() {
            return Err(OrchestratorError::NotFound(format!(
                "resource {tenant}/{resource}"
            )));
        }

        let manifest_path = dir.join(RESOURCE_MANIFEST);
        let manifest = if manifest_path.is_file() {
            let raw = std::fs::read(&manifest_path)?;
            serde_json::from_slice::<ResourceManifest>(&raw).map_err(|err| {
                OrchestratorError::ValidationFailed(format!(
                    "{tenant}/{resource}/{RESOURCE_MANIFEST}: {err}"
                ))
            })?
        } else {
            ResourceManifest::default()
        };

        let content_digest = digest_tree(&dir)?;
        Ok(ResourceDescriptor {
            resource_dir: dir,
            resource_version: non_empty(manifest.version).unwrap_or_else(|| UNVERSIONED.to_string()),
            content_digest,
            engine_spec: non_empty(manifest.engine_spec),
            engine_version: non_empty(manifest.engine_version),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// SHA-256 over every regular file below `root` (hidden entries skipped),
/// visited in sorted relative-path order.
pub fn digest_tree(root: &Path) -> Result<String, std::io::Error> {
    let mut files = Vec::new();
    collect_files(root, root, &mut files)?;
    files.sort();

    let mut hasher = sha2::Sha256::new();
    for rel in &files {
        let content = std::fs::read(root.join(rel))?;
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(&content);
    }

    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(&mut out, "{b:02x}");
    }
    Ok(out)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), std::io::Error> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            let parts: Vec<_> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.push(parts.join("/"));
        }
    }
    Ok(())
}

/// Input documents stored as `<root>/<tenant>/<input_ref>`.
#[derive(Clone, Debug)]
pub struct FsInputResolver {
    root: PathBuf,
}

impl FsInputResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn validate_input_ref(input_ref: &str) -> Result<&Path, OrchestratorError> {
    let trimmed = input_ref.trim();
    if trimmed.is_empty() {
        return Err(OrchestratorError::ValidationFailed(
            "input_ref must not be empty".to_string(),
        ));
    }
    let path = Path::new(trimmed);
    let safe = path
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if !safe {
        return Err(OrchestratorError::ValidationFailed(format!(
            "input_ref {trimmed:?} must be a relative path without '..'"
        )));
    }
    Ok(path)
}

impl InputResolver for FsInputResolver {
    fn resolve(&self, tenant: &TenantId, input_ref: &str) -> Result<Vec<u8>, OrchestratorError> {
        let rel = validate_input_ref(input_ref)?;
        let path = self.root.join(tenant.as_str()).join(rel);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(
                OrchestratorError::NotFound(format!("input {tenant}/{}", rel.display())),
            ),
            Err(err) => Err(err.into()),
        }
    }
}

/// Runs a synchronous collaborator call on the blocking pool so tree walks
/// and file reads never stall a runtime worker.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, OrchestratorError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, OrchestratorError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|err| {
        OrchestratorError::Io(std::io::Error::other(format!(
            "blocking task join error: {err}"
        )))
    })?
}
