#![forbid(unsafe_code)]
#![allow(dead_code)]

use envrun_core::BuildArtifacts;
use envrun_core::ids::{ResourceId, TenantId};
use envrun_runner::{
    BuildError, BuildOrchestrator, BuildRequest, BuildSettings, BuilderEvent, BuilderStream,
    Clock, EnvironmentBuilder, FsCatalog, FsInputResolver, InputResolver, ManualClock,
    OrchestratorError, ResourceCatalog, ResourceDescriptor, RunOrchestrator, RunSettings,
    StoreHandle,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;
use tokio::sync::Semaphore;

pub(crate) const START_MS: i64 = 1_700_000_000_000;

/// Builder double: counts invocations, can be held at a gate, and fails on
/// demand. A successful build creates the target directory.
pub(crate) struct FakeBuilder {
    calls: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    failure: Mutex<Option<String>>,
}

impl FakeBuilder {
    pub(crate) fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            gate: None,
            failure: Mutex::new(None),
        }
    }

    /// Every build waits until `release` is called.
    pub(crate) fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::new()
        }
    }

    pub(crate) fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1_000);
        }
    }

    pub(crate) fn fail_with(&self, message: Option<&str>) {
        *self.failure.lock().expect("failure lock") = message.map(str::to_string);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_for_calls(&self, expected: usize) {
        for _ in 0..500 {
            if self.calls() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("builder was called {} times, expected {expected}", self.calls());
    }
}

impl EnvironmentBuilder for FakeBuilder {
    fn build(&self, request: BuildRequest) -> BuilderStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.clone();
        let failure = self.failure.lock().expect("failure lock").clone();
        Box::pin(async_stream::stream! {
            if let Some(gate) = gate {
                let _permit = gate.acquire().await;
            }
            yield Ok(BuilderEvent::Step {
                name: "create_env".to_string(),
                message: format!("creating {}", request.target_dir.display()),
            });
            match failure {
                Some(message) => {
                    yield Err(BuildError::new(request.build_id.clone(), message));
                }
                None => {
                    let bin = request.target_dir.join("bin");
                    std::fs::create_dir_all(&bin).expect("create env dir");
                    yield Ok(BuilderEvent::Artifacts(BuildArtifacts {
                        python_path: bin.join("python").to_string_lossy().into_owned(),
                        python_version: "3.12.1".to_string(),
                        engine_version: "1.0.0".to_string(),
                        manifest_path: request
                            .target_dir
                            .join("envrun-manifest.json")
                            .to_string_lossy()
                            .into_owned(),
                    }));
                }
            }
        })
    }
}

/// Threads a collaborator was called on, in call order.
#[derive(Default)]
pub(crate) struct CallLog {
    threads: Mutex<Vec<ThreadId>>,
}

impl CallLog {
    fn record(&self) {
        self.threads
            .lock()
            .expect("call log lock")
            .push(std::thread::current().id());
    }

    pub(crate) fn calls(&self) -> usize {
        self.threads.lock().expect("call log lock").len()
    }

    pub(crate) fn threads(&self) -> Vec<ThreadId> {
        self.threads.lock().expect("call log lock").clone()
    }
}

pub(crate) struct RecordingCatalog {
    inner: FsCatalog,
    pub(crate) log: CallLog,
}

impl ResourceCatalog for RecordingCatalog {
    fn describe(
        &self,
        tenant: &TenantId,
        resource: &ResourceId,
    ) -> Result<ResourceDescriptor, OrchestratorError> {
        self.log.record();
        self.inner.describe(tenant, resource)
    }
}

pub(crate) struct RecordingInputs {
    inner: FsInputResolver,
    pub(crate) log: CallLog,
}

impl InputResolver for RecordingInputs {
    fn resolve(&self, tenant: &TenantId, input_ref: &str) -> Result<Vec<u8>, OrchestratorError> {
        self.log.record();
        self.inner.resolve(tenant, input_ref)
    }
}

pub(crate) struct Harness {
    pub(crate) dir: tempfile::TempDir,
    pub(crate) store: StoreHandle,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) builder: Arc<FakeBuilder>,
    pub(crate) catalog: Arc<RecordingCatalog>,
    pub(crate) inputs: Arc<RecordingInputs>,
    pub(crate) tenant: TenantId,
    pub(crate) resource: ResourceId,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_builder(FakeBuilder::new())
    }

    pub(crate) fn with_builder(builder: FakeBuilder) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = StoreHandle::open(dir.path().join("store")).expect("open store");
        let catalog = Arc::new(RecordingCatalog {
            inner: FsCatalog::new(dir.path().join("resources")),
            log: CallLog::default(),
        });
        let inputs = Arc::new(RecordingInputs {
            inner: FsInputResolver::new(dir.path().join("documents")),
            log: CallLog::default(),
        });
        let harness = Self {
            dir,
            store,
            clock: Arc::new(ManualClock::new(START_MS)),
            builder: Arc::new(builder),
            catalog,
            inputs,
            tenant: TenantId::try_new("acme").expect("tenant"),
            resource: ResourceId::try_new("billing").expect("resource"),
        };
        harness.write_resource_file("rules.yaml", "threshold: 3\n");
        harness
    }

    pub(crate) fn resources_dir(&self) -> PathBuf {
        self.dir.path().join("resources")
    }

    pub(crate) fn documents_dir(&self) -> PathBuf {
        self.dir.path().join("documents")
    }

    pub(crate) fn resource_dir(&self) -> PathBuf {
        self.resources_dir()
            .join(self.tenant.as_str())
            .join(self.resource.as_str())
    }

    pub(crate) fn write_resource_file(&self, name: &str, content: &str) {
        write_file(&self.resource_dir().join(name), content);
    }

    pub(crate) fn write_document(&self, input_ref: &str, content: &str) {
        write_file(
            &self.documents_dir().join(self.tenant.as_str()).join(input_ref),
            content,
        );
    }

    pub(crate) fn build_settings() -> BuildSettings {
        BuildSettings {
            build_timeout: Duration::from_secs(60),
            wait_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
            ..BuildSettings::default()
        }
    }

    pub(crate) fn builds(&self) -> BuildOrchestrator {
        self.builds_with(Self::build_settings())
    }

    pub(crate) fn builds_with(&self, settings: BuildSettings) -> BuildOrchestrator {
        let clock: Arc<dyn Clock> = self.clock.clone();
        BuildOrchestrator::new(
            self.store.clone(),
            self.catalog.clone(),
            self.builder.clone(),
            clock,
            settings,
        )
    }

    pub(crate) fn runs_with(&self, settings: RunSettings) -> RunOrchestrator {
        let clock: Arc<dyn Clock> = self.clock.clone();
        RunOrchestrator::new(
            self.store.clone(),
            self.builds(),
            self.inputs.clone(),
            clock,
            settings,
        )
    }
}

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent dir");
    }
    std::fs::write(path, content).expect("write file");
}
