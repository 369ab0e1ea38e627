#![forbid(unsafe_code)]

//! Environment builds and runs for versioned configuration resources.
//!
//! [`BuildOrchestrator`] keeps one valid environment per (tenant, resource)
//! and coalesces concurrent rebuilds; [`RunOrchestrator`] executes work
//! against it and streams [`envrun_core::Event`]s while persisting logs.

mod bin_detect;
pub mod build_orchestrator;
pub mod builder;
pub mod clock;
pub mod collaborators;
pub mod config;
mod defaults;
pub mod error;
mod process;
pub mod render;
pub mod run_orchestrator;
pub mod store;

pub use build_orchestrator::{
    BuildOrchestrator, BuildSettings, EnsureOptions, EnsureOutcome, WaitMode,
};
pub use builder::{BuildRequest, BuilderEvent, BuilderStream, EnvironmentBuilder, VenvBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    FsCatalog, FsInputResolver, InputResolver, ResourceCatalog, ResourceDescriptor,
};
pub use error::{BuildError, OrchestratorError};
pub use run_orchestrator::{
    CANCELED_MESSAGE, EngineCommand, PrepareOptions, RunContext, RunOrchestrator, RunSettings,
    RunStream, StreamOptions,
};
pub use store::StoreHandle;
