#![forbid(unsafe_code)]

use envrun_core::ids::environment_ref;
use envrun_core::{BuildArtifacts, BuildStatus, Fingerprint};

#[derive(Clone, Debug, PartialEq)]
pub struct EnvPointerRow {
    pub build_id: String,
    pub tenant: String,
    pub resource: String,
    pub status: BuildStatus,
    pub fingerprint: Fingerprint,
    pub env_path: String,
    pub python_path: Option<String>,
    pub python_version: Option<String>,
    pub error: Option<String>,
    pub started_at_ms: i64,
    pub built_at_ms: Option<i64>,
    pub expires_at_ms: Option<i64>,
    pub last_used_at_ms: Option<i64>,
    pub retired_at_ms: Option<i64>,
}

impl EnvPointerRow {
    pub fn environment_ref(&self) -> String {
        environment_ref(&self.tenant, &self.resource, &self.build_id)
    }
}

#[derive(Clone, Debug)]
pub struct PointerInsertRequest {
    pub build_id: String,
    pub fingerprint: Fingerprint,
    pub env_path: String,
    pub now_ms: i64,
}

#[derive(Clone, Debug)]
pub struct PointerActivateRequest {
    pub build_id: String,
    pub artifacts: BuildArtifacts,
    pub expires_at_ms: Option<i64>,
    pub now_ms: i64,
}

#[derive(Clone, Debug)]
pub struct PointerFailRequest {
    pub build_id: String,
    pub error: String,
    pub now_ms: i64,
}

#[derive(Clone, Debug)]
pub struct PointerActivateResult {
    pub pointer: EnvPointerRow,
    /// Previously ACTIVE rows demoted to INACTIVE by this activation.
    pub demoted: Vec<String>,
}
