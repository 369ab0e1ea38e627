#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} status: {value}")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}

/// Lifecycle of an environment pointer row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Building,
    Active,
    Inactive,
    Failed,
}

impl BuildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Building => "BUILDING",
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
            Self::Failed => "FAILED",
        }
    }

    /// Retired rows are eligible for retention pruning.
    pub fn is_retired(self) -> bool {
        matches!(self, Self::Inactive | Self::Failed)
    }
}

impl FromStr for BuildStatus {
    type Err = UnknownStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BUILDING" => Ok(Self::Building),
            "ACTIVE" => Ok(Self::Active),
            "INACTIVE" => Ok(Self::Inactive),
            "FAILED" => Ok(Self::Failed),
            _ => Err(UnknownStatus {
                kind: "build",
                value: raw.to_string(),
            }),
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// QUEUED -> RUNNING -> {SUCCEEDED, FAILED, CANCELED}.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => Self::Succeeded,
            _ => Self::Failed,
        }
    }
}

impl FromStr for RunStatus {
    type Err = UnknownStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" | "CANCELLED" => Ok(Self::Canceled),
            _ => Err(UnknownStatus {
                kind: "run",
                value: raw.to_string(),
            }),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl FromStr for LogStream {
    type Err = UnknownStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            _ => Err(UnknownStatus {
                kind: "log stream",
                value: raw.to_string(),
            }),
        }
    }
}

/// Owner of a log sequence: one run or one build.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LogScope {
    Run(String),
    Build(String),
}

impl LogScope {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Build(_) => "build",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Run(id) | Self::Build(id) => id,
        }
    }
}

/// Cache key of an environment. A stored pointer is reusable only while its
/// fingerprint still matches the desired one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub resource_version: String,
    pub content_digest: String,
    pub engine_spec: String,
    /// On a stored pointer: the captured version. On a desired fingerprint:
    /// an optional pin; `None` accepts whatever version is installed.
    pub engine_version: Option<String>,
    pub interpreter_path: String,
}

impl Fingerprint {
    /// Names of the fields on which `self` (stored) differs from `desired`.
    pub fn mismatches(&self, desired: &Fingerprint) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.resource_version != desired.resource_version {
            out.push("resource_version");
        }
        if self.content_digest != desired.content_digest {
            out.push("content_digest");
        }
        if self.engine_spec != desired.engine_spec {
            out.push("engine_spec");
        }
        if let Some(pinned) = desired.engine_version.as_deref()
            && self.engine_version.as_deref() != Some(pinned)
        {
            out.push("engine_version");
        }
        if self.interpreter_path != desired.interpreter_path {
            out.push("interpreter_path");
        }
        out
    }
}

/// What a successful build captured about the environment it produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifacts {
    pub python_path: String,
    pub python_version: String,
    pub engine_version: String,
    pub manifest_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            resource_version: "3".to_string(),
            content_digest: "abc".to_string(),
            engine_spec: "engine==1.2".to_string(),
            engine_version: Some("1.2.0".to_string()),
            interpreter_path: "python3".to_string(),
        }
    }

    #[test]
    fn fingerprint_ignores_engine_version_without_pin() {
        let stored = fingerprint();
        let mut desired = fingerprint();
        desired.engine_version = None;
        assert!(stored.mismatches(&desired).is_empty());

        desired.engine_version = Some("1.3.0".to_string());
        assert_eq!(stored.mismatches(&desired), vec!["engine_version"]);
    }

    #[test]
    fn fingerprint_reports_every_changed_field() {
        let stored = fingerprint();
        let mut desired = fingerprint();
        desired.content_digest = "def".to_string();
        desired.interpreter_path = "/usr/bin/python3.12".to_string();
        assert_eq!(
            stored.mismatches(&desired),
            vec!["content_digest", "interpreter_path"]
        );
    }

    #[test]
    fn statuses_round_trip_through_text() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>(), Ok(status));
        }
        assert_eq!("active".parse::<BuildStatus>(), Ok(BuildStatus::Active));
        assert!("DONE".parse::<RunStatus>().is_err());
        assert!(RunStatus::Canceled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert_eq!(RunStatus::from_exit_code(Some(0)), RunStatus::Succeeded);
        assert_eq!(RunStatus::from_exit_code(Some(2)), RunStatus::Failed);
        assert_eq!(RunStatus::from_exit_code(None), RunStatus::Failed);
    }
}
