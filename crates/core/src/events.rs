#![forbid(unsafe_code)]

//! Streaming envelope shared by build and run progress.
//!
//! Every event is `{type, id, created, ...fields}` where `id` is the run or
//! build the event belongs to and `created` is epoch seconds. `completed` is
//! always the last event of a sequence and carries the authoritative status.

use crate::model::{BuildArtifacts, LogStream};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub created: i64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Created,
    Started,
    Log {
        stream: LogStream,
        message: String,
    },
    Step {
        name: String,
        message: String,
    },
    Artifacts(BuildArtifacts),
    Completed {
        status: String,
        exit_code: Option<i32>,
        error: Option<String>,
    },
}

impl EventPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Log { .. } => "log",
            Self::Step { .. } => "step",
            Self::Artifacts(_) => "artifacts",
            Self::Completed { .. } => "completed",
        }
    }
}

impl Event {
    pub fn new(id: impl Into<String>, created_ms: i64, payload: EventPayload) -> Self {
        Self {
            id: id.into(),
            created: created_ms.div_euclid(1000),
            payload,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.payload, EventPayload::Completed { .. })
    }

    /// One newline-terminated JSON line.
    pub fn to_ndjson(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_flattens_type_and_fields() {
        let event = Event::new(
            "run-1",
            1_700_000_000_999,
            EventPayload::Log {
                stream: LogStream::Stderr,
                message: "boom".to_string(),
            },
        );
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(
            value,
            json!({
                "type": "log",
                "id": "run-1",
                "created": 1_700_000_000,
                "stream": "stderr",
                "message": "boom",
            })
        );
    }

    #[test]
    fn completed_line_is_newline_terminated_and_parses_back() {
        let event = Event::new(
            "run-2",
            5_000,
            EventPayload::Completed {
                status: "FAILED".to_string(),
                exit_code: Some(3),
                error: None,
            },
        );
        let line = event.to_ndjson().expect("ndjson");
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let parsed: Event = serde_json::from_str(line.trim_end()).expect("parse");
        assert_eq!(parsed, event);
        assert!(parsed.is_completed());
        assert_eq!(parsed.payload.type_name(), "completed");
    }

    #[test]
    fn artifacts_fields_sit_beside_the_tag() {
        let event = Event::new(
            "b-1",
            0,
            EventPayload::Artifacts(BuildArtifacts {
                python_path: "/envs/b-1/bin/python".to_string(),
                python_version: "3.12.1".to_string(),
                engine_version: "1.4.0".to_string(),
                manifest_path: "/envs/b-1/envrun-manifest.json".to_string(),
            }),
        );
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "artifacts");
        assert_eq!(value["engine_version"], "1.4.0");
    }
}
