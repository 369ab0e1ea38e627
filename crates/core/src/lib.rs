#![forbid(unsafe_code)]

pub mod events;
pub mod model;

pub use events::{Event, EventPayload};
pub use model::{BuildArtifacts, BuildStatus, Fingerprint, LogScope, LogStream, RunStatus};

pub mod ids {
    use std::fmt;

    const MAX_ID_LEN: usize = 128;

    #[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
    pub enum IdError {
        #[error("{field} must not be empty")]
        Empty { field: &'static str },
        #[error("{field} is too long (max 128 chars)")]
        TooLong { field: &'static str },
        #[error("{field} must start with [A-Za-z0-9]")]
        InvalidFirstChar { field: &'static str },
        #[error("{field} contains invalid char {ch:?} at {index}")]
        InvalidChar {
            field: &'static str,
            ch: char,
            index: usize,
        },
    }

    fn validate_identifier(field: &'static str, value: &str) -> Result<(), IdError> {
        if value.is_empty() {
            return Err(IdError::Empty { field });
        }
        if value.len() > MAX_ID_LEN {
            return Err(IdError::TooLong { field });
        }
        let mut chars = value.chars();
        let Some(first) = chars.next() else {
            return Err(IdError::Empty { field });
        };
        if !first.is_ascii_alphanumeric() {
            return Err(IdError::InvalidFirstChar { field });
        }
        for (index, ch) in value.chars().enumerate().skip(1) {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                continue;
            }
            return Err(IdError::InvalidChar { field, ch, index });
        }
        Ok(())
    }

    macro_rules! identifier {
        ($name:ident, $field:literal) => {
            #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(String);

            impl $name {
                pub fn try_new(value: impl Into<String>) -> Result<Self, IdError> {
                    let value = value.into();
                    validate_identifier($field, &value)?;
                    Ok(Self(value))
                }

                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }
        };
    }

    identifier!(TenantId, "tenant_id");
    identifier!(ResourceId, "resource_id");

    /// `tenant/resource/build` reference handed to callers for an environment.
    pub fn environment_ref(tenant: &str, resource: &str, build_id: &str) -> String {
        format!("{tenant}/{resource}/{build_id}")
    }

}
