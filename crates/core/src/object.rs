//! References to job payloads held by the object store.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Opaque reference to a job's input or output payload.
///
/// The orchestrator never dereferences these; compute units do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectRef {
    /// A key in the object store (e.g. `uploads/report.txt`).
    Object { key: String },
    /// A small payload carried inline with the job record.
    Inline { payload: String },
}

impl ObjectRef {
    pub fn object(key: impl Into<String>) -> Self {
        Self::Object { key: key.into() }
    }

    pub fn inline(payload: impl Into<String>) -> Self {
        Self::Inline {
            payload: payload.into(),
        }
    }

    /// Reject empty keys and payloads.
    pub fn validate(&self) -> DomainResult<()> {
        match self {
            ObjectRef::Object { key } if key.trim().is_empty() => {
                Err(DomainError::validation("object key must not be empty"))
            }
            ObjectRef::Object { key } if key.starts_with('/') => Err(DomainError::validation(
                "object key must be relative (no leading '/')",
            )),
            ObjectRef::Inline { payload } if payload.is_empty() => {
                Err(DomainError::validation("inline payload must not be empty"))
            }
            _ => Ok(()),
        }
    }
}

impl core::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ObjectRef::Object { key } => write!(f, "object:{key}"),
            ObjectRef::Inline { payload } => write!(f, "inline:{}B", payload.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejects_empty_and_absolute_keys() {
        assert!(ObjectRef::object("uploads/a.txt").validate().is_ok());
        assert!(ObjectRef::object("  ").validate().is_err());
        assert!(ObjectRef::object("/etc/passwd").validate().is_err());
        assert!(ObjectRef::inline("").validate().is_err());
    }

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_value(ObjectRef::object("a/b")).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "object", "key": "a/b"}));
    }
}
