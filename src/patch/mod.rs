//! Structural patch operations applied to node payloads
//!
//! The store never edits payloads field by field. Every change goes through a
//! sequence of [`PatchOperation`]s handed to the payload's [`Patchable`]
//! implementation, so that the operations themselves can travel with the
//! `node:data:updated` event.
//!
//! Operations follow the JSON Patch model (RFC 6902) addressed by JSON
//! pointers (RFC 6901) and serialize to the same wire shape. Applying them to
//! a `serde_json::Value` is delegated to the `json_patch` crate.
//!
//! ```rust
//! use relstore::patch::{PatchOperation, Patchable};
//! use serde_json::json;
//!
//! let mut user = json!({ "name": "John Doe", "email": "john.doe@example.com" });
//! let ops: Vec<PatchOperation> = serde_json::from_value(json!([
//!     { "op": "replace", "path": "/email", "value": "john@domain.com" }
//! ])).unwrap();
//!
//! user.apply_patch(&ops).unwrap();
//! assert_eq!(user["email"], "john@domain.com");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while applying a patch
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PatchError {
    #[error("Malformed patch: {0}")]
    Malformed(String),

    #[error("Operation {operation} ({op} {path}) failed: {reason}")]
    Rejected {
        operation: usize,
        op: &'static str,
        path: String,
        reason: String,
    },
}

pub type PatchResult<T> = Result<T, PatchError>;

/// A single structural operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

impl PatchOperation {
    pub fn add(path: impl Into<String>, value: impl Into<Value>) -> Self {
        PatchOperation::Add { path: path.into(), value: value.into() }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        PatchOperation::Remove { path: path.into() }
    }

    pub fn replace(path: impl Into<String>, value: impl Into<Value>) -> Self {
        PatchOperation::Replace { path: path.into(), value: value.into() }
    }

    pub fn move_from(from: impl Into<String>, path: impl Into<String>) -> Self {
        PatchOperation::Move { from: from.into(), path: path.into() }
    }

    pub fn copy_from(from: impl Into<String>, path: impl Into<String>) -> Self {
        PatchOperation::Copy { from: from.into(), path: path.into() }
    }

    pub fn test(path: impl Into<String>, value: impl Into<Value>) -> Self {
        PatchOperation::Test { path: path.into(), value: value.into() }
    }

    /// Target path of the operation
    pub fn path(&self) -> &str {
        match self {
            PatchOperation::Add { path, .. }
            | PatchOperation::Remove { path }
            | PatchOperation::Replace { path, .. }
            | PatchOperation::Move { path, .. }
            | PatchOperation::Copy { path, .. }
            | PatchOperation::Test { path, .. } => path,
        }
    }

    /// Operation name as it appears on the wire
    pub fn op_name(&self) -> &'static str {
        match self {
            PatchOperation::Add { .. } => "add",
            PatchOperation::Remove { .. } => "remove",
            PatchOperation::Replace { .. } => "replace",
            PatchOperation::Move { .. } => "move",
            PatchOperation::Copy { .. } => "copy",
            PatchOperation::Test { .. } => "test",
        }
    }
}

/// A payload that can be mutated in place by a sequence of patch operations.
///
/// Implementations must be atomic: either every operation is applied or the
/// payload is left untouched and an error is returned.
pub trait Patchable {
    fn apply_patch(&mut self, operations: &[PatchOperation]) -> PatchResult<()>;
}

impl Patchable for Value {
    fn apply_patch(&mut self, operations: &[PatchOperation]) -> PatchResult<()> {
        let encoded = serde_json::to_value(operations).map_err(|err| PatchError::Malformed(err.to_string()))?;
        let patch: Vec<json_patch::PatchOperation> =
            serde_json::from_value(encoded).map_err(|err| PatchError::Malformed(err.to_string()))?;

        // json_patch reverts the applied prefix when a later operation fails
        json_patch::patch(self, &patch).map_err(|err| {
            let failed = operations.get(err.operation);
            PatchError::Rejected {
                operation: err.operation,
                op: failed.map_or("unknown", PatchOperation::op_name),
                path: failed.map(|op| op.path().to_string()).unwrap_or_default(),
                reason: err.kind.to_string(),
            }
        })
    }
}
