//! RFC 6902 JSON patch operations.
//!
//! Callers describe patches with `PatchOperation`; both cluster backends
//! hand them to the `json-patch` crate through `to_json_patch`, which also
//! validates every pointer path.

use serde::Serialize;
use serde_json::Value;

/// One JSON patch operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: Value },
    Replace { path: String, value: Value },
    Remove { path: String },
}

impl PatchOperation {
    pub fn path(&self) -> &str {
        match self {
            PatchOperation::Add { path, .. }
            | PatchOperation::Replace { path, .. }
            | PatchOperation::Remove { path } => path,
        }
    }

    /// `add` of a string value at `/metadata/<map>/<key>`, escaping the key.
    pub fn add_metadata(map: &str, key: &str, value: impl Into<String>) -> Self {
        PatchOperation::Add {
            path: metadata_path(map, key),
            value: Value::String(value.into()),
        }
    }

    /// `remove` of `/metadata/<map>/<key>`, escaping the key.
    pub fn remove_metadata(map: &str, key: &str) -> Self {
        PatchOperation::Remove {
            path: metadata_path(map, key),
        }
    }
}

fn metadata_path(map: &str, key: &str) -> String {
    format!("/metadata/{map}/{}", escape_json_pointer(key))
}

/// Escape a token for use inside a JSON pointer.
///
/// `~` becomes `~0` and `/` becomes `~1`, in that order (RFC 6901 §3).
pub fn escape_json_pointer(s: &str) -> String {
    s.replace('~', "~0").replace('/', "~1")
}

/// The typed patch sent by the kube client.
pub fn to_json_patch(ops: &[PatchOperation]) -> serde_json::Result<json_patch::Patch> {
    serde_json::from_value(serde_json::to_value(ops)?)
}
