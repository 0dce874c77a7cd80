//! Platform client capability injected into operands.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::ClientError;

/// Identity of one platform object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
        }
    }

    /// Extract the key of a rendered object.
    pub fn from_object(obj: &Json) -> Result<Self, ClientError> {
        let api_version = obj
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClientError::Invalid("object missing apiVersion".into()))?;
        let kind = obj
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClientError::Invalid("object missing kind".into()))?;
        let meta = obj.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClientError::Invalid(format!("{} missing metadata.name", kind)))?;
        let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str());
        Ok(Self::new(api_version, kind, namespace, name))
    }

    /// `(group, version)` split of `api_version`; core group is empty.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", self.api_version.as_str()),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}

/// Reads and writes against the target platform.
///
/// Write discipline is "apply desired state"; conflict resolution belongs to
/// the platform.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create-or-update the object.
    async fn apply(&self, obj: &Json) -> Result<(), ClientError>;

    /// Delete the object. Absent objects report `ClientError::NotFound`.
    async fn delete(&self, key: &ObjectKey) -> Result<(), ClientError>;

    async fn get(&self, key: &ObjectKey) -> Result<Option<Json>, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_from_object() {
        let obj = serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "api", "namespace": "kube-system" }
        });
        let k = ObjectKey::from_object(&obj).unwrap();
        assert_eq!(k.group_version(), ("apps", "v1"));
        assert_eq!(k.to_string(), "apps/v1/Deployment kube-system/api");

        let core = ObjectKey::new("v1", "Secret", None, "s");
        assert_eq!(core.group_version(), ("", "v1"));
    }

    #[test]
    fn key_errors_are_friendly() {
        let e = ObjectKey::from_object(&serde_json::json!({"kind": "Foo"})).unwrap_err();
        assert!(e.to_string().contains("missing apiVersion"));
        let e = ObjectKey::from_object(&serde_json::json!({"apiVersion": "v1", "kind": "Foo"})).unwrap_err();
        assert!(e.to_string().contains("missing metadata.name"));
    }
}
