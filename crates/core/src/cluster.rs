//! The `StorageCluster` custom resource, as far as operands read it.
//!
//! Schema ownership and validation live outside this workspace; only the
//! fields operands need for rendering are modeled here.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::{Deserialize, Serialize};

use crate::error::OperandError;

pub const API_VERSION: &str = "keel.dev/v1";
pub const KIND: &str = "StorageCluster";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageCluster {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: StorageClusterSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageClusterSpec {
    /// Secret holding api credentials mounted into the node and api-manager pods.
    #[serde(default)]
    pub secret_ref_name: String,
    #[serde(default)]
    pub images: StorageClusterImages,
    #[serde(default)]
    pub storage_class_name: Option<String>,
    #[serde(default)]
    pub kv_backend: KvBackend,
    #[serde(default)]
    pub tls_etcd_secret_ref_name: Option<String>,
}

/// Per-container image overrides. Empty values fall through to operator defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageClusterImages {
    #[serde(default)]
    pub api_manager_container: Option<String>,
    #[serde(default)]
    pub csi_external_provisioner_container: Option<String>,
    #[serde(default)]
    pub csi_external_attacher_container: Option<String>,
    #[serde(default)]
    pub csi_external_resizer_container: Option<String>,
    #[serde(default)]
    pub csi_liveness_probe_container: Option<String>,
    #[serde(default)]
    pub csi_node_driver_registrar_container: Option<String>,
    #[serde(default)]
    pub node_container: Option<String>,
    #[serde(default)]
    pub init_container: Option<String>,
    #[serde(default)]
    pub kube_scheduler_container: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KvBackend {
    #[serde(default)]
    pub address: String,
}

impl StorageCluster {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    /// Controller owner reference attached to every namespaced object applied
    /// on behalf of this cluster.
    pub fn owner_reference(&self) -> Result<OwnerReference, OperandError> {
        let name = self
            .metadata
            .name
            .clone()
            .ok_or_else(|| OperandError::InvalidResource("StorageCluster missing metadata.name".into()))?;
        let uid = self
            .metadata
            .uid
            .clone()
            .ok_or_else(|| OperandError::InvalidResource(format!("StorageCluster {} missing metadata.uid", name)))?;
        Ok(OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            name,
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}
