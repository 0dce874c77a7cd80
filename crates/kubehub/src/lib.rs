//! Keel kubehub: platform clients implementing [`ClusterClient`].
//!
//! [`KubeCluster`] talks to a real API server through kube-rs (server-side
//! apply, dynamic objects, discovery per GVK). [`MemoryCluster`] is the
//! in-memory fake used by tests and dry runs.

#![forbid(unsafe_code)]

use std::sync::Mutex;
use std::time::Instant;

use anyhow::{Context, Result};
use keel_core::{ClientError, ClusterClient, ObjectKey};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Client,
};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::{debug, info};

mod memory;

pub use memory::{Call, MemoryCluster};

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from default config")
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn map_kube_err(e: kube::Error, key: &ObjectKey) -> ClientError {
    match e {
        kube::Error::Api(resp) => {
            let msg = format!("{}: {}", key, resp.message);
            match resp.code {
                404 => ClientError::NotFound(msg),
                409 => ClientError::Conflict(msg),
                403 => ClientError::Forbidden(msg),
                422 => ClientError::Invalid(msg),
                _ => ClientError::Api(msg),
            }
        }
        other => ClientError::Api(format!("{}: {}", key, other)),
    }
}

/// Cluster client backed by kube-rs.
pub struct KubeCluster {
    client: Client,
    field_manager: String,
    /// `group/version/kind` -> resolved resource and whether it is namespaced.
    resources: Mutex<FxHashMap<String, (ApiResource, bool)>>,
}

impl KubeCluster {
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self { client, field_manager: field_manager.to_string(), resources: Mutex::new(FxHashMap::default()) }
    }

    pub async fn try_default(field_manager: &str) -> Result<Self> {
        let client = get_kube_client().await?;
        info!(field_manager, "kube client ready");
        Ok(Self::new(client, field_manager))
    }

    async fn resolve(&self, key: &ObjectKey) -> Result<(ApiResource, bool), ClientError> {
        let (group, version) = key.group_version();
        let cache_key = format!("{}/{}/{}", group, version, key.kind);
        let cached = self.resources.lock().unwrap_or_else(|e| e.into_inner()).get(&cache_key).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }
        let gvk = GroupVersionKind { group: group.to_string(), version: version.to_string(), kind: key.kind.clone() };
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk).await.map_err(|e| map_kube_err(e, key))?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %cache_key, namespaced, "resolved api resource");
        self.resources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cache_key, (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }

    async fn api_for(&self, key: &ObjectKey) -> Result<Api<DynamicObject>, ClientError> {
        let (ar, namespaced) = self.resolve(key).await?;
        if !namespaced {
            return Ok(Api::all_with(self.client.clone(), &ar));
        }
        match key.namespace.as_deref() {
            Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
            None => Err(ClientError::Invalid(format!("{}: namespace required for namespaced kind", key))),
        }
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeCluster {
    async fn apply(&self, obj: &Json) -> Result<(), ClientError> {
        let t0 = Instant::now();
        let key = ObjectKey::from_object(obj)?;
        let api = self.api_for(&key).await?;
        let pp = PatchParams::apply(&self.field_manager).force();
        match api.patch(&key.name, &pp, &Patch::Apply(obj)).await {
            Ok(_) => {
                histogram!("kube_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                counter!("kube_apply_ok", 1u64);
                debug!(object = %key, "applied");
                Ok(())
            }
            Err(e) => {
                counter!("kube_apply_err", 1u64);
                Err(map_kube_err(e, &key))
            }
        }
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClientError> {
        let api = self.api_for(key).await?;
        api.delete(&key.name, &DeleteParams::background()).await.map_err(|e| map_kube_err(e, key))?;
        counter!("kube_delete_ok", 1u64);
        debug!(object = %key, "deleted");
        Ok(())
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<Json>, ClientError> {
        let api = self.api_for(key).await?;
        let Some(obj) = api.get_opt(&key.name).await.map_err(|e| map_kube_err(e, key))? else {
            return Ok(None);
        };
        let mut raw = serde_json::to_value(&obj).map_err(|e| ClientError::Api(format!("{}: {}", key, e)))?;
        strip_managed_fields(&mut raw);
        Ok(Some(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_map_by_status_code() {
        let key = ObjectKey::new("apps/v1", "DaemonSet", Some("storage"), "node");
        let resp = |code| {
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: "boom".into(),
                reason: "x".into(),
                code,
            })
        };
        assert!(map_kube_err(resp(404), &key).is_not_found());
        assert!(matches!(map_kube_err(resp(409), &key), ClientError::Conflict(_)));
        assert!(matches!(map_kube_err(resp(403), &key), ClientError::Forbidden(_)));
        assert!(matches!(map_kube_err(resp(422), &key), ClientError::Invalid(_)));
        let e = map_kube_err(resp(500), &key);
        assert_eq!(e.to_string(), "api: apps/v1/DaemonSet storage/node: boom");
    }

    #[test]
    fn strip_managed_fields_only_touches_metadata() {
        let mut v = serde_json::json!({
            "metadata": { "name": "x", "managedFields": [ {"manager": "keel"} ] },
            "spec": { "managedFields": 1 }
        });
        strip_managed_fields(&mut v);
        assert!(v.pointer("/metadata/managedFields").is_none());
        assert!(v.pointer("/spec/managedFields").is_some());
    }
}
