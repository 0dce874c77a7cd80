//! Shared plumbing: render a package and push it to the platform.

use std::sync::Arc;

use keel_core::prelude::*;
use keel_render::{ContentSource, ManifestPackage, NamedImages, RenderMode, Renderer};
use metrics::counter;
use serde_json::Value as Json;
use tracing::debug;

/// Collaborators every operand needs. Built once at startup and cloned into
/// each operand.
#[derive(Clone)]
pub struct OperandContext {
    pub client: Arc<dyn ClusterClient>,
    pub renderer: Arc<Renderer<Arc<dyn ContentSource>>>,
    /// Operator-level default images, keyed by logical image name.
    pub default_images: NamedImages,
}

impl OperandContext {
    pub fn new(client: Arc<dyn ClusterClient>, source: Arc<dyn ContentSource>, default_images: NamedImages) -> Self {
        Self { client, renderer: Arc::new(Renderer::new(source)), default_images }
    }

    /// Operator defaults for the listed keys followed by the cluster overrides, so
    /// cluster values win when both name the same image.
    pub fn images(&self, overrides: &[(&str, &Option<String>)]) -> Vec<keel_render::Image> {
        let defaults: NamedImages = overrides
            .iter()
            .filter_map(|(k, _)| self.default_images.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect();
        let spec: NamedImages = overrides
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), v.clone())))
            .collect();
        let mut images = keel_render::image_list(&defaults);
        images.extend(keel_render::image_list(&spec));
        images
    }
}

/// Name, dependencies and requeue policy; identical shape for every operand.
#[derive(Debug, Clone)]
pub struct OperandMeta {
    pub name: String,
    pub requires: Vec<String>,
    pub requeue: RequeueStrategy,
}

impl OperandMeta {
    pub fn new(name: &str, requires: &[&str], requeue: RequeueStrategy) -> Self {
        Self { name: name.to_string(), requires: requires.iter().map(|s| s.to_string()).collect(), requeue }
    }
}

fn is_namespaced_in(obj: &Json, namespace: &str) -> bool {
    obj.pointer("/metadata/namespace").and_then(|v| v.as_str()) == Some(namespace)
}

/// Owner references are only valid on objects in the owner's namespace;
/// cluster-scoped objects are left untagged.
fn attach_owner(obj: &mut Json, owner: &OwnerReference, owner_namespace: &str) -> Result<(), OperandError> {
    if !is_namespaced_in(obj, owner_namespace) {
        return Ok(());
    }
    let owner = serde_json::to_value(owner).map_err(|e| OperandError::InvalidResource(e.to_string()))?;
    let meta = obj
        .get_mut("metadata")
        .and_then(|m| m.as_object_mut())
        .ok_or_else(|| OperandError::InvalidResource("rendered object has no metadata".into()))?;
    let refs = meta.entry("ownerReferences").or_insert_with(|| Json::Array(vec![]));
    let refs = refs
        .as_array_mut()
        .ok_or_else(|| OperandError::InvalidResource("ownerReferences is not a list".into()))?;
    refs.retain(|r| r.get("uid") != owner.get("uid"));
    refs.push(owner);
    Ok(())
}

/// Render `pkg` and apply every object. Returns how many were applied.
pub async fn ensure_package(
    ctx: &OperandContext,
    pkg: &ManifestPackage,
    owner: &OwnerReference,
    owner_namespace: &str,
) -> Result<usize, OperandError> {
    let rendered = ctx.renderer.render(pkg, RenderMode::Apply)?;
    let n = rendered.len();
    for mut obj in rendered.objects {
        attach_owner(&mut obj, owner, owner_namespace)?;
        ctx.client.apply(&obj).await?;
    }
    counter!("operand_objects_applied", n as u64, "package" => pkg.name().to_string());
    debug!(package = %pkg.name(), objects = n, "package applied");
    Ok(n)
}

/// Render `pkg` and delete every object, dependents first. Already absent
/// objects count as deleted.
pub async fn delete_package(ctx: &OperandContext, pkg: &ManifestPackage) -> Result<usize, OperandError> {
    let rendered = ctx.renderer.render(pkg, RenderMode::Delete)?;
    let mut removed = 0;
    for obj in &rendered.objects {
        let key = ObjectKey::from_object(obj)?;
        match ctx.client.delete(&key).await {
            Ok(()) => removed += 1,
            Err(e) if e.is_not_found() => debug!(object = %key, "already absent"),
            Err(e) => return Err(e.into()),
        }
    }
    debug!(package = %pkg.name(), removed, "package deleted");
    Ok(removed)
}

fn int_at(v: &Json, pointer: &str) -> i64 {
    v.pointer(pointer).and_then(|x| x.as_i64()).unwrap_or(0)
}

/// A DaemonSet is ready once every scheduled pod is ready.
pub async fn daemonset_ready(ctx: &OperandContext, namespace: &str, name: &str) -> Result<bool, OperandError> {
    let key = ObjectKey::new("apps/v1", "DaemonSet", Some(namespace), name);
    let Some(ds) = ctx.client.get(&key).await? else { return Ok(false) };
    let desired = int_at(&ds, "/status/desiredNumberScheduled");
    let ready = int_at(&ds, "/status/numberReady");
    debug!(daemonset = %key, desired, ready, "readiness");
    Ok(desired > 0 && ready >= desired)
}

/// A Deployment is ready once at least one replica is ready.
pub async fn deployment_ready(ctx: &OperandContext, namespace: &str, name: &str) -> Result<bool, OperandError> {
    let key = ObjectKey::new("apps/v1", "Deployment", Some(namespace), name);
    let Some(d) = ctx.client.get(&key).await? else { return Ok(false) };
    Ok(int_at(&d, "/status/readyReplicas") >= 1)
}

/// How an operand decides it is ready after a successful ensure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Always,
    DaemonSet(&'static str),
    Deployment(&'static str),
}

/// Builds an operand's package from the owning cluster.
pub type PackageFn = fn(&OperandContext, &StorageCluster) -> ManifestPackage;

/// An operand that is nothing more than one rendered package plus a
/// readiness rule.
pub struct DeclarativeOperand {
    meta: OperandMeta,
    ctx: OperandContext,
    package: PackageFn,
    readiness: Readiness,
}

impl DeclarativeOperand {
    pub fn new(meta: OperandMeta, ctx: OperandContext, package: PackageFn, readiness: Readiness) -> Self {
        Self { meta, ctx, package, readiness }
    }

    pub fn package(&self, cluster: &StorageCluster) -> ManifestPackage {
        (self.package)(&self.ctx, cluster)
    }
}

#[async_trait::async_trait]
impl Operand for DeclarativeOperand {
    fn name(&self) -> &str {
        &self.meta.name
    }

    fn requires(&self) -> &[String] {
        &self.meta.requires
    }

    fn requeue_strategy(&self) -> RequeueStrategy {
        self.meta.requeue
    }

    async fn ready_check(&self, cluster: &StorageCluster) -> Result<bool, OperandError> {
        match self.readiness {
            Readiness::Always => Ok(true),
            Readiness::DaemonSet(name) => daemonset_ready(&self.ctx, cluster.namespace(), name).await,
            Readiness::Deployment(name) => deployment_ready(&self.ctx, cluster.namespace(), name).await,
        }
    }

    async fn ensure(&self, cluster: &StorageCluster, owner: &OwnerReference) -> Result<Option<Event>, OperandError> {
        ensure_package(&self.ctx, &self.package(cluster), owner, cluster.namespace()).await?;
        Ok(None)
    }

    async fn delete(&self, cluster: &StorageCluster) -> Result<Option<Event>, OperandError> {
        delete_package(&self.ctx, &self.package(cluster)).await?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "keel.dev/v1".into(),
            kind: "StorageCluster".into(),
            name: "c".into(),
            uid: uid.into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    #[test]
    fn owner_is_attached_once_and_only_in_owner_namespace() {
        let mut obj = serde_json::json!({ "kind": "ConfigMap", "metadata": { "name": "a", "namespace": "storage" } });
        attach_owner(&mut obj, &owner("u1"), "storage").unwrap();
        attach_owner(&mut obj, &owner("u1"), "storage").unwrap();
        let refs = obj.pointer("/metadata/ownerReferences").unwrap().as_array().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0]["uid"], "u1");
        assert_eq!(refs[0]["blockOwnerDeletion"], true);

        let mut crb = serde_json::json!({ "kind": "ClusterRole", "metadata": { "name": "r" } });
        attach_owner(&mut crb, &owner("u1"), "storage").unwrap();
        assert!(crb.pointer("/metadata/ownerReferences").is_none());
    }
}
