//! Per-manifest transforms and package-wide mutations.
//!
//! A transform edits one parsed document of a specific manifest file; a
//! mutation sees the whole rendered set at once.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{json, Map, Value as Json};

use crate::images::Image;

pub type TransformFn = Arc<dyn Fn(&mut Json) -> Result<(), String> + Send + Sync>;
pub type MutateFn = Arc<dyn Fn(&mut [Json]) -> Result<(), String> + Send + Sync>;

/// Kinds that never carry a namespace.
const CLUSTER_SCOPED: &[&str] = &[
    "APIService",
    "CSIDriver",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "MutatingWebhookConfiguration",
    "Namespace",
    "Node",
    "PersistentVolume",
    "PriorityClass",
    "StorageClass",
    "ValidatingWebhookConfiguration",
    "VolumeSnapshotClass",
];

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED.contains(&kind)
}

fn kind_of(obj: &Json) -> &str {
    obj.get("kind").and_then(|v| v.as_str()).unwrap_or_default()
}

fn object_mut<'a>(v: &'a mut Json, key: &str) -> Result<&'a mut Map<String, Json>, String> {
    let obj = v.as_object_mut().ok_or_else(|| "expected a mapping".to_string())?;
    let entry = obj.entry(key.to_string()).or_insert_with(|| Json::Object(Map::new()));
    entry.as_object_mut().ok_or_else(|| format!("{} is not a mapping", key))
}

/// Pod spec of workload kinds, bare pods and cron jobs.
pub fn pod_spec_mut(obj: &mut Json) -> Option<&mut Json> {
    let pointer = match kind_of(obj) {
        "Pod" => "/spec",
        "CronJob" => "/spec/jobTemplate/spec/template/spec",
        "Deployment" | "DaemonSet" | "StatefulSet" | "ReplicaSet" | "Job" => "/spec/template/spec",
        _ => return None,
    };
    obj.pointer_mut(pointer)
}

fn containers_mut(pod: &mut Json) -> impl Iterator<Item = &mut Json> {
    let obj = pod.as_object_mut();
    obj.into_iter().flat_map(|o| {
        o.iter_mut()
            .filter(|(k, _)| k.as_str() == "containers" || k.as_str() == "initContainers")
            .filter_map(|(_, v)| v.as_array_mut())
            .flat_map(|a| a.iter_mut())
    })
}

/// Point the pod template's secret volume `volume` at `secret`, adding the
/// volume when the template does not declare it. `items` replaces the
/// projected keys when given.
pub fn set_pod_template_secret_volume(volume: &str, secret: &str, items: Option<Vec<(String, String)>>) -> TransformFn {
    let volume = volume.to_string();
    let secret = secret.to_string();
    Arc::new(move |obj: &mut Json| {
        let kind = kind_of(obj).to_string();
        let pod = pod_spec_mut(obj).ok_or_else(|| format!("{} has no pod template", kind))?;
        let pod = pod.as_object_mut().ok_or_else(|| "pod spec is not a mapping".to_string())?;
        let volumes = pod.entry("volumes").or_insert_with(|| Json::Array(vec![]));
        let volumes = volumes.as_array_mut().ok_or_else(|| "volumes is not a list".to_string())?;
        let idx = match volumes.iter().position(|v| v.get("name").and_then(|n| n.as_str()) == Some(volume.as_str())) {
            Some(i) => i,
            None => {
                volumes.push(json!({ "name": volume }));
                volumes.len() - 1
            }
        };
        let src = object_mut(&mut volumes[idx], "secret")?;
        src.insert("secretName".into(), Json::String(secret.clone()));
        if let Some(items) = &items {
            let list = items.iter().map(|(k, p)| json!({ "key": k, "path": p })).collect();
            src.insert("items".into(), Json::Array(list));
        }
        Ok(())
    })
}

/// Set the namespace of service-account subjects named `sa` in a
/// (Cluster)RoleBinding. Needed for subjects whose service account is not
/// part of the same package.
pub fn set_cluster_role_binding_subject_namespace(sa: &str, namespace: &str) -> TransformFn {
    let sa = sa.to_string();
    let namespace = namespace.to_string();
    Arc::new(move |obj: &mut Json| {
        let subjects = obj
            .get_mut("subjects")
            .and_then(|s| s.as_array_mut())
            .ok_or_else(|| "binding has no subjects".to_string())?;
        let mut hit = false;
        for s in subjects.iter_mut() {
            let is_sa = s.get("kind").and_then(|k| k.as_str()) == Some("ServiceAccount")
                && s.get("name").and_then(|n| n.as_str()) == Some(sa.as_str());
            if is_sa {
                s["namespace"] = Json::String(namespace.clone());
                hit = true;
            }
        }
        if !hit {
            return Err(format!("no ServiceAccount subject named {}", sa));
        }
        Ok(())
    })
}

/// Set (or replace) env var `name` on `container` of the pod template.
pub fn set_container_env(container: &str, name: &str, value: &str) -> TransformFn {
    let container = container.to_string();
    let name = name.to_string();
    let value = value.to_string();
    Arc::new(move |obj: &mut Json| {
        let kind = kind_of(obj).to_string();
        let pod = pod_spec_mut(obj).ok_or_else(|| format!("{} has no pod template", kind))?;
        let c = containers_mut(pod)
            .find(|c| c.get("name").and_then(|n| n.as_str()) == Some(container.as_str()))
            .ok_or_else(|| format!("container {} not found", container))?;
        let c = c.as_object_mut().ok_or_else(|| "container is not a mapping".to_string())?;
        let env = c.entry("env").or_insert_with(|| Json::Array(vec![]));
        let env = env.as_array_mut().ok_or_else(|| "env is not a list".to_string())?;
        let entry = json!({ "name": name, "value": value });
        match env.iter().position(|e| e.get("name").and_then(|n| n.as_str()) == Some(name.as_str())) {
            Some(i) => env[i] = entry,
            None => env.push(entry),
        }
        Ok(())
    })
}

pub fn set_configmap_data(key: &str, value: &str) -> TransformFn {
    let key = key.to_string();
    let value = value.to_string();
    Arc::new(move |obj: &mut Json| {
        if kind_of(obj) != "ConfigMap" {
            return Err(format!("expected ConfigMap, got {}", kind_of(obj)));
        }
        object_mut(obj, "data")?.insert(key.clone(), Json::String(value.clone()));
        Ok(())
    })
}

/// Point every CSI secret parameter of a StorageClass at `secret` in `namespace`.
pub fn set_storage_class_secret_params(secret: &str, namespace: &str) -> TransformFn {
    let secret = secret.to_string();
    let namespace = namespace.to_string();
    Arc::new(move |obj: &mut Json| {
        if kind_of(obj) != "StorageClass" {
            return Err(format!("expected StorageClass, got {}", kind_of(obj)));
        }
        let params = object_mut(obj, "parameters")?;
        for prefix in ["provisioner", "controller-publish", "node-publish", "controller-expand"] {
            params.insert(format!("csi.storage.k8s.io/{}-secret-name", prefix), Json::String(secret.clone()));
            params.insert(format!("csi.storage.k8s.io/{}-secret-namespace", prefix), Json::String(namespace.clone()));
        }
        Ok(())
    })
}

pub fn set_metadata_name(name: &str) -> TransformFn {
    let name = name.to_string();
    Arc::new(move |obj: &mut Json| {
        object_mut(obj, "metadata")?.insert("name".into(), Json::String(name.clone()));
        Ok(())
    })
}

/// Put every namespaced object into `namespace`. Binding subjects that name
/// a ServiceAccount rendered in the same set follow it into the namespace.
pub fn add_namespace(namespace: &str) -> MutateFn {
    let namespace = namespace.to_string();
    Arc::new(move |objs: &mut [Json]| {
        let local_sas: BTreeSet<String> = objs
            .iter()
            .filter(|o| kind_of(o) == "ServiceAccount")
            .filter_map(|o| o.pointer("/metadata/name").and_then(|n| n.as_str()).map(str::to_string))
            .collect();
        for obj in objs.iter_mut() {
            let kind = kind_of(obj).to_string();
            if !is_cluster_scoped(&kind) {
                object_mut(obj, "metadata")?.insert("namespace".into(), Json::String(namespace.clone()));
            }
            if kind == "RoleBinding" || kind == "ClusterRoleBinding" {
                if let Some(subjects) = obj.get_mut("subjects").and_then(|s| s.as_array_mut()) {
                    for s in subjects.iter_mut() {
                        let local = s.get("kind").and_then(|k| k.as_str()) == Some("ServiceAccount")
                            && s.get("name").and_then(|n| n.as_str()).map(|n| local_sas.contains(n)).unwrap_or(false);
                        if local {
                            s["namespace"] = Json::String(namespace.clone());
                        }
                    }
                }
            }
        }
        Ok(())
    })
}

/// Substitute resolved images into container specs, matching on image name.
pub fn add_images(images: BTreeMap<String, Image>) -> MutateFn {
    Arc::new(move |objs: &mut [Json]| {
        for obj in objs.iter_mut() {
            let Some(pod) = pod_spec_mut(obj) else { continue };
            for c in containers_mut(pod) {
                let Some(current) = c.get("image").and_then(|i| i.as_str()) else { continue };
                let (name, _, _) = crate::images::split_reference(current);
                if let Some(img) = images.get(name) {
                    let next = img.apply_to(current);
                    c["image"] = Json::String(next);
                }
            }
        }
        Ok(())
    })
}
