#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_core::{ClusterClient, EventType, ObjectKey, StorageCluster};
use keel_executor::{Requeue, RunState};
use keel_kubehub::MemoryCluster;
use keel_operands::operator::*;
use keel_operands::{OperandContext, OperatorConfig, StorageOperator};
use keel_render::{ContentSource, FsSource, NamedImages};
use tokio_util::sync::CancellationToken;

const NS: &str = "storage";

fn manifests() -> Arc<dyn ContentSource> {
    Arc::new(FsSource::new(concat!(env!("CARGO_MANIFEST_DIR"), "/../../manifests")))
}

fn cluster(extra_meta: serde_json::Value) -> StorageCluster {
    let mut meta = serde_json::json!({ "name": "main", "namespace": NS, "uid": "c-uid-1" });
    if let (Some(m), Some(extra)) = (meta.as_object_mut(), extra_meta.as_object()) {
        m.extend(extra.clone());
    }
    serde_json::from_value(serde_json::json!({
        "metadata": meta,
        "spec": {
            "secretRefName": "storage-api-creds",
            "kvBackend": { "address": "etcd.db:2379" },
            "images": { "apiManagerContainer": "reg.example/api-manager:v2" }
        }
    }))
    .unwrap()
}

struct Harness {
    fake: Arc<MemoryCluster>,
    op: StorageOperator,
}

fn harness(defaults: NamedImages) -> Harness {
    let fake = Arc::new(MemoryCluster::new());
    let ctx = OperandContext::new(fake.clone(), manifests(), defaults);
    let op = StorageOperator::new(&OperatorConfig::default(), &ctx).unwrap();
    Harness { fake, op }
}

fn daemonset() -> ObjectKey {
    ObjectKey::new("apps/v1", "DaemonSet", Some(NS), "storage-node")
}

fn api_deployment() -> ObjectKey {
    ObjectKey::new("apps/v1", "Deployment", Some(NS), "storage-api-manager")
}

fn cluster_info() -> ObjectKey {
    ObjectKey::new("v1", "ConfigMap", Some(NS), "storage-cluster-info")
}

fn mark_node_ready(fake: &MemoryCluster) {
    assert!(fake.set_status(&daemonset(), serde_json::json!({ "desiredNumberScheduled": 3, "numberReady": 3 })));
}

fn mark_api_ready(fake: &MemoryCluster) {
    assert!(fake.set_status(&api_deployment(), serde_json::json!({ "readyReplicas": 1 })));
}

#[test]
fn wiring_layers_match_declared_dependencies() {
    let h = harness(NamedImages::new());
    assert_eq!(
        h.op.graph().layer_names(),
        vec![
            vec![SCHEDULER_OP, STORAGECLASS_OP, BEFORE_INSTALL_OP],
            vec![NODE_OP],
            vec![API_MANAGER_OP, CSI_OP],
            vec![AFTER_INSTALL_OP],
        ]
    );
}

#[tokio::test]
async fn converge_waits_for_readiness_then_completes() {
    let h = harness(NamedImages::new());
    let c = cluster(serde_json::json!({}));
    let cancel = CancellationToken::new();

    // Node daemons have not reported yet: dependents are held.
    let run = h.op.reconcile(&c, &cancel).await.unwrap();
    assert_eq!(run.state, RunState::Blocked { operand: NODE_OP.into() });
    assert_eq!(run.requeue, Requeue::After(Duration::from_secs(5)));
    assert!(h.fake.object(&daemonset()).is_some());
    assert!(h.fake.object(&api_deployment()).is_none());
    assert!(run.events.iter().any(|e| e.reason == "Waiting"));

    mark_node_ready(&h.fake);
    let run = h.op.reconcile(&c, &cancel).await.unwrap();
    assert_eq!(run.state, RunState::Blocked { operand: API_MANAGER_OP.into() });
    assert!(h.fake.object(&cluster_info()).is_none());

    mark_api_ready(&h.fake);
    let run = h.op.reconcile(&c, &cancel).await.unwrap();
    assert!(run.is_completed(), "state={:?}", run.state);
    assert_eq!(run.requeue, Requeue::No);
    assert!(h.fake.object(&cluster_info()).is_some());
}

#[tokio::test]
async fn converged_cluster_reconciles_without_changes() {
    let h = harness(NamedImages::new());
    let c = cluster(serde_json::json!({}));
    let cancel = CancellationToken::new();
    h.op.reconcile(&c, &cancel).await.unwrap();
    mark_node_ready(&h.fake);
    h.op.reconcile(&c, &cancel).await.unwrap();
    mark_api_ready(&h.fake);
    assert!(h.op.reconcile(&c, &cancel).await.unwrap().is_completed());

    let before = h.fake.changes();
    let run = h.op.reconcile(&c, &cancel).await.unwrap();
    assert!(run.is_completed());
    assert_eq!(h.fake.changes(), before);
}

#[tokio::test]
async fn owner_reference_only_on_namespaced_objects() {
    let h = harness(NamedImages::new());
    let c = cluster(serde_json::json!({}));
    h.op.reconcile(&c, &CancellationToken::new()).await.unwrap();

    let ds = h.fake.object(&daemonset()).unwrap();
    assert_eq!(ds.pointer("/metadata/ownerReferences/0/uid").unwrap(), "c-uid-1");
    assert_eq!(ds.pointer("/metadata/ownerReferences/0/controller").unwrap(), true);

    let role = ObjectKey::new("rbac.authorization.k8s.io/v1", "ClusterRole", None, "storage-node");
    let role = h.fake.object(&role).unwrap();
    assert!(role.pointer("/metadata/namespace").is_none());
    assert!(role.pointer("/metadata/ownerReferences").is_none());
}

#[tokio::test]
async fn spec_images_override_operator_defaults() {
    let defaults: NamedImages = [
        ("api-manager".to_string(), "reg.example/api-manager:v1".to_string()),
        ("node".to_string(), "reg.example/node:v9".to_string()),
    ]
    .into_iter()
    .collect();
    let h = harness(defaults);
    let c = cluster(serde_json::json!({}));
    let cancel = CancellationToken::new();
    h.op.reconcile(&c, &cancel).await.unwrap();
    mark_node_ready(&h.fake);
    h.op.reconcile(&c, &cancel).await.unwrap();

    let ds = h.fake.object(&daemonset()).unwrap();
    assert_eq!(ds.pointer("/spec/template/spec/containers/0/image").unwrap(), "reg.example/node:v9");
    let init_env = ds.pointer("/spec/template/spec/initContainers/0/env/0").unwrap();
    assert_eq!(init_env["name"], "NODE_IMAGE");
    assert_eq!(init_env["value"], "reg.example/node:v9");
    // Untouched containers keep their placeholder.
    assert_eq!(ds.pointer("/spec/template/spec/containers/1/image").unwrap(), "csi-node-driver-registrar");

    let api = h.fake.object(&api_deployment()).unwrap();
    assert_eq!(api.pointer("/spec/template/spec/containers/0/image").unwrap(), "reg.example/api-manager:v2");
    assert_eq!(api.pointer("/spec/template/spec/volumes/0/secret/secretName").unwrap(), "storage-api-creds");
}

#[tokio::test]
async fn cross_package_binding_subjects_get_the_cluster_namespace() {
    let h = harness(NamedImages::new());
    let c = cluster(serde_json::json!({}));
    let cancel = CancellationToken::new();
    h.op.reconcile(&c, &cancel).await.unwrap();
    mark_node_ready(&h.fake);
    h.op.reconcile(&c, &cancel).await.unwrap();

    let rb = ObjectKey::new("rbac.authorization.k8s.io/v1", "RoleBinding", Some(NS), "storage-key-management");
    let rb = h.fake.object(&rb).unwrap();
    assert_eq!(rb.pointer("/subjects/0/namespace").unwrap(), NS);

    let sched = ObjectKey::new("v1", "ConfigMap", Some(NS), "storage-scheduler-config");
    let sched = h.fake.object(&sched).unwrap();
    assert_eq!(sched.pointer("/data/EXTENDER_URL").unwrap(), "http://storage.storage.svc:5705/v2/k8s/scheduler");

    let sc = ObjectKey::new("storage.k8s.io/v1", "StorageClass", None, "storage");
    let sc = h.fake.object(&sc).unwrap();
    assert_eq!(sc.pointer("/parameters/csi.storage.k8s.io~1provisioner-secret-name").unwrap(), "storage-api-creds");
    assert_eq!(sc.pointer("/parameters/csi.storage.k8s.io~1provisioner-secret-namespace").unwrap(), NS);
}

#[tokio::test]
async fn invalid_object_fails_layer_with_configuration_event() {
    let h = harness(NamedImages::new());
    let sc = ObjectKey::new("storage.k8s.io/v1", "StorageClass", None, "storage");
    h.fake.fail_next(sc, keel_core::ClientError::Invalid("bad parameters".into()));

    let run = h.op.reconcile(&cluster(serde_json::json!({})), &CancellationToken::new()).await.unwrap();
    assert_eq!(run.state, RunState::Failed { layer: 0 });
    assert_eq!(run.requeue, Requeue::After(Duration::from_secs(30)));
    assert!(h.fake.object(&daemonset()).is_none());
    let warn = run.events.iter().find(|e| e.type_ == EventType::Warning).unwrap();
    assert_eq!(warn.reason, "EnsureFailed");
    assert!(warn.message.contains("configuration problem"), "{}", warn.message);
}

#[tokio::test]
async fn deletion_tears_everything_down_and_tolerates_absence() {
    let h = harness(NamedImages::new());
    let cancel = CancellationToken::new();
    h.op.reconcile(&cluster(serde_json::json!({})), &cancel).await.unwrap();
    assert!(!h.fake.is_empty());

    let deleting = cluster(serde_json::json!({ "deletionTimestamp": "2026-01-01T00:00:00Z" }));
    let run = h.op.reconcile(&deleting, &cancel).await.unwrap();
    assert!(run.is_completed(), "state={:?}", run.state);
    assert!(h.fake.is_empty(), "left: {:?}", h.fake.keys());

    // Nothing left to delete: still a clean run.
    let run = h.op.reconcile(&deleting, &cancel).await.unwrap();
    assert!(run.is_completed());
    assert_eq!(run.requeue, Requeue::No);
}

#[tokio::test]
async fn missing_uid_is_rejected_before_any_write() {
    let h = harness(NamedImages::new());
    let mut c = cluster(serde_json::json!({}));
    c.metadata.uid = None;
    let err = h.op.reconcile(&c, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.class(), keel_core::ErrorClass::Configuration);
    assert!(h.fake.calls().is_empty());
    assert!(h.fake.get(&daemonset()).await.unwrap().is_none());
}
