//! node: the per-host storage daemon and its CSI node plugin.

use keel_core::StorageCluster;
use keel_render::transform::{set_configmap_data, set_container_env, set_pod_template_secret_volume};
use keel_render::{resolve, ManifestPackage, TransformFn};

use crate::config::{IMAGE_CSI_LIVENESS_PROBE, IMAGE_CSI_NODE_DRIVER_REGISTRAR, IMAGE_INIT, IMAGE_NODE};
use crate::declarative::{DeclarativeOperand, OperandContext, OperandMeta, Readiness};

pub const PACKAGE: &str = "node";
pub const DAEMONSET: &str = "storage-node";
/// Service account of the node daemon; other packages bind roles to it.
pub const NODE_SERVICE_ACCOUNT: &str = "storage-daemonset-sa";

const ETCD_TLS_VOLUME: &str = "etcd-certs";

pub fn package(ctx: &OperandContext, cluster: &StorageCluster) -> ManifestPackage {
    let spec = &cluster.spec;
    let images = ctx.images(&[
        (IMAGE_NODE, &spec.images.node_container),
        (IMAGE_INIT, &spec.images.init_container),
        (IMAGE_CSI_NODE_DRIVER_REGISTRAR, &spec.images.csi_node_driver_registrar_container),
        (IMAGE_CSI_LIVENESS_PROBE, &spec.images.csi_liveness_probe_container),
    ]);

    let mut daemonset: Vec<TransformFn> =
        vec![set_pod_template_secret_volume("api-secret", &spec.secret_ref_name, None)];
    if let Some(tls) = spec.tls_etcd_secret_ref_name.as_deref().filter(|s| !s.is_empty()) {
        let items = vec![
            ("etcd-client-ca.crt".to_string(), "etcd-client-ca.crt".to_string()),
            ("etcd-client.crt".to_string(), "etcd-client.crt".to_string()),
            ("etcd-client.key".to_string(), "etcd-client.key".to_string()),
        ];
        daemonset.push(set_pod_template_secret_volume(ETCD_TLS_VOLUME, tls, Some(items)));
    }
    // The init container upgrades on-disk state and needs to know which node
    // image it is preparing for.
    if let Some(node) = resolve(images.clone()).get(IMAGE_NODE) {
        daemonset.push(set_container_env(IMAGE_INIT, "NODE_IMAGE", &node.apply_to(IMAGE_NODE)));
    }

    ManifestPackage::new(PACKAGE)
        .with_transforms("node/daemonset.yaml", daemonset)
        .with_transforms("node/configmap.yaml", [set_configmap_data("ETCD_ENDPOINTS", &spec.kv_backend.address)])
        .with_namespace_and_images(cluster.namespace(), images)
}

pub fn operand(meta: OperandMeta, ctx: OperandContext) -> DeclarativeOperand {
    DeclarativeOperand::new(meta, ctx, package, Readiness::DaemonSet(DAEMONSET))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use keel_render::{FsSource, RenderMode};

    use super::*;

    #[test]
    fn etcd_tls_volume_only_when_configured() {
        let fake = Arc::new(keel_kubehub::MemoryCluster::new());
        let src = Arc::new(FsSource::new(concat!(env!("CARGO_MANIFEST_DIR"), "/../../manifests")));
        let ctx = OperandContext::new(fake, src, Default::default());
        let mut cluster = StorageCluster::default();
        cluster.spec.secret_ref_name = "creds".into();
        cluster.spec.kv_backend.address = "etcd:2379".into();

        let volumes = |c: &StorageCluster| {
            let out = ctx.renderer.render(&package(&ctx, c), RenderMode::Apply).unwrap();
            let ds = out.objects.iter().find(|o| o["kind"] == "DaemonSet").unwrap().clone();
            let cm = out.objects.iter().find(|o| o["kind"] == "ConfigMap").unwrap().clone();
            assert_eq!(cm.pointer("/data/ETCD_ENDPOINTS").unwrap(), "etcd:2379");
            ds.pointer("/spec/template/spec/volumes").unwrap().as_array().unwrap().clone()
        };
        assert_eq!(volumes(&cluster).len(), 1);

        cluster.spec.tls_etcd_secret_ref_name = Some("etcd-client-tls".into());
        let vols = volumes(&cluster);
        assert_eq!(vols.len(), 2);
        assert_eq!(vols[1]["secret"]["secretName"], "etcd-client-tls");
        assert_eq!(vols[1]["secret"]["items"].as_array().unwrap().len(), 3);
    }
}
