//! csi: the CSI driver registration and the controller-side sidecars.

use keel_core::StorageCluster;
use keel_render::transform::set_cluster_role_binding_subject_namespace;
use keel_render::ManifestPackage;

use crate::config::{IMAGE_CSI_ATTACHER, IMAGE_CSI_LIVENESS_PROBE, IMAGE_CSI_PROVISIONER, IMAGE_CSI_RESIZER};
use crate::declarative::{DeclarativeOperand, OperandContext, OperandMeta, Readiness};
use crate::node::NODE_SERVICE_ACCOUNT;

pub const PACKAGE: &str = "csi";

pub fn package(ctx: &OperandContext, cluster: &StorageCluster) -> ManifestPackage {
    let imgs = &cluster.spec.images;
    let images = ctx.images(&[
        (IMAGE_CSI_PROVISIONER, &imgs.csi_external_provisioner_container),
        (IMAGE_CSI_ATTACHER, &imgs.csi_external_attacher_container),
        (IMAGE_CSI_RESIZER, &imgs.csi_external_resizer_container),
        (IMAGE_CSI_LIVENESS_PROBE, &imgs.csi_liveness_probe_container),
    ]);
    ManifestPackage::new(PACKAGE)
        .with_transforms(
            "csi/node-role-binding.yaml",
            [set_cluster_role_binding_subject_namespace(NODE_SERVICE_ACCOUNT, cluster.namespace())],
        )
        .with_namespace_and_images(cluster.namespace(), images)
}

pub fn operand(meta: OperandMeta, ctx: OperandContext) -> DeclarativeOperand {
    DeclarativeOperand::new(meta, ctx, package, Readiness::Always)
}
