//! api-manager: the cluster-wide control API, run as a Deployment.

use keel_core::StorageCluster;
use keel_render::transform::{set_cluster_role_binding_subject_namespace, set_pod_template_secret_volume};
use keel_render::ManifestPackage;

use crate::config::IMAGE_API_MANAGER;
use crate::declarative::{DeclarativeOperand, OperandContext, OperandMeta, Readiness};
use crate::node::NODE_SERVICE_ACCOUNT;

pub const PACKAGE: &str = "api-manager";
pub const DEPLOYMENT: &str = "storage-api-manager";

pub fn package(ctx: &OperandContext, cluster: &StorageCluster) -> ManifestPackage {
    let images = ctx.images(&[(IMAGE_API_MANAGER, &cluster.spec.images.api_manager_container)]);
    ManifestPackage::new(PACKAGE)
        .with_transforms(
            "api-manager/deployment.yaml",
            [set_pod_template_secret_volume("api-secret", &cluster.spec.secret_ref_name, None)],
        )
        // The bound service account ships with the node package, so namespace
        // injection does not reach it.
        .with_transforms(
            "api-manager/key-management-role-binding.yaml",
            [set_cluster_role_binding_subject_namespace(NODE_SERVICE_ACCOUNT, cluster.namespace())],
        )
        .with_namespace_and_images(cluster.namespace(), images)
}

pub fn operand(meta: OperandMeta, ctx: OperandContext) -> DeclarativeOperand {
    DeclarativeOperand::new(meta, ctx, package, Readiness::Deployment(DEPLOYMENT))
}
