//! scheduler: a kube-scheduler instance with the storage-aware extender.

use keel_core::StorageCluster;
use keel_render::transform::set_configmap_data;
use keel_render::ManifestPackage;

use crate::config::IMAGE_KUBE_SCHEDULER;
use crate::declarative::{DeclarativeOperand, OperandContext, OperandMeta, Readiness};

pub const PACKAGE: &str = "scheduler";

/// Extender endpoint served by the node daemons of the cluster in `namespace`.
pub fn extender_url(namespace: &str) -> String {
    format!("http://storage.{}.svc:5705/v2/k8s/scheduler", namespace)
}

pub fn package(ctx: &OperandContext, cluster: &StorageCluster) -> ManifestPackage {
    let images = ctx.images(&[(IMAGE_KUBE_SCHEDULER, &cluster.spec.images.kube_scheduler_container)]);
    ManifestPackage::new(PACKAGE)
        .with_transforms(
            "scheduler/configmap.yaml",
            [set_configmap_data("EXTENDER_URL", &extender_url(cluster.namespace()))],
        )
        .with_namespace_and_images(cluster.namespace(), images)
}

pub fn operand(meta: OperandMeta, ctx: OperandContext) -> DeclarativeOperand {
    DeclarativeOperand::new(meta, ctx, package, Readiness::Always)
}
