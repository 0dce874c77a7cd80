//! storageclass: the default StorageClass pointing at the cluster's credentials.

use keel_core::StorageCluster;
use keel_render::transform::{set_metadata_name, set_storage_class_secret_params};
use keel_render::{ManifestPackage, TransformFn};

use crate::declarative::{DeclarativeOperand, OperandContext, OperandMeta, Readiness};

pub const PACKAGE: &str = "storageclass";
pub const DEFAULT_NAME: &str = "storage";

pub fn package(_ctx: &OperandContext, cluster: &StorageCluster) -> ManifestPackage {
    let name = cluster.spec.storage_class_name.as_deref().filter(|s| !s.is_empty()).unwrap_or(DEFAULT_NAME);
    let tfs: Vec<TransformFn> = vec![
        set_metadata_name(name),
        set_storage_class_secret_params(&cluster.spec.secret_ref_name, cluster.namespace()),
    ];
    ManifestPackage::new(PACKAGE)
        .with_transforms("storageclass/storageclass.yaml", tfs)
        .with_namespace_and_images(cluster.namespace(), Vec::new())
}

pub fn operand(meta: OperandMeta, ctx: OperandContext) -> DeclarativeOperand {
    DeclarativeOperand::new(meta, ctx, package, Readiness::Always)
}
