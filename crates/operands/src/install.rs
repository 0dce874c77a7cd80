//! Install hooks bracketing the main components.
//!
//! `before-install` lays down cluster-wide prerequisites the node daemons
//! rely on; `after-install` exposes the finished cluster once the CSI driver
//! and api-manager are up.

use keel_core::StorageCluster;
use keel_render::ManifestPackage;

use crate::declarative::{DeclarativeOperand, OperandContext, OperandMeta, Readiness};

pub const BEFORE_PACKAGE: &str = "before-install";
pub const AFTER_PACKAGE: &str = "after-install";

pub fn before_package(_ctx: &OperandContext, cluster: &StorageCluster) -> ManifestPackage {
    ManifestPackage::new(BEFORE_PACKAGE).with_namespace_and_images(cluster.namespace(), Vec::new())
}

pub fn after_package(_ctx: &OperandContext, cluster: &StorageCluster) -> ManifestPackage {
    ManifestPackage::new(AFTER_PACKAGE).with_namespace_and_images(cluster.namespace(), Vec::new())
}

pub fn before_operand(meta: OperandMeta, ctx: OperandContext) -> DeclarativeOperand {
    DeclarativeOperand::new(meta, ctx, before_package, Readiness::Always)
}

pub fn after_operand(meta: OperandMeta, ctx: OperandContext) -> DeclarativeOperand {
    DeclarativeOperand::new(meta, ctx, after_package, Readiness::Always)
}
