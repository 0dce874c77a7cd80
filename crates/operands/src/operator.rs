//! Wiring of the seven operands into one graph plus the reconcile entrypoint.
//!
//! ```text
//!   before-install      scheduler      storageclass
//!         |
//!        node
//!       /    \
//!     csi   api-manager
//!       \    /
//!    after-install
//! ```

use std::sync::Arc;

use keel_core::prelude::*;
use keel_executor::{Executor, RunResult};
use keel_graph::{DependencyGraph, GraphError};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::OperatorConfig;
use crate::declarative::{OperandContext, OperandMeta, PackageFn};
use crate::{api_manager, csi, install, node, scheduler, storageclass};

pub const API_MANAGER_OP: &str = "api-manager-operand";
pub const CSI_OP: &str = "csi-operand";
pub const SCHEDULER_OP: &str = "scheduler-operand";
pub const NODE_OP: &str = "node-operand";
pub const STORAGECLASS_OP: &str = "storageclass-operand";
pub const BEFORE_INSTALL_OP: &str = "before-install-operand";
pub const AFTER_INSTALL_OP: &str = "after-install-operand";

/// All operands in declaration order.
pub fn operands(ctx: &OperandContext) -> Vec<Arc<dyn Operand>> {
    fn meta(name: &str, requires: &[&str]) -> OperandMeta {
        OperandMeta::new(name, requires, RequeueStrategy::OnError)
    }
    vec![
        Arc::new(api_manager::operand(meta(API_MANAGER_OP, &[NODE_OP]), ctx.clone())),
        Arc::new(csi::operand(meta(CSI_OP, &[NODE_OP]), ctx.clone())),
        Arc::new(scheduler::operand(meta(SCHEDULER_OP, &[]), ctx.clone())),
        Arc::new(node::operand(meta(NODE_OP, &[BEFORE_INSTALL_OP]), ctx.clone())),
        Arc::new(storageclass::operand(meta(STORAGECLASS_OP, &[]), ctx.clone())),
        Arc::new(install::before_operand(meta(BEFORE_INSTALL_OP, &[]), ctx.clone())),
        Arc::new(install::after_operand(meta(AFTER_INSTALL_OP, &[CSI_OP, API_MANAGER_OP]), ctx.clone())),
    ]
}

/// Package builders keyed by package name.
pub const PACKAGES: &[(&str, PackageFn)] = &[
    (api_manager::PACKAGE, api_manager::package),
    (csi::PACKAGE, csi::package),
    (scheduler::PACKAGE, scheduler::package),
    (node::PACKAGE, node::package),
    (storageclass::PACKAGE, storageclass::package),
    (install::BEFORE_PACKAGE, install::before_package),
    (install::AFTER_PACKAGE, install::after_package),
];

pub fn package_builder(name: &str) -> Option<PackageFn> {
    PACKAGES.iter().find(|(n, _)| *n == name).map(|(_, f)| *f)
}

/// Graph and executor for `StorageCluster`; built once, shared by every
/// reconcile.
pub struct StorageOperator {
    graph: DependencyGraph<StorageCluster>,
    executor: Executor,
}

impl StorageOperator {
    pub fn new(cfg: &OperatorConfig, ctx: &OperandContext) -> Result<Self, GraphError> {
        let graph = DependencyGraph::build(operands(ctx))?;
        info!(operands = graph.len(), layers = graph.layer_count(), "operator graph built");
        Ok(Self { graph, executor: Executor::new(cfg.executor) })
    }

    pub fn graph(&self) -> &DependencyGraph<StorageCluster> {
        &self.graph
    }

    /// Converge the cluster, or tear it down once it is marked for deletion.
    pub async fn reconcile(&self, cluster: &StorageCluster, cancel: &CancellationToken) -> Result<RunResult, OperandError> {
        if cluster.metadata.deletion_timestamp.is_some() {
            self.teardown(cluster, cancel).await
        } else {
            self.converge(cluster, cancel).await
        }
    }

    pub async fn converge(&self, cluster: &StorageCluster, cancel: &CancellationToken) -> Result<RunResult, OperandError> {
        let owner = cluster.owner_reference()?;
        info!(cluster = %cluster.name(), namespace = %cluster.namespace(), "converging");
        Ok(self.executor.converge(&self.graph, cluster, &owner, cancel).await)
    }

    pub async fn teardown(&self, cluster: &StorageCluster, cancel: &CancellationToken) -> Result<RunResult, OperandError> {
        let owner = cluster.owner_reference()?;
        info!(cluster = %cluster.name(), namespace = %cluster.namespace(), "tearing down");
        Ok(self.executor.teardown(&self.graph, cluster, &owner, cancel).await)
    }
}
