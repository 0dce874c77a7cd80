//! Operator-level configuration, captured once at startup.

use std::path::PathBuf;
use std::time::Duration;

use keel_executor::{ExecutionStrategy, ExecutorConfig};
use keel_render::{named_images_from_env, NamedImages};
use tracing::warn;

pub const IMAGE_API_MANAGER: &str = "api-manager";
pub const IMAGE_CSI_PROVISIONER: &str = "csi-provisioner";
pub const IMAGE_CSI_ATTACHER: &str = "csi-attacher";
pub const IMAGE_CSI_RESIZER: &str = "csi-resizer";
pub const IMAGE_CSI_LIVENESS_PROBE: &str = "csi-liveness-probe";
pub const IMAGE_CSI_NODE_DRIVER_REGISTRAR: &str = "csi-node-driver-registrar";
pub const IMAGE_NODE: &str = "node";
pub const IMAGE_INIT: &str = "init";
pub const IMAGE_KUBE_SCHEDULER: &str = "kube-scheduler";

/// Logical image key -> environment variable carrying its default reference.
pub const RELATED_IMAGES: &[(&str, &str)] = &[
    (IMAGE_API_MANAGER, "RELATED_IMAGE_API_MANAGER"),
    (IMAGE_CSI_PROVISIONER, "RELATED_IMAGE_CSIV1_EXTERNAL_PROVISIONER"),
    (IMAGE_CSI_ATTACHER, "RELATED_IMAGE_CSIV1_EXTERNAL_ATTACHER"),
    (IMAGE_CSI_RESIZER, "RELATED_IMAGE_CSIV1_EXTERNAL_RESIZER"),
    (IMAGE_CSI_LIVENESS_PROBE, "RELATED_IMAGE_CSIV1_LIVENESS_PROBE"),
    (IMAGE_CSI_NODE_DRIVER_REGISTRAR, "RELATED_IMAGE_CSIV1_NODE_DRIVER_REGISTRAR"),
    (IMAGE_NODE, "RELATED_IMAGE_NODE"),
    (IMAGE_INIT, "RELATED_IMAGE_NODE_INIT"),
    (IMAGE_KUBE_SCHEDULER, "RELATED_IMAGE_KUBE_SCHEDULER"),
];

pub const DEFAULT_MANIFESTS_DIR: &str = "manifests";
pub const DEFAULT_FIELD_MANAGER: &str = "keel-operator";

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    pub manifests_dir: PathBuf,
    /// Server-side apply field manager.
    pub field_manager: String,
    pub executor: ExecutorConfig,
    /// Default images; per-cluster spec values take precedence.
    pub images: NamedImages,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            manifests_dir: PathBuf::from(DEFAULT_MANIFESTS_DIR),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            executor: ExecutorConfig::default(),
            images: NamedImages::new(),
        }
    }
}

fn secs_from_env(var: &str) -> Option<Duration> {
    std::env::var(var).ok().and_then(|s| s.trim().parse::<u64>().ok()).map(Duration::from_secs)
}

fn strategy_from_env(var: &str) -> Option<ExecutionStrategy> {
    let raw = std::env::var(var).ok().filter(|s| !s.trim().is_empty())?;
    match raw.parse() {
        Ok(strategy) => Some(strategy),
        Err(e) => {
            warn!(var, error = %e, "ignoring execution strategy");
            None
        }
    }
}

impl OperatorConfig {
    /// Read `KEEL_*` and `RELATED_IMAGE_*`. Unset or unparsable values keep
    /// their defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            manifests_dir: std::env::var("KEEL_MANIFESTS_DIR").map(PathBuf::from).unwrap_or(d.manifests_dir),
            field_manager: std::env::var("KEEL_FIELD_MANAGER")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(d.field_manager),
            executor: ExecutorConfig {
                requeue_after: secs_from_env("KEEL_REQUEUE_SECS").unwrap_or(d.executor.requeue_after),
                not_ready_requeue_after: secs_from_env("KEEL_NOT_READY_SECS")
                    .unwrap_or(d.executor.not_ready_requeue_after),
                strategy: strategy_from_env("KEEL_EXEC_STRATEGY").unwrap_or(d.executor.strategy),
            },
            images: named_images_from_env(RELATED_IMAGES),
        }
    }
}
