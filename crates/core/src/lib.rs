//! Keel core types: the operand contract, lifecycle enums and events shared by
//! the renderer, graph, executor and concrete operands.

#![forbid(unsafe_code)]

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};

pub mod client;
pub mod cluster;
pub mod error;

pub use client::{ClusterClient, ObjectKey};
pub use cluster::{StorageCluster, StorageClusterImages, StorageClusterSpec};
pub use error::{ClientError, ErrorClass, OperandError, RenderError};

pub mod prelude {
    pub use super::{
        ClientError, ClusterClient, Direction, ErrorClass, Event, EventType, ObjectKey, Operand,
        OperandError, RenderError, RequeueStrategy, StorageCluster,
    };
    pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
}

/// Whether the reconcile cycle is rescheduled after an operand participates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RequeueStrategy {
    /// Requeue after every run, successful or not.
    Always,
    /// Requeue only when this operand's own operation failed.
    OnError,
    /// Never force a requeue from this operand alone.
    Never,
}

impl RequeueStrategy {
    /// Does this operand, given its own result, ask for another cycle?
    pub fn wants_requeue(self, failed: bool) -> bool {
        match self {
            RequeueStrategy::Always => true,
            RequeueStrategy::OnError => failed,
            RequeueStrategy::Never => false,
        }
    }
}

/// Lifecycle direction of one executor run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    Converge,
    Teardown,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Converge => f.write_str("converge"),
            Direction::Teardown => f.write_str("teardown"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// User-visible event surfaced to the caller for recording against the resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub type_: EventType,
    pub reason: String,
    pub message: String,
}

impl Event {
    pub fn normal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { type_: EventType::Normal, reason: reason.into(), message: message.into() }
    }

    pub fn warning(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { type_: EventType::Warning, reason: reason.into(), message: message.into() }
    }
}

/// An independently reconcilable unit of a composite workload.
///
/// Operands are built once at startup and shared read-only across reconcile
/// invocations; all mutable state lives in the target cluster. `R` is the
/// owning custom resource type.
#[async_trait::async_trait]
pub trait Operand<R: Sync + ?Sized = StorageCluster>: Send + Sync {
    /// Stable identifier, unique within a graph.
    fn name(&self) -> &str;

    /// Names of operands that must converge before this one runs.
    fn requires(&self) -> &[String];

    fn requeue_strategy(&self) -> RequeueStrategy;

    /// Non-blocking poll of whether dependents may rely on this operand.
    /// `Ok(false)` means "not yet", not a failure.
    async fn ready_check(&self, resource: &R) -> Result<bool, OperandError>;

    /// Render and apply this operand's resources, tagged with `owner`.
    async fn ensure(&self, resource: &R, owner: &OwnerReference) -> Result<Option<Event>, OperandError>;

    /// Render and remove this operand's resources. Absent objects are success.
    async fn delete(&self, resource: &R) -> Result<Option<Event>, OperandError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requeue_strategy_table() {
        assert!(RequeueStrategy::Always.wants_requeue(false));
        assert!(RequeueStrategy::Always.wants_requeue(true));
        assert!(!RequeueStrategy::OnError.wants_requeue(false));
        assert!(RequeueStrategy::OnError.wants_requeue(true));
        assert!(!RequeueStrategy::Never.wants_requeue(true));
    }

    #[test]
    fn direction_display() {
        assert_eq!(Direction::Converge.to_string(), "converge");
        assert_eq!(Direction::Teardown.to_string(), "teardown");
    }
}
