//! Keel operands: the storage cluster's components as declarative operands,
//! and the operator that wires them into one dependency graph.

#![forbid(unsafe_code)]

pub mod api_manager;
pub mod config;
pub mod csi;
pub mod declarative;
pub mod install;
pub mod node;
pub mod operator;
pub mod scheduler;
pub mod storageclass;

pub use config::OperatorConfig;
pub use declarative::{delete_package, ensure_package, DeclarativeOperand, OperandContext, OperandMeta, Readiness};
pub use operator::{operands, package_builder, StorageOperator};
