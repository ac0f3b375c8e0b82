//! # topolab-runtime
//!
//! Container runtime layer for topolab.
//!
//! This crate provides:
//! - The [`ContainerRuntime`] contract the lab orchestrator drives
//! - containerd and podman drivers, selected by engine name
//! - The generic container model every driver reports in
//! - The shared stop sequence
//! - Lifecycle events and runtime configuration

#![warn(missing_docs)]

pub mod config;
pub mod containerd;
pub mod engine;
pub mod events;
pub mod model;
pub mod mounts;
pub mod node;
pub mod podman;
pub mod registry;
pub mod runtime;
pub mod stop;

pub use config::{ContainerdConfig, PodmanConfig, RuntimeConfig};
pub use containerd::ContainerdRuntime;
pub use events::{EventBus, RuntimeEvent};
pub use model::{
    ExecResult, FilterOperator, FilterType, GenericContainer, GenericFilter, GenericMgmtIPs,
    TaskSnapshot,
};
pub use node::{DeploymentStatus, NetworkMode, NodeSpec};
pub use podman::PodmanRuntime;
pub use registry::{RuntimeKind, new_runtime};
pub use runtime::{ContainerRuntime, wait_for_container_running};
pub use stop::{ExitWatch, TaskControl, stop_task};
