//! # topolab-oci
//!
//! OCI (Open Container Initiative) types for the topolab drivers.
//!
//! This crate provides Rust types for:
//! - The OCI Runtime Specification subset used to describe node containers
//! - Task state vocabulary and exit status

#![warn(missing_docs)]

pub mod runtime;
pub mod state;

pub use runtime::Spec;
pub use state::{ContainerStatus, ExitStatus};
