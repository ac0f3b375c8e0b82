//! # topolab-common
//!
//! Shared utilities and types for the topolab runtime layer.
//!
//! This crate provides common functionality used by the network and driver
//! crates:
//! - The error taxonomy
//! - Caller cancellation and deadlines
//! - Standard filesystem paths
//! - Resource quantity parsing and canonical image names

#![warn(missing_docs)]

pub mod context;
pub mod error;
pub mod humanize;
pub mod id;
pub mod paths;
pub mod reference;
pub mod resource;

pub use context::{CancelHandle, Context};
pub use error::{TopoError, TopoResult};
pub use id::ContainerId;
pub use paths::RuntimePaths;
pub use reference::{ImageReference, canonical_image_name};
pub use resource::ResourceQuantity;
