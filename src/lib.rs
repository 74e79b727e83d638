//! lxdriver - node-local LXD VM driver.
//!
//! This crate turns an abstract VM descriptor into concrete host resources:
//! block-device mappings for virtual disks, an LXD container configuration,
//! and lifecycle transitions (create, start, stop, delete) against the LXD
//! REST API.
//!
//! The core pieces are the storage-mapping engine ([`mapper`]) that turns a
//! virtual disk into a mounted host directory, and the lifecycle
//! orchestrator ([`lifecycle`]) that sequences disk mapping and container
//! operations, unmapping storage and deleting the container when a boot
//! fails.

pub mod blockdev;
pub mod cmd;
pub mod container;
pub mod descriptor;
pub mod error;
pub mod fstab;
pub mod lifecycle;
pub mod mapper;
pub mod rest;

pub use error::{Error, Result};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
