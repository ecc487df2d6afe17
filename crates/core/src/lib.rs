//!
//! Per-open-file data plane for projecting a remote object store as a local
//! filesystem.
//!
//! # Quick usage example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vaultfs_core::facade::{DataPlane, OpenFlags};
//! use vaultfs_core::provider::passthrough::PassthroughProvider;
//!
//! let provider = Arc::new(PassthroughProvider::new("/mnt/remote").unwrap());
//! let plane = DataPlane::start("/var/lib/vaultfs".into(), provider).unwrap();
//! let handle = plane.open("/hello.txt", OpenFlags { read: true, ..Default::default() }, Box::new(())).unwrap();
//! let bytes = plane.read(handle, 0, 1024).unwrap();
//! plane.release(handle).unwrap();
//! ```
//!
//! # Overview
//! [`facade::DataPlane`] is the entry point: it wires the metadata store, the
//! cache governor, the open-file table, the upload manager and the eviction
//! scanner together and exposes the filesystem operation set a syscall shim
//! needs. Everything else in this crate is a component `DataPlane` composes.

pub mod cache_governor;
pub mod chunks;
pub mod config;
pub mod error;
pub mod eviction;
pub mod facade;
pub mod logging;
pub mod metadata;
pub mod openfile;
pub mod provider;
pub mod stop;
pub mod table;
pub mod upload;

pub use error::{DataPlaneError, Result};
pub use facade::{DataPlane, OpenFlags, StatFs};
