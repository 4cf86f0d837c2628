#![forbid(unsafe_code)]
//! ext2ro public API facade.
//!
//! Re-exports the volume handle, the `FsOps` interface and the on-disk
//! types from `ext2ro-core` through a stable external interface. The CLI
//! and other downstream consumers depend on this crate.

pub use ext2ro_core::*;
