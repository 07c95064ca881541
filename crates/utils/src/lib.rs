//! Shared helpers for the corepin workspace
//!
//! This crate carries the small pieces every other workspace member
//! needs: CPU list sets, cgroup weight conversion, atomic file writes
//! and the tracing bootstrap.

pub mod cgroup;
pub mod cpuset;
pub mod fs;
pub mod logging;

pub use cpuset::CpuSet;
