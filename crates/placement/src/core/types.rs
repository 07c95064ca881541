//! Core type definitions shared across the placement engine

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// How a container's CPUs are sourced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuKind {
    /// Exclusive and/or shared CPUs from the pool tree
    Normal,
    /// CPUs from the reserved partition at the root
    Reserved,
    /// Leave the container's current pinning untouched
    Preserve,
}

impl std::fmt::Display for CpuKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CpuKind::Normal => write!(f, "normal"),
            CpuKind::Reserved => write!(f, "reserved"),
            CpuKind::Preserve => write!(f, "preserve"),
        }
    }
}

/// Unified error type for placement operations. This is the only error
/// kind that crosses the policy boundary; the runtime shim translates
/// it into an admission rejection, except for the two topology kinds
/// which are fatal at initialization.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("unhandled HW topology: {message}")]
    TopologyInvalid { message: String },

    #[error("unassigned CPU-less NUMA node: {message}")]
    UnassignedMemoryNode { message: String },

    #[error("no suitable pool: {message}")]
    NoSuitablePool { message: String },

    #[error("insufficient resources: {message}")]
    Insufficient { message: String },

    #[error("stale memory offer: {message}")]
    OfferStale { message: String },

    #[error("zone update for unknown container: {message}")]
    UnknownZoneUpdate { message: String },

    #[error("failed to pin container: {message}")]
    PinFailure { message: String },
}

impl PolicyError {
    pub fn topology_invalid(message: impl Into<String>) -> Self {
        Self::TopologyInvalid {
            message: message.into(),
        }
    }

    pub fn unassigned_memory_node(message: impl Into<String>) -> Self {
        Self::UnassignedMemoryNode {
            message: message.into(),
        }
    }

    pub fn no_suitable_pool(message: impl Into<String>) -> Self {
        Self::NoSuitablePool {
            message: message.into(),
        }
    }

    pub fn insufficient(message: impl Into<String>) -> Self {
        Self::Insufficient {
            message: message.into(),
        }
    }

    pub fn offer_stale(message: impl Into<String>) -> Self {
        Self::OfferStale {
            message: message.into(),
        }
    }
}

/// Result type for placement operations
pub type Result<T> = std::result::Result<T, PolicyError>;
