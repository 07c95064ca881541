//! Requests and grants

use std::collections::BTreeMap;

use api_types::{ContainerInfo, CpuPriority, TopologyHint};
use tracing::warn;
use utils::CpuSet;

use super::pool::PoolId;
use super::types::CpuKind;
use crate::config::PolicyOptions;
use crate::platform::annotations::PlacementAnnotations;
use crate::platform::memory::{MemTypeMask, NodeMask};

/// A container's resource demand, derived from its metadata at
/// admission time.
#[derive(Debug, Clone)]
pub struct Request {
    pub container_id: String,
    pub pretty_name: String,
    pub namespace: String,
    pub cpu_kind: CpuKind,
    pub cpu_prio: CpuPriority,
    /// Requested CPU in millicpu
    pub millicpu: i64,
    /// Whole CPUs of the request
    pub full_cpus: usize,
    /// Sub-CPU remainder in millicpu
    pub fraction: i64,
    /// Whole-CPU requests prefer isolated CPUs
    pub isolate: bool,
    /// Requested memory in bytes
    pub mem_amount: u64,
    /// Requested memory types, empty when unspecified
    pub mem_types: MemTypeMask,
    /// Memory types the allocator library has on this machine
    pub available_types: MemTypeMask,
    pub hide_hyperthreads: bool,
    /// Topology hints keyed by provider
    pub hints: BTreeMap<String, TopologyHint>,
}

impl Request {
    /// Build a request from container metadata. Malformed annotations
    /// are logged and fall back to defaults; they never fail admission.
    pub fn new(info: &ContainerInfo, opts: &PolicyOptions, available: MemTypeMask) -> Self {
        let ann = match PlacementAnnotations::from_annotations(&info.annotations) {
            Ok(ann) => ann,
            Err(report) => {
                warn!(
                    container = %info.pretty_name(),
                    error = ?report,
                    "ignoring malformed placement annotations"
                );
                PlacementAnnotations::default()
            }
        };

        let cpu_kind = if ann.cpu_preserve {
            CpuKind::Preserve
        } else if ann.prefer_reserved || opts.is_reserved_namespace(&info.namespace) {
            CpuKind::Reserved
        } else {
            CpuKind::Normal
        };

        let millicpu = info.millicpu_request.max(0);
        let full_cpus = (millicpu / 1000) as usize;
        let fraction = millicpu % 1000;

        // requested types outside what the machine has are meaningless
        let mem_types = ann
            .memory_type
            .map(|m| m & available)
            .unwrap_or_else(MemTypeMask::empty);

        Self {
            container_id: info.id.clone(),
            pretty_name: info.pretty_name(),
            namespace: info.namespace.clone(),
            cpu_kind,
            cpu_prio: ann.cpu_priority.unwrap_or_default(),
            millicpu,
            full_cpus,
            fraction,
            isolate: full_cpus > 0 && ann.prefer_isolated.unwrap_or(true),
            mem_amount: info.mem_request,
            mem_types,
            available_types: available,
            hide_hyperthreads: ann.hide_hyperthreads,
            hints: info.topology_hints.clone(),
        }
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}<{}/{}, {} mCPU{}>",
            self.pretty_name,
            self.cpu_kind,
            self.cpu_prio,
            self.millicpu,
            if self.isolate { ", isolate" } else { "" },
        )
    }
}

/// The record of a committed allocation.
#[derive(Debug, Clone)]
pub struct Grant {
    pub container_id: String,
    pub pretty_name: String,
    pub namespace: String,
    pub pool: PoolId,
    pub pool_name: String,
    pub cpu_kind: CpuKind,
    pub cpu_prio: CpuPriority,
    /// System-wide exclusive CPUs
    pub exclusive: CpuSet,
    /// Reserved partition, for reserved grants
    pub reserved: CpuSet,
    /// Sharable CPUs of the pool at grant time
    pub shared: CpuSet,
    /// Millicpu consumed from the shared capacity
    pub shared_portion: i64,
    /// Millicpu consumed from the reserved partition
    pub reserved_portion: i64,
    /// Committed memory zone
    pub mem_zone: NodeMask,
    /// Requested memory types
    pub mem_types: MemTypeMask,
    /// Requested memory in bytes
    pub mem_amount: u64,
    /// Requested millicpu, kept for telemetry
    pub millicpu: i64,
    pub hide_hyperthreads: bool,
}

impl std::fmt::Display for Grant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}<{}, exclusive {}, shared {} ({} mCPU), mems {}>",
            self.pretty_name,
            self.pool_name,
            self.cpu_kind,
            self.exclusive,
            self.shared,
            self.shared_portion,
            self.mem_zone,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with(annotations: &[(&str, &str)]) -> ContainerInfo {
        ContainerInfo {
            id: "c0".to_string(),
            namespace: "default".to_string(),
            pod_name: "pod0".to_string(),
            container_name: "main".to_string(),
            millicpu_request: 2500,
            mem_request: 1 << 20,
            annotations: annotations
                .iter()
                .map(|(k, v)| (format!("corepin.io/{k}"), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn splits_millicpu_into_full_and_fraction() {
        let req = Request::new(&info_with(&[]), &PolicyOptions::default(), MemTypeMask::DRAM);
        assert_eq!(req.full_cpus, 2);
        assert_eq!(req.fraction, 500);
        assert_eq!(req.cpu_kind, CpuKind::Normal);
        assert!(req.isolate);
    }

    #[test]
    fn reserved_namespace_forces_reserved_kind() {
        let opts = PolicyOptions {
            reserved_pool_namespaces: vec!["default".into()],
            ..Default::default()
        };
        let req = Request::new(&info_with(&[]), &opts, MemTypeMask::DRAM);
        assert_eq!(req.cpu_kind, CpuKind::Reserved);
    }

    #[test]
    fn preserve_annotation_wins_over_reserved() {
        let opts = PolicyOptions {
            reserved_pool_namespaces: vec!["*".into()],
            ..Default::default()
        };
        let req = Request::new(&info_with(&[("cpu-preserve", "true")]), &opts, MemTypeMask::DRAM);
        assert_eq!(req.cpu_kind, CpuKind::Preserve);
    }

    #[test]
    fn requested_memory_types_limited_to_available() {
        let req = Request::new(
            &info_with(&[("memory-type", "dram,hbm")]),
            &PolicyOptions::default(),
            MemTypeMask::DRAM | MemTypeMask::PMEM,
        );
        assert_eq!(req.mem_types, MemTypeMask::DRAM);
    }

    #[test]
    fn malformed_annotations_fall_back_to_defaults() {
        let req = Request::new(
            &info_with(&[("prefer-cpu-priority", "urgent")]),
            &PolicyOptions::default(),
            MemTypeMask::DRAM,
        );
        assert_eq!(req.cpu_prio, CpuPriority::Normal);
        assert_eq!(req.cpu_kind, CpuKind::Normal);
    }
}
