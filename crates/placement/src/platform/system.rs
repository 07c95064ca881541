//! Hardware topology snapshot interface
//!
//! The policy never touches sysfs itself; it consumes a snapshot of the
//! discovered hardware through this trait. Snapshots are immutable for
//! the lifetime of a pool tree; a hardware change means a rebuild.

use api_types::CpuPriority;
use utils::CpuSet;

pub type PackageId = u32;
pub type DieId = u32;
pub type NodeId = u32;

/// Memory type of a NUMA node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryType {
    Dram,
    Pmem,
    Hbm,
    /// Anything the kernel reports that we do not handle
    Other,
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryType::Dram => write!(f, "DRAM"),
            MemoryType::Pmem => write!(f, "PMEM"),
            MemoryType::Hbm => write!(f, "HBM"),
            MemoryType::Other => write!(f, "other"),
        }
    }
}

/// Read-only view of the hardware the node runs on.
///
/// Id-returning methods yield ascending order so that walks over the
/// snapshot are deterministic.
pub trait System {
    /// Number of physical packages (sockets).
    fn socket_count(&self) -> usize;

    fn package_ids(&self) -> Vec<PackageId>;

    /// Die ids within a package.
    fn die_ids(&self, package: PackageId) -> Vec<DieId>;

    /// NUMA node ids attached to a die.
    fn die_node_ids(&self, package: PackageId, die: DieId) -> Vec<NodeId>;

    /// NUMA node ids attached to a package.
    fn package_node_ids(&self, package: PackageId) -> Vec<NodeId>;

    fn node_ids(&self) -> Vec<NodeId>;

    fn node_cpuset(&self, node: NodeId) -> CpuSet;

    fn node_package(&self, node: NodeId) -> PackageId;

    fn node_die(&self, node: NodeId) -> DieId;

    fn node_memory_type(&self, node: NodeId) -> MemoryType;

    /// Usable memory of the node in bytes.
    fn node_mem_capacity(&self, node: NodeId) -> u64;

    /// SLIT distance between two NUMA nodes.
    fn node_distance(&self, from: NodeId, to: NodeId) -> u32;

    /// CPUs isolated from the scheduler (kernel isolcpus).
    fn isolated_cpus(&self) -> CpuSet;

    /// CPUs belonging to a frequency/efficiency priority class.
    fn priority_cpus(&self, prio: CpuPriority) -> CpuSet;

    /// Reduce a CPU set to one logical CPU per physical core.
    fn single_thread_for_cpus(&self, cpus: &CpuSet) -> CpuSet;
}
