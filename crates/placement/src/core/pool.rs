//! Pool tree structure and supplies
//!
//! Pools form a rooted tree over the hardware: virtual root, sockets,
//! dies and NUMA leaves. The tree is built once from a hardware
//! snapshot and never restructured; nodes live in an arena `Vec` whose
//! index doubles as the pool id, assigned in depth-first order so that
//! "lower id wins" tie-breaks are plain index comparisons. Parent
//! links are arena indices, root owns everything transitively.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use utils::CpuSet;

use crate::platform::memory::NodeMask;
use crate::platform::system::{DieId, NodeId, PackageId};

pub type PoolId = usize;

/// What a pool stands for in the hardware hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    VirtualRoot,
    Socket { package: PackageId },
    Die { package: PackageId, die: DieId },
    Numa { node: NodeId },
}

impl PoolKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            PoolKind::VirtualRoot => "virtual-root",
            PoolKind::Socket { .. } => "socket",
            PoolKind::Die { .. } => "die",
            PoolKind::Numa { .. } => "numa",
        }
    }

    /// Path-unique pool name.
    pub fn pool_name(&self) -> String {
        match self {
            PoolKind::VirtualRoot => "root".to_string(),
            PoolKind::Socket { package } => format!("socket #{package}"),
            PoolKind::Die { package, die } => format!("socket #{package}/die #{die}"),
            PoolKind::Numa { node } => format!("NUMA node #{node}"),
        }
    }
}

/// Resources intrinsically owned by one pool (not counting
/// descendants). The reserved partition lives at the root only.
#[derive(Debug, Clone, Default)]
pub struct Supply {
    /// Free kernel-isolated CPUs owned here
    pub isolated: CpuSet,
    /// Free sharable CPUs owned here
    pub sharable: CpuSet,
    /// Reserved partition, root only
    pub reserved: CpuSet,
    /// Millicpu granted out of this pool's shared capacity
    pub granted_shared: i64,
    /// Millicpu granted out of the reserved partition, root only
    pub granted_reserved: i64,
    /// NUMA nodes assigned to this pool
    pub mem_nodes: NodeMask,
}

/// One node of the pool tree.
#[derive(Debug, Clone)]
pub struct Pool {
    pub id: PoolId,
    pub name: String,
    pub kind: PoolKind,
    pub parent: Option<PoolId>,
    pub children: Vec<PoolId>,
    /// Root is at depth 0
    pub depth: u32,
    /// NUMA node ids assigned at build time, DRAM ids first
    pub assigned_nodes: Vec<NodeId>,
    /// All CPUs of the assigned nodes, free or not
    pub cpus: CpuSet,
    pub supply: Supply,
}

/// Transitive (subtree) view of what a pool can currently hand out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeSupply {
    pub isolated: CpuSet,
    pub sharable: CpuSet,
    pub reserved: CpuSet,
    pub granted_shared: i64,
    pub granted_reserved: i64,
    pub mem_nodes: NodeMask,
}

impl FreeSupply {
    /// Millicpu still grantable from the sharable CPUs. Negative means
    /// the pool is overcommitted.
    pub fn allocatable_shared_millicpu(&self) -> i64 {
        1000 * self.sharable.size() as i64 - self.granted_shared
    }

    pub fn allocatable_reserved_millicpu(&self) -> i64 {
        1000 * self.reserved.size() as i64 - self.granted_reserved
    }
}

/// The pool tree. Index 0 is always the root.
#[derive(Debug, Clone, Default)]
pub struct PoolTree {
    pub(crate) pools: Vec<Pool>,
    /// Which pool intrinsically owns each CPU
    pub(crate) cpu_owner: BTreeMap<u32, PoolId>,
}

impl PoolTree {
    pub fn root(&self) -> PoolId {
        0
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn pool(&self, id: PoolId) -> &Pool {
        &self.pools[id]
    }

    pub(crate) fn pool_mut(&mut self, id: PoolId) -> &mut Pool {
        &mut self.pools[id]
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.iter()
    }

    pub fn find_by_name(&self, name: &str) -> Option<PoolId> {
        self.pools.iter().find(|p| p.name == name).map(|p| p.id)
    }

    pub fn owner_of(&self, cpu: u32) -> Option<PoolId> {
        self.cpu_owner.get(&cpu).copied()
    }

    /// Pre-order depth-first walk of the subtree under `from`.
    pub fn depth_first(&self, from: PoolId) -> Vec<PoolId> {
        let mut order = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            order.push(id);
            // reversed so the first child is visited first
            for child in self.pools[id].children.iter().rev() {
                stack.push(*child);
            }
        }
        order
    }

    /// Breadth-first walk of the subtree under `from`.
    pub fn breadth_first(&self, from: PoolId) -> Vec<PoolId> {
        let mut order = Vec::new();
        let mut queue = VecDeque::from([from]);
        while let Some(id) = queue.pop_front() {
            order.push(id);
            queue.extend(self.pools[id].children.iter().copied());
        }
        order
    }

    /// Snapshot of the currently allocatable resources of a pool,
    /// transitive over its subtree. The reserved partition is global
    /// and always reported from the root.
    pub fn free_supply(&self, id: PoolId) -> FreeSupply {
        let mut free = FreeSupply {
            reserved: self.pools[self.root()].supply.reserved.clone(),
            granted_reserved: self.pools[self.root()].supply.granted_reserved,
            ..Default::default()
        };
        for member in self.depth_first(id) {
            let supply = &self.pools[member].supply;
            free.isolated = free.isolated.union(&supply.isolated);
            free.sharable = free.sharable.union(&supply.sharable);
            free.granted_shared += supply.granted_shared;
            free.mem_nodes = free.mem_nodes.union(supply.mem_nodes);
        }
        free
    }

    /// All CPUs of a pool's subtree, allocated or not.
    pub fn pool_cpus(&self, id: PoolId) -> CpuSet {
        self.depth_first(id)
            .into_iter()
            .fold(CpuSet::new(), |acc, member| {
                acc.union(&self.pools[member].cpus)
            })
    }
}

impl std::fmt::Display for PoolTree {
    /// One line per pool, indented by depth, for debug dumps.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for id in self.depth_first(self.root()) {
            let pool = &self.pools[id];
            writeln!(
                f,
                "{:indent$}{} (id {}, cpus {}, mem nodes {})",
                "",
                pool.name,
                pool.id,
                pool.cpus,
                pool.supply.mem_nodes,
                indent = 2 * pool.depth as usize,
            )?;
        }
        Ok(())
    }
}
