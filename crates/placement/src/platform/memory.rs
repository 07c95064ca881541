//! Memory allocator library interface
//!
//! Memory placement is a two-phase protocol: `make_offer` computes a
//! zone (a NUMA node mask) that could satisfy a request against the
//! current state without mutating anything, and `commit` binds it.
//! Between the two no other allocator operation may run; offers are
//! epoch-versioned and committing against a changed state fails with
//! [`MemError::StaleOffer`].
//!
//! [`LinearMemAllocator`] is the in-tree reference implementation of
//! the consumed interface: real deployments plug their own library in
//! behind [`MemAllocator`].

use std::collections::BTreeMap;

use bitflags::bitflags;
use thiserror::Error;
use tracing::warn;
use utils::CpuSet;

use super::system::{MemoryType, NodeId, System};

bitflags! {
    /// Mask of memory types a request may be served from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemTypeMask: u8 {
        const DRAM = 0b001;
        const PMEM = 0b010;
        const HBM  = 0b100;
    }
}

impl Default for MemTypeMask {
    fn default() -> Self {
        Self::empty()
    }
}

impl MemTypeMask {
    /// Parse a comma-separated list of type names, e.g. `"dram,pmem"`.
    pub fn parse(list: &str) -> Result<Self, String> {
        let mut mask = MemTypeMask::empty();
        for part in list.split(',') {
            match part.trim() {
                "" => {}
                "dram" => mask |= MemTypeMask::DRAM,
                "pmem" => mask |= MemTypeMask::PMEM,
                "hbm" => mask |= MemTypeMask::HBM,
                other => return Err(format!("unknown memory type {other:?}")),
            }
        }
        Ok(mask)
    }
}

impl From<MemoryType> for MemTypeMask {
    fn from(mt: MemoryType) -> Self {
        match mt {
            MemoryType::Dram => MemTypeMask::DRAM,
            MemoryType::Pmem => MemTypeMask::PMEM,
            MemoryType::Hbm => MemTypeMask::HBM,
            MemoryType::Other => MemTypeMask::empty(),
        }
    }
}

impl std::fmt::Display for MemTypeMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.contains(MemTypeMask::DRAM) {
            names.push("dram");
        }
        if self.contains(MemTypeMask::PMEM) {
            names.push("pmem");
        }
        if self.contains(MemTypeMask::HBM) {
            names.push("hbm");
        }
        write!(f, "{}", names.join(","))
    }
}

/// A set of NUMA node ids, stored as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct NodeMask(u64);

impl NodeMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_nodes<I: IntoIterator<Item = NodeId>>(nodes: I) -> Self {
        let mut mask = Self::default();
        for node in nodes {
            mask.insert(node);
        }
        mask
    }

    pub fn insert(&mut self, node: NodeId) {
        debug_assert!(node < 64);
        self.0 |= 1 << node;
    }

    pub fn contains(&self, node: NodeId) -> bool {
        node < 64 && self.0 & (1 << node) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Number of nodes in the mask.
    pub fn size(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn union(&self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersection(&self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn is_subset(&self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..64).filter(|n| self.contains(*n))
    }

    /// Format as a cpuset-mems list, e.g. `"0-1,3"`.
    pub fn mems_string(&self) -> String {
        self.nodes().collect::<CpuSet>().to_string()
    }
}

impl std::fmt::Display for NodeMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mems_string())
    }
}

/// An uncommitted memory reservation.
#[derive(Debug, Clone)]
pub struct Offer {
    container: String,
    zone: NodeMask,
    amount: u64,
    version: u64,
}

impl Offer {
    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn node_mask(&self) -> NodeMask {
        self.zone
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }
}

#[derive(Debug, Error)]
pub enum MemError {
    #[error("out of memory: {message}")]
    OutOfMemory { message: String },

    #[error("offer is stale: {message}")]
    StaleOffer { message: String },
}

/// The memory allocator library the policy consumes.
pub trait MemAllocator {
    /// Mask of memory types present on this machine.
    fn available_types(&self) -> MemTypeMask;

    /// Mask of memory types present in a zone.
    fn zone_type(&self, zone: NodeMask) -> MemTypeMask;

    /// Compute a zone for `amount` bytes for `container`, starting from
    /// the nodes in `nodes` that carry one of the requested types. Does
    /// not mutate allocator state.
    fn make_offer(
        &self,
        container: &str,
        nodes: NodeMask,
        amount: u64,
        types: MemTypeMask,
    ) -> Result<Offer, MemError>;

    /// Commit a previously made offer. Returns the zones of other
    /// containers that had to shift to make room, keyed by container id.
    fn commit(&mut self, offer: &Offer) -> Result<BTreeMap<String, NodeMask>, MemError>;

    /// Drop a container's reservation.
    fn release(&mut self, container: &str);

    /// Re-register a reservation from a persisted snapshot.
    fn restore(&mut self, container: &str, zone: NodeMask, amount: u64);
}

#[derive(Debug, Clone)]
struct ZoneAllocation {
    zone: NodeMask,
    amount: u64,
}

/// Reference implementation of [`MemAllocator`]: linear capacity
/// accounting per NUMA node, overflow spill to the nearest node.
pub struct LinearMemAllocator {
    capacity: BTreeMap<NodeId, u64>,
    types: BTreeMap<NodeId, MemoryType>,
    distance: BTreeMap<(NodeId, NodeId), u32>,
    allocations: BTreeMap<String, ZoneAllocation>,
    epoch: u64,
}

impl LinearMemAllocator {
    pub fn from_system(sys: &dyn System) -> Self {
        let mut capacity = BTreeMap::new();
        let mut types = BTreeMap::new();
        let mut distance = BTreeMap::new();
        for a in sys.node_ids() {
            capacity.insert(a, sys.node_mem_capacity(a));
            types.insert(a, sys.node_memory_type(a));
            for b in sys.node_ids() {
                distance.insert((a, b), sys.node_distance(a, b));
            }
        }
        Self {
            capacity,
            types,
            distance,
            allocations: BTreeMap::new(),
            epoch: 0,
        }
    }

    fn zone_capacity(&self, zone: NodeMask) -> u64 {
        zone.nodes()
            .map(|n| self.capacity.get(&n).copied().unwrap_or(0))
            .sum()
    }

    /// Sum of reservations that must fit inside `zone` (everything
    /// whose own zone is a subset of it).
    fn zone_usage(&self, zone: NodeMask) -> u64 {
        self.allocations
            .values()
            .filter(|a| a.zone.is_subset(zone))
            .map(|a| a.amount)
            .sum()
    }

    /// Grow a zone by the node closest to any current member. Ties
    /// break towards the lower node id.
    fn expand(&self, zone: NodeMask) -> Option<NodeMask> {
        let candidate = self
            .capacity
            .keys()
            .copied()
            .filter(|n| !zone.contains(*n))
            .min_by_key(|n| {
                let dist = zone
                    .nodes()
                    .map(|m| self.distance.get(&(m, *n)).copied().unwrap_or(u32::MAX))
                    .min()
                    .unwrap_or(u32::MAX);
                (dist, *n)
            })?;
        let mut grown = zone;
        grown.insert(candidate);
        Some(grown)
    }
}

impl MemAllocator for LinearMemAllocator {
    fn available_types(&self) -> MemTypeMask {
        self.types
            .values()
            .fold(MemTypeMask::empty(), |acc, t| acc | MemTypeMask::from(*t))
    }

    fn zone_type(&self, zone: NodeMask) -> MemTypeMask {
        zone.nodes()
            .filter_map(|n| self.types.get(&n))
            .fold(MemTypeMask::empty(), |acc, t| acc | MemTypeMask::from(*t))
    }

    fn make_offer(
        &self,
        container: &str,
        nodes: NodeMask,
        amount: u64,
        types: MemTypeMask,
    ) -> Result<Offer, MemError> {
        // DRAM is always admissible; requested types widen the zone.
        let effective = types | MemTypeMask::DRAM;
        let mut zone = NodeMask::from_nodes(nodes.nodes().filter(|n| {
            self.types
                .get(n)
                .is_some_and(|t| effective.intersects(MemTypeMask::from(*t)))
        }));
        if zone.is_empty() {
            return Err(MemError::OutOfMemory {
                message: format!("no nodes of type {effective} in {nodes}"),
            });
        }
        // an explicitly requested type must actually be present
        if !types.is_empty() && (self.zone_type(zone) & types).is_empty() {
            return Err(MemError::OutOfMemory {
                message: format!("no {types} nodes in {nodes}"),
            });
        }
        while self.zone_usage(zone) + amount > self.zone_capacity(zone) {
            zone = self.expand(zone).ok_or_else(|| MemError::OutOfMemory {
                message: format!("{amount} bytes do not fit even system-wide for {container}"),
            })?;
        }
        Ok(Offer {
            container: container.to_string(),
            zone,
            amount,
            version: self.epoch,
        })
    }

    fn commit(&mut self, offer: &Offer) -> Result<BTreeMap<String, NodeMask>, MemError> {
        if offer.version != self.epoch {
            return Err(MemError::StaleOffer {
                message: format!(
                    "offer for {} made at epoch {}, state is at {}",
                    offer.container, offer.version, self.epoch
                ),
            });
        }
        self.allocations.insert(
            offer.container.clone(),
            ZoneAllocation {
                zone: offer.zone,
                amount: offer.amount,
            },
        );
        self.epoch += 1;

        // Shift overflowing reservations outward until everything fits
        // again. Each step strictly grows one zone, so this terminates.
        let all_nodes = NodeMask::from_nodes(self.capacity.keys().copied());
        let mut updates = BTreeMap::new();
        loop {
            let overflowing = self.allocations.iter().find_map(|(id, alloc)| {
                if alloc.zone != all_nodes
                    && self.zone_usage(alloc.zone) > self.zone_capacity(alloc.zone)
                {
                    Some((id.clone(), alloc.zone))
                } else {
                    None
                }
            });
            let Some((id, zone)) = overflowing else {
                break;
            };
            let Some(grown) = self.expand(zone) else {
                break;
            };
            self.allocations.get_mut(&id).expect("just found").zone = grown;
            if id != offer.container {
                updates.insert(id, grown);
            } else {
                warn!(
                    container = %offer.container,
                    zone = %grown,
                    "freshly committed zone had to grow immediately"
                );
            }
        }
        Ok(updates)
    }

    fn release(&mut self, container: &str) {
        if self.allocations.remove(container).is_some() {
            self.epoch += 1;
        }
    }

    fn restore(&mut self, container: &str, zone: NodeMask, amount: u64) {
        self.allocations
            .insert(container.to_string(), ZoneAllocation { zone, amount });
        self.epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockSystem;

    fn two_node_system() -> MockSystem {
        MockSystem::new()
            .with_node(0, 0, 0, MemoryType::Dram, "0-3", 1000)
            .with_node(1, 0, 0, MemoryType::Dram, "4-7", 1000)
            .with_distance(0, 1, 20)
    }

    #[test]
    fn offer_prefers_requested_nodes() {
        let sys = two_node_system();
        let mem = LinearMemAllocator::from_system(&sys);
        let offer = mem
            .make_offer("c0", NodeMask::from_nodes([0]), 500, MemTypeMask::empty())
            .unwrap();
        assert_eq!(offer.node_mask(), NodeMask::from_nodes([0]));
    }

    #[test]
    fn offer_spills_to_nearest_node_when_short() {
        let sys = two_node_system();
        let mem = LinearMemAllocator::from_system(&sys);
        let offer = mem
            .make_offer("c0", NodeMask::from_nodes([0]), 1500, MemTypeMask::empty())
            .unwrap();
        assert_eq!(offer.node_mask(), NodeMask::from_nodes([0, 1]));
    }

    #[test]
    fn commit_rejects_stale_offer() {
        let sys = two_node_system();
        let mut mem = LinearMemAllocator::from_system(&sys);
        let stale = mem
            .make_offer("c0", NodeMask::from_nodes([0]), 100, MemTypeMask::empty())
            .unwrap();
        let fresh = mem
            .make_offer("c1", NodeMask::from_nodes([0]), 100, MemTypeMask::empty())
            .unwrap();
        mem.commit(&fresh).unwrap();
        assert!(matches!(
            mem.commit(&stale),
            Err(MemError::StaleOffer { .. })
        ));
    }

    #[test]
    fn tight_commit_displaces_wider_reservation() {
        let sys = MockSystem::new()
            .with_node(0, 0, 0, MemoryType::Dram, "0-1", 1000)
            .with_node(1, 0, 0, MemoryType::Dram, "2-3", 1000)
            .with_node(2, 0, 0, MemoryType::Dram, "4-5", 1000)
            .with_distance(0, 1, 20)
            .with_distance(0, 2, 30)
            .with_distance(1, 2, 20);
        let mut mem = LinearMemAllocator::from_system(&sys);

        // c0 spans nodes 0-1, c1 then claims most of node 0 alone
        let wide = mem
            .make_offer(
                "c0",
                NodeMask::from_nodes([0, 1]),
                1500,
                MemTypeMask::empty(),
            )
            .unwrap();
        mem.commit(&wide).unwrap();

        let tight = mem
            .make_offer("c1", NodeMask::from_nodes([0]), 800, MemTypeMask::empty())
            .unwrap();
        let updates = mem.commit(&tight).unwrap();

        // c0's zone no longer fits next to c1 and spills onto node 2
        assert_eq!(
            updates.get("c0").copied(),
            Some(NodeMask::from_nodes([0, 1, 2]))
        );
    }

    #[test]
    fn pmem_request_keeps_dram_admissible() {
        let sys = MockSystem::new()
            .with_node(0, 0, 0, MemoryType::Dram, "0-3", 1000)
            .with_node(2, 0, 0, MemoryType::Pmem, "", 4000)
            .with_distance(0, 2, 10);
        let mem = LinearMemAllocator::from_system(&sys);
        let offer = mem
            .make_offer("c0", NodeMask::from_nodes([0, 2]), 500, MemTypeMask::PMEM)
            .unwrap();
        assert_eq!(offer.node_mask(), NodeMask::from_nodes([0, 2]));
        assert_eq!(
            mem.zone_type(offer.node_mask()),
            MemTypeMask::DRAM | MemTypeMask::PMEM
        );
    }

    #[test]
    fn release_frees_capacity() {
        let sys = two_node_system();
        let mut mem = LinearMemAllocator::from_system(&sys);
        let offer = mem
            .make_offer("c0", NodeMask::from_nodes([0]), 900, MemTypeMask::empty())
            .unwrap();
        mem.commit(&offer).unwrap();
        mem.release("c0");
        let again = mem
            .make_offer("c1", NodeMask::from_nodes([0]), 900, MemTypeMask::empty())
            .unwrap();
        assert_eq!(again.node_mask(), NodeMask::from_nodes([0]));
    }
}
