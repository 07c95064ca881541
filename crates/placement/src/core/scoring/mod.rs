//! Request scoring
//!
//! Scoring is pull-based and purely functional over the tree: a
//! [`Score`] captures how well one pool could serve one request, and
//! the comparator in [`compare`] turns those into a total order.

pub mod compare;

use std::collections::BTreeMap;

use api_types::{CpuPriority, TopologyHint};
use tracing::warn;
use utils::CpuSet;

use super::pool::{PoolId, PoolTree};
use crate::platform::memory::{MemTypeMask, Offer};

/// How well a pool fits a request. Capacities are signed: negative
/// means granting the request here would overflow the supply.
#[derive(Debug, Clone)]
pub struct Score {
    pub pool: PoolId,
    /// Whole isolated CPUs left after the request
    pub isolated: i64,
    /// Reserved millicpu left after the request
    pub reserved: i64,
    /// Shared millicpu left after the request
    pub shared: i64,
    /// Millicpu left in each CPU priority class after the request
    prio: [i64; 3],
    /// Grants already pinned to this pool
    pub colocated: i64,
    /// Topology hint scores by provider, each in [0.0, 1.0]
    pub hints: BTreeMap<String, f64>,
    /// Memory types the pool's assigned nodes advertise
    pub mem_types: MemTypeMask,
    /// Pending memory offer, if one could be made
    pub offer: Option<Offer>,
    /// Memory types of the offer's zone
    pub offer_types: MemTypeMask,
}

impl Score {
    pub(crate) fn new(pool: PoolId) -> Self {
        Self {
            pool,
            isolated: 0,
            reserved: 0,
            shared: 0,
            prio: [0; 3],
            colocated: 0,
            hints: BTreeMap::new(),
            mem_types: MemTypeMask::empty(),
            offer: None,
            offer_types: MemTypeMask::empty(),
        }
    }

    pub fn prio_capacity(&self, prio: CpuPriority) -> i64 {
        self.prio[prio_index(prio)]
    }

    pub(crate) fn set_prio_capacity(&mut self, prio: CpuPriority, capacity: i64) {
        self.prio[prio_index(prio)] = capacity;
    }
}

fn prio_index(prio: CpuPriority) -> usize {
    match prio {
        CpuPriority::Low => 0,
        CpuPriority::Normal => 1,
        CpuPriority::High => 2,
    }
}

impl std::fmt::Display for Score {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<isolated {}, reserved {}, shared {}, colocated {}, offer {}>",
            self.isolated,
            self.reserved,
            self.shared,
            self.colocated,
            match &self.offer {
                Some(o) => o.node_mask().to_string(),
                None => "none".to_string(),
            },
        )
    }
}

/// Dilution factor per tree edge when spreading affinity outward.
const AFFINITY_Q: f64 = 0.75;

/// Effective affinity of a pool: the pool's own affinity plus that of
/// every ancestor and every descendant, each diluted by `Q^edges`.
pub fn affinity_score(tree: &PoolTree, affinity: &BTreeMap<PoolId, i32>, pool: PoolId) -> f64 {
    let weight = |id: PoolId| affinity.get(&id).copied().unwrap_or(0) as f64;

    let mut score = 0.0;
    let mut q = AFFINITY_Q;
    let mut parent = tree.pool(pool).parent;
    while let Some(id) = parent {
        score += q * weight(id);
        q *= AFFINITY_Q;
        parent = tree.pool(id).parent;
    }

    let base_depth = tree.pool(pool).depth;
    for id in tree.breadth_first(pool) {
        let diff = (tree.pool(id).depth - base_depth) as i32;
        score += AFFINITY_Q.powi(diff) * weight(id);
    }
    score
}

/// Combine per-provider hint scores into the (combined, filtered) pair
/// the comparator consumes: the product of all scores, and the product
/// of the non-zero ones.
pub fn combine_hint_scores(scores: &BTreeMap<String, f64>) -> (f64, f64) {
    if scores.is_empty() {
        return (0.0, 0.0);
    }
    let mut combined = 1.0;
    let mut filtered = 0.0;
    for &score in scores.values() {
        combined *= score;
        if score != 0.0 {
            if filtered == 0.0 {
                filtered = score;
            } else {
                filtered *= score;
            }
        }
    }
    (combined, filtered)
}

/// Score one topology hint against a pool: the fraction of the hinted
/// CPUs (or NUMA nodes) the pool covers.
pub fn hint_score(tree: &PoolTree, pool: PoolId, hint: &TopologyHint) -> f64 {
    if let Some(cpus) = &hint.cpus {
        let hinted = match CpuSet::parse(cpus) {
            Ok(set) => set,
            Err(e) => {
                warn!(hint = %cpus, error = %e, "unparsable CPU hint");
                return 0.0;
            }
        };
        if hinted.is_empty() {
            return 0.0;
        }
        let covered = tree.pool_cpus(pool).intersection(&hinted);
        return covered.size() as f64 / hinted.size() as f64;
    }

    if let Some(numas) = &hint.numas {
        let hinted = match CpuSet::parse(numas) {
            Ok(set) => set,
            Err(e) => {
                warn!(hint = %numas, error = %e, "unparsable NUMA hint");
                return 0.0;
            }
        };
        if hinted.is_empty() {
            return 0.0;
        }
        let mem_nodes = tree.free_supply(pool).mem_nodes;
        let covered = hinted.iter().filter(|n| mem_nodes.contains(*n)).count();
        return covered as f64 / hinted.size() as f64;
    }

    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyOptions;
    use crate::core::topology::build_pools;
    use crate::platform::mock::MockSystem;
    use crate::platform::system::MemoryType;

    fn four_leaf_tree() -> PoolTree {
        let sys = MockSystem::new()
            .with_node(0, 0, 0, MemoryType::Dram, "0-7", 1 << 30)
            .with_node(1, 0, 0, MemoryType::Dram, "8-15", 1 << 30)
            .with_node(2, 0, 0, MemoryType::Dram, "16-23", 1 << 30)
            .with_node(3, 0, 0, MemoryType::Dram, "24-31", 1 << 30);
        build_pools(&sys, &PolicyOptions::default()).unwrap()
    }

    #[test]
    fn affinity_counts_the_pool_itself_at_full_weight() {
        let tree = four_leaf_tree();
        let leaf = tree.find_by_name("NUMA node #0").unwrap();
        let affinity = BTreeMap::from([(leaf, 100)]);
        assert_eq!(affinity_score(&tree, &affinity, leaf), 100.0);
    }

    #[test]
    fn affinity_dilutes_one_edge_away() {
        let tree = four_leaf_tree();
        let leaf0 = tree.find_by_name("NUMA node #0").unwrap();
        let affinity = BTreeMap::from([(leaf0, 100)]);

        // the socket root sees the leaf one edge down
        assert_eq!(affinity_score(&tree, &affinity, tree.root()), 75.0);
        // sibling leaves see it through the root only, via the parent
        // walk, one edge up
        let leaf1 = tree.find_by_name("NUMA node #1").unwrap();
        assert_eq!(affinity_score(&tree, &affinity, leaf1), 0.0);
    }

    #[test]
    fn affinity_on_ancestor_reaches_down() {
        let tree = four_leaf_tree();
        let leaf = tree.find_by_name("NUMA node #2").unwrap();
        let affinity = BTreeMap::from([(tree.root(), 40)]);
        assert_eq!(affinity_score(&tree, &affinity, leaf), 30.0);
    }

    #[test]
    fn combined_hint_score_multiplies_all() {
        let scores = BTreeMap::from([
            ("gpu".to_string(), 0.5),
            ("nic".to_string(), 0.5),
        ]);
        assert_eq!(combine_hint_scores(&scores), (0.25, 0.25));
    }

    #[test]
    fn filtered_hint_score_skips_zeroes() {
        let scores = BTreeMap::from([
            ("gpu".to_string(), 0.0),
            ("nic".to_string(), 0.8),
        ]);
        let (combined, filtered) = combine_hint_scores(&scores);
        assert_eq!(combined, 0.0);
        assert_eq!(filtered, 0.8);
    }

    #[test]
    fn empty_hints_score_zero() {
        assert_eq!(combine_hint_scores(&BTreeMap::new()), (0.0, 0.0));
    }

    #[test]
    fn cpu_hint_scores_by_coverage() {
        let tree = four_leaf_tree();
        let leaf0 = tree.find_by_name("NUMA node #0").unwrap();
        let hint = TopologyHint {
            cpus: Some("0-7".to_string()),
            numas: None,
        };
        assert_eq!(hint_score(&tree, leaf0, &hint), 1.0);

        let wide = TopologyHint {
            cpus: Some("0-15".to_string()),
            numas: None,
        };
        assert_eq!(hint_score(&tree, leaf0, &wide), 0.5);
        assert_eq!(hint_score(&tree, tree.root(), &wide), 1.0);
    }

    #[test]
    fn numa_hint_scores_by_coverage() {
        let tree = four_leaf_tree();
        let leaf1 = tree.find_by_name("NUMA node #1").unwrap();
        let hint = TopologyHint {
            cpus: None,
            numas: Some("1".to_string()),
        };
        assert_eq!(hint_score(&tree, leaf1, &hint), 1.0);
        let leaf0 = tree.find_by_name("NUMA node #0").unwrap();
        assert_eq!(hint_score(&tree, leaf0, &hint), 0.0);
    }
}
