//! Pool tree construction from hardware topology
//!
//! The tree mirrors the locality hierarchy of the machine with two
//! collapsing rules. CPU-less NUMA nodes (PMEM, HBM) never become
//! pools; their memory is assigned to the surrogate of one of the
//! closest DRAM nodes. A NUMA node that would end up the only
//! CPU-bearing child of its parent is omitted too, with the would-be
//! parent recorded as its surrogate, so the tree never contains a
//! single-child chain and comparator depth stays meaningful.

use std::collections::BTreeMap;

use tracing::{debug, warn};
use utils::CpuSet;

use super::pool::{Pool, PoolKind, PoolTree, Supply};
use super::types::{PolicyError, Result};
use crate::config::PolicyOptions;
use crate::platform::memory::NodeMask;
use crate::platform::system::{MemoryType, NodeId, System};

/// Arena node used while the tree shape is still being decided.
struct Draft {
    kind: PoolKind,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Build the pool tree for a hardware snapshot.
pub fn build_pools(sys: &dyn System, opts: &PolicyOptions) -> Result<PoolTree> {
    let omit_dies = check_hw_topology(sys)?;
    if sys.package_ids().is_empty() {
        return Err(PolicyError::topology_invalid("no packages in snapshot"));
    }

    let reserved_cpus = match &opts.reserved_resources {
        Some(list) => CpuSet::parse(list).map_err(|e| {
            PolicyError::topology_invalid(format!("invalid reserved CPU list: {e}"))
        })?,
        None => CpuSet::new(),
    };

    let mut drafts: Vec<Draft> = Vec::new();
    let mut push = |drafts: &mut Vec<Draft>, kind: PoolKind, parent: Option<usize>| {
        let idx = drafts.len();
        drafts.push(Draft {
            kind,
            parent,
            children: Vec::new(),
        });
        if let Some(parent) = parent {
            drafts[parent].children.push(idx);
        }
        idx
    };

    // virtual root only on multi-socket machines
    let root = if sys.socket_count() > 1 {
        let idx = push(&mut drafts, PoolKind::VirtualRoot, None);
        debug!("created virtual root pool");
        Some(idx)
    } else {
        debug!("single-socket system, socket becomes the root");
        None
    };

    let mut sockets: BTreeMap<u32, usize> = BTreeMap::new();
    for package in sys.package_ids() {
        let idx = push(&mut drafts, PoolKind::Socket { package }, root);
        sockets.insert(package, idx);
    }

    // dies, only where a socket has at least two of them
    let mut numa_dies: BTreeMap<NodeId, usize> = BTreeMap::new();
    if !omit_dies {
        for (&package, &socket) in &sockets {
            let die_ids = sys.die_ids(package);
            if die_ids.len() < 2 {
                debug!(package, die_count = die_ids.len(), "omitted die layer");
                continue;
            }
            for die in die_ids {
                let idx = push(&mut drafts, PoolKind::Die { package, die }, Some(socket));
                for node in sys.die_node_ids(package, die) {
                    numa_dies.insert(node, idx);
                }
            }
        }
    }

    // NUMA leaves, partitioned by memory type; CPU-less types never
    // become pools and lone CPU-bearing children are collapsed into
    // their would-be parent
    let mut dram: BTreeMap<NodeId, ()> = BTreeMap::new();
    let mut pmem: BTreeMap<NodeId, ()> = BTreeMap::new();
    let mut hbm: BTreeMap<NodeId, ()> = BTreeMap::new();
    let mut surrogates: BTreeMap<NodeId, usize> = BTreeMap::new();
    for node in sys.node_ids() {
        match sys.node_memory_type(node) {
            MemoryType::Dram => {
                dram.insert(node, ());
            }
            MemoryType::Pmem => {
                pmem.insert(node, ());
                debug!(node, "omitted pool: PMEM node");
                continue;
            }
            MemoryType::Hbm => {
                hbm.insert(node, ());
                debug!(node, "omitted pool: HBM node");
                continue;
            }
            MemoryType::Other => {
                warn!(node, "ignored NUMA node: unhandled memory type");
                continue;
            }
        }

        let die_parent = numa_dies.get(&node).copied();
        let parent = die_parent.unwrap_or_else(|| sockets[&sys.node_package(node)]);
        if cpu_bearing_sibling_count(sys, node, die_parent.is_some()) < 2 {
            surrogates.insert(node, parent);
            debug!(node, surrogate = %drafts[parent].kind.pool_name(), "omitted lone NUMA pool");
            continue;
        }
        let idx = push(&mut drafts, PoolKind::Numa { node }, Some(parent));
        surrogates.insert(node, idx);
    }

    // assign PMEM and HBM memory to the surrogates of their closest
    // DRAM nodes, each type independently, then merge
    let mut assigned = assign_numa_nodes(sys, &surrogates, &pmem, &dram)?;
    let hbms = assign_numa_nodes(sys, &surrogates, &hbm, &dram)?;
    for (idx, ids) in hbms {
        let entry = assigned.entry(idx).or_default();
        entry.extend(ids);
        entry.sort_unstable();
        entry.dedup();
    }

    // enumerate depth-first, discover supplies, consume assignments
    let root_idx = root.unwrap_or_else(|| sockets[sys.package_ids().first().unwrap()]);
    let mut tree = PoolTree::default();
    let mut stack = vec![(root_idx, None::<usize>, 0u32)];
    while let Some((idx, parent, depth)) = stack.pop() {
        let id = tree.pools.len();
        let draft = &drafts[idx];
        let assigned_nodes = assigned.remove(&idx).unwrap_or_default();

        let mut cpus = CpuSet::new();
        let mut mem_nodes = NodeMask::new();
        for node in &assigned_nodes {
            cpus = cpus.union(&sys.node_cpuset(*node));
            mem_nodes.insert(*node);
        }
        let isolated = cpus.intersection(&sys.isolated_cpus());
        let reserved = cpus.intersection(&reserved_cpus);
        let sharable = cpus.difference(&isolated).difference(&reserved);
        for cpu in isolated.iter().chain(sharable.iter()) {
            tree.cpu_owner.insert(cpu, id);
        }

        tree.pools.push(Pool {
            id,
            name: draft.kind.pool_name(),
            kind: draft.kind,
            parent,
            children: Vec::new(),
            depth,
            assigned_nodes,
            cpus,
            supply: Supply {
                isolated,
                sharable,
                mem_nodes,
                ..Default::default()
            },
        });
        if let Some(parent) = parent {
            tree.pools[parent].children.push(id);
        }
        for child in draft.children.iter().rev() {
            stack.push((*child, Some(id), depth + 1));
        }
    }

    // the reserved partition is carved out of the whole machine and
    // owned by the root
    let root_id = tree.root();
    let all_cpus = tree.pool_cpus(root_id);
    tree.pools[root_id].supply.reserved = all_cpus.intersection(&reserved_cpus);

    if !assigned.is_empty() {
        let leftovers: Vec<String> = assigned
            .values()
            .flatten()
            .map(|n| format!("#{n}"))
            .collect();
        return Err(PolicyError::unassigned_memory_node(format!(
            "NUMA nodes {} not assigned to any pool",
            leftovers.join(", ")
        )));
    }

    debug!("pool tree:\n{tree}");

    Ok(tree)
}

/// Number of CPU-bearing NUMA nodes among the would-be siblings of
/// `node` under its prospective parent (die if one exists, else the
/// whole package).
fn cpu_bearing_sibling_count(sys: &dyn System, node: NodeId, has_die_parent: bool) -> usize {
    let package = sys.node_package(node);
    let siblings = if has_die_parent {
        sys.die_node_ids(package, sys.node_die(node))
    } else {
        sys.package_node_ids(package)
    };
    siblings
        .into_iter()
        .filter(|n| !sys.node_cpuset(*n).is_empty())
        .count()
}

/// Assign each CPU-less node to the least-loaded surrogate among the
/// DRAM nodes closest to it, then every DRAM node to its own
/// surrogate, DRAM ids first in the per-surrogate lists.
fn assign_numa_nodes(
    sys: &dyn System,
    surrogates: &BTreeMap<NodeId, usize>,
    xmem: &BTreeMap<NodeId, ()>,
    dram: &BTreeMap<NodeId, ()>,
) -> Result<BTreeMap<usize, Vec<NodeId>>> {
    let mut assigned: BTreeMap<usize, Vec<NodeId>> = BTreeMap::new();

    for &x in xmem.keys() {
        // DRAM nodes at minimum distance, ties kept, ascending ids
        let mut closest: Vec<NodeId> = Vec::new();
        for &d in dram.keys() {
            if closest.is_empty() {
                closest.push(d);
                continue;
            }
            let min_dist = sys.node_distance(x, closest[0]);
            let new_dist = sys.node_distance(x, d);
            if new_dist == min_dist {
                closest.push(d);
            } else if new_dist < min_dist {
                closest = vec![d];
            }
        }
        closest.sort_unstable();

        let mut taker: Option<(usize, NodeId)> = None;
        for &d in &closest {
            let surrogate = surrogates[&d];
            let load = assigned.get(&surrogate).map_or(0, Vec::len);
            match taker {
                Some((current, _)) if assigned.get(&current).map_or(0, Vec::len) > load => {
                    taker = Some((surrogate, d));
                }
                None => taker = Some((surrogate, d)),
                _ => {}
            }
        }
        let Some((taker, via)) = taker else {
            return Err(PolicyError::unassigned_memory_node(format!(
                "CPU-less {} node #{x} has no DRAM surrogate",
                sys.node_memory_type(x)
            )));
        };
        assigned.entry(taker).or_default().push(x);
        debug!(
            node = x,
            via,
            distance = sys.node_distance(x, via),
            "assigned CPU-less NUMA node"
        );
    }

    // reverse order so that after the front-inserts DRAM ids end up
    // ascending ahead of the CPU-less ids
    for &d in dram.keys().rev() {
        assigned.entry(surrogates[&d]).or_default().insert(0, d);
    }

    Ok(assigned)
}

/// Verify the implicit assumptions about the hardware. Returns whether
/// the die layer must be omitted.
fn check_hw_topology(sys: &dyn System) -> Result<bool> {
    // NUMA nodes (memory controllers) must not be shared by sockets
    let package_nodes: BTreeMap<u32, Vec<NodeId>> = sys
        .package_ids()
        .into_iter()
        .map(|p| (p, sys.package_node_ids(p)))
        .collect();
    for (&p1, nodes1) in &package_nodes {
        for (&p2, nodes2) in &package_nodes {
            if p1 == p2 {
                continue;
            }
            let shared: Vec<_> = nodes1.iter().filter(|n| nodes2.contains(n)).collect();
            if !shared.is_empty() {
                return Err(PolicyError::topology_invalid(format!(
                    "sockets #{p1}, #{p2} share NUMA node(s) {shared:?}"
                )));
            }
        }
    }

    // NUMA nodes shared by dies are tolerated by dropping the die layer
    for package in sys.package_ids() {
        let die_ids = sys.die_ids(package);
        for &d1 in &die_ids {
            let nodes1 = sys.die_node_ids(package, d1);
            for &d2 in &die_ids {
                if d1 == d2 {
                    continue;
                }
                let nodes2 = sys.die_node_ids(package, d2);
                if nodes1.iter().any(|n| nodes2.contains(n)) {
                    warn!(
                        package,
                        die1 = d1,
                        die2 = d2,
                        "dies share NUMA nodes, ignoring the die layer"
                    );
                    return Ok(true);
                }
            }
        }
    }

    // the SLIT distance matrix must be symmetric
    for from in sys.node_ids() {
        for to in sys.node_ids() {
            let d1 = sys.node_distance(from, to);
            let d2 = sys.node_distance(to, from);
            if d1 != d2 {
                return Err(PolicyError::topology_invalid(format!(
                    "asymmetric NUMA distance (#{from}, #{to}): {d1} != {d2}"
                )));
            }
        }
    }

    Ok(false)
}
