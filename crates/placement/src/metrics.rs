//! Flat-pool ("balloons") metrics projection
//!
//! The flat-pool variant of the policy reports one gauge sample per
//! balloon, a named group of CPUs dedicated to a set of containers.
//! This module materializes that view from the allocation state: every
//! pool with at least one grant projects to a balloon record with
//! deterministic string encodings (sorted before joining), so repeated
//! collections over unchanged state are byte-identical.

use std::collections::{BTreeMap, BTreeSet};

use lazy_static::lazy_static;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use utils::CpuSet;

use crate::core::allocator::Policy;
use crate::platform::system::System;

const BALLOON_LABELS: &[&str] = &[
    "balloon_type",
    "cpu_class",
    "cpus_min",
    "cpus_max",
    "balloon",
    "groups",
    "cpus",
    "cpus_count",
    "numas",
    "numas_count",
    "dies",
    "dies_count",
    "packages",
    "packages_count",
    "sharedidlecpus",
    "sharedidlecpus_count",
    "cpus_allowed",
    "cpus_allowed_count",
    "mems",
    "containers",
    "tot_req_millicpu",
];

lazy_static! {
    /// Registry for the policy metric families
    pub static ref REGISTRY: Registry = Registry::new();

    static ref BALLOONS: GaugeVec =
        GaugeVec::new(Opts::new("balloons", "CPUs"), BALLOON_LABELS).unwrap();
}

/// Register the metric families with the registry. Call once at
/// startup.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(BALLOONS.clone()))
}

/// Metrics of one balloon instance.
#[derive(Debug, Clone)]
pub struct BalloonMetrics {
    // Balloon type metrics
    pub def_name: String,
    pub cpu_class: String,
    pub min_cpus: usize,
    pub max_cpus: usize,
    // Balloon instance metrics
    pub pretty_name: String,
    pub groups: String,
    pub cpus: CpuSet,
    pub cpus_count: usize,
    pub numas: Vec<String>,
    pub numas_count: usize,
    pub dies: Vec<String>,
    pub dies_count: usize,
    pub packages: Vec<String>,
    pub packages_count: usize,
    pub shared_idle_cpus: CpuSet,
    pub shared_idle_cpus_count: usize,
    pub cpus_allowed: CpuSet,
    pub cpus_allowed_count: usize,
    pub mems: String,
    pub container_names: String,
    pub container_req_millicpu: i64,
}

/// The policy-level metrics snapshot.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub balloons: Vec<BalloonMetrics>,
}

impl Metrics {
    /// Publish the snapshot into the gauge family, replacing the
    /// previous collection.
    pub fn collect(&self) {
        BALLOONS.reset();
        for bm in &self.balloons {
            BALLOONS
                .with_label_values(&[
                    &bm.def_name,
                    &bm.cpu_class,
                    &bm.min_cpus.to_string(),
                    &bm.max_cpus.to_string(),
                    &bm.pretty_name,
                    &bm.groups,
                    &bm.cpus.to_string(),
                    &bm.cpus_count.to_string(),
                    &bm.numas.join(","),
                    &bm.numas_count.to_string(),
                    &bm.dies.join(","),
                    &bm.dies_count.to_string(),
                    &bm.packages.join(","),
                    &bm.packages_count.to_string(),
                    &bm.shared_idle_cpus.to_string(),
                    &bm.shared_idle_cpus_count.to_string(),
                    &bm.cpus_allowed.to_string(),
                    &bm.cpus_allowed_count.to_string(),
                    &bm.mems,
                    &bm.container_names,
                    &bm.container_req_millicpu.to_string(),
                ])
                .set(bm.cpus_count as f64);
        }
    }
}

/// Render the registry in the text exposition format.
pub fn render() -> Result<String, prometheus::Error> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buf)?;
    Ok(String::from_utf8(buf).expect("text exposition is valid utf-8"))
}

/// Where a CPU set lives in the hardware: index 3 holds NUMA node
/// names, 2 die names, 1 package names, each sorted. Index 0 is
/// unused.
pub fn cpu_locations(sys: &dyn System, cpus: &CpuSet) -> [Vec<String>; 4] {
    let mut numas = BTreeSet::new();
    let mut dies = BTreeSet::new();
    let mut packages = BTreeSet::new();
    for node in sys.node_ids() {
        if !sys.node_cpuset(node).intersection(cpus).is_empty() {
            let package = sys.node_package(node);
            numas.insert(node);
            dies.insert((package, sys.node_die(node)));
            packages.insert(package);
        }
    }
    [
        Vec::new(),
        packages.into_iter().map(|p| p.to_string()).collect(),
        dies.into_iter().map(|(p, d)| format!("{p}/{d}")).collect(),
        numas.into_iter().map(|n| n.to_string()).collect(),
    ]
}

impl Policy {
    /// Project the current allocation state into the flat-pool shape:
    /// one balloon per pool holding grants.
    pub fn metrics(&self) -> Metrics {
        let mut balloons = Vec::new();
        for pool in self.tree.pools() {
            let grants: Vec<_> = self
                .allocations
                .values()
                .filter(|g| g.pool == pool.id)
                .collect();
            if grants.is_empty() {
                continue;
            }

            let cpus = grants.iter().fold(CpuSet::new(), |acc, g| {
                acc.union(&g.exclusive).union(&g.reserved)
            });
            let shared_idle_cpus = self.tree.free_supply(pool.id).sharable;
            let cpus_allowed = cpus.union(&shared_idle_cpus);
            let loc = cpu_locations(self.sys.as_ref(), &cpus);

            let mut groups: BTreeMap<String, usize> = BTreeMap::new();
            for grant in &grants {
                *groups.entry(grant.namespace.clone()).or_default() += 1;
            }
            let groups = groups
                .into_iter()
                .filter(|(_, count)| *count > 0)
                .map(|(name, _)| name)
                .collect::<Vec<_>>()
                .join(",");

            // same CPU class for every grant on the pool, else mixed
            let mut classes: BTreeSet<String> = BTreeSet::new();
            for grant in &grants {
                classes.insert(grant.cpu_prio.to_string());
            }
            let cpu_class = if classes.len() == 1 {
                classes.into_iter().next().unwrap()
            } else {
                "mixed".to_string()
            };

            let mems = grants
                .iter()
                .fold(crate::platform::memory::NodeMask::new(), |acc, g| {
                    acc.union(g.mem_zone)
                })
                .mems_string();

            let mut container_names = Vec::new();
            let mut container_req_millicpu = 0;
            for grant in &grants {
                if let Some(container) = self.cache.lookup_container(&grant.container_id) {
                    container_names.push(container.pretty_name());
                    container_req_millicpu += container.millicpu_request();
                }
            }
            container_names.sort();

            balloons.push(BalloonMetrics {
                def_name: pool.kind.type_name().to_string(),
                cpu_class,
                min_cpus: 0,
                max_cpus: self.tree.pool_cpus(pool.id).size(),
                pretty_name: pool.name.clone(),
                groups,
                cpus_count: cpus.size(),
                cpus,
                numas_count: loc[3].len(),
                numas: loc[3].clone(),
                dies_count: loc[2].len(),
                dies: loc[2].clone(),
                packages_count: loc[1].len(),
                packages: loc[1].clone(),
                shared_idle_cpus_count: shared_idle_cpus.size(),
                shared_idle_cpus,
                cpus_allowed_count: cpus_allowed.size(),
                cpus_allowed,
                mems,
                container_names: container_names.join(","),
                container_req_millicpu,
            });
        }
        Metrics { balloons }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockSystem;
    use crate::platform::system::MemoryType;

    #[test]
    fn cpu_locations_index_zero_is_unused() {
        let sys = MockSystem::new()
            .with_node(0, 0, 0, MemoryType::Dram, "0-3", 1 << 30)
            .with_node(1, 0, 1, MemoryType::Dram, "4-7", 1 << 30)
            .with_node(2, 1, 0, MemoryType::Dram, "8-11", 1 << 30);

        let cpus = CpuSet::parse("2,5").unwrap();
        let loc = cpu_locations(&sys, &cpus);

        assert!(loc[0].is_empty());
        assert_eq!(loc[1], vec!["0"]);
        assert_eq!(loc[2], vec!["0/0", "0/1"]);
        assert_eq!(loc[3], vec!["0", "1"]);
    }

    #[test]
    fn cpu_locations_are_sorted() {
        let sys = MockSystem::new()
            .with_node(0, 0, 0, MemoryType::Dram, "0-3", 1 << 30)
            .with_node(1, 1, 0, MemoryType::Dram, "4-7", 1 << 30);

        let loc = cpu_locations(&sys, &CpuSet::parse("0-7").unwrap());
        assert_eq!(loc[1], vec!["0", "1"]);
        assert_eq!(loc[3], vec!["0", "1"]);
    }
}
