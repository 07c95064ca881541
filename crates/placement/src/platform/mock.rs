//! Test adapters implementing the consumed interfaces
//!
//! Synthetic hardware snapshots, containers and caches for unit and
//! integration tests; kept in the library so downstream crates can
//! drive the policy without real hardware.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::bail;
use api_types::{ContainerInfo, CpuPriority};
use utils::CpuSet;

use super::cache::{Cache, Container};
use super::system::{DieId, MemoryType, NodeId, PackageId, System};

#[derive(Debug, Clone)]
struct MockNode {
    package: PackageId,
    die: DieId,
    mem_type: MemoryType,
    cpus: CpuSet,
    capacity: u64,
}

/// Synthetic hardware snapshot built with a fluent builder.
#[derive(Debug, Clone, Default)]
pub struct MockSystem {
    nodes: BTreeMap<NodeId, MockNode>,
    distances: BTreeMap<(NodeId, NodeId), u32>,
    isolated: CpuSet,
    cores: BTreeMap<u32, u32>,
    priorities: BTreeMap<&'static str, CpuSet>,
}

impl MockSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a NUMA node. `cpus` is a kubelet CPU list, empty for
    /// CPU-less (PMEM/HBM) nodes.
    pub fn with_node(
        mut self,
        node: NodeId,
        package: PackageId,
        die: DieId,
        mem_type: MemoryType,
        cpus: &str,
        capacity: u64,
    ) -> Self {
        self.nodes.insert(
            node,
            MockNode {
                package,
                die,
                mem_type,
                cpus: CpuSet::parse(cpus).expect("mock CPU list should parse"),
                capacity,
            },
        );
        self
    }

    /// Set the distance between two nodes, both directions.
    pub fn with_distance(mut self, a: NodeId, b: NodeId, distance: u32) -> Self {
        self.distances.insert((a, b), distance);
        self.distances.insert((b, a), distance);
        self
    }

    /// Set the distance in one direction only, for asymmetry tests.
    pub fn with_one_way_distance(mut self, from: NodeId, to: NodeId, distance: u32) -> Self {
        self.distances.insert((from, to), distance);
        self
    }

    pub fn with_isolated(mut self, cpus: &str) -> Self {
        self.isolated = CpuSet::parse(cpus).expect("mock CPU list should parse");
        self
    }

    /// Declare two logical CPUs as hyperthread siblings of `core`.
    pub fn with_core(mut self, core: u32, threads: &str) -> Self {
        for cpu in CpuSet::parse(threads).expect("mock CPU list should parse").iter() {
            self.cores.insert(cpu, core);
        }
        self
    }

    pub fn with_priority_cpus(mut self, prio: CpuPriority, cpus: &str) -> Self {
        let key = match prio {
            CpuPriority::Low => "low",
            CpuPriority::Normal => "normal",
            CpuPriority::High => "high",
        };
        self.priorities
            .insert(key, CpuSet::parse(cpus).expect("mock CPU list should parse"));
        self
    }

    fn node(&self, id: NodeId) -> &MockNode {
        self.nodes.get(&id).expect("unknown mock NUMA node")
    }

    fn all_cpus(&self) -> CpuSet {
        self.nodes
            .values()
            .fold(CpuSet::new(), |acc, n| acc.union(&n.cpus))
    }
}

impl System for MockSystem {
    fn socket_count(&self) -> usize {
        self.package_ids().len()
    }

    fn package_ids(&self) -> Vec<PackageId> {
        let mut ids: Vec<_> = self.nodes.values().map(|n| n.package).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn die_ids(&self, package: PackageId) -> Vec<DieId> {
        let mut ids: Vec<_> = self
            .nodes
            .values()
            .filter(|n| n.package == package)
            .map(|n| n.die)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn die_node_ids(&self, package: PackageId, die: DieId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.package == package && n.die == die)
            .map(|(id, _)| *id)
            .collect()
    }

    fn package_node_ids(&self, package: PackageId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.package == package)
            .map(|(id, _)| *id)
            .collect()
    }

    fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    fn node_cpuset(&self, node: NodeId) -> CpuSet {
        self.node(node).cpus.clone()
    }

    fn node_package(&self, node: NodeId) -> PackageId {
        self.node(node).package
    }

    fn node_die(&self, node: NodeId) -> DieId {
        self.node(node).die
    }

    fn node_memory_type(&self, node: NodeId) -> MemoryType {
        self.node(node).mem_type
    }

    fn node_mem_capacity(&self, node: NodeId) -> u64 {
        self.node(node).capacity
    }

    fn node_distance(&self, from: NodeId, to: NodeId) -> u32 {
        if let Some(d) = self.distances.get(&(from, to)) {
            return *d;
        }
        if from == to {
            10
        } else {
            20
        }
    }

    fn isolated_cpus(&self) -> CpuSet {
        self.isolated.clone()
    }

    fn priority_cpus(&self, prio: CpuPriority) -> CpuSet {
        match prio {
            CpuPriority::Low => self.priorities.get("low").cloned().unwrap_or_default(),
            CpuPriority::High => self.priorities.get("high").cloned().unwrap_or_default(),
            CpuPriority::Normal => match self.priorities.get("normal") {
                Some(cpus) => cpus.clone(),
                // everything that is not explicitly low or high
                None => self
                    .all_cpus()
                    .difference(&self.priority_cpus(CpuPriority::Low))
                    .difference(&self.priority_cpus(CpuPriority::High)),
            },
        }
    }

    fn single_thread_for_cpus(&self, cpus: &CpuSet) -> CpuSet {
        let mut kept: BTreeMap<u64, u32> = BTreeMap::new();
        for cpu in cpus.iter() {
            // CPUs without a declared sibling are their own core
            let core = match self.cores.get(&cpu) {
                Some(core) => *core as u64,
                None => (1 << 32) + cpu as u64,
            };
            let entry = kept.entry(core).or_insert(cpu);
            if cpu < *entry {
                *entry = cpu;
            }
        }
        kept.values().copied().collect()
    }
}

#[derive(Debug, Default)]
struct CgroupState {
    cpus: String,
    mems: String,
    shares: u64,
}

/// Container test double recording the cgroup writes the policy makes.
pub struct MockContainer {
    info: ContainerInfo,
    state: Mutex<CgroupState>,
    fail_pinning: Mutex<bool>,
}

impl MockContainer {
    pub fn new(info: ContainerInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            state: Mutex::new(CgroupState::default()),
            fail_pinning: Mutex::new(false),
        })
    }

    /// Make subsequent cpuset writes fail, for PinFailure tests.
    pub fn fail_pinning(&self, fail: bool) {
        *self.fail_pinning.lock().unwrap() = fail;
    }

    pub fn cpu_shares(&self) -> u64 {
        self.state.lock().unwrap().shares
    }
}

impl Container for MockContainer {
    fn id(&self) -> String {
        self.info.id.clone()
    }

    fn pretty_name(&self) -> String {
        self.info.pretty_name()
    }

    fn namespace(&self) -> String {
        self.info.namespace.clone()
    }

    fn annotation(&self, key: &str) -> Option<String> {
        self.info.annotations.get(key).cloned()
    }

    fn millicpu_request(&self) -> i64 {
        self.info.millicpu_request
    }

    fn get_cpuset_cpus(&self) -> String {
        self.state.lock().unwrap().cpus.clone()
    }

    fn get_cpuset_mems(&self) -> String {
        self.state.lock().unwrap().mems.clone()
    }

    fn set_cpuset_cpus(&self, cpus: &str) -> anyhow::Result<()> {
        if *self.fail_pinning.lock().unwrap() {
            bail!("cpuset write rejected by OS");
        }
        self.state.lock().unwrap().cpus = cpus.to_string();
        Ok(())
    }

    fn set_cpuset_mems(&self, mems: &str) -> anyhow::Result<()> {
        if *self.fail_pinning.lock().unwrap() {
            bail!("cpuset-mems write rejected by OS");
        }
        self.state.lock().unwrap().mems = mems.to_string();
        Ok(())
    }

    fn set_cpu_shares(&self, shares: u64) -> anyhow::Result<()> {
        self.state.lock().unwrap().shares = shares;
        Ok(())
    }
}

/// In-memory cache test double.
#[derive(Default)]
pub struct MockCache {
    containers: Mutex<BTreeMap<String, Arc<MockContainer>>>,
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MockCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_container(&self, container: Arc<MockContainer>) {
        self.containers
            .lock()
            .unwrap()
            .insert(container.id(), container);
    }

    /// Concrete-typed lookup for assertions on recorded cgroup writes.
    pub fn container(&self, id: &str) -> Option<Arc<MockContainer>> {
        self.containers.lock().unwrap().get(id).cloned()
    }
}

impl Cache for MockCache {
    fn lookup_container(&self, id: &str) -> Option<Arc<dyn Container>> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .map(|c| c as Arc<dyn Container>)
    }

    fn set_blob(&self, key: &str, data: &[u8]) -> anyhow::Result<()> {
        self.blobs
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn get_blob(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().unwrap().get(key).cloned())
    }
}
