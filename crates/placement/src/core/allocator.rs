//! Pool selection and the allocation lifecycle
//!
//! The policy is single-threaded cooperative: the runtime shim
//! serializes admit, release and update events and calls in from one
//! event loop, so the tree is exclusively owned for the duration of
//! every public operation. An admission can fail at any step before
//! the offer commit and leaves the tree untouched; after the commit,
//! failures are limited to OS-level pin errors which are logged and do
//! not roll the grant back.

use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::{ContainerInfo, CpuPriority};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use utils::cgroup::millicpu_to_shares;
use utils::CpuSet;

use super::pool::{PoolId, PoolTree};
use super::request::{Grant, Request};
use super::scoring::compare::compare_pools;
use super::scoring::{hint_score, Score};
use super::supply::CpuTake;
use super::topology::build_pools;
use super::types::{CpuKind, PolicyError, Result};
use crate::config::PolicyOptions;
use crate::platform::cache::{Cache, Container};
use crate::platform::memory::{MemAllocator, MemError, NodeMask, Offer};
use crate::platform::system::System;

/// Blob key the allocations snapshot is persisted under.
pub const ALLOCATIONS_BLOB_KEY: &str = "allocations";

/// The topology-aware placement policy.
pub struct Policy {
    pub(crate) sys: Box<dyn System>,
    pub(crate) cache: Arc<dyn Cache>,
    pub(crate) mem: Box<dyn MemAllocator>,
    pub(crate) opts: PolicyOptions,
    pub(crate) tree: PoolTree,
    pub(crate) allocations: BTreeMap<String, Grant>,
}

impl Policy {
    /// Build the pool tree for the snapshot and start with an empty
    /// allocations table. Topology validation failures are fatal to
    /// the caller.
    pub fn new(
        sys: Box<dyn System>,
        cache: Arc<dyn Cache>,
        mem: Box<dyn MemAllocator>,
        opts: PolicyOptions,
    ) -> Result<Self> {
        let tree = build_pools(sys.as_ref(), &opts)?;
        info!(pools = tree.len(), "placement policy initialized");
        Ok(Self {
            sys,
            cache,
            mem,
            opts,
            tree,
            allocations: BTreeMap::new(),
        })
    }

    pub fn tree(&self) -> &PoolTree {
        &self.tree
    }

    pub fn allocations(&self) -> &BTreeMap<String, Grant> {
        &self.allocations
    }

    /// Pick a pool for the container and allocate from it.
    pub fn allocate_pool(&mut self, info: &ContainerInfo, pool_hint: &str) -> Result<Grant> {
        let mut req = Request::new(info, &self.opts, self.mem.available_types());

        // no reserved partition on this machine: fall back to the
        // shared pools
        if req.cpu_kind == CpuKind::Reserved
            && self.tree.free_supply(self.tree.root()).reserved.is_empty()
        {
            info!(
                container = %req.pretty_name,
                "no reserved CPUs, allocating from the shared pools instead"
            );
            req.cpu_kind = CpuKind::Normal;
        }

        let (pool, offer) = if matches!(req.cpu_kind, CpuKind::Reserved | CpuKind::Preserve) {
            // reserved and preserve requests always land at the root
            let root = self.tree.root();
            let free = self.tree.free_supply(root);
            let offer = self
                .mem
                .make_offer(
                    &req.container_id,
                    free.mem_nodes,
                    req.mem_amount,
                    req.mem_types,
                )
                .map_err(|e| {
                    PolicyError::insufficient(format!("failed to get offer for {req}: {e}"))
                })?;
            (root, offer)
        } else {
            let affinity = self.calculate_pool_affinities(info);
            let (mut scores, pools) = self.sort_pools_by_score(&req, &affinity);
            if pools.is_empty() {
                return Err(PolicyError::no_suitable_pool(format!(
                    "no pool can host {req}"
                )));
            }
            for (rank, id) in pools.iter().enumerate() {
                debug!(
                    rank,
                    pool = %self.tree.pool(*id).name,
                    score = %scores[id],
                    affinity = affinity.get(id).copied().unwrap_or(0),
                    "pool fitting"
                );
            }

            let mut pool = None;
            if !pool_hint.is_empty() {
                match pools
                    .iter()
                    .position(|id| self.tree.pool(*id).name == pool_hint)
                {
                    Some(rank) => {
                        info!(hint = pool_hint, rank = rank + 1, "using hinted pool");
                        pool = Some(pools[rank]);
                    }
                    None => debug!(hint = pool_hint, "cannot use hinted pool"),
                }
            }
            let pool = pool.unwrap_or(pools[0]);
            let offer = scores
                .get_mut(&pool)
                .and_then(|score| score.offer.take())
                .ok_or_else(|| {
                    PolicyError::insufficient(format!(
                        "no memory offer for {req} from {}",
                        self.tree.pool(pool).name
                    ))
                })?;
            (pool, offer)
        };

        let (grant, updates) = self.allocate_from(pool, &req, offer)?;
        self.apply_zone_updates(&grant.container_id, updates);

        info!(grant = %grant, "allocated");
        self.allocations.insert(grant.container_id.clone(), grant.clone());
        self.save_allocations();

        Ok(grant)
    }

    /// Release a container's grant. Returns the removed grant, if any.
    pub fn release_pool(&mut self, container_id: &str) -> Option<Grant> {
        let Some(grant) = self.allocations.remove(container_id) else {
            info!(container = container_id, "no grant found, nothing to release");
            return None;
        };
        info!(grant = %grant, "releasing");

        let take = CpuTake {
            exclusive: grant.exclusive.clone(),
            from_isolated: grant.exclusive.intersection(&self.sys.isolated_cpus()),
            shared_portion: grant.shared_portion,
            reserved: CpuSet::new(),
            reserved_portion: grant.reserved_portion,
        };
        self.tree.put_cpus(grant.pool, &take);
        self.mem.release(container_id);
        self.save_allocations();

        Some(grant)
    }

    /// Push a grant's CPU and memory assignment down to the container.
    pub fn apply_grant(&self, grant: &Grant) {
        let Some(container) = self.cache.lookup_container(&grant.container_id) else {
            warn!(container = %grant.pretty_name, "cannot apply grant, container not cached");
            return;
        };

        let mut cpus = CpuSet::new();
        let mut portion = grant.shared_portion;
        match grant.cpu_kind {
            CpuKind::Normal => {
                if grant.exclusive.is_empty() {
                    cpus = grant.shared.clone();
                } else if portion > 0 {
                    cpus = grant.exclusive.union(&grant.shared);
                } else {
                    cpus = grant.exclusive.clone();
                }
            }
            CpuKind::Reserved => {
                cpus = grant.reserved.clone();
                portion = grant.reserved_portion;
            }
            CpuKind::Preserve => {}
        }

        if self.opts.pin_cpu {
            if grant.cpu_kind == CpuKind::Preserve {
                info!(
                    container = %grant.pretty_name,
                    cpuset = %container.get_cpuset_cpus(),
                    "preserving cpuset"
                );
            } else {
                if cpus.is_empty() {
                    info!(container = %grant.pretty_name, "not pinning CPUs, cpuset is empty");
                    if let Err(e) = container.set_cpuset_cpus("") {
                        warn!(container = %grant.pretty_name, error = %e, "failed to clear cpuset");
                    }
                } else {
                    self.set_preferred_cpuset_cpus(container.as_ref(), &cpus, grant.hide_hyperthreads);
                }

                // the scheduling weight covers the sub-CPU share of the
                // allocation; fully exclusive grants get weighted by
                // their CPU count
                let millicpu = if portion > 0 {
                    portion
                } else {
                    1000 * grant.exclusive.size() as i64
                };
                if let Err(e) = container.set_cpu_shares(millicpu_to_shares(millicpu)) {
                    warn!(container = %grant.pretty_name, error = %e, "failed to set CPU shares");
                }
            }
        }

        if grant.cpu_kind == CpuKind::Preserve {
            debug!(
                container = %grant.pretty_name,
                mems = %container.get_cpuset_mems(),
                "preserving memory pinning"
            );
        } else if self.opts.pin_memory {
            debug!(container = %grant.pretty_name, mems = %grant.mem_zone, "pinning memory");
            if let Err(e) = container.set_cpuset_mems(&grant.mem_zone.mems_string()) {
                warn!(container = %grant.pretty_name, error = %e, "failed to pin memory");
            }
        }
    }

    /// Re-pin every shared allocation whose pool-level shared CPU set
    /// may have changed. `changed` names the grant that triggered the
    /// update and is skipped; `None` refreshes everything.
    pub fn update_shared_allocations(&mut self, changed: Option<&str>) {
        if let Some(id) = changed {
            if let Some(grant) = self.allocations.get(id) {
                info!(grant = %grant, "updating shared allocations affected by grant");
                if grant.cpu_kind == CpuKind::Reserved {
                    info!("grant uses reserved CPUs, does not affect shared allocations");
                    return;
                }
            }
        } else {
            info!("updating all shared allocations");
        }

        let ids: Vec<String> = self.allocations.keys().cloned().collect();
        for id in ids {
            if changed == Some(id.as_str()) {
                continue;
            }
            let grant = &self.allocations[&id];
            match grant.cpu_kind {
                CpuKind::Reserved => {
                    debug!(container = %grant.pretty_name, "not affected, reserved CPUs only");
                    continue;
                }
                CpuKind::Preserve => {
                    debug!(container = %grant.pretty_name, "not affected, preserving pinning");
                    continue;
                }
                CpuKind::Normal => {}
            }
            if grant.shared_portion == 0 && !grant.exclusive.is_empty() {
                debug!(container = %grant.pretty_name, "not affected, exclusive CPUs only");
                continue;
            }

            let shared = self.tree.free_supply(grant.pool).sharable;
            let cpus = if grant.exclusive.is_empty() {
                shared.clone()
            } else {
                grant.exclusive.union(&shared)
            };
            let hide = grant.hide_hyperthreads;
            let pretty = grant.pretty_name.clone();
            self.allocations
                .get_mut(&id)
                .expect("iterating existing ids")
                .shared = shared;

            if self.opts.pin_cpu {
                if let Some(container) = self.cache.lookup_container(&id) {
                    info!(container = %pretty, cpus = %cpus, "re-pinning to updated shared set");
                    self.set_preferred_cpuset_cpus(container.as_ref(), &cpus, hide);
                }
            }
        }
    }

    /// Score every pool for the request and order them best-first.
    pub fn sort_pools_by_score(
        &self,
        req: &Request,
        affinity: &BTreeMap<PoolId, i32>,
    ) -> (BTreeMap<PoolId, Score>, Vec<PoolId>) {
        let scores: BTreeMap<PoolId, Score> = self
            .tree
            .depth_first(self.tree.root())
            .into_iter()
            .map(|id| (id, self.score_pool(id, req)))
            .collect();
        let mut pools: Vec<PoolId> = self.tree.pools().map(|p| p.id).collect();
        pools.sort_by(|&a, &b| compare_pools(req, &self.tree, &scores, affinity, a, b));
        (scores, pools)
    }

    /// Turn the container's affinity rules into per-pool weights by
    /// matching them against the existing grants.
    fn calculate_pool_affinities(&self, info: &ContainerInfo) -> BTreeMap<PoolId, i32> {
        let mut affinity: BTreeMap<PoolId, i32> = BTreeMap::new();
        for rule in &info.affinity {
            let pattern = match glob::Pattern::new(&rule.scope) {
                Ok(pattern) => pattern,
                Err(e) => {
                    warn!(scope = %rule.scope, error = %e, "bad affinity scope glob");
                    continue;
                }
            };
            for grant in self.allocations.values() {
                if pattern.matches(&grant.pretty_name) {
                    *affinity.entry(grant.pool).or_default() += rule.weight;
                }
            }
        }
        affinity
    }

    fn score_pool(&self, pool: PoolId, req: &Request) -> Score {
        let mut score = Score::new(pool);
        let free = self.tree.free_supply(pool);
        let full = req.full_cpus as i64;
        let mut part = req.fraction;
        if full == 0 && part == 0 {
            part = 1;
        }

        match req.cpu_kind {
            CpuKind::Normal => {
                score.shared = free.allocatable_shared_millicpu() - 1000 * full - part;
                if req.isolate {
                    score.isolated = free.isolated.size() as i64 - full;
                }
            }
            CpuKind::Reserved => {
                score.reserved = free.allocatable_reserved_millicpu() - (1000 * full + part);
            }
            CpuKind::Preserve => {}
        }

        for prio in [CpuPriority::Low, CpuPriority::Normal, CpuPriority::High] {
            let class = self.sys.priority_cpus(prio).intersection(&free.sharable);
            score.set_prio_capacity(prio, 1000 * class.size() as i64 - (1000 * full + part));
        }

        score.colocated = self
            .allocations
            .values()
            .filter(|g| g.pool == pool)
            .count() as i64;

        for (provider, hint) in &req.hints {
            score
                .hints
                .insert(provider.clone(), hint_score(&self.tree, pool, hint));
        }

        score.mem_types = self.mem.zone_type(free.mem_nodes);
        match self
            .mem
            .make_offer(&req.container_id, free.mem_nodes, req.mem_amount, req.mem_types)
        {
            Ok(offer) => {
                score.offer_types = self.mem.zone_type(offer.node_mask());
                score.offer = Some(offer);
            }
            Err(e) => {
                debug!(pool = %self.tree.pool(pool).name, error = %e, "no memory offer");
            }
        }

        score
    }

    /// Commit the CPU and memory sides of the request against one
    /// pool. CPU state is rolled back if the offer turns out stale, so
    /// a failed allocation leaves the supply unchanged.
    fn allocate_from(
        &mut self,
        pool: PoolId,
        req: &Request,
        offer: Offer,
    ) -> Result<(Grant, BTreeMap<String, NodeMask>)> {
        let take = self.tree.take_cpus(pool, req)?;

        let updates = match self.mem.commit(&offer) {
            Ok(updates) => updates,
            Err(e) => {
                self.tree.put_cpus(pool, &take);
                return Err(match e {
                    MemError::StaleOffer { .. } => PolicyError::offer_stale(e.to_string()),
                    MemError::OutOfMemory { .. } => PolicyError::insufficient(e.to_string()),
                });
            }
        };

        let shared = if req.cpu_kind == CpuKind::Normal {
            self.tree.free_supply(pool).sharable
        } else {
            CpuSet::new()
        };

        let grant = Grant {
            container_id: req.container_id.clone(),
            pretty_name: req.pretty_name.clone(),
            namespace: req.namespace.clone(),
            pool,
            pool_name: self.tree.pool(pool).name.clone(),
            cpu_kind: req.cpu_kind,
            cpu_prio: req.cpu_prio,
            exclusive: take.exclusive,
            reserved: take.reserved,
            shared,
            shared_portion: take.shared_portion,
            reserved_portion: take.reserved_portion,
            mem_zone: offer.node_mask(),
            mem_types: req.mem_types,
            mem_amount: req.mem_amount,
            millicpu: req.millicpu,
            hide_hyperthreads: req.hide_hyperthreads,
        };
        Ok((grant, updates))
    }

    /// Apply zone updates from an offer commit to the other grants.
    fn apply_zone_updates(&mut self, trigger: &str, updates: BTreeMap<String, NodeMask>) {
        for (id, zone) in updates {
            if id == trigger {
                continue;
            }
            match self.allocations.get_mut(&id) {
                Some(grant) => {
                    info!(container = %grant.pretty_name, zone = %zone, "updating memory allocation");
                    grant.mem_zone = zone;
                    if self.opts.pin_memory {
                        if let Some(container) = self.cache.lookup_container(&id) {
                            if let Err(e) = container.set_cpuset_mems(&zone.mems_string()) {
                                warn!(
                                    container = %grant.pretty_name,
                                    error = %e,
                                    "failed to re-pin memory"
                                );
                            }
                        }
                    }
                }
                None => {
                    let err = PolicyError::UnknownZoneUpdate {
                        message: format!("container {id}, zone {zone}"),
                    };
                    error!(error = %err, "skipping zone update");
                }
            }
        }
    }

    fn set_preferred_cpuset_cpus(
        &self,
        container: &dyn Container,
        cpus: &CpuSet,
        hide_hyperthreads: bool,
    ) {
        let mut allow = cpus.clone();
        if hide_hyperthreads {
            allow = self.sys.single_thread_for_cpus(cpus);
            if allow.size() != cpus.size() {
                info!(
                    container = %container.pretty_name(),
                    hidden = cpus.size() - allow.size(),
                    cpuset = %allow,
                    "hiding hyperthreads"
                );
            }
        }
        if let Err(e) = container.set_cpuset_cpus(&allow.to_string()) {
            let err = PolicyError::PinFailure {
                message: format!("{}: {e}", container.pretty_name()),
            };
            warn!(error = %err, "keeping grant");
        }
    }
}

/// Persisted shape of one grant. Pools are referenced by name so a
/// snapshot survives restarts as long as the topology is unchanged.
#[derive(Debug, Serialize, Deserialize)]
struct GrantRecord {
    container_id: String,
    pretty_name: String,
    namespace: String,
    pool: String,
    cpu_kind: CpuKind,
    cpu_prio: CpuPriority,
    exclusive: String,
    reserved: String,
    shared: String,
    shared_portion: i64,
    reserved_portion: i64,
    mem_zone: Vec<u32>,
    mem_types: String,
    mem_amount: u64,
    millicpu: i64,
    hide_hyperthreads: bool,
}

impl GrantRecord {
    fn from_grant(grant: &Grant) -> Self {
        Self {
            container_id: grant.container_id.clone(),
            pretty_name: grant.pretty_name.clone(),
            namespace: grant.namespace.clone(),
            pool: grant.pool_name.clone(),
            cpu_kind: grant.cpu_kind,
            cpu_prio: grant.cpu_prio,
            exclusive: grant.exclusive.to_string(),
            reserved: grant.reserved.to_string(),
            shared: grant.shared.to_string(),
            shared_portion: grant.shared_portion,
            reserved_portion: grant.reserved_portion,
            mem_zone: grant.mem_zone.nodes().collect(),
            mem_types: grant.mem_types.to_string(),
            mem_amount: grant.mem_amount,
            millicpu: grant.millicpu,
            hide_hyperthreads: grant.hide_hyperthreads,
        }
    }
}

impl Policy {
    /// Persist the allocations table through the cache blob API. Called
    /// after every mutation; failures are logged, the in-memory state
    /// stays authoritative.
    fn save_allocations(&self) {
        let records: Vec<GrantRecord> = self.allocations.values().map(GrantRecord::from_grant).collect();
        let data = match serde_json::to_vec_pretty(&records) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "failed to serialize allocations");
                return;
            }
        };
        if let Err(e) = self.cache.set_blob(ALLOCATIONS_BLOB_KEY, &data) {
            warn!(error = %e, "failed to persist allocations");
        }
    }

    /// Load the persisted allocations snapshot and re-apply it to the
    /// freshly built tree. Records that no longer fit the topology are
    /// logged and skipped. Returns the number of restored grants.
    pub fn restore_allocations(&mut self) -> Result<usize> {
        let data = match self.cache.get_blob(ALLOCATIONS_BLOB_KEY) {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(0),
            Err(e) => {
                warn!(error = %e, "failed to read allocations snapshot");
                return Ok(0);
            }
        };
        let records: Vec<GrantRecord> = match serde_json::from_slice(&data) {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "ignoring unparsable allocations snapshot");
                return Ok(0);
            }
        };

        let mut restored = 0;
        for record in records {
            match self.restore_record(&record) {
                Ok(grant) => {
                    self.allocations.insert(grant.container_id.clone(), grant);
                    restored += 1;
                }
                Err(e) => {
                    warn!(
                        container = %record.pretty_name,
                        error = %e,
                        "dropping unrestorable grant"
                    );
                }
            }
        }
        self.save_allocations();
        Ok(restored)
    }

    fn restore_record(&mut self, record: &GrantRecord) -> Result<Grant> {
        let pool = self.tree.find_by_name(&record.pool).ok_or_else(|| {
            PolicyError::no_suitable_pool(format!("pool {} no longer exists", record.pool))
        })?;
        let exclusive = CpuSet::parse(&record.exclusive)
            .map_err(|e| PolicyError::insufficient(e.to_string()))?;
        let reserved = CpuSet::parse(&record.reserved)
            .map_err(|e| PolicyError::insufficient(e.to_string()))?;
        let shared =
            CpuSet::parse(&record.shared).map_err(|e| PolicyError::insufficient(e.to_string()))?;

        // the recorded exclusive CPUs must still be free
        let free = self.tree.free_supply(pool);
        let available = free.isolated.union(&free.sharable);
        if !exclusive.is_subset(&available) {
            return Err(PolicyError::insufficient(format!(
                "exclusive CPUs {} no longer free in {}",
                exclusive, record.pool
            )));
        }

        let take = CpuTake {
            exclusive: exclusive.clone(),
            from_isolated: exclusive.intersection(&self.sys.isolated_cpus()),
            shared_portion: record.shared_portion,
            reserved: reserved.clone(),
            reserved_portion: record.reserved_portion,
        };
        self.tree.take_exact(pool, &take);

        let mem_zone = NodeMask::from_nodes(record.mem_zone.iter().copied());
        self.mem
            .restore(&record.container_id, mem_zone, record.mem_amount);

        Ok(Grant {
            container_id: record.container_id.clone(),
            pretty_name: record.pretty_name.clone(),
            namespace: record.namespace.clone(),
            pool,
            pool_name: record.pool.clone(),
            cpu_kind: record.cpu_kind,
            cpu_prio: record.cpu_prio,
            exclusive,
            reserved,
            shared,
            shared_portion: record.shared_portion,
            reserved_portion: record.reserved_portion,
            mem_zone,
            mem_types: crate::platform::memory::MemTypeMask::parse(&record.mem_types)
                .unwrap_or_default(),
            mem_amount: record.mem_amount,
            millicpu: record.millicpu,
            hide_hyperthreads: record.hide_hyperthreads,
        })
    }
}
