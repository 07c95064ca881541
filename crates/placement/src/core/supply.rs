//! Supply arithmetic: taking CPUs out of the tree and putting them back
//!
//! All mutations here are monotone per operation: every capacity check
//! happens before the first set is touched, so a failed take leaves the
//! tree byte-for-byte unchanged.

use utils::CpuSet;

use super::pool::{PoolId, PoolTree};
use super::request::Request;
use super::types::{CpuKind, PolicyError, Result};

/// The CPU side of a grant, with enough detail to undo it.
#[derive(Debug, Clone, Default)]
pub(crate) struct CpuTake {
    /// Exclusively taken CPUs
    pub exclusive: CpuSet,
    /// Subset of `exclusive` that came out of isolated supplies
    pub from_isolated: CpuSet,
    /// Millicpu booked against the pool's shared capacity
    pub shared_portion: i64,
    /// Reserved partition snapshot, for reserved grants
    pub reserved: CpuSet,
    /// Millicpu booked against the reserved partition
    pub reserved_portion: i64,
}

impl PoolTree {
    /// Take the CPU side of `req` out of `pool`'s transitive supply.
    pub(crate) fn take_cpus(&mut self, pool: PoolId, req: &Request) -> Result<CpuTake> {
        match req.cpu_kind {
            CpuKind::Preserve => Ok(CpuTake::default()),
            CpuKind::Reserved => self.take_reserved(req),
            CpuKind::Normal => self.take_normal(pool, req),
        }
    }

    fn take_reserved(&mut self, req: &Request) -> Result<CpuTake> {
        let root = self.root();
        let free = self.free_supply(root);
        let amount = req.millicpu.max(1);
        if free.allocatable_reserved_millicpu() < amount {
            return Err(PolicyError::insufficient(format!(
                "{}: {} mCPU of reserved capacity left, {} requested",
                req.pretty_name,
                free.allocatable_reserved_millicpu(),
                amount
            )));
        }
        self.pool_mut(root).supply.granted_reserved += amount;
        Ok(CpuTake {
            reserved: free.reserved,
            reserved_portion: amount,
            ..Default::default()
        })
    }

    fn take_normal(&mut self, pool: PoolId, req: &Request) -> Result<CpuTake> {
        let free = self.free_supply(pool);
        let full = req.full_cpus;
        let fraction = req.fraction;

        if req.isolate && full > 0 && free.isolated.size() >= full {
            if fraction > 0 && free.allocatable_shared_millicpu() < fraction {
                return Err(PolicyError::insufficient(format!(
                    "{}: isolated CPUs available but no {} mCPU of shared remainder",
                    req.pretty_name, fraction
                )));
            }
            let cpus = free.isolated.lowest(full).expect("size checked above");
            self.remove_owned(&cpus, true);
            self.pool_mut(pool).supply.granted_shared += fraction;
            return Ok(CpuTake {
                exclusive: cpus.clone(),
                from_isolated: cpus,
                shared_portion: fraction,
                ..Default::default()
            });
        }

        if full > 0 {
            if free.sharable.size() < full
                || free.allocatable_shared_millicpu() < 1000 * full as i64 + fraction
            {
                return Err(PolicyError::insufficient(format!(
                    "{}: {} whole CPUs + {} mCPU requested, {} mCPU allocatable from {}",
                    req.pretty_name,
                    full,
                    fraction,
                    free.allocatable_shared_millicpu(),
                    free.sharable
                )));
            }
            let cpus = free.sharable.lowest(full).expect("size checked above");
            self.remove_owned(&cpus, false);
            self.pool_mut(pool).supply.granted_shared += fraction;
            return Ok(CpuTake {
                exclusive: cpus,
                shared_portion: fraction,
                ..Default::default()
            });
        }

        // shared only
        if free.sharable.is_empty() || free.allocatable_shared_millicpu() < fraction {
            return Err(PolicyError::insufficient(format!(
                "{}: {} mCPU of shared capacity requested, {} allocatable",
                req.pretty_name,
                fraction,
                free.allocatable_shared_millicpu()
            )));
        }
        self.pool_mut(pool).supply.granted_shared += fraction;
        Ok(CpuTake {
            shared_portion: fraction,
            ..Default::default()
        })
    }

    /// Return a previously taken CPU allocation to the supplies it came
    /// from.
    pub(crate) fn put_cpus(&mut self, pool: PoolId, take: &CpuTake) {
        let exclusive = take.exclusive.clone();
        for cpu in exclusive.iter() {
            let owner = self
                .owner_of(cpu)
                .expect("granted CPU has an owning pool");
            let supply = &mut self.pool_mut(owner).supply;
            if take.from_isolated.contains(cpu) {
                supply.isolated.add(cpu);
            } else {
                supply.sharable.add(cpu);
            }
        }
        self.pool_mut(pool).supply.granted_shared -= take.shared_portion;
        let root = self.root();
        self.pool_mut(root).supply.granted_reserved -= take.reserved_portion;
    }

    /// Re-apply a known-good take, e.g. when restoring a persisted
    /// grant. The caller has already checked availability.
    pub(crate) fn take_exact(&mut self, pool: PoolId, take: &CpuTake) {
        let from_sharable = take.exclusive.difference(&take.from_isolated);
        self.remove_owned(&take.from_isolated, true);
        self.remove_owned(&from_sharable, false);
        self.pool_mut(pool).supply.granted_shared += take.shared_portion;
        let root = self.root();
        self.pool_mut(root).supply.granted_reserved += take.reserved_portion;
    }

    /// Remove exclusively granted CPUs from the pools that own them.
    fn remove_owned(&mut self, cpus: &CpuSet, isolated: bool) {
        for cpu in cpus.iter() {
            let owner = self
                .owner_of(cpu)
                .expect("free CPU has an owning pool");
            let supply = &mut self.pool_mut(owner).supply;
            if isolated {
                supply.isolated.remove(cpu);
            } else {
                supply.sharable.remove(cpu);
            }
        }
    }
}
