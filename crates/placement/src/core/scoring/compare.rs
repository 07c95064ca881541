//! Pool ordering for a request
//!
//! A lexicographic tie-break ladder: the first rung that tells two
//! pools apart decides, and two pools that tie on every rung are
//! ordered by id, so the relation is a total, deterministic order.
//! `Ordering::Less` means the first pool is the better fit.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use api_types::CpuPriority;
use tracing::debug;

use super::{affinity_score, combine_hint_scores, Score};
use crate::core::pool::{PoolId, PoolTree};
use crate::core::request::Request;
use crate::core::types::CpuKind;

/// Compare two pools as placement candidates for `req`.
pub fn compare_pools(
    req: &Request,
    tree: &PoolTree,
    scores: &BTreeMap<PoolId, Score>,
    affinity: &BTreeMap<PoolId, i32>,
    a: PoolId,
    b: PoolId,
) -> Ordering {
    let pool1 = tree.pool(a);
    let pool2 = tree.pool(b);
    let (depth1, depth2) = (pool1.depth, pool2.depth);
    let (id1, id2) = (a, b);
    let score1 = &scores[&a];
    let score2 = &scores[&b];
    let kind = req.cpu_kind;
    let (isolated1, reserved1, shared1) = (score1.isolated, score1.reserved, score1.shared);
    let (isolated2, reserved2, shared2) = (score2.isolated, score2.reserved, score2.shared);
    let a1 = affinity_score(tree, affinity, a);
    let a2 = affinity_score(tree, affinity, b);

    let win1 = |rule: &str| {
        debug!(winner = %pool1.name, loser = %pool2.name, rule, "pool comparison decided");
        Ordering::Less
    };
    let win2 = |rule: &str| {
        debug!(winner = %pool2.name, loser = %pool1.name, rule, "pool comparison decided");
        Ordering::Greater
    };
    let by_id = |rule: &str| {
        let winner = if id1 < id2 { &pool1.name } else { &pool2.name };
        debug!(winner = %winner, rule, "pool comparison decided on lower id");
        id1.cmp(&id2)
    };

    // a pool that cannot hold the request loses outright
    match kind {
        CpuKind::Normal => {
            if (isolated2 < 0 && isolated1 >= 0) || (shared2 <= 0 && shared1 > 0) {
                return win1("sufficiency");
            }
            if (isolated1 < 0 && isolated2 >= 0) || (shared1 <= 0 && shared2 > 0) {
                return win2("sufficiency");
            }
        }
        CpuKind::Reserved => {
            if reserved2 < 0 && reserved1 >= 0 {
                return win1("sufficiency");
            }
            if reserved1 < 0 && reserved2 >= 0 {
                return win2("sufficiency");
            }
        }
        CpuKind::Preserve => {}
    }

    // higher affinity score wins
    if a1 > a2 {
        return win1("affinity");
    }
    if a2 > a1 {
        return win2("affinity");
    }

    // better matching or tighter memory offer wins
    match (&score1.offer, &score2.offer) {
        (Some(_), None) => return win1("memory offer"),
        (None, Some(_)) => return win2("memory offer"),
        (None, None) => {}
        (Some(o1), Some(o2)) => {
            if !req.mem_types.is_empty() {
                let t1 = score1.offer_types;
                let t2 = score2.offer_types;
                if t1 == req.mem_types && t2 != req.mem_types {
                    return win1("offer type match");
                }
                if t1 != req.mem_types && t2 == req.mem_types {
                    return win2("offer type match");
                }
            }
            let (m1, m2) = (o1.node_mask(), o2.node_mask());
            if m1.size() < m2.size() {
                return win1("tighter offer");
            }
            if m2.size() < m1.size() {
                return win2("tighter offer");
            }
        }
    }

    // a pool advertising the requested memory type wins
    if !req.mem_types.is_empty() && kind != CpuKind::Preserve {
        let has1 = score1.mem_types.contains(req.mem_types);
        let has2 = score2.mem_types.contains(req.mem_types);
        if has1 && !has2 {
            return win1("memory type");
        }
        if !has1 && has2 {
            return win2("memory type");
        }
    }

    // topology hints, when either side has any
    if !score1.hints.is_empty() || !score2.hints.is_empty() {
        let (hs1, nz1) = combine_hint_scores(&score1.hints);
        let (hs2, nz2) = combine_hint_scores(&score2.hints);

        if hs1 > hs2 {
            return win1("hints");
        }
        if hs2 > hs1 {
            return win2("hints");
        }
        if hs1 == 0.0 {
            if nz1 > nz2 {
                return win1("non-zero hints");
            }
            if nz2 > nz1 {
                return win2("non-zero hints");
            }
        }
        // equal non-zero hint scores settle on depth and id here;
        // equal all-zero scores deliberately fall through instead
        if hs1 == hs2 && nz1 == nz2 && (hs1 != 0.0 || nz1 != 0.0) {
            if depth1 > depth2 {
                return win1("hint depth");
            }
            if depth1 < depth2 {
                return win2("hint depth");
            }
            return by_id("hint tie");
        }
    }

    // for low and high priority requests the only fulfilling pool wins
    if matches!(req.cpu_prio, CpuPriority::Low | CpuPriority::High) {
        let p1 = score1.prio_capacity(req.cpu_prio);
        let p2 = score2.prio_capacity(req.cpu_prio);
        if p1 >= 0 && p2 < 0 {
            return win1("priority capacity");
        }
        if p1 < 0 && p2 >= 0 {
            return win2("priority capacity");
        }
    }

    // a deeper pool is more local and wins
    if depth1 > depth2 {
        return win1("depth");
    }
    if depth1 < depth2 {
        return win2("depth");
    }

    match kind {
        CpuKind::Reserved => {
            // reserved CPUs also run best-effort containers that carry
            // no CPU demand, so account per colocated container
            let per1 = reserved1 / (score1.colocated + 1);
            let per2 = reserved2 / (score2.colocated + 1);
            if per1 > per2 {
                return win1("reserved per colocated");
            }
            if per2 > per1 {
                return win2("reserved per colocated");
            }
        }
        CpuKind::Normal => {
            if req.isolate && (isolated1 > 0 || isolated2 > 0) {
                if isolated1 > isolated2 {
                    return win1("isolated capacity");
                }
                if isolated2 > isolated1 {
                    return win2("isolated capacity");
                }
                return by_id("isolated tie");
            }

            if req.cpu_prio == CpuPriority::Normal {
                let p1 = score1.prio_capacity(CpuPriority::Normal);
                let p2 = score2.prio_capacity(CpuPriority::Normal);
                if p1 >= 0 && p2 < 0 {
                    return win1("normal priority capacity");
                }
                if p1 < 0 && p2 >= 0 {
                    return win2("normal priority capacity");
                }
            }

            if req.full_cpus > 0 && (shared1 > 0 || shared2 > 0) {
                if shared1 > shared2 {
                    return win1("slicable capacity");
                }
                if shared2 > shared1 {
                    return win2("slicable capacity");
                }
                return by_id("slicable tie");
            }

            if score1.colocated < score2.colocated {
                return win1("colocation");
            }
            if score2.colocated < score1.colocated {
                return win2("colocation");
            }

            if shared1 > shared2 {
                return win1("shared capacity");
            }
            if shared2 > shared1 {
                return win2("shared capacity");
            }
        }
        CpuKind::Preserve => {}
    }

    by_id("final")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyOptions;
    use crate::core::topology::build_pools;
    use crate::platform::mock::MockSystem;
    use crate::platform::system::MemoryType;
    use api_types::ContainerInfo;
    use crate::platform::memory::MemTypeMask;

    fn tree() -> PoolTree {
        let sys = MockSystem::new()
            .with_node(0, 0, 0, MemoryType::Dram, "0-7", 1 << 30)
            .with_node(1, 0, 0, MemoryType::Dram, "8-15", 1 << 30)
            .with_node(2, 0, 0, MemoryType::Dram, "16-23", 1 << 30)
            .with_node(3, 0, 0, MemoryType::Dram, "24-31", 1 << 30);
        build_pools(&sys, &PolicyOptions::default()).unwrap()
    }

    fn request(millicpu: i64) -> Request {
        let info = ContainerInfo {
            id: "c0".to_string(),
            namespace: "default".to_string(),
            pod_name: "pod0".to_string(),
            container_name: "main".to_string(),
            millicpu_request: millicpu,
            ..Default::default()
        };
        Request::new(&info, &PolicyOptions::default(), MemTypeMask::DRAM)
    }

    fn base_scores(tree: &PoolTree) -> BTreeMap<PoolId, Score> {
        tree.pools()
            .map(|p| {
                let mut score = Score::new(p.id);
                score.shared = 8000;
                score.isolated = 0;
                score.mem_types = MemTypeMask::DRAM;
                (p.id, score)
            })
            .collect()
    }

    #[test]
    fn insufficient_shared_capacity_loses() {
        let tree = tree();
        let req = request(1000);
        let mut scores = base_scores(&tree);
        let leaf0 = tree.find_by_name("NUMA node #0").unwrap();
        let leaf1 = tree.find_by_name("NUMA node #1").unwrap();
        scores.get_mut(&leaf0).unwrap().shared = -500;

        let empty = BTreeMap::new();
        assert_eq!(
            compare_pools(&req, &tree, &scores, &empty, leaf1, leaf0),
            Ordering::Less
        );
        assert_eq!(
            compare_pools(&req, &tree, &scores, &empty, leaf0, leaf1),
            Ordering::Greater
        );
    }

    #[test]
    fn affinity_beats_depth() {
        let tree = tree();
        let req = request(1000);
        let scores = base_scores(&tree);
        let leaf1 = tree.find_by_name("NUMA node #1").unwrap();
        // the shallow root carries affinity, the deeper leaf does not
        let affinity = BTreeMap::from([(tree.root(), 100)]);
        // root's own affinity (100) vs leaf seeing it diluted (75)
        assert_eq!(
            compare_pools(&req, &tree, &scores, &affinity, tree.root(), leaf1),
            Ordering::Less
        );
    }

    #[test]
    fn equal_nonzero_hints_settle_on_depth_then_id() {
        let tree = tree();
        let req = request(1000);
        let mut scores = base_scores(&tree);
        let leaf0 = tree.find_by_name("NUMA node #0").unwrap();
        let leaf1 = tree.find_by_name("NUMA node #1").unwrap();
        scores
            .get_mut(&leaf0)
            .unwrap()
            .hints
            .insert("gpu".to_string(), 0.5);
        scores
            .get_mut(&leaf1)
            .unwrap()
            .hints
            .insert("gpu".to_string(), 0.5);

        let empty = BTreeMap::new();
        // depths equal, so the lower id (leaf0) wins right here
        assert_eq!(
            compare_pools(&req, &tree, &scores, &empty, leaf0, leaf1),
            Ordering::Less
        );
        // the deeper pool beats the root on the hint tie-break even
        // though later rungs would also prefer it
        assert_eq!(
            compare_pools(&req, &tree, &scores, &empty, tree.root(), leaf0),
            Ordering::Greater
        );
    }

    #[test]
    fn equal_zero_hints_fall_through_to_later_rungs() {
        let tree = tree();
        let req = request(1000);
        let mut scores = base_scores(&tree);
        let leaf0 = tree.find_by_name("NUMA node #0").unwrap();
        let leaf1 = tree.find_by_name("NUMA node #1").unwrap();
        scores
            .get_mut(&leaf0)
            .unwrap()
            .hints
            .insert("gpu".to_string(), 0.0);
        scores
            .get_mut(&leaf1)
            .unwrap()
            .hints
            .insert("gpu".to_string(), 0.0);
        // make the later shared-capacity rung favor leaf1; with the
        // all-zero hint tie the ladder must fall through and see it
        scores.get_mut(&leaf1).unwrap().shared = 9000;

        let empty = BTreeMap::new();
        assert_eq!(
            compare_pools(&req, &tree, &scores, &empty, leaf0, leaf1),
            Ordering::Greater
        );
    }

    #[test]
    fn higher_hint_score_wins_at_equal_depth() {
        let tree = tree();
        let req = request(1000);
        let mut scores = base_scores(&tree);
        let leaf0 = tree.find_by_name("NUMA node #0").unwrap();
        let leaf1 = tree.find_by_name("NUMA node #1").unwrap();
        scores
            .get_mut(&leaf0)
            .unwrap()
            .hints
            .insert("gpu".to_string(), 0.5);
        scores
            .get_mut(&leaf1)
            .unwrap()
            .hints
            .insert("gpu".to_string(), 0.8);

        let empty = BTreeMap::new();
        assert_eq!(
            compare_pools(&req, &tree, &scores, &empty, leaf1, leaf0),
            Ordering::Less
        );
    }

    #[test]
    fn deeper_pool_wins_without_other_signals() {
        let tree = tree();
        let req = request(1000);
        let scores = base_scores(&tree);
        let leaf3 = tree.find_by_name("NUMA node #3").unwrap();

        let empty = BTreeMap::new();
        assert_eq!(
            compare_pools(&req, &tree, &scores, &empty, leaf3, tree.root()),
            Ordering::Less
        );
    }

    #[test]
    fn high_priority_request_prefers_the_fulfilling_pool() {
        let tree = tree();
        let info = ContainerInfo {
            id: "c0".to_string(),
            namespace: "default".to_string(),
            pod_name: "pod0".to_string(),
            container_name: "main".to_string(),
            millicpu_request: 1000,
            annotations: [(
                "corepin.io/prefer-cpu-priority".to_string(),
                "high".to_string(),
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        };
        let req = Request::new(&info, &PolicyOptions::default(), MemTypeMask::DRAM);

        let mut scores = base_scores(&tree);
        let leaf0 = tree.find_by_name("NUMA node #0").unwrap();
        let leaf1 = tree.find_by_name("NUMA node #1").unwrap();
        scores
            .get_mut(&leaf0)
            .unwrap()
            .set_prio_capacity(api_types::CpuPriority::High, -1000);
        scores
            .get_mut(&leaf1)
            .unwrap()
            .set_prio_capacity(api_types::CpuPriority::High, 500);

        let empty = BTreeMap::new();
        assert_eq!(
            compare_pools(&req, &tree, &scores, &empty, leaf1, leaf0),
            Ordering::Less
        );
        assert_eq!(
            compare_pools(&req, &tree, &scores, &empty, leaf0, leaf1),
            Ordering::Greater
        );
    }

    #[test]
    fn shared_only_requests_prefer_fewer_colocated() {
        let tree = tree();
        let req = request(500);
        let mut scores = base_scores(&tree);
        let leaf0 = tree.find_by_name("NUMA node #0").unwrap();
        let leaf1 = tree.find_by_name("NUMA node #1").unwrap();
        scores.get_mut(&leaf0).unwrap().colocated = 3;

        let empty = BTreeMap::new();
        assert_eq!(
            compare_pools(&req, &tree, &scores, &empty, leaf1, leaf0),
            Ordering::Less
        );
    }

    #[test]
    fn comparison_is_antisymmetric_over_random_scores() {
        use proptest::prelude::*;

        let tree = tree();
        let leaf_ids: Vec<PoolId> = tree.pools().map(|p| p.id).collect();

        let score_strategy = (
            -2000i64..8000,
            -2000i64..8000,
            0i64..4,
            prop::option::of(0.0f64..1.0),
        );

        proptest!(|(
            entries in prop::collection::vec(score_strategy.clone(), 5),
            millicpu in 0i64..4000,
        )| {
            let mut scores = BTreeMap::new();
            for (pool, (shared, isolated, colocated, hint)) in
                leaf_ids.iter().zip(entries.into_iter())
            {
                let mut score = Score::new(*pool);
                score.shared = shared;
                score.isolated = isolated;
                score.colocated = colocated;
                if let Some(h) = hint {
                    score.hints.insert("dev".to_string(), h);
                }
                scores.insert(*pool, score);
            }
            let req = request(millicpu);
            let empty = BTreeMap::new();
            for &x in &leaf_ids {
                for &y in &leaf_ids {
                    let xy = compare_pools(&req, &tree, &scores, &empty, x, y);
                    let yx = compare_pools(&req, &tree, &scores, &empty, y, x);
                    if x == y {
                        prop_assert_eq!(xy, Ordering::Equal);
                    } else {
                        prop_assert_eq!(xy, yx.reverse());
                        prop_assert_ne!(xy, Ordering::Equal);
                    }
                }
            }
        });
    }
}
