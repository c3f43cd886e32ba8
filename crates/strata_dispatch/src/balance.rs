//! Spreading regions across the stores that can host them.
//!
//! Planning initially assigns every region to its primary store. When a
//! region has more than one valid replica host, the balancer may move it so
//! the total region load evens out across participating stores. The first
//! region of every draft task is pinned and never reassigned. This is a
//! greedy heuristic with hash-order tie-breaking; determinism across runs is
//! not contractual.

use std::collections::HashMap;

use crate::plan::BatchTask;
use crate::region::{RegionInfo, RegionVerId, StoreId};

/// Redistribute multi-replica regions across participating stores.
///
/// Returns the drafts unchanged when there is nothing to balance or when the
/// input is inconsistent (a duplicated region key).
pub fn balance_batch_tasks(original: Vec<BatchTask>) -> Vec<BatchTask> {
    // One task per distinct primary store, seeded with its pinned region.
    let mut store_tasks: HashMap<StoreId, BatchTask> = HashMap::new();
    for task in &original {
        let Some(primary) = task.regions.first().and_then(RegionInfo::primary_store) else {
            return original;
        };
        store_tasks.insert(
            primary,
            BatchTask {
                store_addr: task.store_addr.clone(),
                cmd: task.cmd,
                rpc_ctx: task.rpc_ctx.clone(),
                regions: vec![task.regions[0].clone()],
            },
        );
    }

    // Candidate map: for every region with 2+ participating stores, one entry
    // per (store, region) pair.
    let mut candidates: HashMap<StoreId, HashMap<RegionVerId, RegionInfo>> = HashMap::new();
    let mut remaining_pairs = 0usize;
    let mut remaining_regions = 0usize;

    for task in &original {
        let Some(task_store) = task.regions.first().and_then(RegionInfo::primary_store) else {
            return original;
        };
        for info in task.regions.iter().skip(1) {
            let valid_stores: Vec<StoreId> = info
                .all_stores
                .iter()
                .copied()
                .filter(|s| store_tasks.contains_key(s))
                .collect();
            if info.all_stores.len() <= 1 || valid_stores.len() <= 1 {
                // A region with a lone usable replica stays with its origin task.
                if let Some(task) = store_tasks.get_mut(&task_store) {
                    task.regions.push(info.clone());
                }
                continue;
            }
            remaining_pairs += valid_stores.len();
            remaining_regions += 1;
            for store in valid_stores {
                let entry = candidates.entry(store).or_default();
                if entry.insert(info.region, info.clone()).is_some() {
                    // Duplicated region key means the drafts are inconsistent.
                    tracing::warn!(
                        region = %info.region,
                        "duplicate region while balancing batch tasks, giving up balance"
                    );
                    return original;
                }
            }
        }
    }

    if remaining_regions == 0 {
        return original;
    }

    let mut avg = remaining_pairs as f64 / remaining_regions as f64;
    let Some(mut store) = find_next_store(&store_tasks, &candidates, avg) else {
        return original;
    };

    while remaining_pairs > 0 {
        if candidate_count(&candidates, store) == 0 {
            match find_next_store(&store_tasks, &candidates, avg) {
                Some(next) => store = next,
                None => break,
            }
        }
        let Some(per_store) = candidates.get_mut(&store) else {
            break;
        };
        let Some(region_key) = per_store.keys().next().copied() else {
            continue;
        };
        let Some(info) = per_store.remove(&region_key) else {
            continue;
        };
        if let Some(task) = store_tasks.get_mut(&store) {
            task.regions.push(info.clone());
        }
        remaining_regions -= 1;
        for s in &info.all_stores {
            if let Some(other) = candidates.get_mut(s) {
                if other.remove(&region_key).is_some() {
                    remaining_pairs -= 1;
                }
            }
        }

        // Greedily keep assigning to a store of this region while one of its
        // other hosts is projected no heavier; recompute projections inline.
        if remaining_regions > 0 {
            let mut projected = candidate_count(&candidates, store) as f64 / avg
                + store_tasks[&store].regions.len() as f64;
            avg = remaining_pairs as f64 / remaining_regions as f64;
            for s in &info.all_stores {
                if *s == store {
                    continue;
                }
                let count = candidate_count(&candidates, *s);
                if count == 0 {
                    continue;
                }
                let Some(task) = store_tasks.get(s) else {
                    continue;
                };
                let load = count as f64 / avg + task.regions.len() as f64;
                if load <= projected {
                    store = *s;
                    projected = load;
                }
            }
        }
    }

    store_tasks.into_values().collect()
}

fn candidate_count(
    candidates: &HashMap<StoreId, HashMap<RegionVerId, RegionInfo>>,
    store: StoreId,
) -> usize {
    candidates.get(&store).map_or(0, HashMap::len)
}

/// Participating store with the lowest projected load among those that still
/// have candidates. Ties go to hash iteration order.
fn find_next_store(
    store_tasks: &HashMap<StoreId, BatchTask>,
    candidates: &HashMap<StoreId, HashMap<RegionVerId, RegionInfo>>,
    avg: f64,
) -> Option<StoreId> {
    let mut best: Option<(StoreId, f64)> = None;
    for (store, task) in store_tasks {
        let count = candidate_count(candidates, *store);
        if count == 0 {
            continue;
        }
        let load = count as f64 / avg + task.regions.len() as f64;
        if best.map_or(true, |(_, b)| load < b) {
            best = Some((*store, load));
        }
    }
    best.map(|(store, _)| store)
}
