//! Deadlock detection: bounded depth-first search of the waits-for graph.
//!
//! The graph is ephemeral. Edges are computed on demand from the lock
//! queues: a waiting transaction points at every transaction holding (or
//! queued ahead with) a conflicting lock. Detection runs on each blocking
//! request, starting from the requester; if the search budget runs out
//! without finding a cycle, none is assumed.

use oakdb_types::TrxId;
use tracing::trace;

use crate::sys::LockState;

/// Node-visit budget for one search.
const SEARCH_BUDGET: usize = 200;

/// If the requester's new wait closes a cycle, pick the victim: the
/// cycle member with the smallest weight, or the requester itself when no
/// member is strictly lighter.
pub(crate) fn pick_victim(st: &LockState, requester: TrxId) -> Option<TrxId> {
    let mut budget = SEARCH_BUDGET;
    let mut path = vec![requester];
    if !dfs(st, requester, requester, &mut path, &mut budget) {
        return None;
    }
    let weight = |t: TrxId| -> u64 {
        st.trxs
            .get(&t)
            .map_or(0, |e| e.weight + e.locks.len() as u64)
    };
    let req_weight = weight(requester);
    let victim = path
        .iter()
        .copied()
        .filter(|&t| t != requester && weight(t) < req_weight)
        .min_by_key(|&t| weight(t))
        .unwrap_or(requester);
    trace!(%requester, %victim, cycle_len = path.len(), "deadlock cycle");
    Some(victim)
}

/// Depth-first walk; returns true when an edge back to `target` is found.
/// `path` holds the current chain of waiting transactions.
fn dfs(
    st: &LockState,
    current: TrxId,
    target: TrxId,
    path: &mut Vec<TrxId>,
    budget: &mut usize,
) -> bool {
    if *budget == 0 {
        return false;
    }
    *budget -= 1;

    let Some(waiting_on) = st.trxs.get(&current).and_then(|e| e.waiting_on) else {
        return false;
    };
    let blockers: Vec<TrxId> = st.blockers_of(waiting_on).collect();
    for holder in blockers {
        if holder == target {
            return true;
        }
        if path.contains(&holder) {
            // A cycle not through the requester; someone else's request
            // will find it.
            continue;
        }
        path.push(holder);
        if dfs(st, holder, target, path, budget) {
            return true;
        }
        path.pop();
    }
    false
}
