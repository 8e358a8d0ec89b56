//! MVCC read views.

use oakdb_types::TrxId;

/// A consistent-read snapshot: which transaction ids were committed when
/// the view was created.
#[derive(Debug, Clone)]
pub struct ReadView {
    /// Smallest id not yet assigned at view creation; ids at or above are
    /// invisible.
    pub low_limit: TrxId,
    /// Smallest id still active at creation; ids below are visible.
    pub up_limit: TrxId,
    /// Ids active at creation, ascending.
    pub active: Vec<TrxId>,
    /// The creating transaction sees its own changes.
    pub creator: TrxId,
}

impl ReadView {
    /// Whether a record version written by `trx_id` is visible.
    #[must_use]
    pub fn is_visible(&self, trx_id: TrxId) -> bool {
        if trx_id == self.creator || trx_id < self.up_limit {
            return true;
        }
        if trx_id >= self.low_limit {
            return false;
        }
        self.active.binary_search(&trx_id).is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> ReadView {
        ReadView {
            low_limit: TrxId(100),
            up_limit: TrxId(40),
            active: vec![TrxId(40), TrxId(55), TrxId(90)],
            creator: TrxId(55),
        }
    }

    #[test]
    fn committed_before_snapshot_is_visible() {
        let v = view();
        assert!(v.is_visible(TrxId(1)));
        assert!(v.is_visible(TrxId(39)));
        // Committed between up and low limits, not in the active list.
        assert!(v.is_visible(TrxId(60)));
    }

    #[test]
    fn active_and_future_are_invisible() {
        let v = view();
        assert!(!v.is_visible(TrxId(40)));
        assert!(!v.is_visible(TrxId(90)));
        assert!(!v.is_visible(TrxId(100)));
        assert!(!v.is_visible(TrxId(500)));
    }

    #[test]
    fn creator_sees_itself() {
        let v = view();
        assert!(v.is_visible(TrxId(55)));
    }
}
