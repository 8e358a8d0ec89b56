//! Lock modes and the compatibility rules.

/// Table lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableLockMode {
    /// Intention shared: some record of the table will be locked S.
    IS,
    /// Intention exclusive: some record will be locked X.
    IX,
    /// Shared table lock.
    S,
    /// Exclusive table lock.
    X,
}

impl TableLockMode {
    /// The table-lock compatibility matrix (true = compatible).
    #[must_use]
    pub const fn compatible_with(self, held: Self) -> bool {
        use TableLockMode::{IS, IX, S, X};
        match (held, self) {
            (IS, IS | IX | S) | (IX, IS | IX) | (S, IS | S) => true,
            _ => false,
        }
    }
}

/// Record lock flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecLockKind {
    /// Only the record itself.
    NotGap,
    /// Only the open interval before the record.
    Gap,
    /// Record plus the gap before it (the REPEATABLE READ default).
    NextKey,
    /// Intention to insert into the gap before the record; conflicts only
    /// with gap-covering locks, never with other insert intentions.
    InsertIntention,
}

impl RecLockKind {
    /// Whether this flavor covers the record itself.
    #[must_use]
    pub const fn locks_record(self) -> bool {
        matches!(self, Self::NotGap | Self::NextKey)
    }

    /// Whether this flavor covers the gap before the record.
    #[must_use]
    pub const fn locks_gap(self) -> bool {
        matches!(self, Self::Gap | Self::NextKey | Self::InsertIntention)
    }
}

/// A record lock request: shared or exclusive, of one flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecLockMode {
    pub exclusive: bool,
    pub kind: RecLockKind,
}

impl RecLockMode {
    #[must_use]
    pub const fn shared(kind: RecLockKind) -> Self {
        Self {
            exclusive: false,
            kind,
        }
    }

    #[must_use]
    pub const fn exclusive(kind: RecLockKind) -> Self {
        Self {
            exclusive: true,
            kind,
        }
    }
}

/// The record conflict rule: would a request with `req` have to wait for
/// a lock with `held` on the same heap slot held by another transaction?
#[must_use]
pub fn rec_has_to_wait(req: RecLockMode, held: RecLockMode) -> bool {
    // Shared-shared never conflicts (insert intention counts as
    // exclusive).
    if !req.exclusive
        && !held.exclusive
        && req.kind != RecLockKind::InsertIntention
        && held.kind != RecLockKind::InsertIntention
    {
        return false;
    }
    // Nothing ever waits behind an insert intention.
    if held.kind == RecLockKind::InsertIntention {
        return false;
    }
    if req.kind == RecLockKind::InsertIntention {
        // Insert intention conflicts exactly with locks covering the gap.
        return held.kind.locks_gap();
    }
    // Plain gap requests, and requests against pure gap locks, coexist:
    // conflicting users may lock the same gap.
    if req.kind == RecLockKind::Gap || held.kind == RecLockKind::Gap {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::RecLockKind::{Gap, InsertIntention, NextKey, NotGap};
    use super::*;

    #[test]
    fn table_matrix_matches_design() {
        use TableLockMode::{IS, IX, S, X};
        let rows = [
            (IS, [true, true, true, false]),
            (IX, [true, true, false, false]),
            (S, [true, false, true, false]),
            (X, [false, false, false, false]),
        ];
        for (held, expect) in rows {
            for (req, ok) in [IS, IX, S, X].into_iter().zip(expect) {
                assert_eq!(
                    req.compatible_with(held),
                    ok,
                    "held {held:?} vs requested {req:?}"
                );
            }
        }
    }

    #[test]
    fn shared_record_locks_coexist() {
        assert!(!rec_has_to_wait(
            RecLockMode::shared(NextKey),
            RecLockMode::shared(NextKey)
        ));
        assert!(!rec_has_to_wait(
            RecLockMode::shared(NotGap),
            RecLockMode::shared(NotGap)
        ));
    }

    #[test]
    fn exclusive_record_conflicts() {
        assert!(rec_has_to_wait(
            RecLockMode::exclusive(NotGap),
            RecLockMode::shared(NotGap)
        ));
        assert!(rec_has_to_wait(
            RecLockMode::shared(NotGap),
            RecLockMode::exclusive(NextKey)
        ));
        assert!(rec_has_to_wait(
            RecLockMode::exclusive(NextKey),
            RecLockMode::exclusive(NextKey)
        ));
    }

    #[test]
    fn gap_locks_never_wait() {
        for held in [NotGap, Gap, NextKey] {
            assert!(!rec_has_to_wait(
                RecLockMode::exclusive(Gap),
                RecLockMode::exclusive(held)
            ));
        }
        // And nothing with a record component waits on a pure gap lock.
        assert!(!rec_has_to_wait(
            RecLockMode::exclusive(NextKey),
            RecLockMode::exclusive(Gap)
        ));
        assert!(!rec_has_to_wait(
            RecLockMode::exclusive(NotGap),
            RecLockMode::exclusive(Gap)
        ));
    }

    #[test]
    fn insert_intention_rules() {
        // Blocked by anything covering the gap.
        assert!(rec_has_to_wait(
            RecLockMode::exclusive(InsertIntention),
            RecLockMode::shared(Gap)
        ));
        assert!(rec_has_to_wait(
            RecLockMode::exclusive(InsertIntention),
            RecLockMode::exclusive(NextKey)
        ));
        // Not blocked by record-only locks or other insert intentions.
        assert!(!rec_has_to_wait(
            RecLockMode::exclusive(InsertIntention),
            RecLockMode::exclusive(NotGap)
        ));
        assert!(!rec_has_to_wait(
            RecLockMode::exclusive(InsertIntention),
            RecLockMode::exclusive(InsertIntention)
        ));
        // And never blocks anyone.
        for req in [NotGap, Gap, NextKey] {
            assert!(!rec_has_to_wait(
                RecLockMode::exclusive(req),
                RecLockMode::exclusive(InsertIntention)
            ));
        }
    }
}
