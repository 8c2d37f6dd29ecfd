//! Active-database registry.
//!
//! Records which physical databases currently hold open connections, per
//! historical/non-historical mode, and derives the canonical database
//! identity the master reports to clients. During a failover/cutover
//! window more than one database can be active at once ("in transition").

use crate::registry::PoolCounts;
use parking_lot::Mutex;
use std::collections::BTreeSet;

#[derive(Debug, Default)]
struct ModeState {
    /// Full database names with open connections, e.g. "FUNC_A".
    names: BTreeSet<String>,
    /// Canonical identity: distinct names with the `_suffix` stripped,
    /// comma-joined in set order.
    joined: String,
    /// More than one distinct stripped name is active.
    in_transition: bool,
}

impl ModeState {
    fn recompute(&mut self) {
        let stripped: BTreeSet<&str> = self
            .names
            .iter()
            .map(|name| name.split('_').next().unwrap_or(name))
            .collect();
        self.in_transition = stripped.len() > 1;
        self.joined = stripped.into_iter().collect::<Vec<_>>().join(",");
    }

    fn retain_active(&mut self, pool: &dyn PoolCounts) {
        let counts = pool.active_connections_by_database();
        self.names
            .retain(|name| counts.get(name).copied().unwrap_or(0) > 0);
        self.recompute();
    }
}

#[derive(Debug, Default)]
struct Inner {
    historical: ModeState,
    non_historical: ModeState,
}

/// Process-wide registry of currently-active databases.
#[derive(Debug, Default)]
pub struct CurrentDatabase {
    inner: Mutex<Inner>,
}

impl CurrentDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a connection-count transition for a database.
    ///
    /// A positive count inserts the name into the mode's set, a
    /// non-positive count removes it; the canonical string and the
    /// in-transition flag are recomputed on every mutation.
    pub fn record(&self, name: &str, is_historical: bool, connection_count: i64) {
        let mut inner = self.inner.lock();
        let state = if is_historical {
            &mut inner.historical
        } else {
            &mut inner.non_historical
        };

        if connection_count > 0 {
            state.names.insert(name.to_string());
        } else {
            state.names.remove(name);
        }
        state.recompute();
    }

    /// Returns the currently-active database identity for a mode, plus the
    /// in-transition flag of the mode that supplied it.
    ///
    /// Both sets are first re-validated against the live pool counts (a
    /// name is dropped when its pool count is not positive). When the
    /// requested mode's identity is empty the other mode's identity is
    /// returned instead: a node serving only one mode is still the
    /// authoritative answer for "what database am I on".
    pub fn current(&self, is_historical: bool, pool: &dyn PoolCounts) -> (String, bool) {
        let mut inner = self.inner.lock();
        inner.historical.retain_active(pool);
        inner.non_historical.retain_active(pool);

        let (requested, other) = if is_historical {
            (&inner.historical, &inner.non_historical)
        } else {
            (&inner.non_historical, &inner.historical)
        };

        if !requested.joined.is_empty() {
            (requested.joined.clone(), requested.in_transition)
        } else {
            (other.joined.clone(), other.in_transition)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Pool stub reporting fixed counts.
    struct FixedPool(HashMap<String, i64>);

    impl FixedPool {
        fn new(entries: &[(&str, i64)]) -> Self {
            Self(
                entries
                    .iter()
                    .map(|(name, count)| (name.to_string(), *count))
                    .collect(),
            )
        }
    }

    impl PoolCounts for FixedPool {
        fn active_connections_by_database(&self) -> HashMap<String, i64> {
            self.0.clone()
        }
    }

    #[test]
    fn test_record_insert_and_remove() {
        let db = CurrentDatabase::new();
        let pool = FixedPool::new(&[("FUNC_A", 3)]);

        db.record("FUNC_A", false, 3);
        assert_eq!(db.current(false, &pool), ("FUNC".to_string(), false));

        db.record("FUNC_A", false, 0);
        assert_eq!(db.current(false, &pool), (String::new(), false));

        // Removing twice stays absent.
        db.record("FUNC_A", false, 0);
        assert_eq!(db.current(false, &pool), (String::new(), false));
    }

    #[test]
    fn test_suffix_stripped_and_joined() {
        let db = CurrentDatabase::new();
        let pool = FixedPool::new(&[("FUNC_A", 1), ("INTL_B", 2)]);

        db.record("FUNC_A", false, 1);
        db.record("INTL_B", false, 2);

        let (name, in_transition) = db.current(false, &pool);
        assert_eq!(name, "FUNC,INTL");
        assert!(in_transition);
    }

    #[test]
    fn test_same_stripped_name_not_in_transition() {
        let db = CurrentDatabase::new();
        let pool = FixedPool::new(&[("FUNC_A", 1), ("FUNC_B", 1)]);

        db.record("FUNC_A", false, 1);
        db.record("FUNC_B", false, 1);

        let (name, in_transition) = db.current(false, &pool);
        assert_eq!(name, "FUNC");
        assert!(!in_transition);
    }

    #[test]
    fn test_pool_counts_prune_stale_entries() {
        let db = CurrentDatabase::new();
        db.record("FUNC_A", false, 5);

        // The pool no longer reports connections for FUNC_A.
        let pool = FixedPool::new(&[("FUNC_A", 0)]);
        assert_eq!(db.current(false, &pool), (String::new(), false));
    }

    #[test]
    fn test_cross_mode_fallback() {
        let db = CurrentDatabase::new();
        let pool = FixedPool::new(&[("HISTFUNC_A", 2)]);

        db.record("HISTFUNC_A", true, 2);

        // Non-historical set is empty, fall back to the historical one.
        assert_eq!(db.current(false, &pool), ("HISTFUNC".to_string(), false));
        assert_eq!(db.current(true, &pool), ("HISTFUNC".to_string(), false));
    }

    #[test]
    fn test_concurrent_record_and_query() {
        let db = Arc::new(CurrentDatabase::new());
        let pool = Arc::new(FixedPool::new(&[("FUNC_A", 1), ("INTL_B", 1)]));

        let mut handles = Vec::new();
        for i in 0..8 {
            let db = db.clone();
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                for round in 0..200 {
                    let name = if i % 2 == 0 { "FUNC_A" } else { "INTL_B" };
                    db.record(name, false, (round % 3) as i64);
                    let (joined, _) = db.current(false, pool.as_ref());
                    // Always a consistent prior state, never a torn read.
                    assert!(
                        joined.is_empty()
                            || joined == "FUNC"
                            || joined == "INTL"
                            || joined == "FUNC,INTL"
                    );
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
