//! Latest-version selection over append-only rows.
//!
//! Every read path (point get, offset page, cursor export, workspace lookup and
//! each tier of the experiment join) materializes its rows through
//! [`materialize_current_view`]. Filters that scope a read (workspace, dataset,
//! experiment) are applied by the statement *before* the view is materialized.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// A physical row that is one version of a logical record.
pub trait Versioned {
    /// The identity shared by all versions of a record.
    type Key: Ord;

    /// Returns the identity of the record this row is a version of.
    fn key(&self) -> Self::Key;

    /// Returns the server write time of this version (microseconds).
    fn last_updated_at(&self) -> i64;
}

/// Keeps the newest version of every key and returns them by key, descending.
///
/// Among versions with identical write times the first one encountered wins;
/// callers must not rely on which.
pub fn materialize_current_view<R, I>(rows: I) -> Vec<R>
where
    R: Versioned,
    I: IntoIterator<Item = R>,
{
    let mut latest: BTreeMap<R::Key, R> = BTreeMap::new();
    for row in rows {
        match latest.entry(row.key()) {
            Entry::Vacant(slot) => {
                slot.insert(row);
            }
            Entry::Occupied(mut slot) => {
                if row.last_updated_at() > slot.get().last_updated_at() {
                    slot.insert(row);
                }
            }
        }
    }
    latest.into_values().rev().collect()
}
