//! Run-scoped duplicate suppression. The first row seen for a key wins;
//! later versions within the same run are dropped before they reach the
//! sink. Choosing the latest version across runs is left to publish.

use model::{
    dedup::{DedupKey, DedupKeySpec},
    records::row::RowData,
};
use std::collections::HashSet;

#[derive(Debug)]
pub struct RunDedup {
    spec: DedupKeySpec,
    seen: HashSet<DedupKey>,
}

impl RunDedup {
    pub fn new(spec: DedupKeySpec) -> Self {
        Self {
            spec,
            seen: HashSet::new(),
        }
    }

    pub fn spec(&self) -> &DedupKeySpec {
        &self.spec
    }

    /// The row's key when it is new to this run, `None` for a duplicate.
    pub fn admit(&mut self, row: &RowData) -> Option<DedupKey> {
        let key = self.spec.key_of(row);
        self.seen.insert(key).then_some(key)
    }

    /// Lets rows that never reached the sink be admitted again.
    pub fn forget<'a>(&mut self, keys: impl IntoIterator<Item = &'a DedupKey>) {
        for key in keys {
            self.seen.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
