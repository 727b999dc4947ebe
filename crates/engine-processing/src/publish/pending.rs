use model::partition::PartitionKey;
use std::collections::{BTreeMap, BTreeSet};

/// Partitions that received rows since they were last published, with the
/// number of rows each received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingPartitions {
    counts: BTreeMap<PartitionKey, u64>,
}

impl PendingPartitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, partition: PartitionKey, rows: u64) {
        *self.counts.entry(partition).or_default() += rows;
    }

    pub fn add_all(&mut self, partitions: &BTreeMap<PartitionKey, u64>) {
        for (partition, rows) in partitions {
            self.add(*partition, *rows);
        }
    }

    pub fn keys(&self) -> BTreeSet<PartitionKey> {
        self.counts.keys().copied().collect()
    }

    pub fn counts(&self) -> &BTreeMap<PartitionKey, u64> {
        &self.counts
    }

    pub fn remove(&mut self, published: &[PartitionKey]) {
        for partition in published {
            self.counts.remove(partition);
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(d: u32) -> PartitionKey {
        PartitionKey::new(NaiveDate::from_ymd_opt(2025, 1, d).unwrap())
    }

    #[test]
    fn counts_accumulate_until_published() {
        let mut pending = PendingPartitions::new();
        pending.add(day(1), 3);
        pending.add_all(&BTreeMap::from([(day(1), 2), (day(2), 1)]));
        assert_eq!(pending.counts().get(&day(1)), Some(&5));

        pending.remove(&[day(1)]);
        assert_eq!(pending.keys(), BTreeSet::from([day(2)]));
        pending.remove(&[day(2)]);
        assert!(pending.is_empty());
    }
}
