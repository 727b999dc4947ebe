use model::{dedup::DedupKey, partition::PartitionKey, records::row::RowData};
use std::collections::BTreeMap;

/// Rows waiting to be flushed, with the dedup keys they were admitted under
/// and how many land in each partition.
#[derive(Debug)]
pub struct RowBuffer {
    capacity: usize,
    rows: Vec<RowData>,
    keys: Vec<DedupKey>,
    partitions: BTreeMap<PartitionKey, u64>,
}

#[derive(Debug, Default)]
pub struct BufferedRows {
    pub rows: Vec<RowData>,
    pub keys: Vec<DedupKey>,
    pub partitions: BTreeMap<PartitionKey, u64>,
}

impl RowBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            rows: Vec::with_capacity(capacity),
            keys: Vec::with_capacity(capacity),
            partitions: BTreeMap::new(),
        }
    }

    /// Adds a row; returns `true` once the buffer is due for a flush.
    pub fn push(&mut self, row: RowData, key: DedupKey, partition: PartitionKey) -> bool {
        self.rows.push(row);
        self.keys.push(key);
        *self.partitions.entry(partition).or_default() += 1;
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn take(&mut self) -> BufferedRows {
        BufferedRows {
            rows: std::mem::replace(&mut self.rows, Vec::with_capacity(self.capacity)),
            keys: std::mem::take(&mut self.keys),
            partitions: std::mem::take(&mut self.partitions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use model::{core::value::Value, dedup::DedupKeySpec};

    #[test]
    fn fills_up_and_drains() {
        let spec = DedupKeySpec::new("a", "b", "c");
        let day = PartitionKey::new(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        let mut buffer = RowBuffer::new(2);

        let row = |i: i64| RowData::new("t", vec![]).with("a", Value::Int(i));
        assert!(!buffer.push(row(1), spec.key_of(&row(1)), day));
        assert!(buffer.push(row(2), spec.key_of(&row(2)), day));

        let drained = buffer.take();
        assert_eq!(drained.rows.len(), 2);
        assert_eq!(drained.keys.len(), 2);
        assert_eq!(drained.partitions.get(&day), Some(&2));
        assert!(buffer.is_empty());
    }
}
