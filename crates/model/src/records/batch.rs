use crate::records::row::RowData;

/// One page of rows as yielded by a source stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    pub rows: Vec<RowData>,
}

impl RowBatch {
    pub fn new(rows: Vec<RowData>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl From<Vec<RowData>> for RowBatch {
    fn from(rows: Vec<RowData>) -> Self {
        Self::new(rows)
    }
}

impl IntoIterator for RowBatch {
    type Item = RowData;
    type IntoIter = std::vec::IntoIter<RowData>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}
