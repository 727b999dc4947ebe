use crate::records::row::RowData;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three business-identifying columns of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupKeySpec(pub [String; 3]);

impl DedupKeySpec {
    pub fn new(a: impl Into<String>, b: impl Into<String>, c: impl Into<String>) -> Self {
        Self([a.into(), b.into(), c.into()])
    }

    pub fn columns(&self) -> &[String; 3] {
        &self.0
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.iter().any(|c| c.eq_ignore_ascii_case(column))
    }

    /// Digest of the key columns of `row`. Missing columns hash as null.
    pub fn key_of(&self, row: &RowData) -> DedupKey {
        let mut hasher = blake3::Hasher::new();
        for column in &self.0 {
            let bytes = row.get_value(column).canonical_bytes();
            hasher.update(&(bytes.len() as u64).to_le_bytes());
            hasher.update(&bytes);
        }
        DedupKey(*hasher.finalize().as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey([u8; 32]);

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::Value;

    fn row(a: &str, b: i64, c: Value, payload: &str) -> RowData {
        RowData::new("t", vec![])
            .with("tenant", Value::String(a.into()))
            .with("entity_id", Value::Int(b))
            .with("version", c)
            .with("payload", Value::String(payload.into()))
    }

    #[test]
    fn key_ignores_non_key_columns() {
        let spec = DedupKeySpec::new("tenant", "entity_id", "version");
        let a = row("acme", 1, Value::Int(3), "x");
        let b = row("acme", 1, Value::Int(3), "y");
        assert_eq!(spec.key_of(&a), spec.key_of(&b));
    }

    #[test]
    fn length_prefix_prevents_concatenation_collisions() {
        let spec = DedupKeySpec::new("tenant", "entity_id", "version");
        let a = row("ab", 1, Value::String("c".into()), "");
        let b = row("a", 1, Value::String("bc".into()), "");
        assert_ne!(spec.key_of(&a), spec.key_of(&b));
    }
}
