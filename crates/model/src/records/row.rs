use crate::core::value::{FieldValue, Value};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowData {
    pub entity: String,
    pub field_values: Vec<FieldValue>,
}

impl RowData {
    pub fn new(entity: &str, field_values: Vec<FieldValue>) -> Self {
        RowData {
            entity: entity.to_string(),
            field_values,
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.field_values
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(field))
    }

    pub fn get_value(&self, field: &str) -> Value {
        self.get(field)
            .and_then(|f| f.value.clone())
            .unwrap_or(Value::Null)
    }

    /// Replaces the value of `field`, appending it when absent.
    pub fn set(&mut self, field: &str, value: Value) {
        match self
            .field_values
            .iter_mut()
            .find(|f| f.name.eq_ignore_ascii_case(field))
        {
            Some(existing) => existing.value = Some(value),
            None => self.field_values.push(FieldValue::new(field, value)),
        }
    }

    /// Builder-style variant of [`RowData::set`].
    pub fn with(mut self, field: &str, value: Value) -> Self {
        self.set(field, value);
        self
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.field_values.iter().map(|f| f.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_overwrites_case_insensitively() {
        let mut row = RowData::new("events", vec![]).with("Id", Value::Int(1));
        row.set("id", Value::Int(2));
        assert_eq!(row.field_values.len(), 1);
        assert_eq!(row.get_value("ID"), Value::Int(2));
        assert_eq!(row.get_value("missing"), Value::Null);
    }
}
