use crate::core::value::{FieldValue, Value};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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
            .map(|f| f.value.clone())
            .unwrap_or(Value::Null)
    }

    /// True when every `(column, value)` pair in `key` matches this row.
    pub fn matches(&self, key: &[FieldValue]) -> bool {
        key.iter()
            .all(|k| self.get(&k.name).is_some_and(|f| f.value == k.value))
    }

    /// Overwrites (or appends) the given columns.
    pub fn apply(&mut self, values: &[FieldValue]) {
        for update in values {
            match self
                .field_values
                .iter_mut()
                .find(|f| f.name.eq_ignore_ascii_case(&update.name))
            {
                Some(existing) => existing.value = update.value.clone(),
                None => self.field_values.push(update.clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> RowData {
        RowData::new(
            "users",
            vec![
                FieldValue::new("id", Value::Int(1)),
                FieldValue::new("name", Value::String("ada".into())),
            ],
        )
    }

    #[test]
    fn matches_on_key_columns_case_insensitively() {
        let row = row();
        assert!(row.matches(&[FieldValue::new("ID", Value::Int(1))]));
        assert!(!row.matches(&[FieldValue::new("id", Value::Int(2))]));
        assert!(!row.matches(&[FieldValue::new("missing", Value::Int(1))]));
    }

    #[test]
    fn apply_overwrites_and_appends() {
        let mut row = row();
        row.apply(&[
            FieldValue::new("name", Value::String("grace".into())),
            FieldValue::new("admin", Value::Boolean(true)),
        ]);
        assert_eq!(row.get_value("name"), Value::String("grace".into()));
        assert_eq!(row.get_value("admin"), Value::Boolean(true));
        assert_eq!(row.field_values.len(), 3);
    }
}
