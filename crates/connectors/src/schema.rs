//! Row validation shared by the accessors.

use crate::error::DataAccessError;
use model::{
    changelog::TableSchema,
    core::value::{FieldValue, Value},
    records::row::RowData,
};
use std::fmt::Display;

pub fn ensure_columns(schema: &TableSchema, fields: &[FieldValue]) -> Result<(), DataAccessError> {
    for field in fields {
        ensure_column(schema, &field.name)?;
    }
    Ok(())
}

pub fn ensure_column(schema: &TableSchema, column: &str) -> Result<(), DataAccessError> {
    if schema
        .columns
        .iter()
        .any(|c| c.name.eq_ignore_ascii_case(column))
    {
        Ok(())
    } else {
        Err(DataAccessError::ColumnNotFound {
            table: schema.name.clone(),
            column: column.to_string(),
        })
    }
}

/// Builds a full row in schema column order from a partial set of values,
/// enforcing column existence, types and nullability.
pub fn conform_row(
    schema: &TableSchema,
    values: &[FieldValue],
    change: &dyn Display,
) -> Result<RowData, DataAccessError> {
    ensure_columns(schema, values)?;

    let mut fields = Vec::with_capacity(schema.columns.len());
    for column in &schema.columns {
        let value = values
            .iter()
            .find(|v| v.name.eq_ignore_ascii_case(&column.name))
            .map(|v| v.value.clone())
            .unwrap_or(Value::Null);

        check_value(schema, &column.name, &value, change)?;
        fields.push(FieldValue::new(column.name.clone(), value));
    }

    Ok(RowData::new(&schema.name, fields))
}

/// Validates an already-conformed row after an update was applied to it.
pub fn check_row(schema: &TableSchema, row: &RowData, change: &dyn Display) -> Result<(), DataAccessError> {
    for field in &row.field_values {
        check_value(schema, &field.name, &field.value, change)?;
    }
    Ok(())
}

fn check_value(
    schema: &TableSchema,
    column: &str,
    value: &Value,
    change: &dyn Display,
) -> Result<(), DataAccessError> {
    let Some(def) = schema
        .columns
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(column))
    else {
        return Err(DataAccessError::ColumnNotFound {
            table: schema.name.clone(),
            column: column.to_string(),
        });
    };

    match value.data_type() {
        None if !def.nullable => Err(DataAccessError::change_failed(
            change,
            format!("column '{}' may not be null", def.name),
        )),
        Some(actual) if actual != def.data_type => Err(DataAccessError::change_failed(
            change,
            format!(
                "column '{}' expects {} but got {}",
                def.name, def.data_type, actual
            ),
        )),
        _ => Ok(()),
    }
}

/// Primary key values of `row`, or `None` when the table has no key.
pub fn primary_key(schema: &TableSchema, row: &RowData) -> Option<Vec<FieldValue>> {
    if schema.primary_key.is_empty() {
        return None;
    }
    Some(
        schema
            .primary_key
            .iter()
            .map(|col| FieldValue::new(col.clone(), row.get_value(col)))
            .collect(),
    )
}

/// `key` rearranged into primary key order when it names exactly the
/// primary key columns, so a keyed store can look the row up directly.
pub fn exact_primary_key(schema: &TableSchema, key: &[FieldValue]) -> Option<Vec<FieldValue>> {
    if schema.primary_key.is_empty() || key.len() != schema.primary_key.len() {
        return None;
    }
    schema
        .primary_key
        .iter()
        .map(|col| {
            key.iter()
                .find(|field| field.name.eq_ignore_ascii_case(col))
                .map(|field| FieldValue::new(col.clone(), field.value.clone()))
        })
        .collect()
}

pub fn sort_rows(rows: &mut [RowData], column: &str) {
    rows.sort_by(|a, b| a.get_value(column).compare(&b.get_value(column)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{
        changelog::{ColumnDef, InsertChange},
        core::data_type::DataType,
    };

    fn users() -> TableSchema {
        TableSchema::new(
            "users",
            vec![
                ColumnDef::new("id", DataType::Int).not_null(),
                ColumnDef::new("name", DataType::String),
            ],
        )
        .with_primary_key(&["id"])
    }

    fn change(values: Vec<FieldValue>) -> InsertChange {
        InsertChange {
            table: "users".into(),
            values,
        }
    }

    #[test]
    fn fills_missing_nullable_columns() {
        let values = vec![FieldValue::new("id", Value::Int(7))];
        let row = conform_row(&users(), &values, &change(values.clone())).unwrap();
        assert_eq!(row.get_value("name"), Value::Null);
        assert_eq!(row.field_values[0].name, "id");
    }

    #[test]
    fn rejects_null_in_not_null_column() {
        let values = vec![FieldValue::new("name", Value::String("x".into()))];
        let err = conform_row(&users(), &values, &change(values.clone())).unwrap_err();
        assert!(matches!(err, DataAccessError::ChangeFailed { .. }));
        assert!(err.to_string().contains("insert into users"));
    }

    #[test]
    fn rejects_unknown_column_and_wrong_type() {
        let unknown = vec![FieldValue::new("email", Value::Null)];
        assert!(
            conform_row(&users(), &unknown, &change(unknown.clone()))
                .unwrap_err()
                .is_resource_missing()
        );

        let wrong = vec![FieldValue::new("id", Value::String("1".into()))];
        assert!(matches!(
            conform_row(&users(), &wrong, &change(wrong.clone())),
            Err(DataAccessError::ChangeFailed { .. })
        ));
    }
}
