//! Row decoding for the reference SQLite driver.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies the declared column type into a logical category
//! 2. A category-specific decoder extracts the value as JSON
//!
//! SQLite is dynamically typed, so a decoder that fails for the declared
//! category falls back to the storage class actually present.

use crate::models::JsonRow;
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Boolean,
    Text,
    Binary,
    Json,
    Null,
}

/// Classify a SQLite type name into a logical category.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower == "null" {
        return TypeCategory::Null;
    }

    // SQLite's NUMERIC/DECIMAL affinity is stored as float or integer
    if lower.contains("decimal") || lower.contains("numeric") {
        return TypeCategory::Float;
    }

    if lower.contains("int") {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("real") || lower.contains("floa") || lower.contains("doub") {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower.contains("blob") {
        return TypeCategory::Binary;
    }

    // Everything else (varchar, text, date, time, ...) decodes as text
    TypeCategory::Text
}

/// Decode binary data to a JSON value.
///
/// Valid UTF-8 becomes a plain string, anything else is base64 encoded.
pub fn decode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    match std::str::from_utf8(bytes) {
        Ok(s) => JsonValue::String(s.to_string()),
        Err(_) => JsonValue::String(STANDARD.encode(bytes)),
    }
}

/// Trait for converting database rows to JSON maps.
pub trait RowToJson {
    fn to_json_map(&self) -> JsonRow;
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let value = decode_column(self, idx, col.type_info().name());
                (col.name().to_string(), value)
            })
            .collect()
    }
}

fn decode_column(row: &SqliteRow, idx: usize, declared: &str) -> JsonValue {
    let mut category = categorize_type(declared);
    if let Ok(raw) = row.try_get_raw(idx) {
        if raw.is_null() {
            return JsonValue::Null;
        }
        // Expression columns carry no declared type; use the storage class
        if category == TypeCategory::Null {
            category = categorize_type(raw.type_info().name());
        }
    }
    match category {
        TypeCategory::Null => JsonValue::Null,
        TypeCategory::Integer => decode_integer(row, idx),
        TypeCategory::Boolean => decode_boolean(row, idx),
        TypeCategory::Float => decode_float(row, idx),
        TypeCategory::Binary => decode_binary_col(row, idx),
        TypeCategory::Json => decode_json(row, idx),
        TypeCategory::Text => decode_text(row, idx),
    }
}

fn decode_integer(row: &SqliteRow, idx: usize) -> JsonValue {
    match row.try_get::<Option<i64>, _>(idx) {
        Ok(Some(v)) => JsonValue::Number(v.into()),
        Ok(None) => JsonValue::Null,
        Err(_) => decode_float(row, idx),
    }
}

fn decode_boolean(row: &SqliteRow, idx: usize) -> JsonValue {
    row.try_get::<Option<bool>, _>(idx)
        .ok()
        .flatten()
        .map(JsonValue::Bool)
        .unwrap_or(JsonValue::Null)
}

fn decode_float(row: &SqliteRow, idx: usize) -> JsonValue {
    match row.try_get::<Option<f64>, _>(idx) {
        Ok(Some(v)) => serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(v.to_string())),
        Ok(None) => JsonValue::Null,
        Err(_) => decode_text(row, idx),
    }
}

fn decode_binary_col(row: &SqliteRow, idx: usize) -> JsonValue {
    row.try_get::<Option<Vec<u8>>, _>(idx)
        .ok()
        .flatten()
        .map(|v| decode_binary_value(&v))
        .unwrap_or(JsonValue::Null)
}

fn decode_json(row: &SqliteRow, idx: usize) -> JsonValue {
    match row.try_get::<Option<String>, _>(idx) {
        Ok(Some(v)) => serde_json::from_str(&v).unwrap_or(JsonValue::String(v)),
        _ => JsonValue::Null,
    }
}

fn decode_text(row: &SqliteRow, idx: usize) -> JsonValue {
    match row.try_get::<Option<String>, _>(idx) {
        Ok(Some(v)) => JsonValue::String(v),
        Ok(None) => JsonValue::Null,
        Err(_) => decode_binary_col(row, idx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type() {
        assert_eq!(categorize_type("INTEGER"), TypeCategory::Integer);
        assert_eq!(categorize_type("BIGINT"), TypeCategory::Integer);
        assert_eq!(categorize_type("numeric"), TypeCategory::Float);
        assert_eq!(categorize_type("REAL"), TypeCategory::Float);
        assert_eq!(categorize_type("BOOLEAN"), TypeCategory::Boolean);
        assert_eq!(categorize_type("BLOB"), TypeCategory::Binary);
        assert_eq!(categorize_type("json"), TypeCategory::Json);
        assert_eq!(categorize_type("VARCHAR(20)"), TypeCategory::Text);
        assert_eq!(categorize_type("NULL"), TypeCategory::Null);
    }

    #[test]
    fn test_decode_binary_value() {
        assert_eq!(
            decode_binary_value(b"hello"),
            JsonValue::String("hello".to_string())
        );
        assert_eq!(
            decode_binary_value(&[0xFF, 0xFE, 0x00, 0x01]),
            JsonValue::String("//4AAQ==".to_string())
        );
    }
}
