//! Flattening of result frames into variable options.

use crate::models::{DataFrame, Field, FieldType, MetricFindValue};
use serde_json::Value;

const TEXT_FIELDS: [&str; 2] = ["__text", "text"];
const VALUE_FIELDS: [&str; 2] = ["__value", "value"];

/// Converts one frame into `{text, value}` pairs, one per row.
///
/// Frames exposing `text`/`value` columns (or their `__` prefixed forms) map
/// them directly. Otherwise the first string column, or failing that the first
/// non-time column, provides the text.
pub fn frame_to_metric_find_values(frame: &DataFrame) -> Vec<MetricFindValue> {
    if frame.is_empty() {
        return Vec::new();
    }

    let text_field = find_named(frame, &TEXT_FIELDS);
    let value_field = find_named(frame, &VALUE_FIELDS);

    if text_field.is_some() || value_field.is_some() {
        let rows = text_field.or(value_field).map_or(0, |f| f.values.len());
        return (0..rows)
            .map(|row| {
                let value = value_field.map(|field| cell_text(field.values.get(row)));
                let text = match text_field {
                    Some(field) => cell_text(field.values.get(row)),
                    None => value.clone().unwrap_or_default(),
                };
                MetricFindValue { text, value }
            })
            .collect();
    }

    let field = frame
        .fields
        .iter()
        .find(|f| f.field_type == FieldType::String)
        .or_else(|| frame.fields.iter().find(|f| f.field_type != FieldType::Time));

    field
        .map(|field| {
            field
                .values
                .iter()
                .map(|cell| MetricFindValue {
                    text: cell_text(Some(cell)),
                    value: None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn find_named<'a>(frame: &'a DataFrame, names: &[&str]) -> Option<&'a Field> {
    names
        .iter()
        .find_map(|name| frame.fields.iter().find(|f| f.name == *name))
}

fn cell_text(cell: Option<&Value>) -> String {
    match cell {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}
