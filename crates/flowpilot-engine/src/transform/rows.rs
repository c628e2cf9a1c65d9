//! Row and header transforms, plus the equijoin

use super::{config_str, transform_failure, TransformInput};
use crate::context::ExecutionContext;
use crate::resolver::{inline_value, resolve_value};
use crate::shape::extract_value_by_key;
use flowpilot_core::error::WorkflowError;
use flowpilot_core::step::TransformOperation;
use serde_json::{Map, Value};

/// Header names are lowercased and trimmed so object keys stay stable
/// across sheet edits
fn normalize_header(cell: &Value) -> String {
    inline_value(cell).trim().to_lowercase()
}

pub fn rows_to_objects(
    input: &TransformInput,
    config: &Map<String, Value>,
) -> Result<Value, WorkflowError> {
    let rows = input.require_items(TransformOperation::RowsToObjects)?;

    let (headers, data_rows): (Vec<String>, &[Value]) =
        match config.get("headers").and_then(Value::as_array) {
            Some(given) => (
                given.iter().map(normalize_header).collect(),
                rows.as_slice(),
            ),
            None => {
                let first = rows.first().and_then(Value::as_array).ok_or_else(|| {
                    transform_failure(
                        TransformOperation::RowsToObjects,
                        "input must be rows with a header row, or config.headers must be given",
                    )
                })?;
                (first.iter().map(normalize_header).collect(), &rows[1..])
            }
        };

    let objects: Vec<Value> = data_rows
        .iter()
        .map(|row| {
            let cells = row.as_array().cloned().unwrap_or_default();
            let mut object = Map::new();
            for (index, header) in headers.iter().enumerate() {
                if header.is_empty() {
                    continue;
                }
                object.insert(
                    header.clone(),
                    cells.get(index).cloned().unwrap_or(Value::Null),
                );
            }
            Value::Object(object)
        })
        .collect();

    Ok(Value::Array(objects))
}

pub fn map_headers(
    input: &TransformInput,
    config: &Map<String, Value>,
) -> Result<Value, WorkflowError> {
    let mut rows = input.require_items(TransformOperation::MapHeaders)?;
    let mapping = config
        .get("mapping")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let normalize = config
        .get("normalize")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let header = match rows.first().and_then(Value::as_array).cloned() {
        Some(header) => header,
        None => {
            return Err(transform_failure(
                TransformOperation::MapHeaders,
                "input must be 2-D rows with a header row",
            ))
        }
    };

    let renamed: Vec<Value> = header
        .iter()
        .map(|cell| {
            let name = inline_value(cell);
            let mapped = mapping
                .get(&name)
                .or_else(|| mapping.get(name.trim()))
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .unwrap_or(name);
            Value::String(if normalize {
                mapped.trim().to_lowercase()
            } else {
                mapped
            })
        })
        .collect();

    rows[0] = Value::Array(renamed);
    Ok(Value::Array(rows))
}

/// Equijoin on `leftKey`/`rightKey`. The transform input is the left
/// side; `config.right` resolves to the right side. Unmatched rows in
/// outer joins keep the present side's fields.
pub fn join(
    ctx: &ExecutionContext,
    input: &TransformInput,
    config: &Map<String, Value>,
) -> Result<Value, WorkflowError> {
    let left = input.require_items(TransformOperation::Join)?;

    let right_raw = config.get("right").ok_or_else(|| {
        transform_failure(TransformOperation::Join, "config.right is required")
    })?;
    let right_value = resolve_value(ctx, right_raw)?;
    let right = crate::shape::unwrap_structured_output(&right_value, None).ok_or_else(|| {
        transform_failure(TransformOperation::Join, "config.right did not resolve to an array")
    })?;

    let left_key = config_str(config, &["leftKey", "left_key", "joinOn", "join_on"])
        .ok_or_else(|| transform_failure(TransformOperation::Join, "leftKey is required"))?;
    let right_key = config_str(config, &["rightKey", "right_key"]).unwrap_or(left_key);
    let join_type = config_str(config, &["joinType", "join_type"]).unwrap_or("inner");

    let key_of = |item: &Value, key: &str| -> Option<String> {
        extract_value_by_key(item, key, None)
            .filter(|v| !v.is_null())
            .map(|v| inline_value(&v))
    };

    let merge = |a: &Value, b: &Value| -> Value {
        let mut merged = a.as_object().cloned().unwrap_or_default();
        if let Some(object) = b.as_object() {
            for (key, value) in object {
                merged.entry(key.clone()).or_insert(value.clone());
            }
        }
        Value::Object(merged)
    };

    let mut joined: Vec<Value> = Vec::new();
    match join_type {
        "inner" | "left" => {
            for l in &left {
                let key = key_of(l, left_key);
                let matches: Vec<&Value> = match &key {
                    Some(k) => right
                        .iter()
                        .filter(|r| key_of(r, right_key).as_ref() == Some(k))
                        .collect(),
                    None => Vec::new(),
                };
                if matches.is_empty() {
                    if join_type == "left" {
                        joined.push(l.clone());
                    }
                } else {
                    for r in matches {
                        joined.push(merge(l, r));
                    }
                }
            }
        }
        "right" => {
            for r in &right {
                let key = key_of(r, right_key);
                let matches: Vec<&Value> = match &key {
                    Some(k) => left
                        .iter()
                        .filter(|l| key_of(l, left_key).as_ref() == Some(k))
                        .collect(),
                    None => Vec::new(),
                };
                if matches.is_empty() {
                    joined.push(r.clone());
                } else {
                    for l in matches {
                        joined.push(merge(l, r));
                    }
                }
            }
        }
        other => {
            return Err(transform_failure(
                TransformOperation::Join,
                &format!("unknown joinType '{}'", other),
            ))
        }
    }

    Ok(Value::Array(joined))
}
