//! Array-oriented transform operations

use super::{config_str, transform_failure, TransformInput};
use crate::cache::canonical_json;
use crate::conditional::{apply_operator, parse_date};
use crate::context::ExecutionContext;
use crate::expression::evaluate_raw;
use crate::resolver::{inline_value, resolve_reference, sole_reference};
use crate::shape::extract_value_by_key;
use flowpilot_core::condition::{ComplexCondition, Condition};
use flowpilot_core::error::WorkflowError;
use flowpilot_core::step::TransformOperation;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Number, Value};
use std::cmp::Ordering;
use std::collections::HashSet;

fn column_mapping(config: &Map<String, Value>) -> Option<&Map<String, Value>> {
    config.get("column_mapping").and_then(Value::as_object)
}

/// Render a cell for tabular sinks: nested structure becomes JSON text
fn cell_text(value: &Value) -> String {
    match value {
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
        other => inline_value(other),
    }
}

static TUPLE_UNWRAP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^item\.map\(\s*(\w+)\s*=>\s*(\w+)\[0\]\s*\)$").expect("unwrap regex"));

pub fn map(
    ctx: &ExecutionContext,
    input: &TransformInput,
    config: &Map<String, Value>,
) -> Result<Value, WorkflowError> {
    let items = input.require_items(TransformOperation::Map)?;

    if let Some(columns) = config.get("columns").and_then(Value::as_array) {
        let columns: Vec<&str> = columns.iter().filter_map(Value::as_str).collect();
        let mut rows: Vec<Value> = Vec::with_capacity(items.len() + 1);

        let add_headers = config
            .get("add_headers")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if add_headers && !items.is_empty() && headers_wanted(ctx, config) {
            rows.push(Value::Array(
                columns.iter().map(|c| Value::String(c.to_string())).collect(),
            ));
        }

        for item in &items {
            let row: Vec<Value> = columns
                .iter()
                .map(|column| {
                    extract_value_by_key(item, column, column_mapping(config))
                        .map(|v| Value::String(cell_text(&v)))
                        .unwrap_or(Value::String(String::new()))
                })
                .collect();
            rows.push(Value::Array(row));
        }
        return Ok(Value::Array(rows));
    }

    if let Some(expression) = config_str(config, &["expression"]) {
        // pre-unwrapped objects fed to a tuple-unwrap expression pass through
        if TUPLE_UNWRAP_RE.is_match(expression.trim())
            && items.iter().all(Value::is_object)
        {
            debug!("map expression is a tuple unwrap but items are objects; passing through");
            return Ok(Value::Array(items));
        }

        // whole-array form first (`item` bound to the input array)
        let mut whole: Map<String, Value> = Map::new();
        whole.insert("item".into(), Value::Array(items.clone()));
        whole.insert("items".into(), Value::Array(items.clone()));
        if let Ok(Value::Array(mapped)) = evaluate_raw(expression, &whole) {
            return Ok(Value::Array(mapped));
        }

        // per-item form
        let mut mapped = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let mut scope: Map<String, Value> = Map::new();
            scope.insert("item".into(), item.clone());
            scope.insert("index".into(), Value::from(index));
            let value = evaluate_raw(expression, &scope).map_err(WorkflowError::from)?;
            mapped.push(value);
        }
        return Ok(Value::Array(mapped));
    }

    Ok(Value::Array(items))
}

/// `add_headers_source` suppresses the header row unless the referenced
/// array is empty, so repeat runs do not stack headers
fn headers_wanted(ctx: &ExecutionContext, config: &Map<String, Value>) -> bool {
    let source = match config_str(config, &["add_headers_source"]) {
        Some(source) => source,
        None => return true,
    };
    let reference = sole_reference(source).unwrap_or(source);
    match resolve_reference(ctx, reference) {
        Ok(Value::Array(existing)) => existing.is_empty(),
        _ => true,
    }
}

pub fn filter(
    ctx: &ExecutionContext,
    input: &TransformInput,
    config: &Map<String, Value>,
) -> Result<Value, WorkflowError> {
    let items = input.require_items(TransformOperation::Filter)?;
    let original_count = items.len();

    // pre-computed tuple filters: `[original, bool]` pairs
    let is_tuple_filter = !items.is_empty()
        && items.iter().all(|item| {
            item.as_array()
                .map(|pair| pair.len() == 2 && pair[1].is_boolean())
                .unwrap_or(false)
        });
    let kept: Vec<Value> = if is_tuple_filter {
        items
            .into_iter()
            .filter_map(|item| {
                let pair = item.as_array()?;
                if pair[1].as_bool()? {
                    Some(pair[0].clone())
                } else {
                    None
                }
            })
            .collect()
    } else {
        let condition: Condition = config
            .get("condition")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .ok_or_else(|| {
                transform_failure(TransformOperation::Filter, "config.condition is required")
            })?;

        let mut scratch = ctx.clone_for_branch(true);
        let mut kept = Vec::new();
        for item in items {
            scratch.set_variable("item", item.clone());
            if filter_matches(&scratch, &item, &condition, config)? {
                kept.push(item);
            }
        }
        kept
    };

    let count = kept.len();
    Ok(json!({
        "items": kept,
        "count": count,
        "filtered": count,
        "removed": original_count - count,
        "originalCount": original_count,
    }))
}

/// Per-item condition evaluation: simple-condition fields address the item
/// itself first, then fall back to run-state references
fn filter_matches(
    scratch: &ExecutionContext,
    item: &Value,
    condition: &Condition,
    config: &Map<String, Value>,
) -> Result<bool, WorkflowError> {
    match condition {
        Condition::Complex(complex) => match complex {
            ComplexCondition::ComplexAnd { conditions } => {
                for child in conditions {
                    if !filter_matches(scratch, item, child, config)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            ComplexCondition::ComplexOr { conditions } => {
                for child in conditions {
                    if filter_matches(scratch, item, child, config)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            ComplexCondition::ComplexNot { condition } => {
                Ok(!filter_matches(scratch, item, condition, config)?)
            }
        },
        Condition::Simple(simple) => {
            let field = filter_field(scratch, item, &simple.field, config);
            apply_operator(simple.operator, field.as_ref(), &simple.value)
                .map_err(WorkflowError::from)
        }
        Condition::Raw(expression) => {
            let value =
                crate::expression::evaluate_expression(scratch, expression, &Map::new())?;
            Ok(crate::expression::truthy(&value))
        }
    }
}

fn filter_field(
    scratch: &ExecutionContext,
    item: &Value,
    field: &str,
    config: &Map<String, Value>,
) -> Option<Value> {
    let path = sole_reference(field).unwrap_or_else(|| field.trim());
    let stripped = path
        .strip_prefix("item.")
        .or_else(|| path.strip_prefix("current."));

    if let Some(inner) = stripped {
        if let Some(found) = extract_value_by_key(item, inner, column_mapping(config)) {
            return Some(found);
        }
    } else if let Some(found) = extract_value_by_key(item, path, column_mapping(config)) {
        return Some(found);
    }
    resolve_reference(scratch, path).ok()
}

pub fn reduce(input: &TransformInput, config: &Map<String, Value>) -> Result<Value, WorkflowError> {
    let items = input.require_items(TransformOperation::Reduce)?;
    let reducer = config_str(config, &["operation", "reducer"]).unwrap_or("sum");
    let field = config_str(config, &["field"]);

    match reducer {
        "count" => Ok(Value::from(items.len())),
        "sum" => {
            let total: f64 = items
                .iter()
                .filter_map(|item| numeric_of(item, field))
                .sum();
            Ok(number(total))
        }
        "concat" => {
            let separator = config_str(config, &["separator"]).unwrap_or("");
            Ok(Value::String(
                items
                    .iter()
                    .map(|item| {
                        field
                            .and_then(|f| extract_value_by_key(item, f, None))
                            .map(|v| inline_value(&v))
                            .unwrap_or_else(|| inline_value(item))
                    })
                    .collect::<Vec<_>>()
                    .join(separator),
            ))
        }
        "merge" => {
            let mut merged = Map::new();
            for item in &items {
                if let Value::Object(object) = item {
                    merged.extend(object.clone());
                }
            }
            Ok(Value::Object(merged))
        }
        other => Err(transform_failure(
            TransformOperation::Reduce,
            &format!("unknown reducer '{}'", other),
        )),
    }
}

fn numeric_of(item: &Value, field: Option<&str>) -> Option<f64> {
    let value = match field {
        Some(f) => extract_value_by_key(item, f, None)?,
        None => item.clone(),
    };
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
}

fn number(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Value::Number(Number::from(f as i64))
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone)]
struct SortLevel {
    field: String,
    descending: bool,
}

fn sort_levels(config: &Map<String, Value>) -> Result<Vec<SortLevel>, WorkflowError> {
    let mut levels = Vec::new();
    match config.get("sort_by").or_else(|| config.get("sortBy")) {
        Some(Value::String(field)) => levels.push(SortLevel {
            field: field.clone(),
            descending: false,
        }),
        Some(Value::Array(entries)) => {
            for entry in entries {
                match entry {
                    Value::String(field) => levels.push(SortLevel {
                        field: field.clone(),
                        descending: false,
                    }),
                    Value::Object(spec) => {
                        let field = spec
                            .get("field")
                            .or_else(|| spec.get("column"))
                            .and_then(Value::as_str)
                            .ok_or_else(|| {
                                transform_failure(
                                    TransformOperation::Sort,
                                    "sort_by entries need a 'field'",
                                )
                            })?;
                        let descending = spec
                            .get("direction")
                            .and_then(Value::as_str)
                            .map(|d| d.eq_ignore_ascii_case("desc"))
                            .unwrap_or(false);
                        levels.push(SortLevel {
                            field: field.to_string(),
                            descending,
                        });
                    }
                    _ => {}
                }
            }
        }
        _ => {
            if let Some(field) = config_str(config, &["field", "column"]) {
                let descending = config_str(config, &["direction"])
                    .map(|d| d.eq_ignore_ascii_case("desc"))
                    .unwrap_or(false);
                levels.push(SortLevel {
                    field: field.to_string(),
                    descending,
                });
            }
        }
    }
    if levels.is_empty() {
        return Err(transform_failure(
            TransformOperation::Sort,
            "config.sort_by is required",
        ));
    }
    Ok(levels)
}

/// Compare two field values: dates first, then numbers (numeric strings
/// included), then strings. `None` (missing) always sorts last.
fn compare_sort_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(Value::Null), Some(Value::Null)) => Ordering::Equal,
        (Some(Value::Null), Some(_)) => Ordering::Greater,
        (Some(_), Some(Value::Null)) => Ordering::Less,
        (Some(a), Some(b)) => {
            if let (Some(da), Some(db)) = (parse_date(a), parse_date(b)) {
                return da.cmp(&db);
            }
            let numeric = |v: &Value| {
                v.as_f64()
                    .or_else(|| v.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
            };
            if let (Some(na), Some(nb)) = (numeric(a), numeric(b)) {
                return na.partial_cmp(&nb).unwrap_or(Ordering::Equal);
            }
            inline_value(a).cmp(&inline_value(b))
        }
    }
}

pub fn sort(input: &TransformInput, config: &Map<String, Value>) -> Result<Value, WorkflowError> {
    let mut items = input.require_items(TransformOperation::Sort)?;
    let levels = sort_levels(config)?;
    let mapping = column_mapping(config).cloned();

    items.sort_by(|a, b| {
        for level in &levels {
            let va = extract_value_by_key(a, &level.field, mapping.as_ref());
            let vb = extract_value_by_key(b, &level.field, mapping.as_ref());
            let mut ordering = compare_sort_values(va.as_ref(), vb.as_ref());
            // missing values stay at the end even for descending sorts
            if level.descending && va.is_some() && vb.is_some() {
                ordering = ordering.reverse();
            }
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    Ok(Value::Array(items))
}

fn group_key_name(config: &Map<String, Value>) -> Option<&str> {
    config_str(config, &["column", "field", "groupBy", "group_by"])
}

/// Column index for 2-D rows, located by header name
fn header_index(header: &[Value], name: &str) -> Option<usize> {
    let lowered = name.to_lowercase();
    header.iter().position(|cell| {
        cell.as_str()
            .map(|text| text.to_lowercase() == lowered)
            .unwrap_or(false)
    })
}

pub fn group(input: &TransformInput, config: &Map<String, Value>) -> Result<Value, WorkflowError> {
    let items = input.require_items(TransformOperation::Group)?;
    let key_name = group_key_name(config).ok_or_else(|| {
        transform_failure(TransformOperation::Group, "config.column/field/groupBy is required")
    })?;

    let is_rows = items.first().map(Value::is_array).unwrap_or(false);
    let mut grouped: Map<String, Value> = Map::new();
    let mut order: Vec<String> = Vec::new();

    if is_rows {
        // 2-D input: the first row is the header and is skipped
        let header = items
            .first()
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let index = header_index(&header, key_name).ok_or_else(|| {
            transform_failure(
                TransformOperation::Group,
                &format!("column '{}' not found in header row", key_name),
            )
        })?;
        for row in items.iter().skip(1) {
            let key = row
                .as_array()
                .and_then(|cells| cells.get(index))
                .map(inline_value)
                .unwrap_or_default();
            push_group(&mut grouped, &mut order, &key, row.clone());
        }
    } else {
        for item in &items {
            let key = extract_value_by_key(item, key_name, column_mapping(config))
                .map(|v| inline_value(&v))
                .unwrap_or_default();
            push_group(&mut grouped, &mut order, &key, item.clone());
        }
    }

    let groups: Vec<Value> = order
        .iter()
        .map(|key| {
            let members = grouped.get(key).cloned().unwrap_or(json!([]));
            let count = members.as_array().map(|m| m.len()).unwrap_or(0);
            json!({"key": key, "items": members, "count": count})
        })
        .collect();

    let mut result = Map::new();
    result.insert("grouped".into(), Value::Object(grouped.clone()));
    result.insert("groups".into(), Value::Array(groups));
    result.insert(
        "keys".into(),
        Value::Array(order.iter().map(|k| Value::String(k.clone())).collect()),
    );
    result.insert("count".into(), Value::from(order.len()));
    // direct key access for older documents
    for (key, members) in grouped {
        result.entry(key).or_insert(members);
    }
    Ok(Value::Object(result))
}

fn push_group(grouped: &mut Map<String, Value>, order: &mut Vec<String>, key: &str, item: Value) {
    match grouped.get_mut(key) {
        Some(Value::Array(members)) => members.push(item),
        _ => {
            grouped.insert(key.to_string(), json!([item]));
            order.push(key.to_string());
        }
    }
}

pub fn aggregate(
    input: &TransformInput,
    config: &Map<String, Value>,
) -> Result<Value, WorkflowError> {
    let items = input.require_items(TransformOperation::Aggregate)?;
    let operation = config_str(config, &["operation", "aggregation_type"]).unwrap_or("count");
    let field = config_str(config, &["field"]);

    let values: Vec<f64> = items
        .iter()
        .filter_map(|item| numeric_of(item, field))
        .collect();

    let result = match operation {
        "count" => Value::from(items.len()),
        "sum" => number(values.iter().sum()),
        "avg" => {
            if values.is_empty() {
                Value::Null
            } else {
                number(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        "min" => values
            .iter()
            .cloned()
            .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.min(v))))
            .map(number)
            .unwrap_or(Value::Null),
        "max" => values
            .iter()
            .cloned()
            .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.max(v))))
            .map(number)
            .unwrap_or(Value::Null),
        other => {
            return Err(transform_failure(
                TransformOperation::Aggregate,
                &format!("unknown aggregation '{}'", other),
            ))
        }
    };

    Ok(json!({
        "result": result,
        "operation": operation,
        "field": field,
        "count": items.len(),
    }))
}

pub fn deduplicate(
    input: &TransformInput,
    config: &Map<String, Value>,
) -> Result<Value, WorkflowError> {
    let items = input.require_items(TransformOperation::Deduplicate)?;
    let original_count = items.len();
    let key_name = config_str(config, &["column", "field", "key"]);

    let is_rows = items.first().map(Value::is_array).unwrap_or(false);
    let mut seen: HashSet<String> = HashSet::new();
    let mut kept: Vec<Value> = Vec::new();

    if is_rows && key_name.is_some() {
        // keep the header row, dedupe data rows by the named column
        let header = items
            .first()
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let index = key_name.and_then(|name| header_index(&header, name));
        for (position, row) in items.into_iter().enumerate() {
            if position == 0 {
                kept.push(row);
                continue;
            }
            let fingerprint = match index {
                Some(i) => row
                    .as_array()
                    .and_then(|cells| cells.get(i))
                    .map(inline_value)
                    .unwrap_or_default(),
                None => canonical_json(&row),
            };
            if seen.insert(fingerprint) {
                kept.push(row);
            }
        }
    } else {
        for item in items {
            let fingerprint = match key_name {
                Some(name) => extract_value_by_key(&item, name, column_mapping(config))
                    .map(|v| inline_value(&v))
                    .unwrap_or_else(|| canonical_json(&item)),
                None => canonical_json(&item),
            };
            if seen.insert(fingerprint) {
                kept.push(item);
            }
        }
    }

    let count = kept.len();
    Ok(json!({
        "items": kept,
        "count": count,
        "removed": original_count - count,
        "originalCount": original_count,
    }))
}

pub fn flatten(
    input: &TransformInput,
    config: &Map<String, Value>,
) -> Result<Value, WorkflowError> {
    let items = input.require_items(TransformOperation::Flatten)?;
    let depth = config
        .get("depth")
        .and_then(Value::as_u64)
        .unwrap_or(1)
        .max(1) as usize;

    let source: Vec<Value> = match config_str(config, &["field"]) {
        Some(field) => {
            let mut extracted = Vec::new();
            for parent in &items {
                let children = extract_value_by_key(parent, field, None)
                    .and_then(|v| v.as_array().cloned())
                    .unwrap_or_default();
                for child in children {
                    extracted.push(enrich_child(child, parent));
                }
            }
            extracted
        }
        None => items,
    };

    fn flatten_level(items: Vec<Value>, depth: usize) -> Vec<Value> {
        if depth == 0 {
            return items;
        }
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::Array(inner) => out.extend(flatten_level(inner, depth - 1)),
                other => out.push(other),
            }
        }
        out
    }

    Ok(Value::Array(flatten_level(source, depth)))
}

/// Children extracted from a parent keep enough parent identity for
/// downstream content fetches
fn enrich_child(child: Value, parent: &Value) -> Value {
    let mut object = match child {
        Value::Object(object) => object,
        other => return other,
    };
    let mut parent_data = Map::new();
    for (source, target) in [
        ("id", "id"),
        ("subject", "subject"),
        ("from", "from"),
        ("message_id", "messageId"),
        ("messageId", "messageId"),
    ] {
        if let Some(value) = extract_value_by_key(parent, source, None) {
            parent_data.entry(target.to_string()).or_insert(value);
        }
    }
    if let Some(id) = parent_data.get("id").cloned() {
        object.entry("_parentId".to_string()).or_insert(id);
    }
    if !parent_data.is_empty() {
        object
            .entry("_parentData".to_string())
            .or_insert(Value::Object(parent_data));
    }
    Value::Object(object)
}

pub fn pivot(input: &TransformInput, config: &Map<String, Value>) -> Result<Value, WorkflowError> {
    let items = input.require_items(TransformOperation::Pivot)?;
    let row_key = config_str(config, &["rowKey", "row_key"]);
    let column_key = config_str(config, &["columnKey", "column_key"]);
    let value_key = config_str(config, &["valueKey", "value_key"]);
    let (row_key, column_key, value_key) = match (row_key, column_key, value_key) {
        (Some(r), Some(c), Some(v)) => (r, c, v),
        _ => {
            return Err(transform_failure(
                TransformOperation::Pivot,
                "rowKey, columnKey and valueKey are required",
            ))
        }
    };

    let mut pivoted: Map<String, Value> = Map::new();
    for item in &items {
        let row = extract_value_by_key(item, row_key, None)
            .map(|v| inline_value(&v))
            .unwrap_or_default();
        let column = extract_value_by_key(item, column_key, None)
            .map(|v| inline_value(&v))
            .unwrap_or_default();
        let value = extract_value_by_key(item, value_key, None).unwrap_or(Value::Null);
        match pivoted.get_mut(&row) {
            Some(Value::Object(cells)) => {
                cells.insert(column, value);
            }
            _ => {
                let mut cells = Map::new();
                cells.insert(column, value);
                pivoted.insert(row, Value::Object(cells));
            }
        }
    }
    Ok(Value::Object(pivoted))
}

pub fn split(input: &TransformInput, config: &Map<String, Value>) -> Result<Value, WorkflowError> {
    let items = input.require_items(TransformOperation::Split)?;
    let size = match (
        config.get("size").and_then(Value::as_u64),
        config.get("count").and_then(Value::as_u64),
    ) {
        (Some(size), _) if size > 0 => size as usize,
        (_, Some(count)) if count > 0 => items.len().div_ceil(count as usize).max(1),
        _ => {
            return Err(transform_failure(
                TransformOperation::Split,
                "config.size or config.count is required",
            ))
        }
    };
    let chunks: Vec<Value> = items
        .chunks(size)
        .map(|chunk| Value::Array(chunk.to_vec()))
        .collect();
    Ok(Value::Array(chunks))
}

pub fn expand(input: &TransformInput, config: &Map<String, Value>) -> Result<Value, WorkflowError> {
    let items = input.require_items(TransformOperation::Expand)?;
    let delimiter = config_str(config, &["delimiter"]).unwrap_or(".");

    fn flatten_into(prefix: &str, value: &Value, delimiter: &str, out: &mut Map<String, Value>) {
        match value {
            Value::Object(object) => {
                for (key, nested) in object {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{}{}{}", prefix, delimiter, key)
                    };
                    flatten_into(&path, nested, delimiter, out);
                }
            }
            other => {
                out.insert(prefix.to_string(), other.clone());
            }
        }
    }

    let expanded: Vec<Value> = items
        .iter()
        .map(|item| match item {
            Value::Object(_) => {
                let mut flat = Map::new();
                flatten_into("", item, delimiter, &mut flat);
                Value::Object(flat)
            }
            other => other.clone(),
        })
        .collect();
    Ok(Value::Array(expanded))
}

pub fn partition(
    input: &TransformInput,
    config: &Map<String, Value>,
) -> Result<Value, WorkflowError> {
    let items = input.require_items(TransformOperation::Partition)?;
    let field = config_str(config, &["field", "column"]).ok_or_else(|| {
        transform_failure(TransformOperation::Partition, "config.field is required")
    })?;
    let handle_empty = config_str(config, &["handle_empty"]).unwrap_or("separate");

    let mut partitions: Map<String, Value> = Map::new();
    let mut order: Vec<String> = Vec::new();
    for item in items {
        let key = extract_value_by_key(&item, field, column_mapping(config))
            .filter(|v| !v.is_null())
            .map(|v| inline_value(&v))
            .filter(|text| !text.is_empty());
        let bucket = match key {
            Some(key) => key,
            None => match handle_empty {
                "skip" => continue,
                "empty" => String::new(),
                _ => "_empty".to_string(),
            },
        };
        push_group(&mut partitions, &mut order, &bucket, item);
    }

    Ok(json!({
        "partitions": partitions,
        "keys": order,
        "count": order.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpilot_core::types::AgentProfile;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("e", "u", AgentProfile::default())
    }

    fn input_of(value: Value) -> TransformInput {
        TransformInput {
            value,
            origin_plugin: None,
            schema_hint: None,
        }
    }

    fn config(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_map_columns_emits_rows_with_header() {
        let input = input_of(json!([
            {"Name": "Acme", "Owner": "Eve", "nested": {"a": 1}},
            {"Name": "Globex", "Owner": "Ed"}
        ]));
        let out = map(
            &ctx(),
            &input,
            &config(json!({"columns": ["Name", "nested"], "add_headers": true})),
        )
        .unwrap();
        let rows = out.as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], json!(["Name", "nested"]));
        assert_eq!(rows[1], json!(["Acme", "{\"a\":1}"]));
        assert_eq!(rows[2], json!(["Globex", ""]));
    }

    #[test]
    fn test_map_no_header_on_empty_input() {
        let input = input_of(json!([]));
        let out = map(
            &ctx(),
            &input,
            &config(json!({"columns": ["Name"], "add_headers": true})),
        )
        .unwrap();
        assert_eq!(out, json!([]));
    }

    #[test]
    fn test_map_expression_per_item() {
        let input = input_of(json!([{"id": 1}, {"id": 2}, {"id": 3}]));
        let out = map(
            &ctx(),
            &input,
            &config(json!({"expression": "item.id * 10"})),
        )
        .unwrap();
        assert_eq!(out, json!([10, 20, 30]));
    }

    #[test]
    fn test_map_tuple_unwrap_passthrough() {
        let input = input_of(json!([{"id": 1}, {"id": 2}]));
        let out = map(
            &ctx(),
            &input,
            &config(json!({"expression": "item.map(x => x[0])"})),
        )
        .unwrap();
        assert_eq!(out, json!([{"id": 1}, {"id": 2}]));
    }

    #[test]
    fn test_map_whole_array_expression() {
        let input = input_of(json!([[1, "a"], [2, "b"]]));
        let out = map(
            &ctx(),
            &input,
            &config(json!({"expression": "item.map(x => x[0])"})),
        )
        .unwrap();
        assert_eq!(out, json!([1, 2]));
    }

    #[test]
    fn test_filter_simple_condition_bare_field() {
        let input = input_of(json!([
            {"Status": "Open", "Owner": "Eve"},
            {"Status": "Closed", "Owner": "Ed"}
        ]));
        let out = filter(
            &ctx(),
            &input,
            &config(json!({"condition": {"field": "Status", "operator": "equals", "value": "Open"}})),
        )
        .unwrap();
        assert_eq!(out["items"], json!([{"Status": "Open", "Owner": "Eve"}]));
        assert_eq!(out["removed"], json!(1));
        assert_eq!(out["originalCount"], json!(2));
        assert_eq!(out["count"], json!(1));
    }

    #[test]
    fn test_filter_tuple_auto_unwrap() {
        let input = input_of(json!([[{"id": 1}, true], [{"id": 2}, false]]));
        let out = filter(&ctx(), &input, &Map::new()).unwrap();
        assert_eq!(out["items"], json!([{"id": 1}]));
    }

    #[test]
    fn test_filter_raw_expression() {
        let input = input_of(json!([{"n": 1}, {"n": 9}]));
        let out = filter(
            &ctx(),
            &input,
            &config(json!({"condition": "{{item.n}} > 5"})),
        )
        .unwrap();
        assert_eq!(out["items"], json!([{"n": 9}]));
    }

    #[test]
    fn test_reduce_sum_and_merge() {
        let input = input_of(json!([{"v": 2}, {"v": "3"}]));
        let out = reduce(&input, &config(json!({"operation": "sum", "field": "v"}))).unwrap();
        assert_eq!(out, json!(5));

        let input = input_of(json!([{"a": 1}, {"b": 2}]));
        let out = reduce(&input, &config(json!({"operation": "merge"}))).unwrap();
        assert_eq!(out, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_sort_numeric_strings_and_nulls() {
        let input = input_of(json!([
            {"n": "10"}, {"n": 2}, {"x": true}, {"n": "1"}
        ]));
        let out = sort(&input, &config(json!({"sort_by": "n"}))).unwrap();
        let ns: Vec<Value> = out
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item.get("n").cloned().unwrap_or(Value::Null))
            .collect();
        assert_eq!(ns, vec![json!("1"), json!(2), json!("10"), Value::Null]);
    }

    #[test]
    fn test_sort_idempotent() {
        let input = input_of(json!([{"n": 3}, {"n": 1}, {"n": 2}]));
        let cfg = config(json!({"sort_by": "n"}));
        let once = sort(&input, &cfg).unwrap();
        let twice = sort(&input_of(once.clone()), &cfg).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_sort_multi_level_with_direction() {
        let input = input_of(json!([
            {"team": "b", "score": 1},
            {"team": "a", "score": 2},
            {"team": "a", "score": 9}
        ]));
        let out = sort(
            &input,
            &config(json!({"sort_by": [
                {"field": "team"},
                {"field": "score", "direction": "desc"}
            ]})),
        )
        .unwrap();
        assert_eq!(
            out,
            json!([
                {"team": "a", "score": 9},
                {"team": "a", "score": 2},
                {"team": "b", "score": 1}
            ])
        );
    }

    #[test]
    fn test_sort_dates() {
        let input = input_of(json!([
            {"at": "2024-06-01T10:00:00Z"},
            {"at": "2024-05-31T09:00:00Z"}
        ]));
        let out = sort(&input, &config(json!({"sort_by": "at"}))).unwrap();
        assert_eq!(out[0]["at"], json!("2024-05-31T09:00:00Z"));
    }

    #[test]
    fn test_group_objects() {
        let input = input_of(json!([
            {"owner": "Eve", "id": 1},
            {"owner": "Ed", "id": 2},
            {"owner": "Eve", "id": 3}
        ]));
        let out = group(&input, &config(json!({"field": "owner"}))).unwrap();
        assert_eq!(out["count"], json!(2));
        assert_eq!(out["keys"], json!(["Eve", "Ed"]));
        assert_eq!(out["grouped"]["Eve"].as_array().unwrap().len(), 2);
        // direct key access kept for older documents
        assert_eq!(out["Ed"].as_array().unwrap().len(), 1);
        assert_eq!(out["groups"][0]["count"], json!(2));
    }

    #[test]
    fn test_group_rows_skips_header() {
        let input = input_of(json!([
            ["Owner", "Deal"],
            ["Eve", "d1"],
            ["Eve", "d2"],
            ["Ed", "d3"]
        ]));
        let out = group(&input, &config(json!({"column": "owner"}))).unwrap();
        assert_eq!(out["grouped"]["Eve"].as_array().unwrap().len(), 2);
        assert_eq!(out["count"], json!(2));
    }

    #[test]
    fn test_aggregate_avg_and_legacy_shape() {
        let input = input_of(json!([{"v": 2}, {"v": 4}]));
        let out = aggregate(
            &input,
            &config(json!({"aggregation_type": "avg", "field": "v"})),
        )
        .unwrap();
        assert_eq!(out["result"], json!(3));
        assert_eq!(out["count"], json!(2));
    }

    #[test]
    fn test_deduplicate_by_key_and_idempotence() {
        let input = input_of(json!([
            {"id": "a", "n": 1},
            {"id": "a", "n": 2},
            {"id": "b", "n": 3}
        ]));
        let cfg = config(json!({"key": "id"}));
        let once = deduplicate(&input, &cfg).unwrap();
        assert_eq!(once["items"].as_array().unwrap().len(), 2);
        assert_eq!(once["removed"], json!(1));

        // structurally idempotent on the kept items
        let again = deduplicate(&input_of(once["items"].clone()), &cfg).unwrap();
        assert_eq!(again["items"], once["items"]);
        assert_eq!(again["removed"], json!(0));
    }

    #[test]
    fn test_deduplicate_rows_preserves_header() {
        let input = input_of(json!([
            ["Email", "Name"],
            ["a@x.c", "A"],
            ["a@x.c", "A2"],
            ["b@x.c", "B"]
        ]));
        let out = deduplicate(&input, &config(json!({"column": "Email"}))).unwrap();
        let items = out["items"].as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], json!(["Email", "Name"]));
    }

    #[test]
    fn test_flatten_with_field_enriches_parents() {
        let input = input_of(json!([
            {"id": "m1", "subject": "Hi", "attachments": [{"name": "a.pdf"}]},
            {"id": "m2", "attachments": [{"name": "b.pdf"}]}
        ]));
        let out = flatten(&input, &config(json!({"field": "attachments"}))).unwrap();
        let items = out.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["_parentId"], json!("m1"));
        assert_eq!(items[0]["_parentData"]["subject"], json!("Hi"));
    }

    #[test]
    fn test_flatten_depth() {
        let input = input_of(json!([[1, [2, 3]], [4]]));
        let out = flatten(&input, &Map::new()).unwrap();
        assert_eq!(out, json!([1, [2, 3], 4]));
        let out = flatten(&input, &config(json!({"depth": 2}))).unwrap();
        assert_eq!(out, json!([1, 2, 3, 4]));
    }

    #[test]
    fn test_pivot() {
        let input = input_of(json!([
            {"rep": "Eve", "month": "Jan", "total": 10},
            {"rep": "Eve", "month": "Feb", "total": 20},
            {"rep": "Ed", "month": "Jan", "total": 5}
        ]));
        let out = pivot(
            &input,
            &config(json!({"rowKey": "rep", "columnKey": "month", "valueKey": "total"})),
        )
        .unwrap();
        assert_eq!(out["Eve"]["Feb"], json!(20));
        assert_eq!(out["Ed"]["Jan"], json!(5));
    }

    #[test]
    fn test_split_by_size_and_count() {
        let input = input_of(json!([1, 2, 3, 4, 5]));
        let out = split(&input, &config(json!({"size": 2}))).unwrap();
        assert_eq!(out, json!([[1, 2], [3, 4], [5]]));
        let out = split(&input, &config(json!({"count": 2}))).unwrap();
        assert_eq!(out, json!([[1, 2, 3], [4, 5]]));
    }

    #[test]
    fn test_expand_nested_keys() {
        let input = input_of(json!([{"a": {"b": {"c": 1}}, "d": 2}]));
        let out = expand(&input, &Map::new()).unwrap();
        assert_eq!(out, json!([{"a.b.c": 1, "d": 2}]));
    }

    #[test]
    fn test_partition_empty_handling() {
        let input = input_of(json!([
            {"kind": "a"}, {"kind": ""}, {"x": 1}
        ]));
        let out = partition(&input, &config(json!({"field": "kind"}))).unwrap();
        assert_eq!(out["partitions"]["a"].as_array().unwrap().len(), 1);
        assert_eq!(out["partitions"]["_empty"].as_array().unwrap().len(), 2);

        let out = partition(
            &input,
            &config(json!({"field": "kind", "handle_empty": "skip"})),
        )
        .unwrap();
        assert_eq!(out["keys"], json!(["a"]));
    }
}
