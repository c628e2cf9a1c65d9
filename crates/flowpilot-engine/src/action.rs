//! Plugin action execution
//!
//! Parameters are reshaped against the action's declared JSON schema
//! before the call: objects destined for 2-D array parameters become a
//! single row, structured values destined for string parameters are
//! formatted, scalar types coerce, and missing required parameters get
//! defaults. Successful calls carry a synthetic token cost so accounting
//! stays uniform across AI and non-AI work.

use flowpilot_core::error::{ExecutionError, WorkflowError};
use flowpilot_core::traits::PluginRuntime;
use flowpilot_core::types::TokenUsage;
use log::debug;
use serde_json::{Map, Number, Value};
use std::sync::Arc;

/// Reshape resolved params against the declared parameter schema
pub fn transform_parameters(params: &Map<String, Value>, schema: Option<&Value>) -> Map<String, Value> {
    let schema = match schema {
        Some(schema) => schema,
        None => return params.clone(),
    };
    let properties = match schema.get("properties").and_then(Value::as_object) {
        Some(properties) => properties,
        None => return params.clone(),
    };
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut transformed = params.clone();

    for (name, declared) in properties {
        match transformed.get(name) {
            Some(value) => {
                let reshaped = reshape_value(name, value, declared);
                transformed.insert(name.clone(), reshaped);
            }
            None if required.contains(&name.as_str()) => {
                transformed.insert(name.clone(), default_for(name, declared));
            }
            None => {}
        }
    }
    transformed
}

fn declared_type(declared: &Value) -> Option<&str> {
    declared.get("type").and_then(Value::as_str)
}

fn is_two_dimensional(declared: &Value) -> bool {
    declared_type(declared) == Some("array")
        && declared
            .get("items")
            .map(|items| declared_type(items) == Some("array"))
            .unwrap_or(false)
}

fn reshape_value(name: &str, value: &Value, declared: &Value) -> Value {
    match declared_type(declared) {
        Some("array") if is_two_dimensional(declared) => match value {
            // a single object materializes as one row; tabular sinks
            // reject nested structure, so cells are stringified
            Value::Object(object) => {
                let row: Vec<Value> = object.values().map(cell_value).collect();
                Value::Array(vec![Value::Array(row)])
            }
            Value::Array(items) if !items.iter().all(Value::is_array) => {
                Value::Array(vec![Value::Array(items.iter().map(cell_value).collect())])
            }
            other => other.clone(),
        },
        Some("string") => match value {
            Value::Object(_) | Value::Array(_) => {
                let format_hint = declared.get("format").and_then(Value::as_str);
                if format_hint == Some("structured-message")
                    || name.to_lowercase().contains("message")
                {
                    Value::String(structured_message(value))
                } else {
                    Value::String(serde_json::to_string_pretty(value).unwrap_or_default())
                }
            }
            Value::String(_) => value.clone(),
            other => Value::String(crate::resolver::inline_value(other)),
        },
        Some("number") | Some("integer") => match value {
            Value::String(text) => text
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|f| {
                    if declared_type(declared) == Some("integer") {
                        Some(Value::Number(Number::from(f as i64)))
                    } else {
                        Number::from_f64(f).map(Value::Number)
                    }
                })
                .unwrap_or_else(|| value.clone()),
            other => other.clone(),
        },
        Some("boolean") => match value {
            Value::String(text) => {
                match text.trim().to_lowercase().as_str() {
                    "true" | "1" | "yes" => Value::Bool(true),
                    "false" | "0" | "no" => Value::Bool(false),
                    _ => value.clone(),
                }
            }
            Value::Number(n) => Value::Bool(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
            other => other.clone(),
        },
        _ => value.clone(),
    }
}

fn cell_value(value: &Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) => {
            Value::String(serde_json::to_string(value).unwrap_or_default())
        }
        other => other.clone(),
    }
}

/// Human-readable rendering for message-like string parameters
fn structured_message(value: &Value) -> String {
    match value {
        Value::Object(object) => object
            .iter()
            .map(|(key, v)| format!("{}: {}", key, crate::resolver::inline_value(v)))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Array(items) => items
            .iter()
            .map(|item| format!("- {}", crate::resolver::inline_value(item)))
            .collect::<Vec<_>>()
            .join("\n"),
        other => crate::resolver::inline_value(other),
    }
}

fn default_for(name: &str, declared: &Value) -> Value {
    if let Some(given) = declared.get("default") {
        return given.clone();
    }
    if name.to_lowercase().contains("range") {
        return Value::String("Sheet1".to_string());
    }
    match declared_type(declared) {
        Some("string") => Value::String(String::new()),
        Some("number") | Some("integer") => Value::Number(Number::from(0)),
        Some("boolean") => Value::Bool(false),
        Some("array") => Value::Array(Vec::new()),
        Some("object") => Value::Object(Map::new()),
        _ => Value::Null,
    }
}

/// Execute a plugin action with schema-guided parameter shaping.
///
/// Returns the payload, its declared output schema (for downstream shape
/// reconciliation) and the synthetic token cost.
pub async fn execute_action(
    runtime: &Arc<dyn PluginRuntime>,
    user_id: &str,
    plugin: &str,
    action: &str,
    resolved_params: &Map<String, Value>,
    declared_output_schema: Option<&Value>,
    plugin_token_equivalent: u64,
) -> Result<(Value, Option<Value>, TokenUsage), WorkflowError> {
    let definition = runtime.definition(plugin).await;
    let parameter_schema = definition
        .as_ref()
        .and_then(|def| def.action_parameters(action).cloned());
    let params = transform_parameters(resolved_params, parameter_schema.as_ref());
    debug!("executing {}.{} with {} params", plugin, action, params.len());

    let result = runtime
        .execute(user_id, plugin, action, &params)
        .await
        .map_err(|e| {
            WorkflowError::Execution(ExecutionError::PluginFailure {
                plugin: plugin.to_string(),
                action: action.to_string(),
                message: e.to_string(),
            })
        })?;

    if !result.success {
        return Err(WorkflowError::Execution(ExecutionError::PluginFailure {
            plugin: plugin.to_string(),
            action: action.to_string(),
            message: result.failure_text(),
        }));
    }

    let output_schema = declared_output_schema.cloned().or_else(|| {
        definition
            .as_ref()
            .and_then(|def| def.action_output_schema(action).cloned())
    });

    Ok((
        result.data.unwrap_or(Value::Null),
        output_schema,
        TokenUsage::of(plugin_token_equivalent),
    ))
}
