//! Content enrichment via plugin action discovery
//!
//! `fetch_content` enriches each item with its full content by finding a
//! suitable fetch action on the producing plugin (no action names are
//! hardcoded per plugin, only shape patterns) and auto-mapping item fields
//! onto the action's declared parameters.

use super::{config_str, transform_failure, TransformInput};
use flowpilot_core::error::WorkflowError;
use flowpilot_core::step::TransformOperation;
use flowpilot_core::traits::PluginRuntime;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;

static FETCH_ACTION_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^get_.+_attachment$",
        r"^get_.+_content$",
        r"^download_.+$",
        r"^fetch_.+_content$",
        r"^get_file$",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("fetch action pattern"))
    .collect()
});

fn to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (index, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if index > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for c in name.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Map one declared parameter onto an item's fields: exact name, then
/// camel/snake variants, then an `id` fallback for `*_id` parameters,
/// then `_parentData`.
fn map_parameter(item: &Map<String, Value>, parameter: &str) -> Option<Value> {
    if let Some(value) = item.get(parameter) {
        return Some(value.clone());
    }
    for variant in [to_snake(parameter), to_camel(parameter)] {
        if variant != parameter {
            if let Some(value) = item.get(&variant) {
                return Some(value.clone());
            }
        }
    }

    let wants_id = parameter.ends_with("_id") || parameter.ends_with("Id");
    if wants_id {
        if let Some(value) = item.get("id") {
            return Some(value.clone());
        }
    }

    if let Some(Value::Object(parent)) = item.get("_parentData") {
        if let Some(value) = map_parameter_shallow(parent, parameter) {
            return Some(value);
        }
        if wants_id {
            if let Some(value) = parent.get("id") {
                return Some(value.clone());
            }
        }
    }
    None
}

fn map_parameter_shallow(object: &Map<String, Value>, parameter: &str) -> Option<Value> {
    object.get(parameter).cloned().or_else(|| {
        [to_snake(parameter), to_camel(parameter)]
            .into_iter()
            .filter(|variant| variant != parameter)
            .find_map(|variant| object.get(&variant).cloned())
    })
}

pub async fn fetch_content(
    runtime: Option<&Arc<dyn PluginRuntime>>,
    user_id: &str,
    input: &TransformInput,
    config: &Map<String, Value>,
) -> Result<Value, WorkflowError> {
    let runtime = runtime.ok_or_else(|| {
        transform_failure(TransformOperation::FetchContent, "no plugin runtime available")
    })?;
    let items = input.require_items(TransformOperation::FetchContent)?;

    let plugin = config_str(config, &["plugin"])
        .map(|s| s.to_string())
        .or_else(|| input.origin_plugin.clone())
        .ok_or_else(|| {
            transform_failure(
                TransformOperation::FetchContent,
                "cannot determine the source plugin; set config.plugin or feed a step output",
            )
        })?;

    let definition = runtime.definition(&plugin).await.ok_or_else(|| {
        transform_failure(
            TransformOperation::FetchContent,
            &format!("plugin '{}' publishes no action definitions", plugin),
        )
    })?;

    let action = definition
        .action_names()
        .into_iter()
        .find(|name| FETCH_ACTION_RES.iter().any(|re| re.is_match(name)))
        .ok_or_else(|| {
            transform_failure(
                TransformOperation::FetchContent,
                &format!("plugin '{}' exposes no content-fetch action", plugin),
            )
        })?;
    debug!("fetch_content using {}.{}", plugin, action);

    let parameter_names: Vec<String> = definition
        .action_parameters(&action)
        .and_then(|schema| schema.get("properties"))
        .and_then(Value::as_object)
        .map(|props| props.keys().cloned().collect())
        .unwrap_or_default();

    let target_field = config_str(config, &["target_field", "targetField"]).unwrap_or("content");

    let mut enriched = Vec::with_capacity(items.len());
    for item in items {
        let object = match item.as_object() {
            Some(object) => object.clone(),
            None => {
                enriched.push(item);
                continue;
            }
        };

        let mut params = Map::new();
        for parameter in &parameter_names {
            if let Some(value) = map_parameter(&object, parameter) {
                params.insert(parameter.clone(), value);
            }
        }

        match runtime.execute(user_id, &plugin, &action, &params).await {
            Ok(result) if result.success => {
                let mut updated = object;
                updated.insert(
                    target_field.to_string(),
                    result.data.unwrap_or(Value::Null),
                );
                enriched.push(Value::Object(updated));
            }
            Ok(result) => {
                warn!(
                    "fetch_content: {}.{} failed for item: {}",
                    plugin,
                    action,
                    result.failure_text()
                );
                enriched.push(Value::Object(object));
            }
            Err(e) => {
                warn!("fetch_content: {}.{} errored: {}", plugin, action, e);
                enriched.push(Value::Object(object));
            }
        }
    }

    Ok(Value::Array(enriched))
}
