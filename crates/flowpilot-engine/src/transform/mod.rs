//! Deterministic data transforms
//!
//! One entry point routes `(operation, input, config)` to the op
//! implementations. Input coercion happens here: a reference resolving to
//! a step-output shell auto-extracts `.data`, objects go through the
//! schema-aware unwrap to find their primary collection, and operations
//! that require an array fail with guidance when none can be found.

pub mod collection;
pub mod fetch;
pub mod rows;
pub mod table;

use crate::context::ExecutionContext;
use crate::expression;
use crate::resolver::{resolve_template, resolve_value, sole_reference, REFERENCE_RE};
use crate::shape;
use flowpilot_core::error::{ExecutionError, WorkflowError};
use flowpilot_core::step::TransformOperation;
use flowpilot_core::traits::PluginRuntime;
use log::debug;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Resolved transform input with its provenance
#[derive(Debug, Clone)]
pub struct TransformInput {
    /// The resolved value after step-shell extraction
    pub value: Value,
    /// Plugin that produced the referenced step output, when known
    pub origin_plugin: Option<String>,
    /// Declared output schema of the producing step, when known
    pub schema_hint: Option<Value>,
}

impl TransformInput {
    /// The primary collection, through the schema-aware unwrap when the
    /// value is an object
    pub fn items(&self) -> Option<Vec<Value>> {
        shape::unwrap_structured_output(&self.value, self.schema_hint.as_ref())
    }

    /// The primary collection or the guidance error the array-requiring
    /// operations raise
    pub fn require_items(&self, operation: TransformOperation) -> Result<Vec<Value>, WorkflowError> {
        self.items().ok_or_else(|| {
            let available = match &self.value {
                Value::Object(object) => format!(
                    "input is an object with fields [{}] and no array field",
                    object.keys().cloned().collect::<Vec<_>>().join(", ")
                ),
                other => format!("input is {}", type_label(other)),
            };
            WorkflowError::Execution(ExecutionError::InvalidTransformInput {
                operation: operation.to_string(),
                message: format!(
                    "{}; point the input at an upstream array, e.g. '{{{{stepN.data.items}}}}'",
                    available
                ),
            })
        })
    }
}

fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Resolve the raw `input` field of a transform step and carry provenance
pub fn resolve_transform_input(
    ctx: &ExecutionContext,
    raw_input: &Value,
) -> Result<TransformInput, WorkflowError> {
    let mut origin_plugin = None;
    let mut schema_hint = None;

    if let Some(reference) = raw_input.as_str().and_then(sole_reference) {
        let root = reference
            .split(['.', '['])
            .next()
            .unwrap_or(reference)
            .trim();
        if let Some(output) = ctx.get_step_output(root) {
            origin_plugin = Some(output.plugin.clone());
        }
        schema_hint = ctx.get_output_schema(root).cloned();
    }

    // a literal expression containing references expands and parses as
    // JSON first, falling back to the bounded evaluator and finally to a
    // plain substituted string; unresolved references always fail
    let mut value = match raw_input.as_str() {
        Some(text) if sole_reference(text).is_none() && REFERENCE_RE.is_match(text) => {
            let expanded = expression::expand_references(ctx, text)?;
            if let Ok(parsed) = serde_json::from_str::<Value>(expanded.trim()) {
                parsed
            } else if let Ok(evaluated) =
                expression::evaluate_raw(expanded.trim(), &Map::new())
            {
                evaluated
            } else {
                Value::String(resolve_template(ctx, text)?)
            }
        }
        _ => resolve_value(ctx, raw_input)?,
    };

    // a step-output shell resolves to its data
    if let Value::Object(object) = &value {
        if object.contains_key("stepId") && object.contains_key("data") {
            debug!("transform input is a step-output shell; extracting data");
            value = object.get("data").cloned().unwrap_or(Value::Null);
        }
    }

    Ok(TransformInput {
        value,
        origin_plugin,
        schema_hint,
    })
}

/// Apply a transform operation. `plugin_runtime` is only consulted by
/// `fetch_content`.
pub async fn apply(
    ctx: &ExecutionContext,
    plugin_runtime: Option<&Arc<dyn PluginRuntime>>,
    user_id: &str,
    operation: TransformOperation,
    raw_input: &Value,
    config: &Map<String, Value>,
) -> Result<Value, WorkflowError> {
    let input = resolve_transform_input(ctx, raw_input)?;
    debug!("transform {} on {}", operation, type_label(&input.value));

    match operation {
        TransformOperation::Set => Ok(input.value),
        TransformOperation::Map => collection::map(ctx, &input, config),
        TransformOperation::Filter => collection::filter(ctx, &input, config),
        TransformOperation::Reduce => collection::reduce(&input, config),
        TransformOperation::Sort => collection::sort(&input, config),
        TransformOperation::Group => collection::group(&input, config),
        TransformOperation::Aggregate => collection::aggregate(&input, config),
        TransformOperation::Deduplicate => collection::deduplicate(&input, config),
        TransformOperation::Flatten => collection::flatten(&input, config),
        TransformOperation::Pivot => collection::pivot(&input, config),
        TransformOperation::Split => collection::split(&input, config),
        TransformOperation::Expand => collection::expand(&input, config),
        TransformOperation::Partition => collection::partition(&input, config),
        TransformOperation::Join => rows::join(ctx, &input, config),
        TransformOperation::RowsToObjects => rows::rows_to_objects(&input, config),
        TransformOperation::MapHeaders => rows::map_headers(&input, config),
        TransformOperation::RenderTable => table::render_table(&input, config),
        TransformOperation::FetchContent => {
            fetch::fetch_content(plugin_runtime, user_id, &input, config).await
        }
    }
}

/// Shared config accessor: first present key among `names`, as a string
pub(crate) fn config_str<'a>(config: &'a Map<String, Value>, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| config.get(*name).and_then(Value::as_str))
}

pub(crate) fn transform_failure(operation: TransformOperation, message: &str) -> WorkflowError {
    WorkflowError::Execution(ExecutionError::TransformFailure {
        operation: operation.to_string(),
        message: message.to_string(),
    })
}
