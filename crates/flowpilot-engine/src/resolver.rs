//! Reference resolution
//!
//! Workflow documents address run state with `{{path}}` references. The
//! path grammar supports dotted names, numeric bracket indices (`[0]`),
//! quoted bracket indices (`['Sales Person']`, `["Name"]`) and the `[*]`
//! wildcard. The tokenizer respects quotes inside brackets, so keys
//! containing dots survive.
//!
//! Root namespaces, in lookup order: a step id (`step3`), `input`/`inputs`,
//! `var`, `current`/`item`, `loop`, then any registered variable name
//! (scatter-gather binds custom names such as `email`).

use crate::context::ExecutionContext;
use flowpilot_core::error::VariableResolutionError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

pub static REFERENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("reference regex"));

/// One parsed path segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
    Wildcard,
}

/// Tokenize a reference path. Quotes inside brackets are respected;
/// `a.b['x.y'][0]` yields `Key(a), Key(b), Key(x.y), Index(0)`.
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, VariableResolutionError> {
    let mut segments = Vec::new();
    let mut chars = path.chars().peekable();
    let mut current = String::new();

    let flush = |current: &mut String, segments: &mut Vec<PathSegment>| {
        if !current.is_empty() {
            segments.push(PathSegment::Key(std::mem::take(current)));
        }
    };

    while let Some(ch) = chars.next() {
        match ch {
            '.' => flush(&mut current, &mut segments),
            '[' => {
                flush(&mut current, &mut segments);
                match chars.peek() {
                    Some(&(quote @ ('\'' | '"'))) => {
                        chars.next();
                        let mut key = String::new();
                        let mut closed = false;
                        for inner in chars.by_ref() {
                            if inner == quote {
                                closed = true;
                                break;
                            }
                            key.push(inner);
                        }
                        if !closed || chars.next() != Some(']') {
                            return Err(VariableResolutionError::new(
                                path,
                                "unterminated quoted bracket index",
                            ));
                        }
                        segments.push(PathSegment::Key(key));
                    }
                    Some('*') => {
                        chars.next();
                        if chars.next() != Some(']') {
                            return Err(VariableResolutionError::new(
                                path,
                                "expected ']' after wildcard",
                            ));
                        }
                        segments.push(PathSegment::Wildcard);
                    }
                    _ => {
                        let mut digits = String::new();
                        let mut closed = false;
                        for inner in chars.by_ref() {
                            if inner == ']' {
                                closed = true;
                                break;
                            }
                            digits.push(inner);
                        }
                        if !closed {
                            return Err(VariableResolutionError::new(
                                path,
                                "unterminated bracket index",
                            ));
                        }
                        let index = digits.trim().parse::<usize>().map_err(|_| {
                            VariableResolutionError::new(
                                path,
                                &format!("invalid bracket index '{}'", digits),
                            )
                        })?;
                        segments.push(PathSegment::Index(index));
                    }
                }
            }
            _ => current.push(ch),
        }
    }
    flush(&mut current, &mut segments);

    if segments.is_empty() {
        return Err(VariableResolutionError::new(path, "empty reference path"));
    }
    Ok(segments)
}

/// Nested wrappers auto-unwrapped on CRM-style records
const WRAPPER_KEYS: [&str; 3] = ["fields", "properties", "data"];

/// Fields addressable on a step-output shell without auto-navigation
const OUTPUT_SHELL_KEYS: [&str; 5] = ["data", "metadata", "stepId", "plugin", "action"];

/// Look up a key on an object: case-sensitive first, then
/// case-insensitive, then inside recognized wrapper objects.
/// `None` means the key is truly absent; an explicit JSON null is found.
fn lookup_key<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    if let Some(found) = object.get(key) {
        return Some(found);
    }
    let lowered = key.to_lowercase();
    if let Some((_, found)) = object
        .iter()
        .find(|(candidate, _)| candidate.to_lowercase() == lowered)
    {
        return Some(found);
    }
    for wrapper in WRAPPER_KEYS {
        let nested = object.get(wrapper).or_else(|| {
            object
                .iter()
                .find(|(candidate, _)| candidate.to_lowercase() == wrapper)
                .map(|(_, v)| v)
        });
        if let Some(Value::Object(inner)) = nested {
            if let Some(found) = lookup_key(inner, key) {
                return Some(found);
            }
        }
    }
    None
}

/// Walk `segments` into `value`
fn navigate(
    reference: &str,
    mut value: Value,
    segments: &[PathSegment],
) -> Result<Value, VariableResolutionError> {
    for segment in segments {
        match segment {
            PathSegment::Key(key) => match &value {
                Value::Object(object) => match lookup_key(object, key) {
                    Some(found) => value = found.clone(),
                    None => {
                        return Err(VariableResolutionError::new(
                            reference,
                            &format!("key '{}' not found", key),
                        ))
                    }
                },
                other => {
                    return Err(VariableResolutionError::new(
                        reference,
                        &format!("cannot read key '{}' from {}", key, type_name(other)),
                    ))
                }
            },
            PathSegment::Index(index) => match &value {
                Value::Array(items) => match items.get(*index) {
                    Some(found) => value = found.clone(),
                    None => {
                        return Err(VariableResolutionError::new(
                            reference,
                            &format!("index {} out of bounds (len {})", index, items.len()),
                        ))
                    }
                },
                other => {
                    return Err(VariableResolutionError::new(
                        reference,
                        &format!("cannot index into {}", type_name(other)),
                    ))
                }
            },
            PathSegment::Wildcard => match &value {
                Value::Array(_) => {}
                other => {
                    return Err(VariableResolutionError::new(
                        reference,
                        &format!("wildcard requires an array, found {}", type_name(other)),
                    ))
                }
            },
        }
    }
    Ok(value)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Resolve a single reference path against the run state
pub fn resolve_reference(
    ctx: &ExecutionContext,
    reference: &str,
) -> Result<Value, VariableResolutionError> {
    let segments = parse_path(reference)?;
    let (root, rest) = match segments.split_first() {
        Some((PathSegment::Key(root), rest)) => (root.as_str(), rest),
        _ => {
            return Err(VariableResolutionError::new(
                reference,
                "reference must start with a name",
            ))
        }
    };

    // step outputs take priority: `stepN` addresses the output shell, and
    // unknown continuations auto-navigate into `.data`
    if let Some(output) = ctx.get_step_output(root) {
        let shell = serde_json::to_value(output)
            .map_err(|e| VariableResolutionError::new(reference, &e.to_string()))?;
        let rest = match rest.first() {
            Some(PathSegment::Key(next)) if !OUTPUT_SHELL_KEYS.contains(&next.as_str()) => {
                let mut with_data = vec![PathSegment::Key("data".to_string())];
                with_data.extend_from_slice(rest);
                return navigate(reference, shell, &with_data);
            }
            _ => rest,
        };
        return navigate(reference, shell, rest);
    }

    match root {
        "input" | "inputs" => {
            let value = Value::Object(ctx.input_values.clone());
            navigate(reference, value, rest)
        }
        "var" => {
            let (name, rest) = match rest.split_first() {
                Some((PathSegment::Key(name), rest)) => (name, rest),
                _ => {
                    return Err(VariableResolutionError::new(
                        reference,
                        "'var' requires a variable name",
                    ))
                }
            };
            match ctx.get_variable(name) {
                Some(value) => navigate(reference, value.clone(), rest),
                None => Err(VariableResolutionError::new(
                    reference,
                    &format!("variable '{}' is not set", name),
                )),
            }
        }
        "current" | "item" => match ctx.get_variable("item") {
            Some(value) => navigate(reference, value.clone(), rest),
            None => Err(VariableResolutionError::new(
                reference,
                "no active iteration item; 'current' is only bound inside scatter or loop steps",
            )),
        },
        "loop" => match ctx.get_variable("loop") {
            Some(value) => navigate(reference, value.clone(), rest),
            None => Err(VariableResolutionError::new(
                reference,
                "no loop scope is active",
            )),
        },
        other => match ctx.get_variable(other) {
            Some(value) => navigate(reference, value.clone(), rest),
            None => Err(VariableResolutionError::new(
                reference,
                &format!(
                    "'{}' is neither a step output, an input namespace, nor a variable",
                    other
                ),
            )),
        },
    }
}

/// Render a value for inlining into a larger string: scalars bare,
/// arrays and objects as JSON
pub fn inline_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Whether the trimmed string is exactly one `{{...}}` reference
pub fn sole_reference(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let captures = REFERENCE_RE.captures(trimmed)?;
    let whole = captures.get(0)?;
    if whole.start() == 0 && whole.end() == trimmed.len() {
        Some(captures.get(1)?.as_str())
    } else {
        None
    }
}

/// Substitute every `{{...}}` site in a template string
pub fn resolve_template(
    ctx: &ExecutionContext,
    template: &str,
) -> Result<String, VariableResolutionError> {
    let mut result = String::with_capacity(template.len());
    let mut last = 0;
    for captures in REFERENCE_RE.captures_iter(template) {
        let whole = captures.get(0).expect("capture 0");
        let reference = captures.get(1).expect("capture 1").as_str();
        result.push_str(&template[last..whole.start()]);
        let value = resolve_reference(ctx, reference)?;
        result.push_str(&inline_value(&value));
        last = whole.end();
    }
    result.push_str(&template[last..]);
    Ok(result)
}

/// Deep-resolve a value tree.
///
/// Strings that are exactly one reference return the raw resolved value
/// (type-preserving); other strings go through template substitution;
/// arrays and objects recurse.
pub fn resolve_value(
    ctx: &ExecutionContext,
    value: &Value,
) -> Result<Value, VariableResolutionError> {
    match value {
        Value::String(text) => {
            if let Some(reference) = sole_reference(text) {
                return resolve_reference(ctx, reference);
            }
            if REFERENCE_RE.is_match(text) {
                return Ok(Value::String(resolve_template(ctx, text)?));
            }
            Ok(value.clone())
        }
        Value::Array(items) => {
            let resolved: Result<Vec<_>, _> =
                items.iter().map(|item| resolve_value(ctx, item)).collect();
            Ok(Value::Array(resolved?))
        }
        Value::Object(object) => {
            let mut resolved = Map::new();
            for (key, item) in object {
                resolved.insert(key.clone(), resolve_value(ctx, item)?);
            }
            Ok(Value::Object(resolved))
        }
        _ => Ok(value.clone()),
    }
}

/// Deep-resolve a parameter map
pub fn resolve_params(
    ctx: &ExecutionContext,
    params: &Map<String, Value>,
) -> Result<Map<String, Value>, VariableResolutionError> {
    let mut resolved = Map::new();
    for (key, value) in params {
        resolved.insert(key.clone(), resolve_value(ctx, value)?);
    }
    Ok(resolved)
}

/// All distinct references appearing in a template string
pub fn extract_references(template: &str) -> Vec<String> {
    let mut references = Vec::new();
    for captures in REFERENCE_RE.captures_iter(template) {
        let reference = captures.get(1).expect("capture 1").as_str().to_string();
        if !references.contains(&reference) {
            references.push(reference);
        }
    }
    references
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpilot_core::types::{AgentProfile, StepMetadata, StepOutput};
    use serde_json::json;

    fn context_with_step(step_id: &str, data: Value) -> ExecutionContext {
        let mut ctx = ExecutionContext::new("exec", "user", AgentProfile::default());
        ctx.set_step_output(
            step_id,
            StepOutput::new(step_id, "test", "run", data, StepMetadata::success(1)),
        );
        ctx
    }

    #[test]
    fn test_parse_quoted_bracket_path() {
        let segments = parse_path("step1.data.row['Sales Person']").unwrap();
        assert_eq!(
            segments,
            vec![
                PathSegment::Key("step1".into()),
                PathSegment::Key("data".into()),
                PathSegment::Key("row".into()),
                PathSegment::Key("Sales Person".into()),
            ]
        );
    }

    #[test]
    fn test_parse_preserves_dots_inside_quotes() {
        let segments = parse_path("a['x.y'].b[2][*]").unwrap();
        assert_eq!(
            segments,
            vec![
                PathSegment::Key("a".into()),
                PathSegment::Key("x.y".into()),
                PathSegment::Key("b".into()),
                PathSegment::Index(2),
                PathSegment::Wildcard,
            ]
        );
    }

    #[test]
    fn test_quoted_key_resolution_with_and_without_data() {
        let ctx = context_with_step("step1", json!({"row": {"Sales Person": "Alice"}}));
        let v = resolve_reference(&ctx, "step1.data.row['Sales Person']").unwrap();
        assert_eq!(v, json!("Alice"));
        // auto-`.data` navigation
        let v = resolve_reference(&ctx, "step1.row['Sales Person']").unwrap();
        assert_eq!(v, json!("Alice"));
    }

    #[test]
    fn test_shell_fields_not_auto_navigated() {
        let ctx = context_with_step("step1", json!({"x": 1}));
        let v = resolve_reference(&ctx, "step1.metadata.success").unwrap();
        assert_eq!(v, json!(true));
        let v = resolve_reference(&ctx, "step1.stepId").unwrap();
        assert_eq!(v, json!("step1"));
    }

    #[test]
    fn test_case_insensitive_fallback() {
        let ctx = context_with_step("s", json!({"Owner": "Eve"}));
        assert_eq!(resolve_reference(&ctx, "s.owner").unwrap(), json!("Eve"));
    }

    #[test]
    fn test_wrapper_auto_unwrap() {
        let ctx = context_with_step("s", json!({"fields": {"Email": "a@b.c"}}));
        assert_eq!(resolve_reference(&ctx, "s.email").unwrap(), json!("a@b.c"));
    }

    #[test]
    fn test_null_preserved_but_missing_fails() {
        let ctx = context_with_step("s", json!({"present": null}));
        assert_eq!(resolve_reference(&ctx, "s.present").unwrap(), Value::Null);
        assert!(resolve_reference(&ctx, "s.absent").is_err());
    }

    #[test]
    fn test_index_on_non_array_fails() {
        let ctx = context_with_step("s", json!({"a": {"b": 1}}));
        assert!(resolve_reference(&ctx, "s.a[0]").is_err());
    }

    #[test]
    fn test_current_outside_iteration_is_descriptive() {
        let ctx = ExecutionContext::new("e", "u", AgentProfile::default());
        let err = resolve_reference(&ctx, "current.id").unwrap_err();
        assert!(err.to_string().contains("scatter or loop"));
    }

    #[test]
    fn test_custom_bound_variable_root() {
        let mut ctx = ExecutionContext::new("e", "u", AgentProfile::default());
        ctx.set_variable("email", json!({"id": "m-1"}));
        assert_eq!(resolve_reference(&ctx, "email.id").unwrap(), json!("m-1"));
    }

    #[test]
    fn test_sole_reference_is_type_preserving() {
        let ctx = context_with_step("s", json!({"items": [1, 2, 3]}));
        let v = resolve_value(&ctx, &json!("{{s.items}}")).unwrap();
        assert_eq!(v, json!([1, 2, 3]));
        // embedded reference serializes to JSON inside the larger string
        let v = resolve_value(&ctx, &json!("found: {{s.items}}")).unwrap();
        assert_eq!(v, json!("found: [1,2,3]"));
    }

    #[test]
    fn test_wildcard_returns_whole_array() {
        let ctx = context_with_step("s", json!({"rows": [{"a": 1}]}));
        let v = resolve_reference(&ctx, "s.rows[*]").unwrap();
        assert_eq!(v, json!([{"a": 1}]));
    }

    #[test]
    fn test_input_namespace() {
        let mut ctx = ExecutionContext::new("e", "u", AgentProfile::default());
        ctx.input_values.insert("city".into(), json!("Oslo"));
        assert_eq!(resolve_reference(&ctx, "input.city").unwrap(), json!("Oslo"));
        assert_eq!(resolve_reference(&ctx, "inputs.city").unwrap(), json!("Oslo"));
    }

    #[test]
    fn test_repeat_resolution_is_stable() {
        let ctx = context_with_step("s", json!({"n": 7}));
        let first = resolve_reference(&ctx, "s.n").unwrap();
        let second = resolve_reference(&ctx, "s.n").unwrap();
        assert_eq!(first, second);
    }
}
