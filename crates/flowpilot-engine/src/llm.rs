//! LLM decision and processing steps
//!
//! Builds the prompt from the step's prompt, description or name,
//! enriches it with resolved references and a run-context summary, runs
//! text or vision mode, cleans summary responses, and optionally
//! constrains the output to a declared JSON schema with validation and a
//! retry hint.
//!
//! Plugin access policy: `ai_processing` steps are pure text analysis and
//! receive no plugins; `llm_decision` steps may use them.

use crate::context::ExecutionContext;
use crate::resolver::{extract_references, inline_value, resolve_reference};
use crate::vision;
use flowpilot_core::error::{ExecutionError, WorkflowError};
use flowpilot_core::traits::LlmRuntime;
use flowpilot_core::types::{LlmPrompt, LlmRequest, LlmResponse, TokenUsage};
use jsonschema::{Draft, JSONSchema};
use log::{debug, warn};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Outcome of an LLM step: the aliased data payload and token usage
pub struct LlmStepResult {
    pub data: Value,
    pub tokens: TokenUsage,
    pub model: Option<String>,
}

/// Run an LLM-family step.
pub async fn execute_llm_step(
    runtime: &Arc<dyn LlmRuntime>,
    ctx: &ExecutionContext,
    step_name: &str,
    prompt_text: Option<&str>,
    description: Option<&str>,
    resolved_params: &Map<String, Value>,
    output_schema: Option<&Value>,
    allow_plugins: bool,
) -> Result<LlmStepResult, WorkflowError> {
    let base_prompt = prompt_text
        .filter(|text| !text.trim().is_empty())
        .map(|text| text.to_string())
        .or_else(|| description.map(|text| text.to_string()))
        .unwrap_or_else(|| step_name.to_string());

    let mut params = resolved_params.clone();
    enrich_params_from_references(ctx, &base_prompt, &mut params);
    if params.is_empty() {
        if let Some(last) = ctx.last_completed_output() {
            debug!("seeding llm params from last completed step '{}'", last.step_id);
            params.insert("previous_step_data".to_string(), last.data.clone());
        }
    }

    let mut prompt = substitute_prompt(ctx, &base_prompt);
    if !params.is_empty() {
        prompt.push_str("\n\nData:\n");
        for (name, value) in &params {
            prompt.push_str(&format!(
                "{}: {}\n",
                name,
                serde_json::to_string(value).unwrap_or_default()
            ));
        }
    }
    if let Some(memory) = &ctx.memory_context {
        prompt.push_str("\n\nAgent memory:\n");
        prompt.push_str(memory);
    }
    prompt.push_str(&context_summary(ctx));
    if let Some(schema) = output_schema {
        prompt.push_str(&schema_instruction(schema));
    }

    let images = vision::detect_images(&Value::Object(params.clone()));
    let request_prompt = if !images.is_empty() {
        if runtime.supports_vision() {
            debug!("vision mode: {} image(s) attached", images.len());
            LlmPrompt::Multimodal(vision::build_multimodal(&prompt, &images))
        } else {
            warn!("payload contains images but the LLM runtime is text-only; falling back");
            LlmPrompt::Text(prompt.clone())
        }
    } else {
        LlmPrompt::Text(prompt.clone())
    };

    let mut agent = ctx.agent.clone();
    if !allow_plugins {
        agent.plugins_required.clear();
    }

    let response = run(runtime, ctx, &agent, request_prompt, allow_plugins).await?;
    let mut tokens = response.tokens_used;
    let mut text = response
        .response
        .clone()
        .unwrap_or_default();
    let mut structured: Option<Value> = None;

    if let Some(schema) = output_schema {
        match parse_and_validate(&text, schema) {
            Ok(value) => structured = Some(value),
            Err(errors) => {
                // one retry with a hint enumerating the first errors
                let hint = retry_hint(&errors);
                debug!("schema validation failed, retrying with hint");
                let retry_prompt = format!("{}\n\n{}", prompt, hint);
                let retry = run(
                    runtime,
                    ctx,
                    &agent,
                    LlmPrompt::Text(retry_prompt),
                    allow_plugins,
                )
                .await?;
                tokens = TokenUsage {
                    total: tokens.total + retry.tokens_used.total,
                    prompt: tokens.prompt + retry.tokens_used.prompt,
                    completion: tokens.completion + retry.tokens_used.completion,
                };
                let retry_text = retry.response.clone().unwrap_or_default();
                match parse_and_validate(&retry_text, schema) {
                    Ok(value) => {
                        text = retry_text;
                        structured = Some(value);
                    }
                    Err(errors) => {
                        return Err(WorkflowError::Execution(ExecutionError::LlmFailure(
                            format!("output failed schema validation: {}", errors.join("; ")),
                        )))
                    }
                }
            }
        }
    }

    let cleaned = if mentions_summarize(step_name, prompt_text, description) {
        clean_summary(&text)
    } else {
        text.clone()
    };

    let mut data = json!({
        "result": cleaned,
        "response": cleaned,
        "output": cleaned,
        "summary": cleaned,
        "analysis": cleaned,
        "decision": cleaned,
        "reasoning": cleaned,
        "classification": cleaned,
        "toolCalls": response.tool_calls,
        "tokens": {
            "total": tokens.total,
            "prompt": tokens.prompt,
            "completion": tokens.completion,
        },
    });
    if let Some(structured) = structured {
        data["structured"] = structured;
    }

    Ok(LlmStepResult {
        data,
        tokens,
        model: response.model,
    })
}

async fn run(
    runtime: &Arc<dyn LlmRuntime>,
    ctx: &ExecutionContext,
    agent: &flowpilot_core::types::AgentProfile,
    prompt: LlmPrompt,
    allow_plugins: bool,
) -> Result<LlmResponse, WorkflowError> {
    let response = runtime
        .run(LlmRequest {
            user_id: ctx.user_id.clone(),
            agent: agent.clone(),
            prompt,
            session_id: ctx.session_id.clone(),
            allow_plugins,
        })
        .await
        .map_err(|e| WorkflowError::Execution(ExecutionError::LlmFailure(e.to_string())))?;

    if !response.success {
        return Err(WorkflowError::Execution(ExecutionError::LlmFailure(
            response
                .error
                .clone()
                .unwrap_or_else(|| "LLM runtime returned no response".to_string()),
        )));
    }
    Ok(response)
}

/// Each reference in the prompt becomes a named parameter, dots replaced
/// with underscores
fn enrich_params_from_references(
    ctx: &ExecutionContext,
    prompt: &str,
    params: &mut Map<String, Value>,
) {
    for reference in extract_references(prompt) {
        if let Ok(value) = resolve_reference(ctx, &reference) {
            let name = reference.replace(['.', '[', ']', '\'', '"'], "_");
            let name = name.trim_matches('_').replace("__", "_");
            params.entry(name).or_insert(value);
        }
    }
}

/// Inline-substitute references in the prompt text; unresolved ones stay
/// verbatim (they are also surfaced as named params)
fn substitute_prompt(ctx: &ExecutionContext, prompt: &str) -> String {
    crate::resolver::REFERENCE_RE
        .replace_all(prompt, |captures: &regex::Captures<'_>| {
            let reference = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            match resolve_reference(ctx, reference) {
                Ok(value) => inline_value(&value),
                Err(_) => captures.get(0).map(|m| m.as_str().to_string()).unwrap_or_default(),
            }
        })
        .to_string()
}

fn context_summary(ctx: &ExecutionContext) -> String {
    let mut summary = String::from("\n\nRun context:\n");
    if !ctx.completed_steps.is_empty() {
        summary.push_str(&format!(
            "Completed steps: {}\n",
            ctx.completed_steps.join(", ")
        ));
    }
    if !ctx.input_values.is_empty() {
        summary.push_str(&format!(
            "Inputs: {}\n",
            serde_json::to_string(&ctx.input_values).unwrap_or_default()
        ));
    }
    summary.push_str(&format!(
        "Progress: {} completed, {} failed, {} skipped\n",
        ctx.completed_steps.len(),
        ctx.failed_steps.len(),
        ctx.skipped_steps.len()
    ));
    summary
}

fn mentions_summarize(name: &str, prompt: Option<&str>, description: Option<&str>) -> bool {
    let mut haystack = name.to_lowercase();
    if let Some(prompt) = prompt {
        haystack.push_str(&prompt.to_lowercase());
    }
    if let Some(description) = description {
        haystack.push_str(&description.to_lowercase());
    }
    haystack.contains("summarize") || haystack.contains("summarise")
}

const LEADING_META: [&str; 8] = [
    "i will ",
    "i'll ",
    "i am going to ",
    "let me ",
    "sure,",
    "certainly",
    "okay,",
    "here is ",
];

const TRAILING_META: [&str; 4] = [
    "now i will ",
    "next, i will ",
    "i will now ",
    "let me know ",
];

/// Strip leading meta-commentary and trailing narrative from summaries;
/// keep the original when cleaning leaves too little behind
pub fn clean_summary(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut start = 0;
    for line in &lines {
        let lowered = line.trim().to_lowercase();
        if lowered.is_empty() || LEADING_META.iter().any(|meta| lowered.starts_with(meta)) {
            start += 1;
        } else {
            break;
        }
    }
    let mut end = lines.len();
    for line in lines.iter().rev() {
        let lowered = line.trim().to_lowercase();
        if lowered.is_empty() || TRAILING_META.iter().any(|meta| lowered.starts_with(meta)) {
            end -= 1;
        } else {
            break;
        }
    }

    if start >= end {
        return text.to_string();
    }
    let cleaned = lines[start..end].join("\n").trim().to_string();
    if cleaned.len() < 50 {
        text.to_string()
    } else {
        cleaned
    }
}

fn schema_instruction(schema: &Value) -> String {
    format!(
        "\n\nRespond with JSON only, matching this schema:\n{}\nExample shape:\n{}\n",
        serde_json::to_string_pretty(schema).unwrap_or_default(),
        serde_json::to_string(&example_from_schema(schema)).unwrap_or_default()
    )
}

/// A minimal example instance derived from the schema's property types
fn example_from_schema(schema: &Value) -> Value {
    match schema.get("type").and_then(Value::as_str) {
        Some("object") => {
            let mut example = Map::new();
            if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                for (name, property) in properties {
                    example.insert(name.clone(), example_from_schema(property));
                }
            }
            Value::Object(example)
        }
        Some("array") => Value::Array(vec![schema
            .get("items")
            .map(example_from_schema)
            .unwrap_or(Value::Null)]),
        Some("string") => schema
            .get("enum")
            .and_then(Value::as_array)
            .and_then(|options| options.first().cloned())
            .unwrap_or(Value::String("text".to_string())),
        Some("number") | Some("integer") => json!(0),
        Some("boolean") => json!(false),
        _ => Value::Null,
    }
}

/// Parse the response text (direct JSON, fenced JSON, or the first
/// `{...}`/`[...]` span) and validate it against the schema
pub fn parse_and_validate(text: &str, schema: &Value) -> Result<Value, Vec<String>> {
    let candidate = extract_json(text).ok_or_else(|| vec!["no JSON found in response".to_string()])?;
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|e| vec![format!("schema did not compile: {}", e)])?;

    let errors: Vec<String> = compiled
        .validate(&candidate)
        .err()
        .map(|errors| errors.map(|e| e.to_string()).collect())
        .unwrap_or_default();
    if errors.is_empty() {
        Ok(candidate)
    } else {
        Err(errors)
    }
}

fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    // code-fenced JSON
    if let Some(open) = trimmed.find("```") {
        let after = &trimmed[open + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(close) = after.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(after[..close].trim()) {
                return Some(value);
            }
        }
    }

    // first balanced object or array span
    for open_char in ['{', '['] {
        if let Some(start) = trimmed.find(open_char) {
            let close_char = if open_char == '{' { '}' } else { ']' };
            let mut depth = 0usize;
            for (offset, c) in trimmed[start..].char_indices() {
                if c == open_char {
                    depth += 1;
                } else if c == close_char {
                    depth -= 1;
                    if depth == 0 {
                        let span = &trimmed[start..start + offset + 1];
                        if let Ok(value) = serde_json::from_str::<Value>(span) {
                            return Some(value);
                        }
                        break;
                    }
                }
            }
        }
    }
    None
}

fn retry_hint(errors: &[String]) -> String {
    let mut hint = String::from(
        "The previous response did not match the required schema. Problems:\n",
    );
    for error in errors.iter().take(3) {
        hint.push_str(&format!("- {}\n", error));
    }
    hint.push_str("Respond again with corrected JSON only.");
    hint
}
