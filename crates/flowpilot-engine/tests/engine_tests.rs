//! End-to-end engine tests with mock plugin and LLM runtimes

use anyhow::Result;
use async_trait::async_trait;
use flowpilot_core::config::EngineSettings;
use flowpilot_core::traits::{LlmRuntime, PluginRuntime};
use flowpilot_core::types::{
    AgentProfile, LlmRequest, LlmResponse, PluginDefinition, PluginResult, TokenUsage,
};
use flowpilot_core::workflow::Workflow;
use flowpilot_engine::dispatcher::StepDispatcher;
use flowpilot_engine::engine::{RunOptions, WorkflowEngine};
use flowpilot_engine::events::EventBus;
use flowpilot_engine::stores::{MemoryStateManager, MemoryWorkflowRegistry};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Scripted plugin runtime: per-action response queues, call counting
#[derive(Default)]
struct MockPlugin {
    responses: Mutex<HashMap<String, Vec<PluginResult>>>,
    calls: AtomicUsize,
}

impl MockPlugin {
    fn new() -> Self {
        Self::default()
    }

    fn script(&self, plugin: &str, action: &str, results: Vec<PluginResult>) {
        self.responses
            .lock()
            .unwrap()
            .insert(format!("{}.{}", plugin, action), results);
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PluginRuntime for MockPlugin {
    async fn execute(
        &self,
        _user_id: &str,
        plugin: &str,
        action: &str,
        _params: &Map<String, Value>,
    ) -> Result<PluginResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = format!("{}.{}", plugin, action);
        let mut responses = self.responses.lock().unwrap();
        match responses.get_mut(&key) {
            Some(queue) if !queue.is_empty() => Ok(queue.remove(0)),
            _ => Ok(PluginResult::ok(json!({"echo": key}))),
        }
    }

    async fn definition(&self, _plugin: &str) -> Option<PluginDefinition> {
        None
    }
}

struct MockLlm {
    response: String,
    tokens: u64,
}

#[async_trait]
impl LlmRuntime for MockLlm {
    async fn run(&self, _request: LlmRequest) -> Result<LlmResponse> {
        Ok(LlmResponse {
            success: true,
            response: Some(self.response.clone()),
            tool_calls: Vec::new(),
            tokens_used: TokenUsage {
                total: self.tokens,
                prompt: self.tokens / 2,
                completion: self.tokens - self.tokens / 2,
            },
            error: None,
            model: Some("mock-model".to_string()),
        })
    }
}

struct Harness {
    engine: WorkflowEngine,
    plugin: Arc<MockPlugin>,
    state: Arc<MemoryStateManager>,
}

fn harness() -> Harness {
    harness_with(|dispatcher| dispatcher)
}

fn harness_with<F>(customize: F) -> Harness
where
    F: FnOnce(StepDispatcher) -> StepDispatcher,
{
    let settings = EngineSettings::default();
    let state = Arc::new(MemoryStateManager::new());
    let plugin = Arc::new(MockPlugin::new());
    let llm = Arc::new(MockLlm {
        response: "All three deals look healthy and are likely to close this quarter.".to_string(),
        tokens: 500,
    });

    let dispatcher = StepDispatcher::new(state.clone(), EventBus::new(), settings.clone())
        .with_plugin_runtime(plugin.clone())
        .with_llm_runtime(llm);
    let dispatcher = customize(dispatcher);
    Harness {
        engine: WorkflowEngine::new(dispatcher, EventBus::new(), settings),
        plugin,
        state,
    }
}

fn workflow(value: Value) -> Workflow {
    serde_json::from_value(value).unwrap()
}

fn options() -> RunOptions {
    RunOptions {
        user_id: "user-1".to_string(),
        agent: AgentProfile {
            id: "agent-1".to_string(),
            name: "tester".to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn run(harness: &Harness, wf: &Workflow, opts: RunOptions) -> flowpilot_core::types::WorkflowExecutionResult {
    harness
        .engine
        .execute(wf, opts, CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_linear_workflow_completes() {
    let h = harness();
    h.plugin.script(
        "crm",
        "list_deals",
        vec![PluginResult::ok(json!({"deals": [{"name": "Acme", "stage": "open"}], "total": 1}))],
    );

    let wf = workflow(json!({
        "name": "linear",
        "steps": [
            {"id": "fetch", "name": "Fetch deals", "type": "action", "plugin": "crm", "action": "list_deals"},
            {"id": "pick", "name": "Pick names", "type": "transform",
             "operation": "map", "input": "{{fetch}}", "config": {"expression": "item.name"},
             "dependencies": ["fetch"]}
        ]
    }));

    let result = run(&h, &wf, options()).await;
    assert!(result.success);
    assert_eq!(result.completed_steps, vec!["fetch", "pick"]);
    assert_eq!(result.output, json!(["Acme"]));
    // plugin calls carry a synthetic token cost
    assert_eq!(result.total_tokens_used, EngineSettings::default().plugin_token_equivalent);
}

#[tokio::test]
async fn test_retry_token_dedup_across_attempts() {
    let h = harness();
    h.plugin.script(
        "mail",
        "send",
        vec![
            PluginResult::err("503 timeout talking to upstream"),
            PluginResult::ok(json!({"sent": true})),
        ],
    );

    let wf = workflow(json!({
        "name": "retry",
        "steps": [{
            "id": "send",
            "name": "Send mail",
            "type": "action",
            "plugin": "mail",
            "action": "send",
            "retryPolicy": {"maxRetries": 2, "backoffMs": 1}
        }]
    }));

    let result = run(&h, &wf, options()).await;
    assert!(result.success);
    assert_eq!(h.plugin.call_count(), 2);
    // only the final attempt's tokens are counted
    assert_eq!(
        result.total_tokens_used,
        EngineSettings::default().plugin_token_equivalent
    );
    assert!(result.failed_steps.is_empty());
    assert_eq!(result.completed_steps, vec!["send"]);
}

#[tokio::test]
async fn test_failure_stops_run_without_continue_on_error() {
    let h = harness();
    h.plugin
        .script("crm", "list_deals", vec![PluginResult::err("401 unauthorized")]);

    let wf = workflow(json!({
        "name": "fails",
        "steps": [
            {"id": "a", "name": "A", "type": "action", "plugin": "crm", "action": "list_deals"},
            {"id": "b", "name": "B", "type": "delay", "duration": 1, "dependencies": ["a"]}
        ]
    }));

    let result = run(&h, &wf, options()).await;
    assert!(!result.success);
    assert_eq!(result.failed_step.as_deref(), Some("a"));
    assert!(result.error.as_deref().unwrap().contains("unauthorized"));
    // b never ran
    assert!(h.state.rows_for("b").is_empty());
}

#[tokio::test]
async fn test_continue_on_error_keeps_going() {
    let h = harness();
    h.plugin
        .script("crm", "list_deals", vec![PluginResult::err("404 not found")]);

    let wf = workflow(json!({
        "name": "tolerant",
        "steps": [
            {"id": "a", "name": "A", "type": "action", "plugin": "crm", "action": "list_deals",
             "continueOnError": true},
            {"id": "b", "name": "B", "type": "delay", "duration": 1, "dependencies": ["a"]}
        ]
    }));

    let result = run(&h, &wf, options()).await;
    assert!(result.success);
    assert_eq!(result.failed_steps, vec!["a"]);
    assert_eq!(result.completed_steps, vec!["b"]);
}

#[tokio::test]
async fn test_filter_then_render_table() {
    let h = harness();
    h.plugin.script(
        "sheets",
        "read",
        vec![PluginResult::ok(json!([
            {"Status": "Open", "Owner": "Eve"},
            {"Status": "Closed", "Owner": "Ed"}
        ]))],
    );

    let wf = workflow(json!({
        "name": "report",
        "steps": [
            {"id": "rows", "name": "Read", "type": "action", "plugin": "sheets", "action": "read"},
            {"id": "open", "name": "Only open", "type": "transform",
             "operation": "filter", "input": "{{rows}}",
             "config": {"condition": {"field": "Status", "operator": "equals", "value": "Open"}},
             "dependencies": ["rows"]},
            {"id": "table", "name": "Render", "type": "transform",
             "operation": "render_table", "input": "{{open}}",
             "config": {"columns": ["owner"]},
             "dependencies": ["open"]}
        ]
    }));

    let result = run(&h, &wf, options()).await;
    assert!(result.success);
    let html = result.output["html"].as_str().unwrap();
    assert!(html.contains("Eve"));
    assert!(!html.contains("Ed"));
    assert_eq!(result.output["count"], json!(1));
}

#[tokio::test]
async fn test_schema_aware_unwrap_feeds_filter() {
    let h = harness();
    h.plugin.script(
        "mail",
        "list",
        vec![PluginResult::ok(json!({
            "emails": [{"id": "a", "unread": true}, {"id": "b", "unread": false}],
            "total": 2,
            "next_page_token": "x"
        }))],
    );

    let wf = workflow(json!({
        "name": "unwrap",
        "steps": [
            {"id": "inbox", "name": "List", "type": "action", "plugin": "mail", "action": "list"},
            {"id": "unread", "name": "Unread only", "type": "transform",
             "operation": "filter", "input": "{{inbox}}",
             "config": {"condition": {"field": "unread", "operator": "equals", "value": true}},
             "dependencies": ["inbox"]}
        ]
    }));

    let result = run(&h, &wf, options()).await;
    assert!(result.success);
    assert_eq!(result.output["items"], json!([{"id": "a", "unread": true}]));
    assert_eq!(result.output["originalCount"], json!(2));
}

#[tokio::test]
async fn test_scatter_gather_collect_order() {
    let h = harness();
    let wf = workflow(json!({
        "name": "scatter",
        "steps": [{
            "id": "fan",
            "name": "Fan out",
            "type": "scatter_gather",
            "scatter": {
                "input": [{"id": 1}, {"id": 2}, {"id": 3}],
                "maxConcurrency": 3,
                "steps": [{
                    "id": "calc",
                    "name": "Calc",
                    "type": "transform",
                    "operation": "map",
                    "input": "[{{item}}]",
                    "config": {"expression": "item.id * 10"}
                }]
            },
            "gather": {"operation": "flatten", "outputKey": "out"}
        }]
    }));

    let result = run(&h, &wf, options()).await;
    assert!(result.success, "error: {:?}", result.error);
    // map over single-item arrays, flattened back in input order
    assert_eq!(result.output["out"], json!([10, 20, 30]));
}

#[tokio::test]
async fn test_calibration_dependency_skip() {
    let h = harness();
    h.plugin
        .script("crm", "list_deals", vec![PluginResult::err("401 invalid credentials")]);

    let wf = workflow(json!({
        "name": "calibrate",
        "steps": [
            {"id": "a", "name": "A", "type": "action", "plugin": "crm", "action": "list_deals"},
            {"id": "b", "name": "B", "type": "action", "plugin": "mail", "action": "send",
             "dependencies": ["a"]}
        ]
    }));

    let mut opts = options();
    opts.batch_calibration_mode = true;
    let result = run(&h, &wf, opts).await;

    assert!(!result.success);
    assert_eq!(result.failed_steps, vec!["a"]);
    assert_eq!(result.skipped_steps, vec!["b"]);
    // b never invoked its plugin: only a's single call happened
    assert_eq!(h.plugin.call_count(), 1);
    assert_eq!(result.collected_issues.len(), 1);
    assert_eq!(
        result.collected_issues[0].category.to_string(),
        "execution_auth"
    );

    let rows = h.state.rows_for("b");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, "skipped");
    assert_eq!(rows[0].metadata.skip_reason.as_deref(), Some("dependency_failed"));
}

#[tokio::test]
async fn test_calibration_continues_past_recoverable_errors() {
    let h = harness();
    h.plugin
        .script("mail", "send", vec![PluginResult::err("429 rate limit exceeded")]);

    let wf = workflow(json!({
        "name": "calibrate-continue",
        "steps": [
            {"id": "a", "name": "A", "type": "action", "plugin": "mail", "action": "send"},
            {"id": "standalone", "name": "S", "type": "delay", "duration": 1}
        ]
    }));

    let mut opts = options();
    opts.batch_calibration_mode = true;
    let result = run(&h, &wf, opts).await;

    // rate limits collect an issue and the run keeps going
    assert!(result.success);
    assert_eq!(result.failed_steps, vec!["a"]);
    assert!(result.completed_steps.contains(&"standalone".to_string()));
    assert_eq!(result.collected_issues.len(), 1);
    assert!(result.collected_issues[0].suggested_fix.is_some());
}

#[tokio::test]
async fn test_conditional_then_branch_runs_before_downstream() {
    let h = harness();
    let wf = workflow(json!({
        "name": "branching",
        "steps": [
            {"id": "seed", "name": "Seed", "type": "transform",
             "operation": "set", "input": {"mode": "fast"}, "config": {}},
            {"id": "gate", "name": "Gate", "type": "conditional",
             "condition": {"field": "seed.mode", "operator": "equals", "value": "fast"},
             "then_steps": [
                {"id": "then-a", "name": "Then A", "type": "transform",
                 "operation": "set", "input": "picked-fast", "config": {}}
             ],
             "else_steps": [
                {"id": "else-a", "name": "Else A", "type": "transform",
                 "operation": "set", "input": "picked-slow", "config": {}}
             ],
             "dependencies": ["seed"]},
            {"id": "after", "name": "After", "type": "transform",
             "operation": "set", "input": "{{then-a}}", "config": {},
             "dependencies": ["gate"]}
        ]
    }));

    let result = run(&h, &wf, options()).await;
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.output, json!("picked-fast"));
    assert!(result.completed_steps.contains(&"then-a".to_string()));
    assert!(!result.completed_steps.contains(&"else-a".to_string()));
}

#[tokio::test]
async fn test_switch_gates_unselected_steps() {
    let h = harness();
    let wf = workflow(json!({
        "name": "switching",
        "steps": [
            {"id": "seed", "name": "Seed", "type": "transform",
             "operation": "set", "input": {"lane": "email"}, "config": {}},
            {"id": "route", "name": "Route", "type": "switch",
             "evaluate": "{{seed.lane}}",
             "cases": {"email": ["send-email"], "chat": ["send-chat"]},
             "dependencies": ["seed"]},
            {"id": "send-email", "name": "Email", "type": "delay", "duration": 1,
             "dependencies": ["route"]},
            {"id": "send-chat", "name": "Chat", "type": "delay", "duration": 1,
             "dependencies": ["route"]}
        ]
    }));

    let result = run(&h, &wf, options()).await;
    assert!(result.success);
    assert!(result.completed_steps.contains(&"send-email".to_string()));
    assert_eq!(result.skipped_steps, vec!["send-chat"]);
}

#[tokio::test]
async fn test_llm_step_tokens_accounted() {
    let h = harness();
    let wf = workflow(json!({
        "name": "summarize",
        "steps": [
            {"id": "seed", "name": "Seed", "type": "transform",
             "operation": "set", "input": [{"deal": "Acme"}], "config": {}},
            {"id": "sum", "name": "Summarize deals", "type": "summarize",
             "prompt": "Summarize {{seed}}",
             "dependencies": ["seed"]}
        ]
    }));

    let result = run(&h, &wf, options()).await;
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.total_tokens_used, 500);
    assert_eq!(
        result.output["summary"],
        json!("All three deals look healthy and are likely to close this quarter.")
    );
}

#[tokio::test]
async fn test_cache_prevents_second_plugin_call() {
    let h = harness();
    h.plugin.script(
        "crm",
        "list_deals",
        vec![
            PluginResult::ok(json!({"deals": [1]})),
            PluginResult::ok(json!({"deals": [2]})),
        ],
    );

    let wf = workflow(json!({
        "name": "cached",
        "steps": [{
            "id": "fetch", "name": "Fetch", "type": "action",
            "plugin": "crm", "action": "list_deals",
            "params": {"stage": "open"},
            "cache": true
        }]
    }));

    let first = run(&h, &wf, options()).await;
    let second = run(&h, &wf, options()).await;
    assert!(first.success && second.success);
    assert_eq!(h.plugin.call_count(), 1);
    assert_eq!(first.output, second.output);
}

#[tokio::test]
async fn test_sub_workflow_with_registry_and_mapping() {
    let registry = Arc::new(MemoryWorkflowRegistry::new());
    registry.register(
        "scoring",
        workflow(json!({
            "name": "scoring",
            "steps": [{
                "id": "score", "name": "Score", "type": "transform",
                "operation": "set", "input": {"score": 42}, "config": {}
            }]
        })),
    );
    let registry_dyn: Arc<dyn flowpilot_core::traits::WorkflowRegistry> = registry;
    let h = harness_with(move |dispatcher| dispatcher.with_registry(registry_dyn));

    let wf = workflow(json!({
        "name": "outer",
        "steps": [{
            "id": "nested", "name": "Nested", "type": "sub_workflow",
            "workflowId": "scoring",
            "inputs": {},
            "outputMapping": {"final_score": "{{score.data.score}}"}
        }]
    }));

    let result = run(&h, &wf, options()).await;
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.output, json!({"final_score": 42}));
}

#[tokio::test]
async fn test_loop_sequential_over_upstream_data() {
    let h = harness();
    h.plugin.script(
        "crm",
        "list_deals",
        vec![PluginResult::ok(json!({"deals": [{"amount": 5}, {"amount": 7}]}))],
    );

    let wf = workflow(json!({
        "name": "looping",
        "steps": [
            {"id": "fetch", "name": "Fetch", "type": "action", "plugin": "crm", "action": "list_deals"},
            {"id": "walk", "name": "Walk", "type": "loop",
             "iterateOver": "{{fetch.deals}}",
             "loopSteps": [{
                "id": "double", "name": "Double", "type": "transform",
                "operation": "set", "input": "{{item.amount}}", "config": {}
             }],
             "dependencies": ["fetch"]}
        ]
    }));

    let result = run(&h, &wf, options()).await;
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.output["results"], json!([5, 7]));
    assert_eq!(result.output["iterations"], json!(2));
}

#[tokio::test]
async fn test_execute_if_skips_step() {
    let h = harness();
    let wf = workflow(json!({
        "name": "gated",
        "steps": [
            {"id": "seed", "name": "Seed", "type": "transform",
             "operation": "set", "input": {"ready": false}, "config": {}},
            {"id": "guarded", "name": "Guarded", "type": "delay", "duration": 1,
             "executeIf": {"field": "seed.ready", "operator": "equals", "value": true},
             "dependencies": ["seed"]}
        ]
    }));

    let result = run(&h, &wf, options()).await;
    assert!(result.success);
    assert_eq!(result.skipped_steps, vec!["guarded"]);
    let rows = h.state.rows_for("guarded");
    assert_eq!(rows[0].metadata.skip_reason.as_deref(), Some("condition_not_met"));
}

#[tokio::test]
async fn test_cancellation_marks_run_cancelled() {
    let h = harness();
    let wf = workflow(json!({
        "name": "cancelled",
        "steps": [
            {"id": "a", "name": "A", "type": "delay", "duration": 1}
        ]
    }));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = h.engine.execute(&wf, options(), cancel).await.unwrap();
    assert_eq!(result.status, flowpilot_core::types::ExecutionStatus::Cancelled);
    assert!(!result.success);
}

#[tokio::test]
async fn test_validation_step_fail_and_warn() {
    let h = harness();
    let wf_fail = workflow(json!({
        "name": "validate-fail",
        "steps": [
            {"id": "seed", "name": "Seed", "type": "transform",
             "operation": "set", "input": {"email": ""}, "config": {}},
            {"id": "check", "name": "Check", "type": "validation",
             "input": "{{seed}}",
             "rules": [{"field": "email", "operator": "is_not_empty", "value": null,
                        "message": "email required"}],
             "dependencies": ["seed"]}
        ]
    }));
    let result = run(&h, &wf_fail, options()).await;
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("email required"));

    let wf_warn = workflow(json!({
        "name": "validate-warn",
        "steps": [
            {"id": "seed", "name": "Seed", "type": "transform",
             "operation": "set", "input": {"email": ""}, "config": {}},
            {"id": "check", "name": "Check", "type": "validation",
             "input": "{{seed}}",
             "rules": [{"field": "email", "operator": "is_not_empty", "value": null}],
             "onValidationFail": "warn",
             "dependencies": ["seed"]}
        ]
    }));
    let result = run(&h, &wf_warn, options()).await;
    assert!(result.success);
    assert_eq!(result.output["valid"], json!(false));
}

#[tokio::test]
async fn test_unresolved_reference_fails_step() {
    let h = harness();
    let wf = workflow(json!({
        "name": "bad-ref",
        "steps": [{
            "id": "use", "name": "Use", "type": "transform",
            "operation": "set", "input": "{{ghost.data.items}}", "config": {}
        }]
    }));

    let result = run(&h, &wf, options()).await;
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("ghost"));
    let rows = h.state.rows_for("use");
    assert_eq!(
        rows.last().unwrap().metadata.error_code.as_deref(),
        Some("VARIABLE_RESOLUTION_FAILED")
    );
}
