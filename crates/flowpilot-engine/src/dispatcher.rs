//! Step dispatch
//!
//! One entry point per step: gate on `executeIf`, apply the calibration
//! dependency skip, probe the cache, hand LLM-family steps to the
//! orchestrator when one is active, resolve parameters, route by step
//! type, wrap the execution in the retry policy and timeout, and record
//! the outcome everywhere it belongs (context, state rows, events,
//! cache). Peripheral side effects never fail a step.

use crate::action;
use crate::approval;
use crate::cache::StepCache;
use crate::calibration;
use crate::conditional::{apply_operator, evaluate_condition};
use crate::context::ExecutionContext;
use crate::events::{EventBus, EventType, ExecutionEvent};
use crate::llm;
use crate::notify::Notifier;
use crate::parallel::{self, StepRunner};
use crate::planner;
use crate::resolver::{resolve_params, resolve_template, resolve_value};
use crate::retry::{retry_delay, should_retry, CircuitBreaker};
use crate::shape;
use crate::transform;
use async_trait::async_trait;
use flowpilot_core::config::EngineSettings;
use flowpilot_core::error::{ExecutionError, ValidationError, WorkflowError};
use flowpilot_core::step::{
    ComparisonFormat, ComparisonOperation, EnrichmentStrategy, OnValidationFail, Step, StepKind,
    SubWorkflowOnError, ValidationRule,
};
use flowpilot_core::traits::{
    ApprovalTracker, LlmRuntime, Orchestrator, PluginRuntime, StateManager, WorkflowRegistry,
};
use flowpilot_core::types::{StepMetadata, StepOutput, TokenUsage};
use jsonschema::{Draft, JSONSchema};
use log::{debug, warn};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// What a routed handler produced, before metadata assembly
struct KindOutcome {
    data: Value,
    tokens: Option<TokenUsage>,
    token_source: Option<&'static str>,
    orchestrated: bool,
    routed_model: Option<String>,
    auto_repaired: bool,
}

impl KindOutcome {
    fn data(data: Value) -> Self {
        Self {
            data,
            tokens: None,
            token_source: None,
            orchestrated: false,
            routed_model: None,
            auto_repaired: false,
        }
    }
}

/// Routes steps to their handlers; cheap to clone (all shared state is
/// behind `Arc`), which is how recursive fan-out re-enters it.
#[derive(Clone)]
pub struct StepDispatcher {
    state: Arc<dyn StateManager>,
    events: EventBus,
    cache: Arc<StepCache>,
    settings: EngineSettings,
    notifier: Notifier,
    plugin_runtime: Option<Arc<dyn PluginRuntime>>,
    llm_runtime: Option<Arc<dyn LlmRuntime>>,
    orchestrator: Option<Arc<dyn Orchestrator>>,
    registry: Option<Arc<dyn WorkflowRegistry>>,
    approvals: Option<Arc<dyn ApprovalTracker>>,
    plugin_breaker: Arc<CircuitBreaker>,
    llm_breaker: Arc<CircuitBreaker>,
}

impl StepDispatcher {
    pub fn new(state: Arc<dyn StateManager>, events: EventBus, settings: EngineSettings) -> Self {
        let notifier = Notifier::new(&settings);
        let plugin_breaker = Arc::new(CircuitBreaker::new("plugins", &settings.circuit_breaker));
        let llm_breaker = Arc::new(CircuitBreaker::new("llm", &settings.circuit_breaker));
        Self {
            state,
            events,
            cache: Arc::new(StepCache::new(settings.cache.capacity, settings.cache.ttl())),
            settings,
            notifier,
            plugin_runtime: None,
            llm_runtime: None,
            orchestrator: None,
            registry: None,
            approvals: None,
            plugin_breaker,
            llm_breaker,
        }
    }

    pub fn with_plugin_runtime(mut self, runtime: Arc<dyn PluginRuntime>) -> Self {
        self.plugin_runtime = Some(runtime);
        self
    }

    pub fn with_llm_runtime(mut self, runtime: Arc<dyn LlmRuntime>) -> Self {
        self.llm_runtime = Some(runtime);
        self
    }

    pub fn with_orchestrator(mut self, orchestrator: Arc<dyn Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn WorkflowRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_approvals(mut self, approvals: Arc<dyn ApprovalTracker>) -> Self {
        self.approvals = Some(approvals);
        self
    }

    pub fn cache(&self) -> &Arc<StepCache> {
        &self.cache
    }

    /// The per-step algorithm
    pub async fn dispatch(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, WorkflowError> {
        if cancel.is_cancelled() {
            return Err(WorkflowError::Execution(ExecutionError::Cancelled));
        }
        ctx.current_step = Some(step.id.clone());

        if let Some(condition) = &step.execute_if {
            if !evaluate_condition(ctx, condition)? {
                debug!("step '{}' skipped: executeIf is false", step.id);
                return self.record_skip(step, ctx, "condition_not_met", None).await;
            }
        }

        if ctx.batch_calibration_mode {
            let blocking = step.dependencies.iter().find(|dep| {
                ctx.failed_steps.contains(dep)
                    && ctx
                        .get_step_output(dep)
                        .map(|output| output.metadata.recoverable != Some(true))
                        .unwrap_or(true)
            });
            if let Some(dep) = blocking {
                debug!("step '{}' skipped: dependency '{}' failed", step.id, dep);
                let detail = format!("dependency '{}' failed", dep);
                return self
                    .record_skip(step, ctx, "dependency_failed", Some(&detail))
                    .await;
            }
        }

        let cache_key = if step.cache_enabled() {
            Some(StepCache::fingerprint(
                step.type_name(),
                &step.id,
                raw_params_of(step),
            ))
        } else {
            None
        };
        if let Some(key) = &cache_key {
            if let Some(mut output) = self.cache.get(key) {
                debug!("cache hit for step '{}'", step.id);
                output.metadata.cache_hit = Some(true);
                self.events
                    .emit(ExecutionEvent::step(
                        EventType::StepCacheHit,
                        &ctx.execution_id,
                        &step.id,
                    ))
                    .await;
                self.log_row(ctx, step, "completed", &output.metadata, None)
                    .await;
                ctx.set_step_output(&step.id, output.clone());
                return Ok(output);
            }
        }

        let policy = step.retry_policy.clone().unwrap_or_default();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            self.events
                .emit(ExecutionEvent::step(EventType::StepStarted, &ctx.execution_id, &step.id))
                .await;
            self.log_row(ctx, step, "running", &StepMetadata::default(), None)
                .await;

            let result = self.execute_with_timeout(step, ctx, cancel).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(outcome) => {
                    return self
                        .record_success(step, ctx, outcome, elapsed_ms, cache_key.as_deref())
                        .await;
                }
                Err(error) => {
                    let retryable = attempt <= policy.max_retries
                        && should_retry(&policy, &error.to_string())
                        && !cancel.is_cancelled()
                        && !matches!(
                            error,
                            WorkflowError::Execution(ExecutionError::Cancelled)
                        );
                    if retryable {
                        warn!(
                            "step '{}' attempt {} failed ({}); retrying",
                            step.id, attempt, error
                        );
                        self.events
                            .emit(
                                ExecutionEvent::step(
                                    EventType::StepRetrying,
                                    &ctx.execution_id,
                                    &step.id,
                                )
                                .with_data("error", json!(error.to_string())),
                            )
                            .await;
                        tokio::time::sleep(retry_delay(&policy, attempt)).await;
                        continue;
                    }
                    return self.record_failure(step, ctx, error, elapsed_ms).await;
                }
            }
        }
    }

    async fn execute_with_timeout(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<KindOutcome, WorkflowError> {
        let timeout = Duration::from_millis(
            step.timeout_ms.unwrap_or(self.settings.default_step_timeout_ms),
        );
        match tokio::time::timeout(timeout, self.execute_kind(step, ctx, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(WorkflowError::Execution(ExecutionError::Timeout {
                step: step.id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            })),
        }
    }

    /// Route on the step type
    async fn execute_kind(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<KindOutcome, WorkflowError> {
        match &step.kind {
            StepKind::Action {
                plugin,
                action: action_name,
                params,
                output_schema,
            } => {
                let runtime = self.plugin_runtime.as_ref().ok_or_else(|| {
                    WorkflowError::Internal("no plugin runtime configured".to_string())
                })?;
                if !self.plugin_breaker.allow() {
                    return Err(WorkflowError::Execution(ExecutionError::CircuitOpen {
                        component: "plugins".to_string(),
                    }));
                }
                let resolved = resolve_params(ctx, params)
                    .map_err(|e| WorkflowError::from(e.in_step(&step.id)))?;
                let result = action::execute_action(
                    runtime,
                    &ctx.user_id,
                    plugin,
                    action_name,
                    &resolved,
                    output_schema.as_ref(),
                    self.settings.plugin_token_equivalent,
                )
                .await;
                match result {
                    Ok((data, schema, tokens)) => {
                        self.plugin_breaker.record_success();
                        if let Some(schema) = schema {
                            ctx.set_output_schema(&step.id, schema);
                        }
                        let mut outcome = KindOutcome::data(data);
                        outcome.tokens = Some(tokens);
                        outcome.token_source = Some("plugin");
                        Ok(outcome)
                    }
                    Err(error) => {
                        self.plugin_breaker.record_failure();
                        Err(error)
                    }
                }
            }

            StepKind::LlmDecision {
                prompt,
                params,
                output_schema,
            } => {
                self.run_llm_family(step, ctx, prompt.as_deref(), params, output_schema, true)
                    .await
            }
            StepKind::AiProcessing {
                prompt,
                params,
                output_schema,
            } => {
                self.run_llm_family(step, ctx, prompt.as_deref(), params, output_schema, false)
                    .await
            }

            StepKind::Transform {
                operation,
                input,
                config,
            } => {
                let user_id = ctx.user_id.clone();
                let data = transform::apply(
                    ctx,
                    self.plugin_runtime.as_ref(),
                    &user_id,
                    *operation,
                    input,
                    config,
                )
                .await?;
                Ok(KindOutcome::data(data))
            }

            StepKind::Conditional {
                condition,
                true_branch,
                false_branch,
                then_steps,
                else_steps,
            } => {
                let verdict = evaluate_condition(ctx, condition)?;
                let runner: Arc<dyn StepRunner> = Arc::new(self.clone());
                let branch_steps: Vec<Step> = if verdict {
                    then_steps
                        .clone()
                        .or_else(|| true_branch.clone().map(|s| vec![*s]))
                        .unwrap_or_default()
                } else {
                    else_steps
                        .clone()
                        .or_else(|| false_branch.clone().map(|s| vec![*s]))
                        .unwrap_or_default()
                };
                let result =
                    parallel::run_sequence(&runner, ctx, &branch_steps, cancel).await?;
                Ok(KindOutcome::data(json!({
                    "condition": verdict,
                    "branch": if verdict { "then" } else { "else" },
                    "executed": branch_steps.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
                    "result": result,
                })))
            }

            StepKind::Switch {
                evaluate,
                cases,
                default,
            } => {
                let value = resolve_template(ctx, evaluate)
                    .map_err(|e| WorkflowError::from(e.in_step(&step.id)))?;
                let selected: Vec<String> = cases
                    .get(&value)
                    .and_then(Value::as_array)
                    .map(|ids| {
                        ids.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .or_else(|| default.clone())
                    .unwrap_or_default();
                let gated: Vec<String> = cases
                    .values()
                    .filter_map(Value::as_array)
                    .flatten()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .chain(default.iter().flatten().cloned())
                    .collect();
                Ok(KindOutcome::data(json!({
                    "matched": value,
                    "selected": selected,
                    "gated": gated,
                })))
            }

            StepKind::Loop {
                iterate_over,
                max_iterations,
                loop_steps,
                parallel: in_parallel,
            } => {
                let runner: Arc<dyn StepRunner> = Arc::new(self.clone());
                let data = parallel::execute_loop(
                    &runner,
                    ctx,
                    iterate_over,
                    *max_iterations,
                    loop_steps,
                    *in_parallel,
                    cancel,
                )
                .await?;
                Ok(KindOutcome::data(data))
            }

            StepKind::Parallel {
                steps,
                max_concurrency,
            } => {
                let runner: Arc<dyn StepRunner> = Arc::new(self.clone());
                let data = parallel::execute_parallel(
                    &runner,
                    ctx,
                    steps,
                    *max_concurrency,
                    false,
                    cancel,
                )
                .await?;
                Ok(KindOutcome::data(data))
            }
            StepKind::ParallelGroup {
                steps,
                max_concurrency,
            } => {
                let runner: Arc<dyn StepRunner> = Arc::new(self.clone());
                let data = parallel::execute_parallel(
                    &runner,
                    ctx,
                    steps,
                    *max_concurrency,
                    true,
                    cancel,
                )
                .await?;
                Ok(KindOutcome::data(data))
            }

            StepKind::ScatterGather { scatter, gather } => {
                let runner: Arc<dyn StepRunner> = Arc::new(self.clone());
                let data =
                    parallel::execute_scatter_gather(&runner, ctx, scatter, gather, cancel)
                        .await?;
                Ok(KindOutcome::data(data))
            }

            StepKind::Enrichment {
                sources,
                strategy,
                join_on,
                merge_arrays,
            } => {
                let mut resolved = Vec::with_capacity(sources.len());
                for source in sources {
                    let value = resolve_value(ctx, &source.from)
                        .map_err(|e| WorkflowError::from(e.in_step(&step.id)))?;
                    resolved.push((source.key.clone(), unwrap_shell(value)));
                }
                Ok(KindOutcome::data(enrich(
                    resolved,
                    *strategy,
                    join_on.as_deref(),
                    *merge_arrays,
                )?))
            }

            StepKind::Validation {
                input,
                schema,
                rules,
                on_validation_fail,
            } => {
                let resolved = resolve_value(ctx, input)
                    .map_err(|e| WorkflowError::from(e.in_step(&step.id)))?;
                let resolved = unwrap_shell(resolved);
                let failures = validate_input(&resolved, schema.as_ref(), rules)?;
                if failures.is_empty() {
                    return Ok(KindOutcome::data(json!({
                        "valid": true,
                        "failures": [],
                        "checked": rules.len(),
                    })));
                }
                match on_validation_fail {
                    OnValidationFail::Fail => {
                        Err(WorkflowError::Validation(ValidationError::RuleFailed {
                            step: step.id.clone(),
                            details: failures
                                .iter()
                                .map(|f| f["message"].as_str().unwrap_or_default().to_string())
                                .collect::<Vec<_>>()
                                .join("; "),
                        }))
                    }
                    OnValidationFail::Warn => {
                        warn!("validation step '{}' recorded {} failure(s)", step.id, failures.len());
                        Ok(KindOutcome::data(json!({
                            "valid": false,
                            "failures": failures,
                            "checked": rules.len(),
                        })))
                    }
                }
            }

            StepKind::Comparison {
                left,
                right,
                operation,
                output_format,
            } => {
                let left = unwrap_shell(
                    resolve_value(ctx, left)
                        .map_err(|e| WorkflowError::from(e.in_step(&step.id)))?,
                );
                let right = unwrap_shell(
                    resolve_value(ctx, right)
                        .map_err(|e| WorkflowError::from(e.in_step(&step.id)))?,
                );
                Ok(KindOutcome::data(compare_values(
                    &left,
                    &right,
                    *operation,
                    *output_format,
                )))
            }

            StepKind::DeterministicExtraction {
                input,
                output_schema,
                instruction: _,
                document_type,
                ocr_fallback,
            } => {
                let resolved = resolve_value(ctx, input)
                    .map_err(|e| WorkflowError::from(e.in_step(&step.id)))?;
                let (extracted, fuzzy_used) =
                    extract_deterministic(&unwrap_shell(resolved), output_schema.as_ref());
                let mut outcome = KindOutcome::data(json!({
                    "extracted": extracted,
                    "document_type": document_type,
                    "ocr_fallback": ocr_fallback,
                }));
                outcome.auto_repaired = fuzzy_used;
                Ok(outcome)
            }

            StepKind::Delay { duration } => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(*duration)) => {
                        Ok(KindOutcome::data(json!({"delayed_ms": duration})))
                    }
                    _ = cancel.cancelled() => {
                        Err(WorkflowError::Execution(ExecutionError::Cancelled))
                    }
                }
            }

            StepKind::SubWorkflow {
                workflow_id,
                workflow_steps,
                inputs,
                output_mapping,
                inherit_context,
                on_error,
            } => {
                self.run_sub_workflow(
                    step,
                    ctx,
                    workflow_id.as_deref(),
                    workflow_steps.as_deref(),
                    inputs,
                    output_mapping.as_ref(),
                    *inherit_context,
                    *on_error,
                    cancel,
                )
                .await
            }

            StepKind::HumanApproval {
                approvers,
                approval_type,
                title,
                message,
                timeout,
                on_timeout,
                notification_channels,
            } => {
                let tracker = self.approvals.as_ref().ok_or_else(|| {
                    WorkflowError::Internal("no approval tracker configured".to_string())
                })?;
                let data = approval::execute_human_approval(
                    tracker,
                    &self.notifier,
                    ctx,
                    &step.id,
                    approvers,
                    *approval_type,
                    title,
                    message.as_deref(),
                    *timeout,
                    *on_timeout,
                    notification_channels,
                )
                .await?;
                Ok(KindOutcome::data(data))
            }
        }
    }

    async fn run_llm_family(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
        prompt: Option<&str>,
        params: &Option<Map<String, Value>>,
        output_schema: &Option<Value>,
        allow_plugins: bool,
    ) -> Result<KindOutcome, WorkflowError> {
        let resolved = match params {
            Some(params) => resolve_params(ctx, params)
                .map_err(|e| WorkflowError::from(e.in_step(&step.id)))?,
            None => Map::new(),
        };

        // orchestration hook: params are resolved already so referenced
        // upstream data is materialized for the router
        if let Some(orchestrator) = &self.orchestrator {
            if orchestrator.is_active() {
                match orchestrator.execute_step(step, &resolved).await {
                    Ok((data, tokens, routed_model)) => {
                        return Ok(KindOutcome {
                            data,
                            tokens: Some(tokens),
                            token_source: Some("llm"),
                            orchestrated: true,
                            routed_model,
                            auto_repaired: false,
                        });
                    }
                    Err(e) => {
                        warn!(
                            "orchestrator failed for step '{}' ({}); falling back to direct execution",
                            step.id, e
                        );
                    }
                }
            }
        }

        let runtime = self.llm_runtime.as_ref().ok_or_else(|| {
            WorkflowError::Internal("no LLM runtime configured".to_string())
        })?;
        if !self.llm_breaker.allow() {
            return Err(WorkflowError::Execution(ExecutionError::CircuitOpen {
                component: "llm".to_string(),
            }));
        }

        let result = llm::execute_llm_step(
            runtime,
            ctx,
            &step.name,
            prompt,
            step.description.as_deref(),
            &resolved,
            output_schema.as_ref(),
            allow_plugins,
        )
        .await;

        match result {
            Ok(step_result) => {
                self.llm_breaker.record_success();
                Ok(KindOutcome {
                    data: step_result.data,
                    tokens: Some(step_result.tokens),
                    token_source: Some("llm"),
                    orchestrated: false,
                    routed_model: step_result.model,
                    auto_repaired: false,
                })
            }
            Err(error) => {
                self.llm_breaker.record_failure();
                Err(error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_sub_workflow(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
        workflow_id: Option<&str>,
        inline_steps: Option<&[Step]>,
        inputs: &Map<String, Value>,
        output_mapping: Option<&Map<String, Value>>,
        inherit_context: bool,
        on_error: SubWorkflowOnError,
        cancel: &CancellationToken,
    ) -> Result<KindOutcome, WorkflowError> {
        let steps: Vec<Step> = match (inline_steps, workflow_id) {
            (Some(steps), _) => steps.to_vec(),
            (None, Some(id)) => {
                let registry = self.registry.as_ref().ok_or_else(|| {
                    WorkflowError::Execution(ExecutionError::UnknownWorkflow(id.to_string()))
                })?;
                registry
                    .get(id)
                    .await
                    .map_err(|e| WorkflowError::Internal(e.to_string()))?
                    .ok_or_else(|| {
                        WorkflowError::Execution(ExecutionError::UnknownWorkflow(id.to_string()))
                    })?
                    .steps
            }
            (None, None) => {
                return Err(WorkflowError::Validation(ValidationError::MissingField {
                    step: step.id.clone(),
                    field: "workflowId or workflowSteps".to_string(),
                }))
            }
        };

        let resolved_inputs = resolve_params(ctx, inputs)
            .map_err(|e| WorkflowError::from(e.in_step(&step.id)))?;
        let mut child = if inherit_context {
            ctx.clone_for_branch(true)
        } else {
            ExecutionContext::new(&ctx.execution_id, &ctx.user_id, ctx.agent.clone())
        };
        child.input_values = resolved_inputs;
        child.batch_calibration_mode = ctx.batch_calibration_mode;

        let plan = planner::build_plan(&steps)?;
        let workflow_label = workflow_id.unwrap_or("inline");
        let mut failure: Option<WorkflowError> = None;

        'levels: for level in &plan.levels {
            for step_id in level {
                let child_step = steps
                    .iter()
                    .find(|s| &s.id == step_id)
                    .expect("planned step exists");
                match Box::pin(self.dispatch(child_step, &mut child, cancel)).await {
                    Ok(_) => {}
                    Err(e) => {
                        failure = Some(e);
                        break 'levels;
                    }
                }
            }
        }

        let tokens = TokenUsage::of(child.total_tokens_used);
        if let Some(error) = failure {
            match on_error {
                SubWorkflowOnError::Fail => {
                    return Err(WorkflowError::Execution(ExecutionError::SubWorkflowFailure {
                        workflow: workflow_label.to_string(),
                        message: error.to_string(),
                    }))
                }
                SubWorkflowOnError::Continue => {
                    let mut outcome = KindOutcome::data(json!({
                        "success": false,
                        "error": error.to_string(),
                        "completed_steps": child.completed_steps,
                    }));
                    outcome.tokens = Some(tokens);
                    return Ok(outcome);
                }
            }
        }

        let data = match output_mapping {
            Some(mapping) => {
                let mut mapped = Map::new();
                for (key, reference) in mapping {
                    mapped.insert(key.clone(), resolve_value(&child, reference)?);
                }
                Value::Object(mapped)
            }
            None => steps
                .last()
                .and_then(|last| child.get_step_output(&last.id))
                .map(|output| output.data.clone())
                .unwrap_or(Value::Null),
        };

        let mut outcome = KindOutcome::data(data);
        outcome.tokens = Some(tokens);
        Ok(outcome)
    }

    async fn record_success(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
        outcome: KindOutcome,
        elapsed_ms: u64,
        cache_key: Option<&str>,
    ) -> Result<StepOutput, WorkflowError> {
        let mut metadata = StepMetadata::success(elapsed_ms);
        metadata.tokens_used = outcome.tokens;
        metadata.item_count = shape::derive_item_count(&outcome.data);
        metadata.field_names = shape::sample_field_names(&outcome.data, 10);
        if outcome.orchestrated {
            metadata.orchestrated = Some(true);
        }
        metadata.routed_model = outcome.routed_model.clone();
        if outcome.auto_repaired {
            metadata.auto_repaired = Some(true);
        }

        let (plugin, action_name) = provenance(step);
        let output = StepOutput::new(&step.id, &plugin, &action_name, outcome.data, metadata);

        if let Some(key) = cache_key {
            let guard = self.cache.lock_key(key).await;
            if self.cache.get(key).is_none() {
                let ttl = step
                    .cache
                    .as_ref()
                    .and_then(|c| c.ttl_ms())
                    .map(Duration::from_millis);
                self.cache.put(key, output.clone(), ttl);
            }
            drop(guard);
            self.cache.release_key(key).await;
        }

        if let (Some(tokens), Some(source)) = (outcome.tokens, outcome.token_source) {
            if let Err(e) = self
                .state
                .record_token_usage(&ctx.execution_id, &step.id, &tokens, source)
                .await
            {
                warn!("token usage row failed for '{}': {}", step.id, e);
            }
        }
        self.log_row(ctx, step, "completed", &output.metadata, None).await;
        self.events
            .emit(ExecutionEvent::step(EventType::StepCompleted, &ctx.execution_id, &step.id))
            .await;
        ctx.set_step_output(&step.id, output.clone());
        Ok(output)
    }

    async fn record_failure(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
        error: WorkflowError,
        elapsed_ms: u64,
    ) -> Result<StepOutput, WorkflowError> {
        let mut metadata = StepMetadata::failure(elapsed_ms, &error.to_string(), error.code());
        metadata.failure_category = Some(calibration::classify(&error).to_string());
        if let WorkflowError::Execution(ExecutionError::PluginFailure { message, .. }) = &error {
            if calibration::classify_text(message)
                == flowpilot_core::types::IssueCategory::ExecutionParameter
            {
                metadata.parameter_error_details = Some(message.clone());
            }
        }

        let may_continue = if ctx.batch_calibration_mode {
            let issue = calibration::collect(&step.id, &error);
            let verdict = calibration::may_continue(&issue);
            ctx.record_issue(issue);
            verdict
        } else {
            step.continue_on_error
        };
        if !ctx.batch_calibration_mode && step.continue_on_error {
            // downstream steps may proceed against this output
            metadata.recoverable = Some(true);
        }

        let (plugin, action_name) = provenance(step);
        let output = StepOutput::new(&step.id, &plugin, &action_name, Value::Null, metadata);
        self.log_row(ctx, step, "failed", &output.metadata, Some(&error.to_string()))
            .await;
        self.events
            .emit(
                ExecutionEvent::step(EventType::StepFailed, &ctx.execution_id, &step.id)
                    .with_data("error", json!(error.to_string())),
            )
            .await;
        ctx.set_step_output(&step.id, output.clone());

        if may_continue {
            Ok(output)
        } else {
            Err(error)
        }
    }

    /// Record a skipped output without executing anything; also used by
    /// the coordinator for dependent skipping and switch gating
    pub async fn record_skip(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
        reason: &str,
        detail: Option<&str>,
    ) -> Result<StepOutput, WorkflowError> {
        let mut output = StepOutput::skipped(&step.id, reason);
        if let Some(detail) = detail {
            output.metadata.error = Some(detail.to_string());
        }
        // skips never had a `running` row, so insert one directly
        if let Err(e) = self
            .state
            .log_step_execution(
                &ctx.execution_id,
                &step.id,
                &step.name,
                step.type_name(),
                "skipped",
                &output.metadata,
            )
            .await
        {
            warn!("state row write failed for skipped step '{}': {}", step.id, e);
        }
        self.events
            .emit(
                ExecutionEvent::step(EventType::StepSkipped, &ctx.execution_id, &step.id)
                    .with_data("reason", json!(reason)),
            )
            .await;
        ctx.set_step_output(&step.id, output.clone());
        Ok(output)
    }

    /// State rows are observability; failures are logged and swallowed
    async fn log_row(
        &self,
        ctx: &ExecutionContext,
        step: &Step,
        status: &str,
        metadata: &StepMetadata,
        error_message: Option<&str>,
    ) {
        let result = if status == "running" {
            self.state
                .log_step_execution(
                    &ctx.execution_id,
                    &step.id,
                    &step.name,
                    step.type_name(),
                    status,
                    metadata,
                )
                .await
        } else {
            self.state
                .update_step_execution(&ctx.execution_id, &step.id, status, metadata, error_message)
                .await
        };
        if let Err(e) = result {
            warn!("state row write failed for step '{}': {}", step.id, e);
        }
    }
}

#[async_trait]
impl StepRunner for StepDispatcher {
    async fn run_step(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, WorkflowError> {
        self.dispatch(step, ctx, cancel).await
    }
}

/// Raw (unresolved) params used for the cache fingerprint
fn raw_params_of(step: &Step) -> &Map<String, Value> {
    static EMPTY: once_cell::sync::Lazy<Map<String, Value>> =
        once_cell::sync::Lazy::new(Map::new);
    match &step.kind {
        StepKind::Action { params, .. } => params,
        _ => &EMPTY,
    }
}

/// Step-output provenance: the producing plugin and action, or a
/// symbolic source for engine-internal kinds
fn provenance(step: &Step) -> (String, String) {
    match &step.kind {
        StepKind::Action { plugin, action, .. } => (plugin.clone(), action.clone()),
        StepKind::Transform { operation, .. } => ("transform".to_string(), operation.to_string()),
        StepKind::LlmDecision { .. } => ("llm".to_string(), "decision".to_string()),
        StepKind::AiProcessing { .. } => ("llm".to_string(), "processing".to_string()),
        other => ("engine".to_string(), other.type_name().to_string()),
    }
}

/// A resolved step-output shell collapses to its data
fn unwrap_shell(value: Value) -> Value {
    match &value {
        Value::Object(object) if object.contains_key("stepId") && object.contains_key("data") => {
            object.get("data").cloned().unwrap_or(Value::Null)
        }
        _ => value,
    }
}

fn validate_input(
    input: &Value,
    schema: Option<&Value>,
    rules: &[ValidationRule],
) -> Result<Vec<Value>, WorkflowError> {
    let mut failures = Vec::new();

    if let Some(schema) = schema {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|e| {
                WorkflowError::Validation(ValidationError::SchemaViolation(format!(
                    "validation schema did not compile: {}",
                    e
                )))
            })?;
        if let Err(errors) = compiled.validate(input) {
            for error in errors {
                failures.push(json!({
                    "field": error.instance_path.to_string(),
                    "message": error.to_string(),
                }));
            }
        };
    }

    for rule in rules {
        let field = input
            .as_object()
            .and_then(|object| shape::find_field(object, &rule.field, None))
            .map(|(value, _)| value);
        let passed = apply_operator(rule.operator, field.as_ref(), &rule.value)?;
        if !passed {
            let message = rule.message.clone().unwrap_or_else(|| {
                format!("field '{}' failed {} check", rule.field, rule.operator)
            });
            failures.push(json!({"field": rule.field, "message": message}));
        }
    }

    Ok(failures)
}

fn value_set(value: &Value) -> Vec<Value> {
    shape::unwrap_structured_output(value, None).unwrap_or_else(|| vec![value.clone()])
}

fn compare_values(
    left: &Value,
    right: &Value,
    operation: ComparisonOperation,
    format: ComparisonFormat,
) -> Value {
    use crate::cache::canonical_json;

    let (result, detail): (bool, Value) = match operation {
        ComparisonOperation::Equals | ComparisonOperation::NotEquals => {
            let equal = canonical_json(left) == canonical_json(right);
            let result = if operation == ComparisonOperation::Equals {
                equal
            } else {
                !equal
            };
            (result, Value::Null)
        }
        ComparisonOperation::Diff => {
            let left_items = value_set(left);
            let right_items = value_set(right);
            let right_keys: Vec<String> = right_items.iter().map(canonical_json).collect();
            let left_keys: Vec<String> = left_items.iter().map(canonical_json).collect();
            let left_only: Vec<Value> = left_items
                .iter()
                .filter(|item| !right_keys.contains(&canonical_json(item)))
                .cloned()
                .collect();
            let right_only: Vec<Value> = right_items
                .iter()
                .filter(|item| !left_keys.contains(&canonical_json(item)))
                .cloned()
                .collect();
            let identical = left_only.is_empty() && right_only.is_empty();
            (
                !identical,
                json!({"left_only": left_only, "right_only": right_only}),
            )
        }
        ComparisonOperation::Intersection => {
            let left_items = value_set(left);
            let right_keys: Vec<String> = value_set(right).iter().map(canonical_json).collect();
            let common: Vec<Value> = left_items
                .into_iter()
                .filter(|item| right_keys.contains(&canonical_json(item)))
                .collect();
            (!common.is_empty(), json!({"items": common}))
        }
        ComparisonOperation::Union => {
            let mut seen = Vec::new();
            let mut union = Vec::new();
            for item in value_set(left).into_iter().chain(value_set(right)) {
                let key = canonical_json(&item);
                if !seen.contains(&key) {
                    seen.push(key);
                    union.push(item);
                }
            }
            (true, json!({"items": union}))
        }
    };

    match format {
        ComparisonFormat::Boolean => json!({"result": result}),
        ComparisonFormat::Detailed => json!({
            "result": result,
            "operation": operation.to_string(),
            "left": left,
            "right": right,
            "details": detail,
        }),
        ComparisonFormat::Summary => json!({
            "result": result,
            "operation": operation.to_string(),
            "details": detail,
        }),
    }
}

/// Deterministic extraction: structural parse, then key/value lines,
/// then schema-projected fuzzy field mapping. Never calls a runtime.
fn extract_deterministic(input: &Value, schema: Option<&Value>) -> (Value, bool) {
    let parsed = match input {
        Value::String(text) => serde_json::from_str::<Value>(text.trim())
            .unwrap_or_else(|_| parse_key_value_lines(text)),
        other => other.clone(),
    };

    let properties = schema
        .and_then(|s| s.get("properties"))
        .and_then(Value::as_object);
    let properties = match properties {
        Some(properties) if !properties.is_empty() => properties,
        _ => return (parsed, false),
    };

    let mut fuzzy_used = false;
    let project = |item: &Value, fuzzy_used: &mut bool| -> Value {
        let object = match item.as_object() {
            Some(object) => object,
            None => return item.clone(),
        };
        let mut projected = Map::new();
        for (name, declared) in properties {
            match shape::find_field(object, name, None) {
                Some((value, kind)) => {
                    if kind == shape::FieldMatch::Fuzzy {
                        *fuzzy_used = true;
                    }
                    projected.insert(name.clone(), coerce_to(declared, value));
                }
                None => {
                    projected.insert(name.clone(), Value::Null);
                }
            }
        }
        Value::Object(projected)
    };

    let extracted = match &parsed {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| project(item, &mut fuzzy_used))
                .collect(),
        ),
        other => project(other, &mut fuzzy_used),
    };
    (extracted, fuzzy_used)
}

fn parse_key_value_lines(text: &str) -> Value {
    let mut object = Map::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':').or_else(|| line.split_once('=')) {
            let key = key.trim();
            if key.is_empty() || key.contains(' ') && key.split_whitespace().count() > 4 {
                continue;
            }
            object.insert(key.to_string(), Value::String(value.trim().to_string()));
        }
    }
    if object.is_empty() {
        json!({"text": text})
    } else {
        Value::Object(object)
    }
}

fn coerce_to(declared: &Value, value: Value) -> Value {
    match declared.get("type").and_then(Value::as_str) {
        Some("number") | Some("integer") => match &value {
            Value::String(text) => text
                .trim()
                .trim_start_matches('$')
                .replace(',', "")
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(value),
            _ => value,
        },
        Some("boolean") => match &value {
            Value::String(text) => match text.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => Value::Bool(true),
                "false" | "no" | "0" => Value::Bool(false),
                _ => value,
            },
            _ => value,
        },
        Some("string") => match &value {
            Value::String(_) => value,
            other => Value::String(crate::resolver::inline_value(other)),
        },
        _ => value,
    }
}

/// Applies `sources` onto one another per the enrichment strategy
fn enrich(
    sources: Vec<(String, Value)>,
    strategy: EnrichmentStrategy,
    join_on: Option<&str>,
    merge_arrays: bool,
) -> Result<Value, WorkflowError> {
    if sources.is_empty() {
        return Err(WorkflowError::Validation(ValidationError::MissingField {
            step: "enrichment".to_string(),
            field: "sources".to_string(),
        }));
    }

    match strategy {
        EnrichmentStrategy::Nest => {
            let mut nested = Map::new();
            for (key, value) in sources {
                nested.insert(key, value);
            }
            Ok(Value::Object(nested))
        }
        EnrichmentStrategy::Merge => {
            let mut iter = sources.into_iter();
            let (_, mut base) = iter.next().expect("non-empty sources");
            for (_, source) in iter {
                base = merge_source(base, source, join_on, merge_arrays);
            }
            Ok(base)
        }
        EnrichmentStrategy::Join => {
            let join_on = join_on.ok_or_else(|| {
                WorkflowError::Validation(ValidationError::MissingField {
                    step: "enrichment".to_string(),
                    field: "joinOn".to_string(),
                })
            })?;
            let mut iter = sources.into_iter();
            let (_, base) = iter.next().expect("non-empty sources");
            let mut joined = base;
            for (_, source) in iter {
                joined = merge_source(joined, source, Some(join_on), merge_arrays);
            }
            Ok(joined)
        }
    }
}

fn merge_source(base: Value, source: Value, join_on: Option<&str>, merge_arrays: bool) -> Value {
    match (base, source) {
        (Value::Array(base_items), Value::Array(source_items)) => {
            let joined: Vec<Value> = base_items
                .into_iter()
                .enumerate()
                .map(|(index, item)| {
                    let partner = match join_on {
                        Some(key) => {
                            let wanted = shape::extract_value_by_key(&item, key, None);
                            source_items
                                .iter()
                                .find(|candidate| {
                                    shape::extract_value_by_key(candidate, key, None) == wanted
                                        && wanted.is_some()
                                })
                                .cloned()
                        }
                        None => source_items.get(index).cloned(),
                    };
                    match partner {
                        Some(partner) => merge_objects(item, partner, merge_arrays),
                        None => item,
                    }
                })
                .collect();
            Value::Array(joined)
        }
        (Value::Array(base_items), source @ Value::Object(_)) => Value::Array(
            base_items
                .into_iter()
                .map(|item| merge_objects(item, source.clone(), merge_arrays))
                .collect(),
        ),
        (base @ Value::Object(_), source @ Value::Object(_)) => {
            merge_objects(base, source, merge_arrays)
        }
        (base, _) => base,
    }
}

/// Source fills missing keys; with `merge_arrays` shared array fields
/// concatenate instead
fn merge_objects(base: Value, source: Value, merge_arrays: bool) -> Value {
    let (mut base_map, source_map) = match (base, source) {
        (Value::Object(base_map), Value::Object(source_map)) => (base_map, source_map),
        (base, _) => return base,
    };
    for (key, value) in source_map {
        match base_map.get_mut(&key) {
            Some(Value::Array(existing)) if merge_arrays => {
                if let Value::Array(incoming) = value {
                    existing.extend(incoming);
                }
            }
            Some(_) => {}
            None => {
                base_map.insert(key, value);
            }
        }
    }
    Value::Object(base_map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpilot_core::types::IssueCategory;
    use serde_json::json;

    #[test]
    fn test_provenance() {
        let step: Step = serde_json::from_value(json!({
            "id": "t", "name": "t", "type": "transform",
            "operation": "filter", "input": [], "config": {}
        }))
        .unwrap();
        assert_eq!(provenance(&step), ("transform".to_string(), "filter".to_string()));
    }

    #[test]
    fn test_unwrap_shell() {
        let shell = json!({"stepId": "s", "plugin": "p", "action": "a", "data": {"x": 1}, "metadata": {}});
        assert_eq!(unwrap_shell(shell), json!({"x": 1}));
        assert_eq!(unwrap_shell(json!({"x": 1})), json!({"x": 1}));
    }

    #[test]
    fn test_compare_formats() {
        let out = compare_values(
            &json!([1, 2]),
            &json!([2, 3]),
            ComparisonOperation::Diff,
            ComparisonFormat::Detailed,
        );
        assert_eq!(out["result"], json!(true));
        assert_eq!(out["details"]["left_only"], json!([1]));
        assert_eq!(out["details"]["right_only"], json!([3]));

        let out = compare_values(
            &json!({"a": 1}),
            &json!({"a": 1}),
            ComparisonOperation::Equals,
            ComparisonFormat::Boolean,
        );
        assert_eq!(out, json!({"result": true}));
    }

    #[test]
    fn test_comparison_union_dedupes() {
        let out = compare_values(
            &json!([1, 2]),
            &json!([2, 3]),
            ComparisonOperation::Union,
            ComparisonFormat::Summary,
        );
        assert_eq!(out["details"]["items"], json!([1, 2, 3]));
    }

    #[test]
    fn test_validate_rules_and_schema() {
        let rules: Vec<ValidationRule> = serde_json::from_value(json!([
            {"field": "email", "operator": "exists", "value": null},
            {"field": "count", "operator": ">", "value": 0, "message": "count must be positive"}
        ]))
        .unwrap();
        let failures = validate_input(&json!({"email": "e@x.c", "count": 0}), None, &rules).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0]["message"], json!("count must be positive"));

        let schema = json!({"type": "object", "required": ["name"]});
        let failures = validate_input(&json!({"email": "e@x.c"}), Some(&schema), &[]).unwrap();
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn test_extract_deterministic_kv_lines() {
        let text = "Invoice Number: INV-42\nTotal Amount: $1,200.50\nPaid: yes\n";
        let schema = json!({
            "type": "object",
            "properties": {
                "invoice_number": {"type": "string"},
                "total_amount": {"type": "number"},
                "paid": {"type": "boolean"}
            }
        });
        let (extracted, fuzzy) =
            extract_deterministic(&Value::String(text.to_string()), Some(&schema));
        assert_eq!(extracted["invoice_number"], json!("INV-42"));
        assert_eq!(extracted["total_amount"], json!(1200.5));
        assert_eq!(extracted["paid"], json!(true));
        assert!(fuzzy);
    }

    #[test]
    fn test_extract_deterministic_exact_is_not_repaired() {
        let schema = json!({
            "type": "object",
            "properties": {"vendor": {"type": "string"}}
        });
        let (extracted, fuzzy) =
            extract_deterministic(&json!({"vendor": "Acme"}), Some(&schema));
        assert_eq!(extracted, json!({"vendor": "Acme"}));
        assert!(!fuzzy);
    }

    #[test]
    fn test_enrich_nest_and_merge() {
        let out = enrich(
            vec![
                ("deals".into(), json!([{"id": "a"}])),
                ("owners".into(), json!([{"id": "a", "owner": "Eve"}])),
            ],
            EnrichmentStrategy::Nest,
            None,
            false,
        )
        .unwrap();
        assert_eq!(out["deals"], json!([{"id": "a"}]));

        let out = enrich(
            vec![
                ("base".into(), json!([{"id": "a", "n": 1}])),
                ("extra".into(), json!([{"id": "a", "owner": "Eve"}])),
            ],
            EnrichmentStrategy::Join,
            Some("id"),
            false,
        )
        .unwrap();
        assert_eq!(out, json!([{"id": "a", "n": 1, "owner": "Eve"}]));
    }

    #[test]
    fn test_merge_arrays_concat() {
        let merged = merge_objects(
            json!({"tags": ["a"]}),
            json!({"tags": ["b"], "extra": 1}),
            true,
        );
        assert_eq!(merged, json!({"tags": ["a", "b"], "extra": 1}));
    }

    #[test]
    fn test_failure_category_string() {
        let error = WorkflowError::Execution(ExecutionError::Timeout {
            step: "s".into(),
            timeout_ms: 10,
        });
        assert_eq!(calibration::classify(&error), IssueCategory::ExecutionTimeout);
        assert_eq!(
            calibration::classify(&error).to_string(),
            "execution_timeout"
        );
    }
}
