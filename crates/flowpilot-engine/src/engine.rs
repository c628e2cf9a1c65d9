//! Workflow coordinator
//!
//! The single logical coordinator: derives the level structure from the
//! dependency DAG and walks it level by level. Independent steps within a
//! level run concurrently on cloned contexts that are merged back
//! deterministically. Switch steps gate their referenced steps; failed
//! steps stop the run unless `continueOnError` or calibration mode says
//! otherwise; calibration failures mark transitive dependents skipped.

use crate::context::ExecutionContext;
use crate::dispatcher::StepDispatcher;
use crate::events::{EventBus, EventType, ExecutionEvent};
use crate::parallel;
use crate::planner;
use flowpilot_core::config::EngineSettings;
use flowpilot_core::error::WorkflowError;
use flowpilot_core::step::{Step, StepKind};
use flowpilot_core::types::{
    AgentProfile, ExecutionStatus, WorkflowExecutionResult,
};
use flowpilot_core::workflow::Workflow;
use log::{info, warn};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-run options supplied by the caller
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub user_id: String,
    pub agent: AgentProfile,
    pub inputs: Map<String, Value>,
    pub session_id: Option<String>,
    pub batch_calibration_mode: bool,
    pub memory_context: Option<String>,
}

/// Drives workflows to completion through the dispatcher
pub struct WorkflowEngine {
    dispatcher: Arc<StepDispatcher>,
    events: EventBus,
    settings: EngineSettings,
}

impl WorkflowEngine {
    pub fn new(dispatcher: StepDispatcher, events: EventBus, settings: EngineSettings) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            events,
            settings,
        }
    }

    pub fn dispatcher(&self) -> &Arc<StepDispatcher> {
        &self.dispatcher
    }

    /// Execute a workflow to completion.
    ///
    /// Definition problems (bad document, cycles) surface as `Err`;
    /// runtime failures produce an `Ok` result with `success == false`.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<WorkflowExecutionResult, WorkflowError> {
        workflow.validate()?;
        let plan = planner::build_plan(&workflow.steps)?;

        let execution_id = Uuid::new_v4().to_string();
        let started_at = chrono::Utc::now();
        let started = Instant::now();
        info!(
            "executing workflow '{}' ({} steps, {} levels) as {}",
            workflow.name,
            workflow.steps.len(),
            plan.levels.len(),
            execution_id
        );

        let mut ctx = ExecutionContext::new(&execution_id, &options.user_id, options.agent)
            .with_inputs(options.inputs);
        ctx.session_id = options.session_id;
        ctx.batch_calibration_mode = options.batch_calibration_mode;
        ctx.memory_context = options.memory_context;

        self.events
            .emit(ExecutionEvent::run(EventType::RunStarted, &execution_id))
            .await;

        let steps_by_id: HashMap<&str, &Step> = workflow
            .steps
            .iter()
            .map(|step| (step.id.as_str(), step))
            .collect();
        let deadline = workflow
            .timeout_ms
            .map(|ms| started + std::time::Duration::from_millis(ms));
        let level_concurrency = workflow
            .max_concurrency
            .unwrap_or(self.settings.max_level_concurrency)
            .max(1);

        let mut run_error: Option<(String, WorkflowError)> = None;

        'levels: for level in &plan.levels {
            if cancel.is_cancelled() {
                ctx.mark_cancelled();
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    warn!("workflow '{}' exceeded its timeout; cancelling", workflow.name);
                    cancel.cancel();
                    ctx.mark_cancelled();
                    break;
                }
            }

            // switch gating: steps referenced by a completed switch run
            // only when selected
            let mut runnable: Vec<&Step> = Vec::new();
            for step_id in level {
                let step = steps_by_id[step_id.as_str()];
                if let Some(owner) = gated_out(&ctx, workflow, &step.id) {
                    let detail = format!("not selected by switch '{}'", owner);
                    let _ = self
                        .dispatcher
                        .record_skip(step, &mut ctx, "switch_not_selected", Some(&detail))
                        .await;
                    continue;
                }
                runnable.push(step);
            }

            if runnable.len() == 1 {
                let step = runnable[0];
                if let Err(error) = self.dispatcher.dispatch(step, &mut ctx, &cancel).await {
                    run_error = Some((step.id.clone(), error));
                    break 'levels;
                }
            } else if !runnable.is_empty() {
                let owned: Vec<Step> = runnable.iter().map(|s| (*s).clone()).collect();
                let runner: Arc<dyn parallel::StepRunner> =
                    Arc::new(self.dispatcher.as_ref().clone());
                if let Err(error) = parallel::execute_parallel(
                    &runner,
                    &mut ctx,
                    &owned,
                    Some(level_concurrency),
                    false,
                    &cancel,
                )
                .await
                {
                    // attribute the failure to the first failed step in
                    // document order
                    let failed_id = owned
                        .iter()
                        .find(|step| ctx.failed_steps.contains(&step.id))
                        .map(|step| step.id.clone())
                        .unwrap_or_else(|| owned[0].id.clone());
                    run_error = Some((failed_id, error));
                    break 'levels;
                }
            }
        }

        if let Some((failed_id, _)) = &run_error {
            if ctx.batch_calibration_mode {
                self.skip_dependents(workflow, failed_id, &mut ctx).await;
            }
        }

        if cancel.is_cancelled() {
            ctx.mark_cancelled();
        }
        let finished_at = chrono::Utc::now();
        let status = if ctx.is_cancelled() {
            self.events
                .emit(ExecutionEvent::run(EventType::RunCancelled, &execution_id))
                .await;
            ExecutionStatus::Cancelled
        } else if run_error.is_some() {
            ctx.mark_failed();
            self.events
                .emit(ExecutionEvent::run(EventType::RunFailed, &execution_id))
                .await;
            ExecutionStatus::Failed
        } else {
            ctx.mark_completed();
            self.events
                .emit(ExecutionEvent::run(EventType::RunCompleted, &execution_id))
                .await;
            ExecutionStatus::Completed
        };

        // the run's output is the last completed step's data, walking the
        // document backwards
        let output = workflow
            .steps
            .iter()
            .rev()
            .find(|step| ctx.completed_steps.contains(&step.id))
            .and_then(|step| ctx.get_step_output(&step.id))
            .map(|out| out.data.clone())
            .unwrap_or(Value::Null);

        let success = status == ExecutionStatus::Completed;
        Ok(WorkflowExecutionResult {
            execution_id,
            workflow_name: workflow.name.clone(),
            status,
            success,
            output,
            error: run_error.as_ref().map(|(_, error)| error.to_string()),
            failed_step: run_error.as_ref().map(|(id, _)| id.clone()),
            completed_steps: ctx.completed_steps.clone(),
            failed_steps: ctx.failed_steps.clone(),
            skipped_steps: ctx.skipped_steps.clone(),
            total_tokens_used: ctx.total_tokens_used,
            total_execution_time_ms: started.elapsed().as_millis() as u64,
            started_at,
            finished_at,
            collected_issues: ctx.collected_issues.clone(),
        })
    }

    /// Mark every transitive dependent of a failed step skipped with
    /// `dependency_failed`; none of them may invoke a plugin
    async fn skip_dependents(
        &self,
        workflow: &Workflow,
        failed_id: &str,
        ctx: &mut ExecutionContext,
    ) {
        let mut dependents: HashMap<&str, Vec<&Step>> = HashMap::new();
        for step in &workflow.steps {
            for dependency in &step.dependencies {
                dependents.entry(dependency.as_str()).or_default().push(step);
            }
        }

        let mut queue: VecDeque<&str> = VecDeque::from([failed_id]);
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(current) = queue.pop_front() {
            for dependent in dependents.get(current).cloned().unwrap_or_default() {
                if !seen.insert(dependent.id.as_str()) {
                    continue;
                }
                if ctx.get_step_output(&dependent.id).is_none() {
                    let detail = format!("dependency '{}' failed", current);
                    let _ = self
                        .dispatcher
                        .record_skip(dependent, ctx, "dependency_failed", Some(&detail))
                        .await;
                }
                queue.push_back(dependent.id.as_str());
            }
        }
    }
}

/// If the step is referenced by a completed switch and was not selected,
/// return the switch's id
fn gated_out(ctx: &ExecutionContext, workflow: &Workflow, step_id: &str) -> Option<String> {
    for step in &workflow.steps {
        if !matches!(step.kind, StepKind::Switch { .. }) {
            continue;
        }
        let output = match ctx.get_step_output(&step.id) {
            Some(output) if output.metadata.success => output,
            _ => continue,
        };
        let gated = output.data.get("gated").and_then(Value::as_array);
        let selected = output.data.get("selected").and_then(Value::as_array);
        if let (Some(gated), Some(selected)) = (gated, selected) {
            let in_gated = gated.iter().any(|id| id.as_str() == Some(step_id));
            let in_selected = selected.iter().any(|id| id.as_str() == Some(step_id));
            if in_gated && !in_selected {
                return Some(step.id.clone());
            }
        }
    }
    None
}
