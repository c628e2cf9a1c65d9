//! Per-run execution context
//!
//! The context owns all mutable run state: the step-output memo,
//! run-scoped variables, progress sets and the token/time counters.
//! It is owned by the coordinator; parallel branches receive clones
//! (optionally with zeroed metrics) and are merged back deterministically,
//! so peer branches never share mutable state.

use flowpilot_core::types::{
    AgentProfile, CollectedIssue, ExecutionStatus, StepOutput, TokenUsage,
};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Mutable state for a single workflow run
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub agent_id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub agent: AgentProfile,
    pub input_values: Map<String, Value>,

    pub status: ExecutionStatus,
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,

    step_outputs: HashMap<String, StepOutput>,
    /// Declared output schemas keyed by producing step id; a sidecar so
    /// data payloads stay plain JSON
    output_schemas: HashMap<String, Value>,
    pub variables: HashMap<String, Value>,

    pub total_tokens_used: u64,
    pub total_execution_time_ms: u64,

    /// Pre-loaded agent memory appended to LLM prompts
    pub memory_context: Option<String>,

    pub batch_calibration_mode: bool,
    pub collected_issues: Vec<CollectedIssue>,
}

impl ExecutionContext {
    pub fn new(execution_id: &str, user_id: &str, agent: AgentProfile) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            agent_id: agent.id.clone(),
            user_id: user_id.to_string(),
            session_id: None,
            agent,
            input_values: Map::new(),
            status: ExecutionStatus::Running,
            current_step: None,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            skipped_steps: Vec::new(),
            step_outputs: HashMap::new(),
            output_schemas: HashMap::new(),
            variables: HashMap::new(),
            total_tokens_used: 0,
            total_execution_time_ms: 0,
            memory_context: None,
            batch_calibration_mode: false,
            collected_issues: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.input_values = inputs;
        self
    }

    /// Record a step output, replacing any prior one.
    ///
    /// On replacement the prior output's token total and execution time
    /// are subtracted before the new ones are added, so retries never
    /// double-count. The completed/failed sets stay disjoint. Never fails;
    /// a missing prior token field counts as zero.
    pub fn set_step_output(&mut self, step_id: &str, output: StepOutput) {
        if let Some(prior) = self.step_outputs.get(step_id) {
            let prior_tokens = prior.metadata.tokens_used.map(|t| t.total).unwrap_or(0);
            self.total_tokens_used = self.total_tokens_used.saturating_sub(prior_tokens);
            self.total_execution_time_ms = self
                .total_execution_time_ms
                .saturating_sub(prior.metadata.execution_time_ms);
        }

        self.completed_steps.retain(|id| id != step_id);
        self.failed_steps.retain(|id| id != step_id);
        self.skipped_steps.retain(|id| id != step_id);

        if output.metadata.skipped == Some(true) {
            self.skipped_steps.push(step_id.to_string());
        } else if output.metadata.success {
            self.completed_steps.push(step_id.to_string());
        } else {
            self.failed_steps.push(step_id.to_string());
        }

        self.total_tokens_used += output.metadata.tokens_used.map(|t| t.total).unwrap_or(0);
        self.total_execution_time_ms += output.metadata.execution_time_ms;
        self.step_outputs.insert(step_id.to_string(), output);
    }

    pub fn get_step_output(&self, step_id: &str) -> Option<&StepOutput> {
        self.step_outputs.get(step_id)
    }

    pub fn step_output_ids(&self) -> impl Iterator<Item = &String> {
        self.step_outputs.keys()
    }

    /// Data of the most recently completed step, if any
    pub fn last_completed_output(&self) -> Option<&StepOutput> {
        self.completed_steps
            .last()
            .and_then(|id| self.step_outputs.get(id))
    }

    /// Attach the declared output schema of a producing step so
    /// downstream transforms can consult it instead of guessing
    pub fn set_output_schema(&mut self, step_id: &str, schema: Value) {
        self.output_schemas.insert(step_id.to_string(), schema);
    }

    pub fn get_output_schema(&self, step_id: &str) -> Option<&Value> {
        self.output_schemas.get(step_id)
    }

    pub fn set_variable(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn remove_variable(&mut self, name: &str) -> Option<Value> {
        self.variables.remove(name)
    }

    /// Resolve a single `{{path}}` reference against this run's state
    pub fn resolve_variable(
        &self,
        reference: &str,
    ) -> Result<Value, flowpilot_core::error::VariableResolutionError> {
        crate::resolver::resolve_reference(self, reference)
    }

    /// Deep-resolve a value tree: whole-string references are
    /// type-preserving, embedded ones substitute inline
    pub fn resolve_all_variables(
        &self,
        value: &Value,
    ) -> Result<Value, flowpilot_core::error::VariableResolutionError> {
        crate::resolver::resolve_value(self, value)
    }

    pub fn record_issue(&mut self, issue: CollectedIssue) {
        self.collected_issues.push(issue);
    }

    /// Clone for a parallel branch. With `reset_metrics` the clone starts
    /// at zero so merging back sums only the branch's new work.
    pub fn clone_for_branch(&self, reset_metrics: bool) -> Self {
        let mut branch = self.clone();
        if reset_metrics {
            branch.total_tokens_used = 0;
            branch.total_execution_time_ms = 0;
        }
        branch
    }

    /// Merge a branch back: step outputs and variables with the branch
    /// winning on conflict, progress sets unioned (branch verdict wins),
    /// metrics summed.
    pub fn merge(&mut self, other: ExecutionContext) {
        for id in &other.skipped_steps {
            if !self.skipped_steps.contains(id) {
                self.skipped_steps.push(id.clone());
            }
        }
        for id in &other.failed_steps {
            self.completed_steps.retain(|existing| existing != id);
            if !self.failed_steps.contains(id) {
                self.failed_steps.push(id.clone());
            }
        }
        for id in &other.completed_steps {
            self.failed_steps.retain(|existing| existing != id);
            if !self.completed_steps.contains(id) {
                self.completed_steps.push(id.clone());
            }
        }

        self.step_outputs.extend(other.step_outputs);
        self.output_schemas.extend(other.output_schemas);
        self.variables.extend(other.variables);
        self.collected_issues.extend(other.collected_issues);
        self.total_tokens_used += other.total_tokens_used;
        self.total_execution_time_ms += other.total_execution_time_ms;
    }

    /// Wipe mutable state and return to `running`
    pub fn reset(&mut self) {
        self.status = ExecutionStatus::Running;
        self.current_step = None;
        self.completed_steps.clear();
        self.failed_steps.clear();
        self.skipped_steps.clear();
        self.step_outputs.clear();
        self.output_schemas.clear();
        self.variables.clear();
        self.total_tokens_used = 0;
        self.total_execution_time_ms = 0;
        self.collected_issues.clear();
    }

    pub fn mark_completed(&mut self) {
        self.status = ExecutionStatus::Completed;
        self.current_step = None;
    }

    pub fn mark_failed(&mut self) {
        self.status = ExecutionStatus::Failed;
    }

    pub fn mark_paused(&mut self) {
        self.status = ExecutionStatus::Paused;
    }

    pub fn mark_cancelled(&mut self) {
        self.status = ExecutionStatus::Cancelled;
    }

    pub fn resume(&mut self) {
        if self.status == ExecutionStatus::Paused {
            self.status = ExecutionStatus::Running;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == ExecutionStatus::Cancelled
    }
}
