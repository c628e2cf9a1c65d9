//! Capability interfaces at the engine's seams
//!
//! The engine owns none of its side effects. Plugins, LLM calls,
//! persistence, audit, approvals and sub-workflow lookup are all injected
//! as `Arc<dyn ...>` capabilities, which also breaks the
//! dispatcher/parallel-executor/state cycles: components hold the small
//! interface they need, never each other.

use crate::step::Step;
use crate::types::{
    ApprovalDecision, ApprovalRequest, AuditEvent, LlmRequest, LlmResponse, PluginDefinition,
    PluginResult, StepMetadata, TokenUsage,
};
use crate::workflow::Workflow;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;

/// Executes named `(plugin, action, params)` operations
#[async_trait]
pub trait PluginRuntime: Send + Sync {
    async fn execute(
        &self,
        user_id: &str,
        plugin: &str,
        action: &str,
        params: &Map<String, Value>,
    ) -> Result<PluginResult>;

    /// Introspectable definition, if the plugin publishes one
    async fn definition(&self, plugin: &str) -> Option<PluginDefinition>;
}

/// Runs prompts (text or multimodal) against a model
#[async_trait]
pub trait LlmRuntime: Send + Sync {
    async fn run(&self, request: LlmRequest) -> Result<LlmResponse>;

    /// Whether multimodal prompts are accepted; callers fall back to text
    fn supports_vision(&self) -> bool {
        false
    }
}

/// Write-only observability sink for per-step execution rows
#[async_trait]
pub trait StateManager: Send + Sync {
    async fn log_step_execution(
        &self,
        execution_id: &str,
        step_id: &str,
        name: &str,
        step_type: &str,
        status: &str,
        metadata: &StepMetadata,
    ) -> Result<()>;

    async fn update_step_execution(
        &self,
        execution_id: &str,
        step_id: &str,
        status: &str,
        metadata: &StepMetadata,
        error_message: Option<&str>,
    ) -> Result<()>;

    async fn record_token_usage(
        &self,
        execution_id: &str,
        step_id: &str,
        usage: &TokenUsage,
        source: &str,
    ) -> Result<()>;
}

/// Append-only audit trail
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<()>;
}

/// Tracks human approval requests and their decisions
#[async_trait]
pub trait ApprovalTracker: Send + Sync {
    /// Register a pending request; returns its id
    async fn create(&self, request: ApprovalRequest) -> Result<String>;

    /// Block until a decision lands or the timeout elapses
    async fn wait(&self, approval_id: &str, timeout: Duration) -> Result<ApprovalDecision>;
}

/// Optional external routing layer for LLM-family steps
#[async_trait]
pub trait Orchestrator: Send + Sync {
    fn is_active(&self) -> bool;

    /// Execute an LLM-family step with already-resolved parameters.
    /// Returns the step data and token usage; errors fall through to
    /// normal execution.
    async fn execute_step(
        &self,
        step: &Step,
        resolved_params: &Map<String, Value>,
    ) -> Result<(Value, TokenUsage, Option<String>)>;

    fn config(&self) -> Value {
        Value::Null
    }
}

/// Resolves `workflowId` references on sub-workflow steps
#[async_trait]
pub trait WorkflowRegistry: Send + Sync {
    async fn get(&self, workflow_id: &str) -> Result<Option<Workflow>>;
}
