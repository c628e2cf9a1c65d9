// crates/flowpilot-core/src/types.rs

//! Core types for the flowpilot workflow engine
//!
//! This module defines the fundamental data structures shared between the
//! engine and its collaborators: step outputs and their persistable
//! metadata, token accounting, run results, and the request/response
//! shapes used at the plugin and LLM runtime boundaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};

/// Token usage statistics for an AI or plugin call
///
/// Plugin calls record a synthetic equivalent cost so that accounting
/// stays uniform across AI and non-AI work.
///
/// # Examples
///
/// ```rust
/// use flowpilot_core::types::TokenUsage;
///
/// let usage = TokenUsage { total: 150, prompt: 100, completion: 50 };
/// assert_eq!(usage.total, usage.prompt + usage.completion);
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Total tokens used (prompt + completion)
    pub total: u64,
    /// Tokens in the input prompt
    pub prompt: u64,
    /// Tokens in the generated completion
    pub completion: u64,
}

impl TokenUsage {
    pub fn of(total: u64) -> Self {
        Self {
            total,
            prompt: 0,
            completion: 0,
        }
    }
}

/// Lifecycle status of a run or a step
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// Persistable metadata attached to every step output
///
/// `StepOutput::data` is ephemeral (process lifetime); this struct is what
/// the state manager writes per step. Optional fields are omitted from the
/// serialized form when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StepMetadata {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_names: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestrated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routed_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_saved: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_repaired: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_error_details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Set on failed outputs whose downstream dependents may still run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recoverable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
}

impl StepMetadata {
    /// Metadata for a successful execution, stamped now
    pub fn success(execution_time_ms: u64) -> Self {
        Self {
            success: true,
            executed_at: Some(Utc::now()),
            execution_time_ms,
            ..Default::default()
        }
    }

    /// Metadata for a failed execution, stamped now
    pub fn failure(execution_time_ms: u64, error: &str, error_code: &str) -> Self {
        Self {
            success: false,
            executed_at: Some(Utc::now()),
            execution_time_ms,
            error: Some(error.to_string()),
            error_code: Some(error_code.to_string()),
            ..Default::default()
        }
    }
}

/// The result record for a single step
///
/// `data` is the ephemeral payload downstream steps resolve references
/// against; `metadata` is the persistable execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutput {
    pub step_id: String,
    /// Producing plugin, or a symbolic source such as `transform` or `llm`
    pub plugin: String,
    pub action: String,
    pub data: Value,
    pub metadata: StepMetadata,
}

impl StepOutput {
    pub fn new(step_id: &str, plugin: &str, action: &str, data: Value, metadata: StepMetadata) -> Self {
        Self {
            step_id: step_id.to_string(),
            plugin: plugin.to_string(),
            action: action.to_string(),
            data,
            metadata,
        }
    }

    /// A skipped-step output with `success=false` and the skip reason set
    pub fn skipped(step_id: &str, reason: &str) -> Self {
        let mut metadata = StepMetadata::default();
        metadata.success = false;
        metadata.executed_at = Some(Utc::now());
        metadata.skipped = Some(true);
        metadata.skip_reason = Some(reason.to_string());
        Self::new(step_id, "engine", "skip", Value::Null, metadata)
    }
}

/// Issue category collected during batch-calibration runs
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IssueCategory {
    ExecutionAuth,
    ExecutionTimeout,
    ExecutionRateLimit,
    ExecutionParameter,
    DataShapeMismatch,
    DataUnavailable,
    LogicError,
    CapabilityMismatch,
    MissingStep,
    InvalidStepOrder,
}

impl IssueCategory {
    /// Whether a calibration run must stop when this category is collected.
    /// Auth, logic, capability and ordering problems invalidate everything
    /// downstream; the rest are exactly what calibration exists to gather.
    pub fn halts_run(&self) -> bool {
        matches!(
            self,
            IssueCategory::ExecutionAuth
                | IssueCategory::LogicError
                | IssueCategory::CapabilityMismatch
                | IssueCategory::MissingStep
                | IssueCategory::InvalidStepOrder
        )
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// A classified problem accumulated while a calibration run continues
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectedIssue {
    pub category: IssueCategory,
    pub severity: IssueSeverity,
    pub affected_steps: Vec<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    pub auto_repair_available: bool,
}

/// Final result of a workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionResult {
    pub execution_id: String,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub success: bool,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub total_tokens_used: u64,
    pub total_execution_time_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collected_issues: Vec<CollectedIssue>,
}

/// Result of a plugin action call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PluginResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message: None,
        }
    }

    pub fn err(error: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
            message: None,
        }
    }

    /// The failure text, preferring `error` over `message`
    pub fn failure_text(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "unknown plugin error".to_string())
    }
}

/// Introspectable definition published by a plugin
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginDefinition {
    pub actions: Map<String, Value>,
}

impl PluginDefinition {
    /// Declared parameter JSON schema for an action, if published
    pub fn action_parameters(&self, action: &str) -> Option<&Value> {
        self.actions.get(action).and_then(|a| a.get("parameters"))
    }

    /// Declared output schema for an action, if published
    pub fn action_output_schema(&self, action: &str) -> Option<&Value> {
        self.actions.get(action).and_then(|a| a.get("output_schema"))
    }

    pub fn action_names(&self) -> Vec<String> {
        self.actions.keys().cloned().collect()
    }
}

/// Agent configuration handed to the LLM runtime
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_preference: Option<String>,
    #[serde(default)]
    pub plugins_required: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// One block of a multimodal LLM prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        media_type: String,
        /// Base64-encoded image bytes
        data: String,
        /// Resolution hint; `low` bounds token cost for vision payloads
        detail: String,
    },
}

/// Prompt payload for the LLM runtime: plain text or multimodal blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LlmPrompt {
    Text(String),
    Multimodal(Vec<ContentBlock>),
}

impl LlmPrompt {
    pub fn is_multimodal(&self) -> bool {
        matches!(self, LlmPrompt::Multimodal(_))
    }
}

/// Request to the LLM runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub user_id: String,
    pub agent: AgentProfile,
    pub prompt: LlmPrompt,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Suppressed for pure-analysis steps; tool-augmented steps allow it
    pub allow_plugins: bool,
}

/// Response from the LLM runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<Value>,
    pub tokens_used: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Severity attached to audit events
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Append-only audit trail entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub user_id: String,
    pub resource_name: String,
    pub details: Value,
    pub severity: AuditSeverity,
}

/// Pending human-approval request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub execution_id: String,
    pub step_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub approvers: Vec<String>,
    pub approval_type: String,
    pub context: Value,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of waiting on a human approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved {
        by: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
    Rejected {
        by: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
    TimedOut,
}
