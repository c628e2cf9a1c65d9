//! Step definitions
//!
//! A workflow is a graph of typed steps. Every step shares an envelope
//! (id, name, dependencies, conditional gate, error policy, retry, cache)
//! and carries one discriminated payload selected by its `type` field.
//! The serialized field names follow the workflow authoring dialect the
//! engine consumes, which mixes camelCase (`executeIf`, `iterateOver`)
//! with snake_case (`then_steps`, `output_schema`); snake_case aliases
//! are accepted everywhere.

use crate::condition::Condition;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};

/// Per-step retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryPolicy {
    #[serde(rename = "maxRetries", alias = "max_retries")]
    pub max_retries: u32,
    #[serde(rename = "backoffMs", alias = "backoff_ms", default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(
        rename = "backoffMultiplier",
        alias = "backoff_multiplier",
        default = "default_backoff_multiplier"
    )]
    pub backoff_multiplier: f64,
    /// Substrings matched against the error text; empty retries everything
    #[serde(rename = "retryableErrors", alias = "retryable_errors", default)]
    pub retryable_errors: Vec<String>,
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            retryable_errors: Vec::new(),
        }
    }
}

/// Per-step cache opt-in, either a bare flag or a config object
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum CacheSpec {
    Flag(bool),
    Config {
        #[serde(default = "default_true")]
        enabled: bool,
        #[serde(rename = "ttlMs", alias = "ttl_ms")]
        ttl_ms: Option<u64>,
    },
}

fn default_true() -> bool {
    true
}

impl CacheSpec {
    pub fn is_enabled(&self) -> bool {
        match self {
            CacheSpec::Flag(flag) => *flag,
            CacheSpec::Config { enabled, .. } => *enabled,
        }
    }

    pub fn ttl_ms(&self) -> Option<u64> {
        match self {
            CacheSpec::Flag(_) => None,
            CacheSpec::Config { ttl_ms, .. } => *ttl_ms,
        }
    }
}

/// Deterministic data operations understood by the transform handler
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransformOperation {
    Set,
    Map,
    Filter,
    Reduce,
    Sort,
    #[serde(alias = "group_by")]
    #[strum(to_string = "group", serialize = "group_by")]
    Group,
    Aggregate,
    Deduplicate,
    Flatten,
    Pivot,
    Split,
    Expand,
    Partition,
    Join,
    RowsToObjects,
    MapHeaders,
    RenderTable,
    FetchContent,
}

impl TransformOperation {
    /// Operations that require an array once the input shape is reconciled
    pub fn requires_array(&self) -> bool {
        matches!(
            self,
            TransformOperation::Filter
                | TransformOperation::Map
                | TransformOperation::Reduce
                | TransformOperation::Sort
                | TransformOperation::Deduplicate
                | TransformOperation::Flatten
                | TransformOperation::Group
                | TransformOperation::Aggregate
                | TransformOperation::Pivot
                | TransformOperation::Split
                | TransformOperation::Expand
        )
    }
}

/// Scatter phase of a scatter-gather step
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ScatterSpec {
    /// Reference or literal resolving to the collection to fan out
    pub input: Value,
    pub steps: Vec<Step>,
    #[serde(rename = "itemVariable", alias = "item_variable")]
    pub item_variable: Option<String>,
    #[serde(rename = "maxConcurrency", alias = "max_concurrency")]
    pub max_concurrency: Option<usize>,
}

/// How per-item results are folded back together
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GatherOperation {
    /// Array of per-item results in scatter input order
    Collect,
    /// Object union of per-item results; later items win on key conflicts
    Merge,
    /// Fold with `reduceExpression`; the expression is required
    Reduce,
    /// Concatenate per-item arrays
    Flatten,
}

/// Gather phase of a scatter-gather step
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatherSpec {
    pub operation: GatherOperation,
    #[serde(rename = "outputKey", alias = "output_key")]
    pub output_key: Option<String>,
    #[serde(rename = "reduceExpression", alias = "reduce_expression")]
    pub reduce_expression: Option<String>,
}

/// One upstream source feeding an enrichment step
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EnrichmentSource {
    /// Key the source lands under (or joins as)
    pub key: String,
    /// Reference resolving to the source data
    pub from: Value,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EnrichmentStrategy {
    /// Object union per item
    Merge,
    /// Equijoin on `joinOn`
    Join,
    /// Attach each source under its key
    Nest,
}

/// A single validation rule evaluated against the resolved input
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ValidationRule {
    pub field: String,
    pub operator: crate::condition::ConditionOperator,
    #[serde(default)]
    pub value: Value,
    pub message: Option<String>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, EnumString, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OnValidationFail {
    /// Fail the step (default)
    #[default]
    Fail,
    /// Record the failures and continue with the input untouched
    Warn,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ComparisonOperation {
    Equals,
    NotEquals,
    /// Elements present on one side but not the other
    Diff,
    Intersection,
    Union,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, EnumString, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ComparisonFormat {
    #[default]
    Boolean,
    Detailed,
    Summary,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, EnumString, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubWorkflowOnError {
    #[default]
    Fail,
    Continue,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, EnumString, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OnApprovalTimeout {
    #[default]
    Fail,
    Approve,
    Reject,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChannelKind {
    Webhook,
    Email,
    Slack,
    Teams,
}

/// A notification channel declared on a human-approval step
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NotificationChannelSpec {
    pub channel: ChannelKind,
    #[serde(default)]
    pub config: Map<String, Value>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, EnumString, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApprovalType {
    /// One approver is enough
    #[default]
    Any,
    /// Every listed approver must approve
    All,
}

/// The discriminated step payload, selected by the `type` field
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Action {
        plugin: String,
        action: String,
        #[serde(default)]
        params: Map<String, Value>,
        #[serde(default)]
        output_schema: Option<Value>,
    },
    LlmDecision {
        prompt: Option<String>,
        #[serde(default)]
        params: Option<Map<String, Value>>,
        #[serde(default)]
        output_schema: Option<Value>,
    },
    /// Pure text analysis; receives no plugins. `summarize`, `extract`
    /// and `generate` are accepted as symbolic aliases.
    #[serde(alias = "summarize", alias = "extract", alias = "generate")]
    AiProcessing {
        prompt: Option<String>,
        #[serde(default)]
        params: Option<Map<String, Value>>,
        #[serde(default)]
        output_schema: Option<Value>,
    },
    Transform {
        operation: TransformOperation,
        input: Value,
        #[serde(default)]
        config: Map<String, Value>,
    },
    Conditional {
        condition: Condition,
        #[serde(rename = "trueBranch", alias = "true_branch")]
        true_branch: Option<Box<Step>>,
        #[serde(rename = "falseBranch", alias = "false_branch")]
        false_branch: Option<Box<Step>>,
        #[serde(default)]
        then_steps: Option<Vec<Step>>,
        #[serde(default)]
        else_steps: Option<Vec<Step>>,
    },
    Switch {
        /// Reference whose resolved string selects the case
        evaluate: String,
        /// Case value to the step ids it unlocks
        cases: Map<String, Value>,
        #[serde(default)]
        default: Option<Vec<String>>,
    },
    Loop {
        #[serde(rename = "iterateOver", alias = "iterate_over")]
        iterate_over: Value,
        #[serde(rename = "maxIterations", alias = "max_iterations")]
        max_iterations: Option<usize>,
        #[serde(rename = "loopSteps", alias = "loop_steps")]
        loop_steps: Vec<Step>,
        #[serde(default)]
        parallel: bool,
    },
    Parallel {
        steps: Vec<Step>,
        #[serde(rename = "maxConcurrency", alias = "max_concurrency")]
        max_concurrency: Option<usize>,
    },
    ParallelGroup {
        steps: Vec<Step>,
        #[serde(rename = "maxConcurrency", alias = "max_concurrency")]
        max_concurrency: Option<usize>,
    },
    ScatterGather {
        scatter: ScatterSpec,
        gather: GatherSpec,
    },
    Enrichment {
        sources: Vec<EnrichmentSource>,
        strategy: EnrichmentStrategy,
        #[serde(rename = "joinOn", alias = "join_on")]
        join_on: Option<String>,
        #[serde(rename = "mergeArrays", alias = "merge_arrays", default)]
        merge_arrays: bool,
    },
    Validation {
        input: Value,
        #[serde(default)]
        schema: Option<Value>,
        #[serde(default)]
        rules: Vec<ValidationRule>,
        #[serde(rename = "onValidationFail", alias = "on_validation_fail", default)]
        on_validation_fail: OnValidationFail,
    },
    Comparison {
        left: Value,
        right: Value,
        operation: ComparisonOperation,
        #[serde(rename = "outputFormat", alias = "output_format", default)]
        output_format: ComparisonFormat,
    },
    DeterministicExtraction {
        input: Value,
        #[serde(default)]
        output_schema: Option<Value>,
        #[serde(default)]
        instruction: Option<String>,
        #[serde(default)]
        document_type: Option<String>,
        #[serde(default)]
        ocr_fallback: bool,
    },
    Delay {
        /// Milliseconds
        duration: u64,
    },
    SubWorkflow {
        #[serde(rename = "workflowId", alias = "workflow_id")]
        workflow_id: Option<String>,
        #[serde(rename = "workflowSteps", alias = "workflow_steps")]
        workflow_steps: Option<Vec<Step>>,
        #[serde(default)]
        inputs: Map<String, Value>,
        #[serde(rename = "outputMapping", alias = "output_mapping")]
        output_mapping: Option<Map<String, Value>>,
        #[serde(rename = "inheritContext", alias = "inherit_context", default)]
        inherit_context: bool,
        #[serde(rename = "onError", alias = "on_error", default)]
        on_error: SubWorkflowOnError,
    },
    HumanApproval {
        approvers: Vec<String>,
        #[serde(rename = "approvalType", alias = "approval_type", default)]
        approval_type: ApprovalType,
        title: String,
        #[serde(default)]
        message: Option<String>,
        /// Milliseconds until the request expires
        #[serde(default)]
        timeout: Option<u64>,
        #[serde(rename = "onTimeout", alias = "on_timeout", default)]
        on_timeout: OnApprovalTimeout,
        #[serde(rename = "notificationChannels", alias = "notification_channels", default)]
        notification_channels: Vec<NotificationChannelSpec>,
    },
}

impl StepKind {
    /// The serialized `type` discriminator
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Action { .. } => "action",
            StepKind::LlmDecision { .. } => "llm_decision",
            StepKind::AiProcessing { .. } => "ai_processing",
            StepKind::Transform { .. } => "transform",
            StepKind::Conditional { .. } => "conditional",
            StepKind::Switch { .. } => "switch",
            StepKind::Loop { .. } => "loop",
            StepKind::Parallel { .. } => "parallel",
            StepKind::ParallelGroup { .. } => "parallel_group",
            StepKind::ScatterGather { .. } => "scatter_gather",
            StepKind::Enrichment { .. } => "enrichment",
            StepKind::Validation { .. } => "validation",
            StepKind::Comparison { .. } => "comparison",
            StepKind::DeterministicExtraction { .. } => "deterministic_extraction",
            StepKind::Delay { .. } => "delay",
            StepKind::SubWorkflow { .. } => "sub_workflow",
            StepKind::HumanApproval { .. } => "human_approval",
        }
    }

    /// LLM-family steps eligible for the orchestration hook
    pub fn is_llm_family(&self) -> bool {
        matches!(self, StepKind::LlmDecision { .. } | StepKind::AiProcessing { .. })
    }

    /// Step types whose outputs may be cached
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self,
            StepKind::Action { .. }
                | StepKind::Transform { .. }
                | StepKind::Validation { .. }
                | StepKind::Comparison { .. }
        )
    }
}

/// One node of a workflow
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(rename = "executeIf", alias = "execute_if", default)]
    pub execute_if: Option<Condition>,
    #[serde(rename = "continueOnError", alias = "continue_on_error", default)]
    pub continue_on_error: bool,
    #[serde(rename = "retryPolicy", alias = "retry_policy", default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub cache: Option<CacheSpec>,
    #[serde(rename = "timeoutMs", alias = "timeout_ms", default)]
    pub timeout_ms: Option<u64>,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Whether caching applies: the type must be cacheable and the step
    /// must not have opted out
    pub fn cache_enabled(&self) -> bool {
        self.kind.is_cacheable() && self.cache.as_ref().map(|c| c.is_enabled()).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> Step {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_action_step_parses() {
        let step = parse(json!({
            "id": "s1",
            "name": "Fetch contacts",
            "type": "action",
            "plugin": "crm",
            "action": "list_contacts",
            "params": {"limit": 50},
            "dependencies": ["s0"],
            "continueOnError": true
        }));
        assert_eq!(step.type_name(), "action");
        assert!(step.continue_on_error);
        assert_eq!(step.dependencies, vec!["s0"]);
        match step.kind {
            StepKind::Action { plugin, action, params, .. } => {
                assert_eq!(plugin, "crm");
                assert_eq!(action, "list_contacts");
                assert_eq!(params["limit"], json!(50));
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_symbolic_llm_alias() {
        let step = parse(json!({
            "id": "sum",
            "name": "Summarize thread",
            "type": "summarize",
            "prompt": "Summarize {{step1.data}}"
        }));
        assert_eq!(step.type_name(), "ai_processing");
        assert!(step.kind.is_llm_family());
    }

    #[test]
    fn test_transform_group_alias() {
        let step = parse(json!({
            "id": "g",
            "name": "Group rows",
            "type": "transform",
            "operation": "group_by",
            "input": "{{step1}}",
            "config": {"field": "owner"}
        }));
        match step.kind {
            StepKind::Transform { operation, .. } => {
                assert_eq!(operation, TransformOperation::Group)
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_scatter_gather_parses() {
        let step = parse(json!({
            "id": "sg",
            "name": "Per-email analysis",
            "type": "scatter_gather",
            "scatter": {
                "input": "{{step1.data.emails}}",
                "itemVariable": "email",
                "maxConcurrency": 4,
                "steps": [{
                    "id": "inner",
                    "name": "Score",
                    "type": "transform",
                    "operation": "set",
                    "input": "{{email.score}}",
                    "config": {}
                }]
            },
            "gather": {"operation": "collect", "outputKey": "scores"}
        }));
        match step.kind {
            StepKind::ScatterGather { scatter, gather } => {
                assert_eq!(scatter.item_variable.as_deref(), Some("email"));
                assert_eq!(scatter.max_concurrency, Some(4));
                assert_eq!(gather.operation, GatherOperation::Collect);
                assert_eq!(gather.output_key.as_deref(), Some("scores"));
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_cache_flag_and_config() {
        let step = parse(json!({
            "id": "c",
            "name": "Cached fetch",
            "type": "action",
            "plugin": "mail",
            "action": "list",
            "cache": true
        }));
        assert!(step.cache_enabled());

        let step = parse(json!({
            "id": "c2",
            "name": "Not cached",
            "type": "action",
            "plugin": "mail",
            "action": "list",
            "cache": {"enabled": false}
        }));
        assert!(!step.cache_enabled());

        // llm_decision is never cacheable regardless of the flag
        let step = parse(json!({
            "id": "c3",
            "name": "Decide",
            "type": "llm_decision",
            "prompt": "pick one",
            "cache": true
        }));
        assert!(!step.cache_enabled());
    }

    #[test]
    fn test_snake_case_aliases_accepted() {
        let step = parse(json!({
            "id": "l",
            "name": "Loop",
            "type": "loop",
            "iterate_over": "{{step1.data}}",
            "max_iterations": 5,
            "loop_steps": []
        }));
        match step.kind {
            StepKind::Loop { max_iterations, .. } => assert_eq!(max_iterations, Some(5)),
            other => panic!("unexpected kind {:?}", other),
        }
    }
}
