use std::fmt;

/// Core error types for the flowpilot system
#[derive(Debug)]
pub enum WorkflowError {
    /// Step shape or parameter problems; fatal for the step
    Validation(ValidationError),

    /// The step's underlying call failed (plugin, LLM, transform input)
    Execution(ExecutionError),

    /// A `{{...}}` reference could not be resolved; always fatal for the step
    VariableResolution(VariableResolutionError),

    /// Predicate evaluation failed
    Condition(ConditionError),

    /// Internal engine errors
    Internal(String),
}

/// Step-definition and parameter validation errors
#[derive(Debug)]
pub enum ValidationError {
    /// Workflow document is malformed
    InvalidDefinition(String),

    /// Step id appears more than once
    DuplicateStepId(String),

    /// A step names a dependency that does not exist
    UnknownDependency { step: String, dependency: String },

    /// The dependency graph contains a cycle
    CircularDependency(String),

    /// A step carries a type the dispatcher does not know
    UnknownStepType { step: String, step_type: String },

    /// A required field is missing from a step definition
    MissingField { step: String, field: String },

    /// Definition or output failed JSON-schema validation
    SchemaViolation(String),

    /// A validation step's rules rejected the input
    RuleFailed { step: String, details: String },
}

/// Errors raised while executing a step's underlying call
#[derive(Debug)]
pub enum ExecutionError {
    /// Plugin returned a failure or could not be invoked
    PluginFailure { plugin: String, action: String, message: String },

    /// LLM runtime returned a failure
    LlmFailure(String),

    /// Transform received data it cannot operate on
    InvalidTransformInput { operation: String, message: String },

    /// Transform failed mid-operation
    TransformFailure { operation: String, message: String },

    /// Step exceeded its timeout
    Timeout { step: String, timeout_ms: u64 },

    /// Run was cancelled while the step was pending or in flight
    Cancelled,

    /// Circuit breaker is open for this component
    CircuitOpen { component: String },

    /// Human approval expired without a decision
    ApprovalTimeout { step: String },

    /// Human approval was rejected
    ApprovalRejected { step: String, by: String },

    /// A nested workflow failed
    SubWorkflowFailure { workflow: String, message: String },

    /// Sub-workflow id could not be resolved through the registry
    UnknownWorkflow(String),
}

/// A `{{path}}` reference that could not be resolved against the run state
#[derive(Debug)]
pub struct VariableResolutionError {
    pub reference: String,
    pub step_id: Option<String>,
    pub reason: String,
}

/// Predicate evaluation errors
#[derive(Debug)]
pub enum ConditionError {
    /// Operator string did not parse
    UnknownOperator(String),

    /// Operands cannot be compared with the given operator
    NotComparable { operator: String, detail: String },

    /// Raw expression failed to evaluate
    BadExpression(String),
}

impl WorkflowError {
    /// Stable machine-readable code surfaced in step metadata
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::Validation(e) => e.code(),
            WorkflowError::Execution(e) => e.code(),
            WorkflowError::VariableResolution(_) => "VARIABLE_RESOLUTION_FAILED",
            WorkflowError::Condition(_) => "CONDITION_EVALUATION_FAILED",
            WorkflowError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::UnknownStepType { .. } => "UNKNOWN_STEP_TYPE",
            ValidationError::RuleFailed { .. } => "VALIDATION_FAILED",
            ValidationError::CircularDependency(_) => "CIRCULAR_DEPENDENCY",
            _ => "INVALID_DEFINITION",
        }
    }
}

impl ExecutionError {
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::PluginFailure { .. } => "PLUGIN_EXECUTION_FAILED",
            ExecutionError::LlmFailure(_) => "LLM_EXECUTION_FAILED",
            ExecutionError::InvalidTransformInput { .. } => "INVALID_TRANSFORM_INPUT",
            ExecutionError::TransformFailure { .. } => "TRANSFORM_FAILED",
            ExecutionError::Timeout { .. } => "STEP_TIMEOUT",
            ExecutionError::Cancelled => "EXECUTION_CANCELLED",
            ExecutionError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            ExecutionError::ApprovalTimeout { .. } => "APPROVAL_TIMEOUT",
            ExecutionError::ApprovalRejected { .. } => "APPROVAL_REJECTED",
            ExecutionError::SubWorkflowFailure { .. } => "SUB_WORKFLOW_FAILED",
            ExecutionError::UnknownWorkflow(_) => "UNKNOWN_WORKFLOW",
        }
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowError::Validation(e) => write!(f, "Validation error: {}", e),
            WorkflowError::Execution(e) => write!(f, "Execution error: {}", e),
            WorkflowError::VariableResolution(e) => write!(f, "Variable resolution error: {}", e),
            WorkflowError::Condition(e) => write!(f, "Condition error: {}", e),
            WorkflowError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::InvalidDefinition(msg) => {
                write!(f, "Invalid workflow definition: {}", msg)
            }
            ValidationError::DuplicateStepId(id) => write!(f, "Duplicate step id: {}", id),
            ValidationError::UnknownDependency { step, dependency } => {
                write!(f, "Step '{}' depends on non-existent step '{}'", step, dependency)
            }
            ValidationError::CircularDependency(msg) => {
                write!(f, "Circular dependency detected: {}", msg)
            }
            ValidationError::UnknownStepType { step, step_type } => {
                write!(f, "Step '{}' has unknown type '{}'", step, step_type)
            }
            ValidationError::MissingField { step, field } => {
                write!(f, "Step '{}' is missing required field '{}'", step, field)
            }
            ValidationError::SchemaViolation(msg) => {
                write!(f, "Schema validation failed: {}", msg)
            }
            ValidationError::RuleFailed { step, details } => {
                write!(f, "Validation rules failed for step '{}': {}", step, details)
            }
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::PluginFailure { plugin, action, message } => {
                write!(f, "Plugin '{}.{}' failed: {}", plugin, action, message)
            }
            ExecutionError::LlmFailure(msg) => write!(f, "LLM call failed: {}", msg),
            ExecutionError::InvalidTransformInput { operation, message } => {
                write!(f, "Transform '{}' received invalid input: {}", operation, message)
            }
            ExecutionError::TransformFailure { operation, message } => {
                write!(f, "Transform '{}' failed: {}", operation, message)
            }
            ExecutionError::Timeout { step, timeout_ms } => {
                write!(f, "Step '{}' exceeded timeout of {} ms", step, timeout_ms)
            }
            ExecutionError::Cancelled => write!(f, "Execution was cancelled"),
            ExecutionError::CircuitOpen { component } => {
                write!(f, "Circuit breaker open for component '{}'", component)
            }
            ExecutionError::ApprovalTimeout { step } => {
                write!(f, "Approval for step '{}' timed out", step)
            }
            ExecutionError::ApprovalRejected { step, by } => {
                write!(f, "Approval for step '{}' was rejected by {}", step, by)
            }
            ExecutionError::SubWorkflowFailure { workflow, message } => {
                write!(f, "Sub-workflow '{}' failed: {}", workflow, message)
            }
            ExecutionError::UnknownWorkflow(id) => write!(f, "Unknown workflow id: {}", id),
        }
    }
}

impl fmt::Display for VariableResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step_id {
            Some(step) => write!(
                f,
                "Cannot resolve '{{{{{}}}}}' in step '{}': {}",
                self.reference, step, self.reason
            ),
            None => write!(f, "Cannot resolve '{{{{{}}}}}': {}", self.reference, self.reason),
        }
    }
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionError::UnknownOperator(op) => write!(f, "Unknown operator: {}", op),
            ConditionError::NotComparable { operator, detail } => {
                write!(f, "Operands not comparable with '{}': {}", operator, detail)
            }
            ConditionError::BadExpression(msg) => write!(f, "Bad expression: {}", msg),
        }
    }
}

impl std::error::Error for WorkflowError {}
impl std::error::Error for ValidationError {}
impl std::error::Error for ExecutionError {}
impl std::error::Error for VariableResolutionError {}
impl std::error::Error for ConditionError {}

impl From<ValidationError> for WorkflowError {
    fn from(err: ValidationError) -> Self {
        WorkflowError::Validation(err)
    }
}

impl From<ExecutionError> for WorkflowError {
    fn from(err: ExecutionError) -> Self {
        WorkflowError::Execution(err)
    }
}

impl From<VariableResolutionError> for WorkflowError {
    fn from(err: VariableResolutionError) -> Self {
        WorkflowError::VariableResolution(err)
    }
}

impl From<ConditionError> for WorkflowError {
    fn from(err: ConditionError) -> Self {
        WorkflowError::Condition(err)
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        WorkflowError::Validation(ValidationError::InvalidDefinition(err.to_string()))
    }
}

impl VariableResolutionError {
    pub fn new(reference: &str, reason: &str) -> Self {
        Self {
            reference: reference.to_string(),
            step_id: None,
            reason: reason.to_string(),
        }
    }

    pub fn in_step(mut self, step_id: &str) -> Self {
        self.step_id = Some(step_id.to_string());
        self
    }
}

/// Result type alias for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;
