//! Batch-calibration error handling
//!
//! In calibration mode the run collects and classifies failures instead of
//! failing fast: recoverable categories become `CollectedIssue` records and
//! the run continues with dependents of unrecoverable failures skipped.
//! Auth, logic, capability and ordering problems still stop the run; there
//! is nothing useful to collect downstream of those.

use flowpilot_core::error::WorkflowError;
use flowpilot_core::types::{CollectedIssue, IssueCategory, IssueSeverity};

/// Classify an error by its stable code first, then by text heuristics
pub fn classify(error: &WorkflowError) -> IssueCategory {
    match error.code() {
        "INVALID_TRANSFORM_INPUT" | "TRANSFORM_FAILED" => return IssueCategory::DataShapeMismatch,
        "VARIABLE_RESOLUTION_FAILED" => return IssueCategory::DataUnavailable,
        "CONDITION_EVALUATION_FAILED" => return IssueCategory::LogicError,
        "UNKNOWN_STEP_TYPE" | "UNKNOWN_WORKFLOW" => return IssueCategory::CapabilityMismatch,
        "CIRCULAR_DEPENDENCY" => return IssueCategory::InvalidStepOrder,
        "STEP_TIMEOUT" => return IssueCategory::ExecutionTimeout,
        "VALIDATION_FAILED" => return IssueCategory::ExecutionParameter,
        _ => {}
    }
    classify_text(&error.to_string())
}

/// Text-level heuristics for errors surfaced by plugins and runtimes
pub fn classify_text(text: &str) -> IssueCategory {
    let lowered = text.to_lowercase();

    if ["401", "403", "unauthorized", "forbidden", "invalid credentials", "api key", "expired token"]
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        return IssueCategory::ExecutionAuth;
    }
    if ["429", "rate limit", "quota exceeded", "too many requests"]
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        return IssueCategory::ExecutionRateLimit;
    }
    if ["timeout", "timed out", "deadline exceeded"]
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        return IssueCategory::ExecutionTimeout;
    }
    if ["missing required", "invalid parameter", "invalid argument", "bad request", "400"]
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        return IssueCategory::ExecutionParameter;
    }
    if ["no array", "unexpected shape", "cannot read", "not an array", "wrong type"]
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        return IssueCategory::DataShapeMismatch;
    }
    if ["not found", "404", "no data", "empty result", "does not exist"]
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        return IssueCategory::DataUnavailable;
    }
    if ["unsupported", "not supported", "unknown action", "unknown plugin"]
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        return IssueCategory::CapabilityMismatch;
    }
    IssueCategory::LogicError
}

fn severity_for(category: IssueCategory) -> IssueSeverity {
    match category {
        IssueCategory::ExecutionAuth => IssueSeverity::Critical,
        IssueCategory::LogicError
        | IssueCategory::CapabilityMismatch
        | IssueCategory::MissingStep
        | IssueCategory::InvalidStepOrder => IssueSeverity::High,
        IssueCategory::ExecutionTimeout | IssueCategory::ExecutionRateLimit => IssueSeverity::Medium,
        IssueCategory::ExecutionParameter | IssueCategory::DataShapeMismatch => IssueSeverity::Medium,
        IssueCategory::DataUnavailable => IssueSeverity::Low,
    }
}

fn suggested_fix(category: IssueCategory) -> Option<String> {
    let fix = match category {
        IssueCategory::ExecutionAuth => "Reconnect the integration or refresh its credentials",
        IssueCategory::ExecutionRateLimit => "Lower concurrency or add a retry policy with backoff",
        IssueCategory::ExecutionTimeout => "Raise the step timeout or narrow the requested data",
        IssueCategory::ExecutionParameter => "Check the step parameters against the action schema",
        IssueCategory::DataShapeMismatch => {
            "Point the transform input at the collection field of the upstream output"
        }
        IssueCategory::DataUnavailable => "Verify the upstream step produced the referenced data",
        IssueCategory::MissingStep => "Add the missing step or fix the dependency id",
        IssueCategory::InvalidStepOrder => "Reorder the steps so dependencies resolve",
        IssueCategory::LogicError | IssueCategory::CapabilityMismatch => return None,
    };
    Some(fix.to_string())
}

/// Parameter and shape problems can usually be rewritten mechanically
fn auto_repairable(category: IssueCategory) -> bool {
    matches!(
        category,
        IssueCategory::ExecutionParameter | IssueCategory::DataShapeMismatch
    )
}

/// Build the issue record for a failed step
pub fn collect(step_id: &str, error: &WorkflowError) -> CollectedIssue {
    let category = classify(error);
    CollectedIssue {
        category,
        severity: severity_for(category),
        affected_steps: vec![step_id.to_string()],
        message: error.to_string(),
        suggested_fix: suggested_fix(category),
        auto_repair_available: auto_repairable(category),
    }
}

/// Whether the run may continue collecting after this issue
pub fn may_continue(issue: &CollectedIssue) -> bool {
    !issue.category.halts_run()
}
