//! Human approval steps
//!
//! Builds the approval request, fans it out to the configured channels,
//! then blocks on the approval tracker until a decision lands or the
//! timeout elapses. `onTimeout` decides whether an expired request fails
//! the step or resolves it.

use crate::context::ExecutionContext;
use crate::notify::Notifier;
use chrono::{Duration as ChronoDuration, Utc};
use flowpilot_core::error::{ExecutionError, WorkflowError};
use flowpilot_core::step::{ApprovalType, NotificationChannelSpec, OnApprovalTimeout};
use flowpilot_core::traits::ApprovalTracker;
use flowpilot_core::types::{ApprovalDecision, ApprovalRequest};
use log::{info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

#[allow(clippy::too_many_arguments)]
pub async fn execute_human_approval(
    tracker: &Arc<dyn ApprovalTracker>,
    notifier: &Notifier,
    ctx: &ExecutionContext,
    step_id: &str,
    approvers: &[String],
    approval_type: ApprovalType,
    title: &str,
    message: Option<&str>,
    timeout_ms: Option<u64>,
    on_timeout: OnApprovalTimeout,
    channels: &[NotificationChannelSpec],
) -> Result<Value, WorkflowError> {
    let timeout_ms = timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
    let now = Utc::now();
    let request = ApprovalRequest {
        approval_id: Uuid::new_v4().to_string(),
        execution_id: ctx.execution_id.clone(),
        step_id: step_id.to_string(),
        title: title.to_string(),
        message: message.map(|m| m.to_string()),
        approvers: approvers.to_vec(),
        approval_type: approval_type.to_string(),
        context: json!({
            "workflow": ctx.agent.name,
            "completed_steps": ctx.completed_steps,
        }),
        expires_at: now + ChronoDuration::milliseconds(timeout_ms as i64),
        created_at: now,
    };

    let approval_id = tracker
        .create(request.clone())
        .await
        .map_err(|e| WorkflowError::Internal(format!("approval tracking failed: {}", e)))?;
    info!("approval '{}' created for step '{}'", approval_id, step_id);

    notifier.notify_all(channels, &request).await;

    let decision = tracker
        .wait(&approval_id, Duration::from_millis(timeout_ms))
        .await
        .map_err(|e| WorkflowError::Internal(format!("approval wait failed: {}", e)))?;

    match decision {
        ApprovalDecision::Approved { by, comment } => Ok(json!({
            "approved": true,
            "approval_id": approval_id,
            "decided_by": by,
            "comment": comment,
        })),
        ApprovalDecision::Rejected { by, .. } => Err(WorkflowError::Execution(
            ExecutionError::ApprovalRejected {
                step: step_id.to_string(),
                by,
            },
        )),
        ApprovalDecision::TimedOut => match on_timeout {
            OnApprovalTimeout::Approve => {
                warn!("approval '{}' timed out; step configured to auto-approve", approval_id);
                Ok(json!({
                    "approved": true,
                    "approval_id": approval_id,
                    "decided_by": "timeout_policy",
                }))
            }
            OnApprovalTimeout::Reject | OnApprovalTimeout::Fail => Err(WorkflowError::Execution(
                ExecutionError::ApprovalTimeout {
                    step: step_id.to_string(),
                },
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use flowpilot_core::config::EngineSettings;
    use flowpilot_core::types::AgentProfile;
    use std::sync::Mutex;

    struct ScriptedTracker {
        decision: Mutex<Option<ApprovalDecision>>,
        created: Mutex<Vec<ApprovalRequest>>,
    }

    #[async_trait]
    impl ApprovalTracker for ScriptedTracker {
        async fn create(&self, request: ApprovalRequest) -> Result<String> {
            let id = request.approval_id.clone();
            self.created.lock().unwrap().push(request);
            Ok(id)
        }

        async fn wait(&self, _approval_id: &str, _timeout: Duration) -> Result<ApprovalDecision> {
            Ok(self
                .decision
                .lock()
                .unwrap()
                .take()
                .unwrap_or(ApprovalDecision::TimedOut))
        }
    }

    fn tracker_with(decision: ApprovalDecision) -> Arc<ScriptedTracker> {
        Arc::new(ScriptedTracker {
            decision: Mutex::new(Some(decision)),
            created: Mutex::new(Vec::new()),
        })
    }

    async fn run(
        tracker: Arc<ScriptedTracker>,
        on_timeout: OnApprovalTimeout,
    ) -> Result<Value, WorkflowError> {
        let dyn_tracker: Arc<dyn ApprovalTracker> = tracker;
        let notifier = Notifier::new(&EngineSettings::default());
        let ctx = ExecutionContext::new("exec", "user", AgentProfile::default());
        execute_human_approval(
            &dyn_tracker,
            &notifier,
            &ctx,
            "gate",
            &["lead@example.com".to_string()],
            ApprovalType::Any,
            "Send it?",
            None,
            Some(50),
            on_timeout,
            &[],
        )
        .await
    }

    #[tokio::test]
    async fn test_approved() {
        let tracker = tracker_with(ApprovalDecision::Approved {
            by: "lead@example.com".into(),
            comment: Some("go".into()),
        });
        let out = run(tracker.clone(), OnApprovalTimeout::Fail).await.unwrap();
        assert_eq!(out["approved"], json!(true));
        assert_eq!(out["decided_by"], json!("lead@example.com"));
        assert_eq!(tracker.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_fails_step() {
        let tracker = tracker_with(ApprovalDecision::Rejected {
            by: "lead@example.com".into(),
            comment: None,
        });
        let err = run(tracker, OnApprovalTimeout::Fail).await.unwrap_err();
        assert_eq!(err.code(), "APPROVAL_REJECTED");
    }

    #[tokio::test]
    async fn test_timeout_policies() {
        let err = run(tracker_with(ApprovalDecision::TimedOut), OnApprovalTimeout::Fail)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "APPROVAL_TIMEOUT");

        let out = run(tracker_with(ApprovalDecision::TimedOut), OnApprovalTimeout::Approve)
            .await
            .unwrap();
        assert_eq!(out["decided_by"], json!("timeout_policy"));
    }
}
