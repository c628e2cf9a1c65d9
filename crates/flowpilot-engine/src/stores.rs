//! In-memory collaborator implementations
//!
//! The engine is testable and embeddable without external persistence:
//! these stores keep step-execution rows, audit events, token usage and
//! approval decisions in memory. Production deployments supply their own
//! implementations of the same traits.

use anyhow::Result;
use async_trait::async_trait;
use flowpilot_core::traits::{ApprovalTracker, AuditSink, StateManager, WorkflowRegistry};
use flowpilot_core::types::{
    ApprovalDecision, ApprovalRequest, AuditEvent, StepMetadata, TokenUsage,
};
use flowpilot_core::workflow::Workflow;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// One recorded step-execution row
#[derive(Debug, Clone, Serialize)]
pub struct StepExecutionRow {
    pub execution_id: String,
    pub step_id: String,
    pub name: String,
    pub step_type: String,
    pub status: String,
    pub metadata: StepMetadata,
    pub error_message: Option<String>,
}

/// One recorded token-usage row
#[derive(Debug, Clone, Serialize)]
pub struct TokenUsageRow {
    pub execution_id: String,
    pub step_id: String,
    pub usage: TokenUsage,
    pub source: String,
}

/// In-memory state manager collecting rows for inspection
#[derive(Default)]
pub struct MemoryStateManager {
    pub rows: Mutex<Vec<StepExecutionRow>>,
    pub token_rows: Mutex<Vec<TokenUsageRow>>,
}

impl MemoryStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows_for(&self, step_id: &str) -> Vec<StepExecutionRow> {
        self.rows
            .lock()
            .expect("rows lock")
            .iter()
            .filter(|row| row.step_id == step_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StateManager for MemoryStateManager {
    async fn log_step_execution(
        &self,
        execution_id: &str,
        step_id: &str,
        name: &str,
        step_type: &str,
        status: &str,
        metadata: &StepMetadata,
    ) -> Result<()> {
        self.rows.lock().expect("rows lock").push(StepExecutionRow {
            execution_id: execution_id.to_string(),
            step_id: step_id.to_string(),
            name: name.to_string(),
            step_type: step_type.to_string(),
            status: status.to_string(),
            metadata: metadata.clone(),
            error_message: None,
        });
        Ok(())
    }

    async fn update_step_execution(
        &self,
        execution_id: &str,
        step_id: &str,
        status: &str,
        metadata: &StepMetadata,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut rows = self.rows.lock().expect("rows lock");
        if let Some(row) = rows
            .iter_mut()
            .rev()
            .find(|row| row.execution_id == execution_id && row.step_id == step_id)
        {
            row.status = status.to_string();
            row.metadata = metadata.clone();
            row.error_message = error_message.map(|m| m.to_string());
        }
        Ok(())
    }

    async fn record_token_usage(
        &self,
        execution_id: &str,
        step_id: &str,
        usage: &TokenUsage,
        source: &str,
    ) -> Result<()> {
        self.token_rows
            .lock()
            .expect("token lock")
            .push(TokenUsageRow {
                execution_id: execution_id.to_string(),
                step_id: step_id.to_string(),
                usage: *usage,
                source: source.to_string(),
            });
        Ok(())
    }
}

/// In-memory append-only audit sink
#[derive(Default)]
pub struct MemoryAuditSink {
    pub events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<()> {
        self.events.lock().expect("events lock").push(event);
        Ok(())
    }
}

/// In-memory approval tracker; decisions are posted by tests or embedders
pub struct MemoryApprovalTracker {
    pending: Mutex<HashMap<String, ApprovalDecision>>,
    notify: Notify,
}

impl Default for MemoryApprovalTracker {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }
}

impl MemoryApprovalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post a decision for a pending approval
    pub fn decide(&self, approval_id: &str, decision: ApprovalDecision) {
        self.pending
            .lock()
            .expect("pending lock")
            .insert(approval_id.to_string(), decision);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl ApprovalTracker for MemoryApprovalTracker {
    async fn create(&self, request: ApprovalRequest) -> Result<String> {
        Ok(request.approval_id)
    }

    async fn wait(&self, approval_id: &str, timeout: Duration) -> Result<ApprovalDecision> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(decision) = self
                .pending
                .lock()
                .expect("pending lock")
                .remove(approval_id)
            {
                return Ok(decision);
            }
            // bounded poll interval so a wake lost to the check/register
            // race only delays, never deadlocks
            let wake = tokio::time::timeout(Duration::from_millis(25), notified);
            if tokio::time::timeout_at(deadline, wake).await.is_err() {
                return Ok(ApprovalDecision::TimedOut);
            }
        }
    }
}

/// In-memory workflow registry for sub-workflow lookup
#[derive(Default)]
pub struct MemoryWorkflowRegistry {
    workflows: Mutex<HashMap<String, Workflow>>,
}

impl MemoryWorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str, workflow: Workflow) {
        self.workflows
            .lock()
            .expect("workflows lock")
            .insert(id.to_string(), workflow);
    }
}

#[async_trait]
impl WorkflowRegistry for MemoryWorkflowRegistry {
    async fn get(&self, workflow_id: &str) -> Result<Option<Workflow>> {
        Ok(self
            .workflows
            .lock()
            .expect("workflows lock")
            .get(workflow_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn test_state_rows_update() {
        let state = MemoryStateManager::new();
        let metadata = StepMetadata::success(5);
        state
            .log_step_execution("e", "s1", "Step 1", "action", "running", &metadata)
            .await
            .unwrap();
        state
            .update_step_execution("e", "s1", "completed", &metadata, None)
            .await
            .unwrap();
        let rows = state.rows_for("s1");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "completed");
    }

    #[tokio::test]
    async fn test_approval_wait_and_decide() {
        let tracker = std::sync::Arc::new(MemoryApprovalTracker::new());
        let request = ApprovalRequest {
            approval_id: "ap".into(),
            execution_id: "e".into(),
            step_id: "s".into(),
            title: "t".into(),
            message: None,
            approvers: vec![],
            approval_type: "any".into(),
            context: json!({}),
            expires_at: Utc::now(),
            created_at: Utc::now(),
        };
        let id = tracker.create(request).await.unwrap();

        let waiter = tracker.clone();
        let handle = tokio::spawn(async move {
            waiter.wait(&id, Duration::from_secs(5)).await.unwrap()
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.decide(
            "ap",
            ApprovalDecision::Approved {
                by: "x".into(),
                comment: None,
            },
        );
        let decision = handle.await.unwrap();
        assert!(matches!(decision, ApprovalDecision::Approved { .. }));
    }

    #[tokio::test]
    async fn test_approval_timeout() {
        let tracker = MemoryApprovalTracker::new();
        let decision = tracker
            .wait("missing", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(decision, ApprovalDecision::TimedOut);
    }
}
