//! Workflow documents
//!
//! The engine consumes workflow definitions; it does not author them.
//! Documents load from JSON or YAML, are checked against the generated
//! JSON schema, and then structurally validated (unique ids, known
//! dependencies). Cycle detection is the planner's job.

use crate::error::{ValidationError, WorkflowResult};
use crate::step::{Step, StepKind};
use anyhow::{anyhow, Error};
use jsonschema::{Draft, JSONSchema};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A declarative workflow definition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Workflow {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub steps: Vec<Step>,
    /// Bound on concurrently running steps within a plan level
    #[serde(rename = "maxConcurrency", alias = "max_concurrency", default)]
    pub max_concurrency: Option<usize>,
    /// Overall run timeout in milliseconds
    #[serde(rename = "timeoutMs", alias = "timeout_ms", default)]
    pub timeout_ms: Option<u64>,
}

pub fn workflow_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(Workflow)
}

/// Validate a YAML workflow document against the generated schema
pub fn validate_workflow_yaml(yaml: &str) -> Result<(), Error> {
    let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    let instance = serde_json::to_value(&value)?;
    validate_workflow_value(&instance)
}

/// Validate a JSON workflow document against the generated schema
pub fn validate_workflow_json(json: &str) -> Result<(), Error> {
    let instance: serde_json::Value = serde_json::from_str(json)?;
    validate_workflow_value(&instance)
}

fn validate_workflow_value(instance: &serde_json::Value) -> Result<(), Error> {
    let schema = workflow_schema();
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&serde_json::to_value(&schema)?)
        .map_err(|e| anyhow!("schema compilation failed: {}", e))?;
    compiled
        .validate(instance)
        .map(|_| ())
        .map_err(|errors| anyhow!(errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ")))
}

/// Load a workflow from YAML, schema-checking first
pub fn workflow_from_yaml(yaml: &str) -> Result<Workflow, Error> {
    validate_workflow_yaml(yaml)?;
    let workflow: Workflow = serde_yaml::from_str(yaml)?;
    workflow.validate()?;
    Ok(workflow)
}

/// Load a workflow from JSON, schema-checking first
pub fn workflow_from_json(json: &str) -> Result<Workflow, Error> {
    validate_workflow_json(json)?;
    let workflow: Workflow = serde_json::from_str(json)?;
    workflow.validate()?;
    Ok(workflow)
}

impl Workflow {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Structural validation: ids unique and non-empty, every referenced
    /// dependency and switch target exists
    pub fn validate(&self) -> WorkflowResult<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                return Err(ValidationError::InvalidDefinition(format!(
                    "step '{}' has an empty id",
                    step.name
                ))
                .into());
            }
            if !seen.insert(step.id.as_str()) {
                return Err(ValidationError::DuplicateStepId(step.id.clone()).into());
            }
        }

        let ids: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        for step in &self.steps {
            for dep in &step.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(ValidationError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    }
                    .into());
                }
            }
            if let StepKind::Switch { cases, default, .. } = &step.kind {
                let case_targets = cases
                    .values()
                    .filter_map(|v| v.as_array())
                    .flatten()
                    .filter_map(|v| v.as_str());
                let default_targets = default.iter().flatten().map(|s| s.as_str());
                for id in case_targets.chain(default_targets) {
                    if !ids.contains(id) {
                        return Err(ValidationError::UnknownDependency {
                            step: step.id.clone(),
                            dependency: id.to_string(),
                        }
                        .into());
                    }
                }
            }
        }
        Ok(())
    }
}
