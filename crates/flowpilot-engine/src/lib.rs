//! Flowpilot Engine Library
//!
//! The execution engine for declarative, typed workflows: a dependency
//! scheduler walking the plan level by level, a per-run execution context
//! with variable resolution and token/time accounting, a typed step
//! dispatcher with handlers for plugin actions, LLM decisions, data
//! transforms, conditionals, fan-out and approvals, plus the cache,
//! retry/circuit-breaker and batch-calibration machinery around them.
//!
//! # Example
//!
//! ```rust,no_run
//! use flowpilot_core::config::EngineSettings;
//! use flowpilot_core::workflow::workflow_from_yaml;
//! use flowpilot_engine::dispatcher::StepDispatcher;
//! use flowpilot_engine::engine::{RunOptions, WorkflowEngine};
//! use flowpilot_engine::events::EventBus;
//! use flowpilot_engine::stores::MemoryStateManager;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let settings = EngineSettings::from_env();
//! let state = Arc::new(MemoryStateManager::new());
//! let dispatcher = StepDispatcher::new(state, EventBus::new(), settings.clone());
//! let engine = WorkflowEngine::new(dispatcher, EventBus::new(), settings);
//!
//! let workflow = workflow_from_yaml("name: demo\nsteps: []")?;
//! let result = engine
//!     .execute(&workflow, RunOptions::default(), CancellationToken::new())
//!     .await?;
//! println!("run {} success={}", result.execution_id, result.success);
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod approval;
pub mod cache;
pub mod calibration;
pub mod conditional;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod expression;
pub mod llm;
pub mod notify;
pub mod parallel;
pub mod planner;
pub mod resolver;
pub mod retry;
pub mod shape;
pub mod stores;
pub mod transform;
pub mod vision;
