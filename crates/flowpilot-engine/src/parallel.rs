//! Fan-out execution: parallel groups, loops, scatter-gather
//!
//! Children never share mutable state: each branch runs on a
//! metrics-reset clone of the parent context and is merged back in input
//! order, so the final state is deterministic regardless of completion
//! order. Concurrency is bounded by a semaphore; a cancellation token
//! stops new dispatches while in-flight steps finish their current call.

use crate::context::ExecutionContext;
use crate::expression::evaluate_raw;
use crate::resolver::resolve_value;
use crate::shape::unwrap_structured_output;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use flowpilot_core::error::{ExecutionError, ValidationError, WorkflowError};
use flowpilot_core::step::{GatherOperation, GatherSpec, ScatterSpec, Step};
use flowpilot_core::types::StepOutput;
use log::{debug, warn};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Capability to execute one step against a context. The dispatcher
/// implements this; taking it as a trait breaks the dispatcher/parallel
/// cycle.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run_step(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, WorkflowError>;
}

/// Run a sequence of steps on one context, stopping on the first fatal
/// error. Returns the last step's data.
pub async fn run_sequence(
    runner: &Arc<dyn StepRunner>,
    ctx: &mut ExecutionContext,
    steps: &[Step],
    cancel: &CancellationToken,
) -> Result<Value, WorkflowError> {
    let mut last = Value::Null;
    for step in steps {
        if cancel.is_cancelled() {
            return Err(WorkflowError::Execution(ExecutionError::Cancelled));
        }
        let output = runner.run_step(step, ctx, cancel).await?;
        last = output.data;
    }
    Ok(last)
}

/// Run independent steps concurrently on cloned contexts. Returns
/// `step id -> data` (or the full outputs when `full_outputs` is set,
/// the parallel-group shape).
pub async fn execute_parallel(
    runner: &Arc<dyn StepRunner>,
    ctx: &mut ExecutionContext,
    steps: &[Step],
    max_concurrency: Option<usize>,
    full_outputs: bool,
    cancel: &CancellationToken,
) -> Result<Value, WorkflowError> {
    let permits = max_concurrency.unwrap_or(steps.len().max(1));
    let semaphore = Arc::new(Semaphore::new(permits.max(1)));
    let mut join_set: JoinSet<(usize, ExecutionContext, Option<WorkflowError>)> = JoinSet::new();

    for (index, step) in steps.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        let runner = Arc::clone(runner);
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        let step = step.clone();
        let mut child = ctx.clone_for_branch(true);

        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result = runner.run_step(&step, &mut child, &cancel).await;
            (index, child, result.err())
        });
    }

    // children merge back even on failure so their recorded failure
    // outputs survive; errors keep the lowest input index
    let mut children: Vec<Option<(ExecutionContext, Option<WorkflowError>)>> =
        (0..steps.len()).map(|_| None).collect();
    let mut join_error: Option<WorkflowError> = None;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((index, child, error)) => {
                if let Some(e) = &error {
                    warn!("parallel child '{}' failed: {}", steps[index].id, e);
                }
                children[index] = Some((child, error));
            }
            Err(e) => {
                if join_error.is_none() {
                    join_error = Some(WorkflowError::Internal(format!("join error: {}", e)));
                }
            }
        }
    }

    // deterministic merge in input order, regardless of completion order
    let mut first_error = join_error;
    for (child, error) in children.into_iter().flatten() {
        ctx.merge(child);
        if first_error.is_none() {
            first_error = error;
        }
    }
    if let Some(error) = first_error {
        return Err(error);
    }

    let mut result = Map::new();
    for step in steps {
        if let Some(output) = ctx.get_step_output(&step.id) {
            let value = if full_outputs {
                serde_json::to_value(output)
                    .map_err(|e| WorkflowError::Internal(e.to_string()))?
            } else {
                output.data.clone()
            };
            result.insert(step.id.clone(), value);
        }
    }
    Ok(Value::Object(result))
}

/// Iterate over a resolved collection, sequentially or in parallel
#[allow(clippy::too_many_arguments)]
pub async fn execute_loop(
    runner: &Arc<dyn StepRunner>,
    ctx: &mut ExecutionContext,
    iterate_over: &Value,
    max_iterations: Option<usize>,
    loop_steps: &[Step],
    parallel: bool,
    cancel: &CancellationToken,
) -> Result<Value, WorkflowError> {
    let resolved = resolve_value(ctx, iterate_over)?;
    let mut items = unwrap_structured_output(&resolved, None).ok_or_else(|| {
        WorkflowError::Execution(ExecutionError::InvalidTransformInput {
            operation: "loop".to_string(),
            message: "iterateOver did not resolve to an array".to_string(),
        })
    })?;
    if let Some(cap) = max_iterations {
        items.truncate(cap);
    }
    let total = items.len();
    debug!("loop over {} item(s), parallel={}", total, parallel);

    let results: Vec<Value> = if parallel {
        let mut join_set: JoinSet<(usize, ExecutionContext, Result<Value, WorkflowError>)> =
            JoinSet::new();
        for (index, item) in items.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            let runner = Arc::clone(runner);
            let cancel = cancel.clone();
            let steps = loop_steps.to_vec();
            let mut child = ctx.clone_for_branch(true);
            bind_iteration(&mut child, item.clone(), None, index, total);

            join_set.spawn(async move {
                let result = run_sequence(&runner, &mut child, &steps, &cancel).await;
                (index, child, result)
            });
        }

        let mut slots: Vec<Option<(ExecutionContext, Result<Value, WorkflowError>)>> =
            (0..total).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, child, result)) => slots[index] = Some((child, result)),
                Err(e) => {
                    return Err(WorkflowError::Internal(format!("join error: {}", e)))
                }
            }
        }

        // merge each child exactly once, in input order
        let mut first_error = None;
        let mut collected = Vec::with_capacity(total);
        for (child, result) in slots.into_iter().flatten() {
            ctx.merge(child);
            match result {
                Ok(value) => collected.push(value),
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(_) => {}
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }
        collected
    } else {
        let mut collected = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(WorkflowError::Execution(ExecutionError::Cancelled));
            }
            bind_iteration(ctx, item, None, index, total);
            let value = run_sequence(runner, ctx, loop_steps, cancel).await?;
            collected.push(value);
        }
        collected
    };

    clear_iteration(ctx, None);
    Ok(json!({
        "results": results,
        "iterations": results.len(),
        "count": results.len(),
    }))
}

/// Scatter a collection across per-item plans, then gather
pub async fn execute_scatter_gather(
    runner: &Arc<dyn StepRunner>,
    ctx: &mut ExecutionContext,
    scatter: &ScatterSpec,
    gather: &GatherSpec,
    cancel: &CancellationToken,
) -> Result<Value, WorkflowError> {
    if gather.operation == GatherOperation::Reduce && gather.reduce_expression.is_none() {
        return Err(WorkflowError::Validation(ValidationError::MissingField {
            step: "scatter_gather".to_string(),
            field: "gather.reduceExpression".to_string(),
        }));
    }

    let resolved = resolve_value(ctx, &scatter.input)?;
    let items = unwrap_structured_output(&resolved, None).ok_or_else(|| {
        WorkflowError::Execution(ExecutionError::InvalidTransformInput {
            operation: "scatter_gather".to_string(),
            message: "scatter.input did not resolve to an array".to_string(),
        })
    })?;
    let total = items.len();
    let item_variable = scatter.item_variable.as_deref();
    let permits = scatter.max_concurrency.unwrap_or(total.max(1)).max(1);
    debug!("scatter over {} item(s), {} in flight", total, permits);

    let semaphore = Arc::new(Semaphore::new(permits));
    let mut in_flight = FuturesUnordered::new();

    for (index, item) in items.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        let runner = Arc::clone(runner);
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        let steps = scatter.steps.clone();
        let mut child = ctx.clone_for_branch(true);
        bind_iteration(&mut child, item.clone(), item_variable, index, total);

        in_flight.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            if cancel.is_cancelled() {
                return (
                    index,
                    child,
                    Err(WorkflowError::Execution(ExecutionError::Cancelled)),
                );
            }
            let result = run_sequence(&runner, &mut child, &steps, &cancel).await;
            (index, child, result)
        }));
    }

    let mut slots: Vec<Option<(ExecutionContext, Result<Value, WorkflowError>)>> =
        (0..total).map(|_| None).collect();
    while let Some(joined) = in_flight.next().await {
        match joined {
            Ok((index, child, result)) => slots[index] = Some((child, result)),
            Err(e) => return Err(WorkflowError::Internal(format!("join error: {}", e))),
        }
    }

    // per-item results follow scatter input order; failed items merge
    // their recorded state but contribute no result
    let mut first_error = None;
    let mut results = Vec::with_capacity(total);
    for (child, result) in slots.into_iter().flatten() {
        ctx.merge(child);
        match result {
            Ok(value) => results.push(value),
            Err(e) if first_error.is_none() => first_error = Some(e),
            Err(_) => {}
        }
    }
    clear_iteration(ctx, item_variable);
    if let Some(error) = first_error {
        return Err(error);
    }

    let gathered = apply_gather(gather, results)?;
    Ok(match &gather.output_key {
        Some(key) => json!({ key.clone(): gathered }),
        None => gathered,
    })
}

fn bind_iteration(
    ctx: &mut ExecutionContext,
    item: Value,
    item_variable: Option<&str>,
    index: usize,
    total: usize,
) {
    if let Some(name) = item_variable {
        ctx.set_variable(name, item.clone());
    }
    ctx.set_variable("item", item);
    ctx.set_variable(
        "loop",
        json!({"index": index, "iteration": index + 1, "total": total}),
    );
}

fn clear_iteration(ctx: &mut ExecutionContext, item_variable: Option<&str>) {
    if let Some(name) = item_variable {
        ctx.remove_variable(name);
    }
    ctx.remove_variable("item");
    ctx.remove_variable("loop");
}

fn apply_gather(gather: &GatherSpec, results: Vec<Value>) -> Result<Value, WorkflowError> {
    match gather.operation {
        GatherOperation::Collect => Ok(Value::Array(results)),
        GatherOperation::Merge => {
            let mut merged = Map::new();
            for result in results {
                if let Value::Object(object) = result {
                    merged.extend(object);
                }
            }
            Ok(Value::Object(merged))
        }
        GatherOperation::Flatten => {
            let mut flattened = Vec::new();
            for result in results {
                match result {
                    Value::Array(items) => flattened.extend(items),
                    other => flattened.push(other),
                }
            }
            Ok(Value::Array(flattened))
        }
        GatherOperation::Reduce => {
            let expression = gather
                .reduce_expression
                .as_deref()
                .expect("validated at entry");
            let mut iter = results.into_iter();
            let mut acc = iter.next().unwrap_or(Value::Null);
            for (offset, item) in iter.enumerate() {
                let mut bindings = Map::new();
                bindings.insert("acc".to_string(), acc);
                bindings.insert("item".to_string(), item);
                bindings.insert("index".to_string(), Value::from(offset + 1));
                acc = evaluate_raw(expression, &bindings).map_err(WorkflowError::from)?;
            }
            Ok(acc)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpilot_core::step::{StepKind, TransformOperation};
    use flowpilot_core::types::{AgentProfile, StepMetadata};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Test runner: transform `set` steps resolve their input; `delay`
    /// steps sleep. Everything else fails.
    struct FakeRunner {
        concurrent: Arc<Mutex<(usize, usize)>>,
    }

    impl FakeRunner {
        fn new() -> Arc<dyn StepRunner> {
            Arc::new(Self {
                concurrent: Arc::new(Mutex::new((0, 0))),
            })
        }
    }

    #[async_trait]
    impl StepRunner for FakeRunner {
        async fn run_step(
            &self,
            step: &Step,
            ctx: &mut ExecutionContext,
            _cancel: &CancellationToken,
        ) -> Result<StepOutput, WorkflowError> {
            {
                let mut counters = self.concurrent.lock().unwrap();
                counters.0 += 1;
                counters.1 = counters.1.max(counters.0);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;

            let data = match &step.kind {
                StepKind::Transform {
                    operation: TransformOperation::Set,
                    input,
                    ..
                } => {
                    let resolved = resolve_value(ctx, input)?;
                    crate::expression::evaluate_expression(
                        ctx,
                        &crate::resolver::inline_value(&resolved),
                        &Map::new(),
                    )
                    .unwrap_or(resolved)
                }
                StepKind::Delay { duration } => {
                    tokio::time::sleep(Duration::from_millis(*duration)).await;
                    Value::Null
                }
                _ => {
                    return Err(WorkflowError::Internal("unsupported in fake".to_string()))
                }
            };

            {
                let mut counters = self.concurrent.lock().unwrap();
                counters.0 -= 1;
            }
            let output = StepOutput::new(&step.id, "fake", "run", data, StepMetadata::success(1));
            ctx.set_step_output(&step.id, output.clone());
            Ok(output)
        }
    }

    fn set_step(id: &str, input: Value) -> Step {
        serde_json::from_value(json!({
            "id": id,
            "name": id,
            "type": "transform",
            "operation": "set",
            "input": input,
            "config": {}
        }))
        .unwrap()
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("e", "u", AgentProfile::default())
    }

    #[tokio::test]
    async fn test_scatter_gather_collect_in_input_order() {
        let runner = FakeRunner::new();
        let mut context = ctx();
        let scatter: ScatterSpec = serde_json::from_value(json!({
            "input": [{"id": 1}, {"id": 2}, {"id": 3}],
            "steps": [{
                "id": "times10",
                "name": "times10",
                "type": "transform",
                "operation": "set",
                "input": "{{item.id}} * 10",
                "config": {}
            }],
            "maxConcurrency": 3
        }))
        .unwrap();
        let gather: GatherSpec =
            serde_json::from_value(json!({"operation": "collect", "outputKey": "out"})).unwrap();

        let cancel = CancellationToken::new();
        let result =
            execute_scatter_gather(&runner, &mut context, &scatter, &gather, &cancel)
                .await
                .unwrap();
        assert_eq!(result, json!({"out": [10, 20, 30]}));
    }

    #[tokio::test]
    async fn test_scatter_bounded_concurrency() {
        let fake = Arc::new(FakeRunner {
            concurrent: Arc::new(Mutex::new((0, 0))),
        });
        let runner: Arc<dyn StepRunner> = fake.clone();
        let mut context = ctx();
        let scatter: ScatterSpec = serde_json::from_value(json!({
            "input": [1, 2, 3, 4, 5, 6],
            "steps": [{
                "id": "s",
                "name": "s",
                "type": "transform",
                "operation": "set",
                "input": "{{item}}",
                "config": {}
            }],
            "maxConcurrency": 2
        }))
        .unwrap();
        let gather: GatherSpec = serde_json::from_value(json!({"operation": "collect"})).unwrap();

        execute_scatter_gather(&runner, &mut context, &scatter, &gather, &CancellationToken::new())
            .await
            .unwrap();
        let peak = fake.concurrent.lock().unwrap().1;
        assert!(peak <= 2, "peak concurrency {} exceeded bound", peak);
    }

    #[tokio::test]
    async fn test_gather_merge_and_flatten() {
        let runner = FakeRunner::new();
        let mut context = ctx();
        let scatter: ScatterSpec = serde_json::from_value(json!({
            "input": [{"k": "a"}, {"k": "b"}],
            "steps": [{
                "id": "obj",
                "name": "obj",
                "type": "transform",
                "operation": "set",
                "input": {"wrapped": "{{item.k}}"},
                "config": {}
            }]
        }))
        .unwrap();
        let gather: GatherSpec = serde_json::from_value(json!({"operation": "merge"})).unwrap();
        let result =
            execute_scatter_gather(&runner, &mut context, &scatter, &gather, &CancellationToken::new())
                .await
                .unwrap();
        // later items win on key conflicts
        assert_eq!(result, json!({"wrapped": "b"}));
    }

    #[tokio::test]
    async fn test_gather_reduce_requires_expression() {
        let runner = FakeRunner::new();
        let mut context = ctx();
        let scatter: ScatterSpec = serde_json::from_value(json!({
            "input": [1],
            "steps": []
        }))
        .unwrap();
        let gather: GatherSpec = serde_json::from_value(json!({"operation": "reduce"})).unwrap();
        let err = execute_scatter_gather(
            &runner,
            &mut context,
            &scatter,
            &gather,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[tokio::test]
    async fn test_gather_reduce_folds() {
        let runner = FakeRunner::new();
        let mut context = ctx();
        let scatter: ScatterSpec = serde_json::from_value(json!({
            "input": [1, 2, 3],
            "steps": [{
                "id": "v",
                "name": "v",
                "type": "transform",
                "operation": "set",
                "input": "{{item}}",
                "config": {}
            }]
        }))
        .unwrap();
        let gather: GatherSpec = serde_json::from_value(
            json!({"operation": "reduce", "reduceExpression": "acc + item"}),
        )
        .unwrap();
        let result =
            execute_scatter_gather(&runner, &mut context, &scatter, &gather, &CancellationToken::new())
                .await
                .unwrap();
        assert_eq!(result, json!(6));
    }

    #[tokio::test]
    async fn test_custom_item_variable() {
        let runner = FakeRunner::new();
        let mut context = ctx();
        let scatter: ScatterSpec = serde_json::from_value(json!({
            "input": [{"id": "m-1"}],
            "itemVariable": "email",
            "steps": [{
                "id": "pick",
                "name": "pick",
                "type": "transform",
                "operation": "set",
                "input": "{{email.id}}",
                "config": {}
            }]
        }))
        .unwrap();
        let gather: GatherSpec = serde_json::from_value(json!({"operation": "collect"})).unwrap();
        let result =
            execute_scatter_gather(&runner, &mut context, &scatter, &gather, &CancellationToken::new())
                .await
                .unwrap();
        assert_eq!(result, json!(["m-1"]));
        assert!(context.get_variable("email").is_none());
    }

    #[tokio::test]
    async fn test_loop_sequential_binds_loop_scope() {
        let runner = FakeRunner::new();
        let mut context = ctx();
        let steps = vec![set_step("inner", json!("{{loop.iteration}}"))];
        let result = execute_loop(
            &runner,
            &mut context,
            &json!([10, 20, 30]),
            Some(2),
            &steps,
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(result["results"], json!([1, 2]));
        assert_eq!(result["iterations"], json!(2));
        assert!(context.get_variable("loop").is_none());
    }

    #[tokio::test]
    async fn test_loop_parallel_results_in_input_order() {
        let runner = FakeRunner::new();
        let mut context = ctx();
        let steps = vec![set_step("inner", json!("{{item}} * 2"))];
        let result = execute_loop(
            &runner,
            &mut context,
            &json!([3, 1, 2]),
            None,
            &steps,
            true,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(result["results"], json!([6, 2, 4]));
    }

    #[tokio::test]
    async fn test_parallel_group_outputs() {
        let runner = FakeRunner::new();
        let mut context = ctx();
        let steps = vec![set_step("a", json!(1)), set_step("b", json!(2))];
        let result = execute_parallel(
            &runner,
            &mut context,
            &steps,
            None,
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(result, json!({"a": 1, "b": 2}));
        assert!(context.get_step_output("a").is_some());
        assert!(context.get_step_output("b").is_some());
    }

    #[tokio::test]
    async fn test_cancelled_scatter_dispatches_nothing_new() {
        let runner = FakeRunner::new();
        let mut context = ctx();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let scatter: ScatterSpec = serde_json::from_value(json!({
            "input": [1, 2, 3],
            "steps": [{
                "id": "s",
                "name": "s",
                "type": "transform",
                "operation": "set",
                "input": "{{item}}",
                "config": {}
            }]
        }))
        .unwrap();
        let gather: GatherSpec = serde_json::from_value(json!({"operation": "collect"})).unwrap();
        let result = execute_scatter_gather(&runner, &mut context, &scatter, &gather, &cancel)
            .await
            .unwrap();
        assert_eq!(result, json!([]));
    }
}
