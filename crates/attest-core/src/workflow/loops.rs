//! The loop driver: forEach (sequential and bounded-parallel), while, and
//! fixed-count loops around a single step's dispatch.
//!
//! Each iteration runs one dispatch pass and therefore persists its own
//! step-execution record. Loop bindings (`loopVar`, `$loopIndex`,
//! `$loopCount`, `$loopTotal`, `$loopFirst`, `$loopLast`, `$loopItem`) are
//! visible only inside the loop; they are removed from the variable map on
//! exit. Parallel iterations each get a forked variable map so bindings
//! cannot race; step outputs stay shared, so the step's output slot holds
//! whatever iteration finished last.

use std::sync::Arc;

use attest_types::event::WorkflowEvent;
use attest_types::workflow::{StepDefinition, StepExecution, StepExecutionResult, StepStatus};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::repository::workflow::WorkflowStore;

use super::context::ExecutionContext;
use super::step_runner::{StepError, StepRunner};

/// Default in-flight bound for parallel forEach loops.
const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Default safety cap for while loops.
const DEFAULT_MAX_ITERATIONS: u32 = 100;

const LOOP_BINDINGS: [&str; 6] = [
    "$loopIndex",
    "$loopCount",
    "$loopTotal",
    "$loopFirst",
    "$loopLast",
    "$loopItem",
];

/// Entry point from the step runner for any step with a loop specification.
pub(crate) async fn run_loop<S: WorkflowStore + 'static>(
    runner: &Arc<StepRunner<S>>,
    step: &StepDefinition,
    ctx: &ExecutionContext,
) -> Result<(), StepError> {
    if let Some(loop_over) = step.loop_over.as_deref() {
        if step.parallel {
            run_for_each_parallel(runner, step, ctx, loop_over).await
        } else {
            run_for_each(runner, step, ctx, loop_over).await
        }
    } else if let Some(condition) = step.loop_condition.as_deref() {
        run_while(runner, step, ctx, condition).await
    } else if let Some(count) = step.loop_count {
        run_count(runner, step, ctx, count).await
    } else {
        runner.dispatch_once(step, ctx).await
    }
}

// ---------------------------------------------------------------------------
// forEach (sequential)
// ---------------------------------------------------------------------------

async fn run_for_each<S: WorkflowStore + 'static>(
    runner: &Arc<StepRunner<S>>,
    step: &StepDefinition,
    ctx: &ExecutionContext,
    loop_over: &str,
) -> Result<(), StepError> {
    ctx.logger
        .info(&step.id, &format!("Starting forEach loop over: {loop_over}"))
        .await;

    let collection = match ctx.evaluator_for_step(step).evaluate_to_array(loop_over) {
        Ok(collection) => collection,
        Err(e) => {
            let error = format!("failed to evaluate loop collection: {e}");
            runner.record_immediate_failure(step, ctx, &error).await?;
            return Err(StepError::Failed {
                step_id: step.id.clone(),
                error,
            });
        }
    };
    let total = collection.len();

    ctx.logger
        .info(&step.id, &format!("Loop collection size: {total} items"))
        .await;
    runner.events.publish(WorkflowEvent::LoopStart {
        run_id: ctx.run_id,
        step_id: step.id.clone(),
        step_name: step.name.clone(),
        total: Some(total),
        parallel: false,
    });

    if total == 0 {
        record_empty_loop(runner, step, ctx).await?;
        runner.events.publish(WorkflowEvent::LoopComplete {
            run_id: ctx.run_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            iterations: 0,
        });
        return Ok(());
    }

    for (index, item) in collection.iter().enumerate() {
        ctx.logger
            .info(
                &step.id,
                &format!("Loop iteration {}/{}", index + 1, total),
            )
            .await;
        runner.events.publish(WorkflowEvent::IterationStart {
            run_id: ctx.run_id,
            step_id: step.id.clone(),
            iteration: index,
        });

        bind_loop_variables(ctx, step.loop_var.as_deref(), item, index, total);

        let iteration_result = runner.dispatch_once(step, ctx).await;

        runner.events.publish(WorkflowEvent::IterationComplete {
            run_id: ctx.run_id,
            step_id: step.id.clone(),
            iteration: index,
            status: last_status(ctx, &step.id),
        });

        if let Err(e) = iteration_result {
            // dispatch_once already resolved onError=continue internally.
            return Err(StepError::Failed {
                step_id: step.id.clone(),
                error: format!("loop iteration {index} failed: {e}"),
            });
        }
    }

    clear_loop_variables(ctx, step.loop_var.as_deref());

    runner.events.publish(WorkflowEvent::LoopComplete {
        run_id: ctx.run_id,
        step_id: step.id.clone(),
        step_name: step.name.clone(),
        iterations: total,
    });
    ctx.logger
        .info(&step.id, "ForEach loop completed successfully")
        .await;
    Ok(())
}

// ---------------------------------------------------------------------------
// forEach (parallel)
// ---------------------------------------------------------------------------

async fn run_for_each_parallel<S: WorkflowStore + 'static>(
    runner: &Arc<StepRunner<S>>,
    step: &StepDefinition,
    ctx: &ExecutionContext,
    loop_over: &str,
) -> Result<(), StepError> {
    ctx.logger
        .info(
            &step.id,
            &format!("Starting parallel forEach loop over: {loop_over}"),
        )
        .await;

    let collection = match ctx.evaluator_for_step(step).evaluate_to_array(loop_over) {
        Ok(collection) => collection,
        Err(e) => {
            let error = format!("failed to evaluate loop collection: {e}");
            runner.record_immediate_failure(step, ctx, &error).await?;
            return Err(StepError::Failed {
                step_id: step.id.clone(),
                error,
            });
        }
    };
    let total = collection.len();

    ctx.logger
        .info(
            &step.id,
            &format!("Parallel loop collection size: {total} items"),
        )
        .await;
    runner.events.publish(WorkflowEvent::LoopStart {
        run_id: ctx.run_id,
        step_id: step.id.clone(),
        step_name: step.name.clone(),
        total: Some(total),
        parallel: true,
    });

    if total == 0 {
        record_empty_loop(runner, step, ctx).await?;
        runner.events.publish(WorkflowEvent::LoopComplete {
            run_id: ctx.run_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            iterations: 0,
        });
        return Ok(());
    }

    let max_concurrency = step
        .max_concurrency
        .filter(|m| *m > 0)
        .unwrap_or(DEFAULT_MAX_CONCURRENCY);
    let semaphore = Arc::new(Semaphore::new(max_concurrency));
    let mut join_set = JoinSet::new();

    for (index, item) in collection.into_iter().enumerate() {
        // Each iteration gets its own variable map; outputs stay shared.
        let iter_ctx = ctx.fork_variables();
        bind_loop_variables(&iter_ctx, step.loop_var.as_deref(), &item, index, total);

        let runner = Arc::clone(runner);
        let step = step.clone();
        let semaphore = Arc::clone(&semaphore);

        join_set.spawn(async move {
            // The semaphore is never closed; `ok()` keeps the permit alive.
            let _permit = semaphore.acquire_owned().await.ok();
            runner.events.publish(WorkflowEvent::IterationStart {
                run_id: iter_ctx.run_id,
                step_id: step.id.clone(),
                iteration: index,
            });

            let result = runner.dispatch_once(&step, &iter_ctx).await;

            runner.events.publish(WorkflowEvent::IterationComplete {
                run_id: iter_ctx.run_id,
                step_id: step.id.clone(),
                iteration: index,
                status: last_status(&iter_ctx, &step.id),
            });

            (index, result)
        });
    }

    // Drain every in-flight iteration, then surface the first failure.
    let mut first_error: Option<String> = None;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((index, Err(e))) => {
                if first_error.is_none() {
                    first_error = Some(format!("parallel loop iteration {index} failed: {e}"));
                }
            }
            Err(join_err) => {
                if first_error.is_none() {
                    first_error = Some(format!("loop task join error: {join_err}"));
                }
            }
        }
    }

    runner.events.publish(WorkflowEvent::LoopComplete {
        run_id: ctx.run_id,
        step_id: step.id.clone(),
        step_name: step.name.clone(),
        iterations: total,
    });

    if let Some(error) = first_error {
        return Err(StepError::Failed {
            step_id: step.id.clone(),
            error,
        });
    }

    ctx.logger
        .info(&step.id, "Parallel forEach loop completed successfully")
        .await;
    Ok(())
}

// ---------------------------------------------------------------------------
// while
// ---------------------------------------------------------------------------

async fn run_while<S: WorkflowStore + 'static>(
    runner: &Arc<StepRunner<S>>,
    step: &StepDefinition,
    ctx: &ExecutionContext,
    condition: &str,
) -> Result<(), StepError> {
    ctx.logger
        .info(
            &step.id,
            &format!("Starting while loop with condition: {condition}"),
        )
        .await;

    let max_iterations = step
        .max_iterations
        .filter(|m| *m > 0)
        .unwrap_or(DEFAULT_MAX_ITERATIONS);

    runner.events.publish(WorkflowEvent::LoopStart {
        run_id: ctx.run_id,
        step_id: step.id.clone(),
        step_name: step.name.clone(),
        total: None,
        parallel: false,
    });

    let mut iteration: u32 = 0;
    while iteration < max_iterations {
        // Condition is checked before each iteration against fresh state.
        let should_continue = match ctx.evaluator_for_step(step).evaluate_bool(condition) {
            Ok(value) => value,
            Err(e) => {
                let error = format!("failed to evaluate loop condition: {e}");
                runner.record_immediate_failure(step, ctx, &error).await?;
                return Err(StepError::Failed {
                    step_id: step.id.clone(),
                    error,
                });
            }
        };
        if !should_continue {
            ctx.logger
                .info(
                    &step.id,
                    &format!("While loop condition became false after {iteration} iterations"),
                )
                .await;
            break;
        }

        ctx.logger
            .info(&step.id, &format!("While loop iteration {}", iteration + 1))
            .await;
        runner.events.publish(WorkflowEvent::IterationStart {
            run_id: ctx.run_id,
            step_id: step.id.clone(),
            iteration: iteration as usize,
        });

        ctx.variables
            .insert("$loopIndex".to_string(), json!(iteration));
        ctx.variables
            .insert("$loopCount".to_string(), json!(iteration + 1));

        let iteration_result = runner.dispatch_once(step, ctx).await;

        runner.events.publish(WorkflowEvent::IterationComplete {
            run_id: ctx.run_id,
            step_id: step.id.clone(),
            iteration: iteration as usize,
            status: last_status(ctx, &step.id),
        });

        if let Err(e) = iteration_result {
            return Err(StepError::Failed {
                step_id: step.id.clone(),
                error: format!("while loop iteration {iteration} failed: {e}"),
            });
        }

        iteration += 1;
    }

    if iteration >= max_iterations {
        // Reaching the safety cap is a clean exit, not a failure.
        ctx.logger
            .warn(
                &step.id,
                &format!("While loop reached max iterations limit: {max_iterations}"),
            )
            .await;
    }

    ctx.remove_variables(&["$loopIndex", "$loopCount"]);

    runner.events.publish(WorkflowEvent::LoopComplete {
        run_id: ctx.run_id,
        step_id: step.id.clone(),
        step_name: step.name.clone(),
        iterations: iteration as usize,
    });
    ctx.logger
        .info(
            &step.id,
            &format!("While loop completed after {iteration} iterations"),
        )
        .await;
    Ok(())
}

// ---------------------------------------------------------------------------
// count
// ---------------------------------------------------------------------------

async fn run_count<S: WorkflowStore + 'static>(
    runner: &Arc<StepRunner<S>>,
    step: &StepDefinition,
    ctx: &ExecutionContext,
    count: u32,
) -> Result<(), StepError> {
    ctx.logger
        .info(&step.id, &format!("Starting count loop: {count} iterations"))
        .await;
    let total = count as usize;

    runner.events.publish(WorkflowEvent::LoopStart {
        run_id: ctx.run_id,
        step_id: step.id.clone(),
        step_name: step.name.clone(),
        total: Some(total),
        parallel: false,
    });

    if total == 0 {
        record_empty_loop(runner, step, ctx).await?;
        runner.events.publish(WorkflowEvent::LoopComplete {
            run_id: ctx.run_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            iterations: 0,
        });
        return Ok(());
    }

    for index in 0..total {
        runner.events.publish(WorkflowEvent::IterationStart {
            run_id: ctx.run_id,
            step_id: step.id.clone(),
            iteration: index,
        });

        bind_loop_variables(ctx, step.loop_var.as_deref(), &json!(index), index, total);

        let iteration_result = runner.dispatch_once(step, ctx).await;

        runner.events.publish(WorkflowEvent::IterationComplete {
            run_id: ctx.run_id,
            step_id: step.id.clone(),
            iteration: index,
            status: last_status(ctx, &step.id),
        });

        if let Err(e) = iteration_result {
            return Err(StepError::Failed {
                step_id: step.id.clone(),
                error: format!("loop iteration {index} failed: {e}"),
            });
        }
    }

    clear_loop_variables(ctx, step.loop_var.as_deref());

    runner.events.publish(WorkflowEvent::LoopComplete {
        run_id: ctx.run_id,
        step_id: step.id.clone(),
        step_name: step.name.clone(),
        iterations: total,
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn bind_loop_variables(
    ctx: &ExecutionContext,
    loop_var: Option<&str>,
    item: &Value,
    index: usize,
    total: usize,
) {
    if let Some(name) = loop_var {
        ctx.variables.insert(name.to_string(), item.clone());
    }
    ctx.variables.insert("$loopIndex".to_string(), json!(index));
    ctx.variables
        .insert("$loopCount".to_string(), json!(index + 1));
    ctx.variables.insert("$loopTotal".to_string(), json!(total));
    ctx.variables
        .insert("$loopFirst".to_string(), json!(index == 0));
    ctx.variables
        .insert("$loopLast".to_string(), json!(index == total - 1));
    ctx.variables.insert("$loopItem".to_string(), item.clone());
}

fn clear_loop_variables(ctx: &ExecutionContext, loop_var: Option<&str>) {
    if let Some(name) = loop_var {
        ctx.variables.remove(name);
    }
    ctx.remove_variables(&LOOP_BINDINGS);
}

fn last_status(ctx: &ExecutionContext, step_id: &str) -> StepStatus {
    ctx.step_results
        .get(step_id)
        .map(|r| r.status)
        .unwrap_or(StepStatus::Failed)
}

/// An empty collection still leaves a single wrapper record: success, zero
/// iterations, no loop bindings leaked.
async fn record_empty_loop<S: WorkflowStore + 'static>(
    runner: &Arc<StepRunner<S>>,
    step: &StepDefinition,
    ctx: &ExecutionContext,
) -> Result<(), StepError> {
    let now = Utc::now();
    let output = json!({ "iterations": 0 });
    let exec = StepExecution {
        id: Uuid::now_v7(),
        run_id: ctx.run_id,
        step_id: step.id.clone(),
        step_name: step.name.clone(),
        status: StepStatus::Success,
        input: Some(json!({ "input": step.input, "config": step.config })),
        output: Some(output.clone()),
        error: None,
        started_at: now,
        completed_at: Some(now),
        duration_ms: Some(0),
    };
    runner.store.create_step_exec(&exec).await?;

    ctx.record_result(
        &step.id,
        StepExecutionResult {
            status: StepStatus::Success,
            duration_ms: 0,
            output: Some(output),
            error: None,
        },
    );

    ctx.logger
        .info(&step.id, "Loop collection is empty; nothing to iterate")
        .await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
