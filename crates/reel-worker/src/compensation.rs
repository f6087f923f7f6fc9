//! Failure recording and credit refunds.
//!
//! A task whose job fails for good is moved to `failed` and its credits are
//! returned exactly once: the ledger refund is keyed by task id and the
//! `refunded` flag is set afterwards, so a crash between the two steps is
//! repaired by running compensation again.

use reel_models::{ProgressEvent, ProgressKind, TaskId, TaskStatus, TaskUpdate, TransitionError};
use reel_store::{refund_key, StoreError};
use tracing::{error, info, warn};

use crate::context::PipelineDeps;
use crate::error::WorkerResult;
use crate::metrics;
use crate::retry::{retry_async, RetryConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compensation {
    /// Credits were returned by this call.
    Refunded { amount: u32 },
    /// The ledger had already applied the refund; only the flag was missing.
    RefundAlreadyApplied,
    /// Nothing left to return (already refunded, or free task).
    NothingToRefund,
    /// The task finished in another state and was left alone.
    Skipped(TaskStatus),
    /// The task record no longer exists.
    TaskMissing,
}

fn store_retry(name: &'static str) -> RetryConfig {
    RetryConfig::new(name).with_max_retries(3)
}

/// Record a terminal failure for `task_id` and refund its credits.
pub async fn compensate(deps: &PipelineDeps, task_id: TaskId, message: &str) -> WorkerResult<Compensation> {
    let Some(task) = deps.store.get(task_id).await? else {
        error!(task_id = %task_id, "Cannot compensate: task record missing");
        return Ok(Compensation::TaskMissing);
    };

    let task = match task.status {
        TaskStatus::Failed => task,
        TaskStatus::Completed => {
            warn!(task_id = %task_id, "Task already completed, skipping compensation");
            return Ok(Compensation::Skipped(TaskStatus::Completed));
        }
        TaskStatus::Pending | TaskStatus::Processing => {
            let applied = retry_async(&store_retry("record_failure"), StoreError::is_retryable, || {
                deps.store.apply(task_id, TaskUpdate::fail(message))
            })
            .await;
            match applied {
                Ok(task) => task,
                // Lost a race with a writer that finished the task first
                Err(StoreError::Transition(TransitionError::InvalidTransition { from, .. })) => {
                    warn!(task_id = %task_id, status = %from, "Task left its live state, skipping compensation");
                    return Ok(Compensation::Skipped(from));
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    let _ = deps
        .progress
        .publish(&ProgressEvent::new(
            task_id,
            ProgressKind::Failed {
                message: message.to_string(),
                will_retry: false,
            },
        ))
        .await;

    if !task.needs_refund() {
        return Ok(Compensation::NothingToRefund);
    }

    let amount = task.cost.total;
    let key = refund_key(task_id);
    let refunded = retry_async(&store_retry("refund"), StoreError::is_retryable, || {
        deps.ledger.refund(&task.owner_id, amount, &key)
    })
    .await?;

    match retry_async(&store_retry("mark_refunded"), StoreError::is_retryable, || {
        deps.store.apply(task_id, TaskUpdate::MarkRefunded)
    })
    .await
    {
        Ok(_) | Err(StoreError::Transition(TransitionError::AlreadyRefunded)) => {}
        Err(e) => return Err(e.into()),
    }

    if refunded {
        metrics::record_refund(amount);
        info!(task_id = %task_id, owner_id = %task.owner_id, amount, "Refunded failed task");
        Ok(Compensation::Refunded { amount })
    } else {
        info!(task_id = %task_id, "Refund already applied, marked task refunded");
        Ok(Compensation::RefundAlreadyApplied)
    }
}
