//! Task handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use reel_models::{CostBreakdown, SegmentationStrategy, Task, TaskId, TaskStatus};

use crate::error::{ApiError, ApiResult};
use crate::owner::Owner;
use crate::services::TaskRequest;
use crate::state::AppState;

#[derive(Serialize)]
pub struct EstimateResponse {
    pub cost: CostBreakdown,
    pub strategy: SegmentationStrategy,
    pub needs_segmentation: bool,
}

#[derive(Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<Task>,
    pub count: usize,
}

#[derive(Serialize)]
pub struct DeleteTaskResponse {
    pub deleted: bool,
    pub task_id: TaskId,
    pub previous_status: TaskStatus,
    pub refunded_credits: u32,
}

fn parse_task_id(raw: &str) -> ApiResult<TaskId> {
    TaskId::parse(raw).map_err(|_| ApiError::bad_request(format!("invalid task id '{raw}'")))
}

/// Price a request without submitting it.
pub async fn estimate_task(
    State(state): State<AppState>,
    Json(request): Json<TaskRequest>,
) -> ApiResult<Json<EstimateResponse>> {
    let quote = state.submissions.quote(&request)?;
    Ok(Json(EstimateResponse {
        cost: quote.cost,
        strategy: quote.plan.strategy,
        needs_segmentation: quote.plan.needs_segmentation,
    }))
}

/// Submit a new task. Credits are debited up front.
pub async fn create_task(
    State(state): State<AppState>,
    owner: Owner,
    Json(request): Json<TaskRequest>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let task = state.submissions.submit(owner.as_str(), request).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// List the caller's tasks, newest first.
pub async fn list_tasks(State(state): State<AppState>, owner: Owner) -> ApiResult<Json<TaskListResponse>> {
    let tasks = state.submissions.list(owner.as_str()).await?;
    Ok(Json(TaskListResponse {
        count: tasks.len(),
        tasks,
    }))
}

/// Fetch one task with its progress and results.
pub async fn get_task(
    State(state): State<AppState>,
    owner: Owner,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Task>> {
    let task_id = parse_task_id(&task_id)?;
    let task = state.submissions.get(owner.as_str(), task_id).await?;
    Ok(Json(task))
}

/// Delete a task that is not processing.
pub async fn delete_task(
    State(state): State<AppState>,
    owner: Owner,
    Path(task_id): Path<String>,
) -> ApiResult<Json<DeleteTaskResponse>> {
    let task_id = parse_task_id(&task_id)?;
    let deleted = state.submissions.delete(owner.as_str(), task_id).await?;
    Ok(Json(DeleteTaskResponse {
        deleted: true,
        task_id,
        previous_status: deleted.previous_status,
        refunded_credits: deleted.refunded,
    }))
}
