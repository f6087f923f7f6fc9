//! Credit balance handler.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::error::ApiResult;
use crate::owner::Owner;
use crate::state::AppState;

#[derive(Serialize)]
pub struct CreditsResponse {
    pub owner_id: String,
    pub balance: u64,
}

/// Current credit balance of the caller.
pub async fn get_credits(State(state): State<AppState>, owner: Owner) -> ApiResult<Json<CreditsResponse>> {
    let balance = state.submissions.balance(owner.as_str()).await?;
    Ok(Json(CreditsResponse {
        owner_id: owner.0,
        balance,
    }))
}
