//! User stats endpoint.

use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use tally_core::ids::UserId;
use tally_core::stats::UserStats;

/// Current aggregate stats for a user.
///
/// A user with no recorded events gets a zero score and empty lists. The
/// response lags an in-flight submit by at most the aggregation worker's
/// processing latency (plus the response cache TTL when invalidation
/// failed).
///
/// # Errors
///
/// Returns 422 for a non-positive user id, 503 when neither the counter
/// store nor replay could produce a score.
pub async fn get_stats(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<UserStats>, ApiError> {
    if user_id <= 0 {
        return Err(ApiError::validation(format!(
            "user_id must be positive, got {user_id}"
        )));
    }

    let stats = state.stats.get_stats(UserId::new(user_id)).await?;
    Ok(Json(stats))
}
