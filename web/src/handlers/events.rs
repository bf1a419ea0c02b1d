//! Event ingestion endpoint.

use crate::error::ApiError;
use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};
use tally_core::event::{EventType, NewEvent};
use tally_core::ids::{EventId, UserId};

/// Body of `POST /api/v1/events/event`.
#[derive(Debug, Deserialize)]
pub struct PostEventRequest {
    /// The user the event belongs to.
    pub user_id: i64,
    /// Event type tag; validated against the known vocabulary.
    pub event_type: String,
    /// Type-specific payload, e.g. `{"level": 30}`.
    pub details: serde_json::Value,
}

/// Response of `POST /api/v1/events/event`.
#[derive(Debug, Serialize)]
pub struct PostEventResponse {
    /// Identifier of the committed event.
    pub event_id: EventId,
}

/// Record a user event.
///
/// Returns 201 with the committed event id. Validation failures are 422;
/// an unreachable event store is 503 and means the event was not recorded.
/// Aggregation happens asynchronously — the new score is visible once the
/// worker has run, not necessarily at response time.
///
/// # Errors
///
/// Returns [`ApiError`] per the mapping above.
pub async fn post_event(
    State(state): State<AppState>,
    Json(request): Json<PostEventRequest>,
) -> Result<(StatusCode, Json<PostEventResponse>), ApiError> {
    // The type tag is parsed here rather than by serde so unknown tags get
    // the same 422 shape as every other validation failure.
    let event_type: EventType = request.event_type.parse()?;

    let event = NewEvent::new(UserId::new(request.user_id), event_type, request.details);
    let event_id = state.ingestion.submit(event).await?;

    Ok((StatusCode::CREATED, Json(PostEventResponse { event_id })))
}
