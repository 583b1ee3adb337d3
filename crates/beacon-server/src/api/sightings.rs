//! Sighting ingestion endpoint.
//!
//! Lets an external scanner push advertisements into the engine. Sightings
//! are applied in request order; each gets its own outcome.

use axum::extract::State;
use axum::Json;
use beacon_core::{IngestOutcome, Sighting};
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// Upper bound on sightings per request.
pub const MAX_BATCH_SIZE: usize = 1024;

// ============================================================================
// Request/Response Types
// ============================================================================

/// A batch of sightings from a scanner.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "sightings": [
        { "address": "AA:BB:CC:DD:EE:FF", "rssi": -52.0, "observed_at": "2025-01-15T03:30:00Z" }
    ]
}))]
pub struct IngestRequest {
    /// Sightings in the order they were received.
    pub sightings: Vec<Sighting>,
}

/// What happened to a single sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SightingOutcome {
    /// Stored; status was recomputed.
    Updated,
    /// Identical to the stored sighting.
    Duplicate,
    /// Older than the stored sighting.
    Stale,
    /// Already outside the expiry window.
    Expired,
    /// Empty address, unusable signal strength, or stamped in the future.
    Invalid,
}

impl From<IngestOutcome> for SightingOutcome {
    fn from(outcome: IngestOutcome) -> Self {
        match outcome {
            IngestOutcome::Updated => Self::Updated,
            IngestOutcome::Duplicate => Self::Duplicate,
            IngestOutcome::Stale => Self::Stale,
            IngestOutcome::Expired => Self::Expired,
            IngestOutcome::Invalid => Self::Invalid,
        }
    }
}

/// Per-sighting outcomes.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "updated": 1,
    "outcomes": ["updated"]
}))]
pub struct IngestResponse {
    /// Number of sightings that changed presence.
    #[schema(example = 1, minimum = 0)]
    pub updated: usize,

    /// One outcome per submitted sighting, in request order.
    pub outcomes: Vec<SightingOutcome>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Submit sightings.
#[utoipa::path(
    post,
    path = "/api/sightings",
    tag = "sightings",
    operation_id = "ingestSightings",
    summary = "Submit sightings",
    description = "Feeds advertisements into the presence engine. Older or \
        already-expired sightings are ignored and reported as such.",
    request_body = IngestRequest,
    responses(
        (status = 200, description = "Sightings processed", body = IngestResponse),
        (status = 400, description = "Batch too large", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn ingest_sightings(
    State(state): State<SharedState>,
    Json(request): Json<IngestRequest>,
) -> ApiResult<Json<IngestResponse>> {
    if request.sightings.len() > MAX_BATCH_SIZE {
        return Err(ApiError::BadRequest {
            error_code: "batch_too_large".to_string(),
            message: format!(
                "At most {MAX_BATCH_SIZE} sightings per request (got {})",
                request.sightings.len()
            ),
        });
    }

    let outcomes: Vec<SightingOutcome> = request
        .sightings
        .into_iter()
        .map(|sighting| state.engine.ingest(sighting).into())
        .collect();
    let updated = outcomes
        .iter()
        .filter(|outcome| **outcome == SightingOutcome::Updated)
        .count();

    debug!(submitted = outcomes.len(), updated, "Sightings ingested");
    Ok(Json(IngestResponse { updated, outcomes }))
}
