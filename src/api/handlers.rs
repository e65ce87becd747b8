use axum::{
    extract::{Path, State},
    Json,
};
use utoipa::OpenApi;

use super::{
    dto::{IntervalDto, PlanDto, RelayStatusDto},
    errors::AppError,
    AppState,
};
use crate::{relay::RelayRuntimeState, serial::LinkState};

/// The activation plan in force, or `null` while today's prices are missing.
#[utoipa::path(
    get,
    path = "/plan",
    responses(
        (status = 200, description = "Current activation plan", body = Option<PlanDto>),
    ),
    tag = "schedule"
)]
pub async fn get_plan(State(state): State<AppState>) -> Json<Option<PlanDto>> {
    let plan = state.plan.current().await;
    Json(plan.as_deref().map(PlanDto::from))
}

/// Runtime state of every configured circuit.
#[utoipa::path(
    get,
    path = "/relays",
    responses(
        (status = 200, description = "Relay states", body = Vec<RelayStatusDto>),
    ),
    tag = "relays"
)]
pub async fn get_relays(State(state): State<AppState>) -> Json<Vec<RelayStatusDto>> {
    let relays = state.relays.snapshot().await;
    Json(
        relays
            .into_iter()
            .map(|relay| status(&state, relay))
            .collect(),
    )
}

#[utoipa::path(
    get,
    path = "/relays/{circuit_id}",
    params(
        ("circuit_id" = String, Path, description = "Configured circuit id"),
    ),
    responses(
        (status = 200, description = "Relay state", body = RelayStatusDto),
        (status = 404, description = "Unknown circuit"),
    ),
    tag = "relays"
)]
pub async fn get_relay(
    State(state): State<AppState>,
    Path(circuit_id): Path<String>,
) -> Result<Json<RelayStatusDto>, AppError> {
    let relay = state
        .relays
        .get_known_state(&circuit_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("unknown circuit: {circuit_id}")))?;
    Ok(Json(status(&state, relay)))
}

fn status(state: &AppState, relay: RelayRuntimeState) -> RelayStatusDto {
    let link_state = state
        .relays
        .link_state(&relay.endpoint.board_id)
        .unwrap_or(LinkState::Disconnected);
    RelayStatusDto::new(relay, link_state)
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
    ),
    tag = "system"
)]
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// OpenAPI spec struct (used in api/mod.rs)
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(get_plan, get_relays, get_relay, health),
    components(schemas(PlanDto, IntervalDto, RelayStatusDto, LinkState)),
    tags(
        (name = "schedule", description = "Price-driven activation plan"),
        (name = "relays", description = "Relay runtime state"),
        (name = "system", description = "Service health"),
    ),
    info(
        title = "Spot Relay Service API",
        version = "0.1.0",
        description = "Read-only status of the price schedule and the relay boards"
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
