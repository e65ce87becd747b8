pub mod dto;
pub mod errors;
pub mod handlers;

use axum::{routing::get, Router};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

use crate::{plan_cache::PlanCache, relay::RelayController};

use handlers::ApiDoc;

/// Shared with every handler; both halves are cheap clones.
#[derive(Clone)]
pub struct AppState {
    pub plan: PlanCache,
    pub relays: RelayController,
}

pub fn router(state: AppState) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .route("/plan", get(handlers::get_plan))
        .route("/relays", get(handlers::get_relays))
        .route("/relays/{circuit_id}", get(handlers::get_relay))
        .with_state(state)
        .split_for_parts();

    router
        .route("/health", get(handlers::health))
        .route(
            "/api-docs/openapi.json",
            get(move || async move { axum::Json(api) }),
        )
}
