use axum::{
    Json, Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use super::handlers::{self, AppState};
use crate::replicas::{FunctionResources, FunctionStatusView};
use crate::scale::ScaleServiceRequest;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "faasd provider",
        version = "0.1.0",
        description = "Replica status and scale control for functions running as containerd tasks.",
        license(name = "MIT")
    ),
    tags(
        (name = "system", description = "Liveness and provider information"),
        (name = "functions", description = "Function status and scaling")
    ),
    paths(
        handlers::healthz,
        handlers::get_info,
        handlers::list_functions,
        handlers::get_function,
        handlers::scale_function,
    ),
    components(schemas(
        handlers::ApiError,
        handlers::ProviderInfo,
        handlers::VersionInfo,
        FunctionStatusView,
        FunctionResources,
        ScaleServiceRequest,
    ))
)]
pub struct ApiDoc;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let system_routes = Router::new()
        .route("/info", get(handlers::get_info))
        .route("/functions", get(handlers::list_functions))
        .route("/function/{name}", get(handlers::get_function))
        .route("/scale-function/{name}", post(handlers::scale_function));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/api-docs/openapi.json", get(openapi_json))
        .nest("/system", system_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
