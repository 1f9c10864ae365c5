use std::sync::Arc;

use axum::{
    Json,
    body::to_bytes,
    extract::{Path, Query, Request, State},
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::error;
use utoipa::{IntoParams, ToSchema};

use crate::config::ProviderConfig;
use crate::directory::FunctionDirectory;
use crate::engine::ContainerEngine;
use crate::error::ProviderError;
use crate::lifecycle::TaskController;
use crate::namespace::NamespaceValidator;
use crate::proxy::{Forward, InboundRequest, RelayBody};
use crate::replicas::{FunctionStatusView, ReplicaAggregator};
use crate::resolver::Resolve;
use crate::scale::{ScaleService, ScaleServiceRequest};

/// Largest scale request body accepted.
const MAX_SCALE_BODY: usize = 64 * 1024;

/// Shared application state
pub struct AppState {
    pub config: Arc<ProviderConfig>,
    pub validator: NamespaceValidator,
    pub directory: FunctionDirectory,
    pub replicas: ReplicaAggregator,
    pub scaler: ScaleService,
}

impl AppState {
    pub fn new(
        config: Arc<ProviderConfig>,
        engine: Arc<dyn ContainerEngine>,
        resolver: Arc<dyn Resolve>,
        proxy: Arc<dyn Forward>,
    ) -> Self {
        let validator = NamespaceValidator::new(engine.clone(), config.clone());
        let directory = FunctionDirectory::new(engine.clone());
        let replicas = ReplicaAggregator::new(resolver.clone(), proxy.clone(), config.clone());
        let scaler = ScaleService::new(
            validator.clone(),
            directory.clone(),
            resolver,
            proxy,
            TaskController::new(engine),
            config.clone(),
        );

        Self {
            config,
            validator,
            directory,
            replicas,
            scaler,
        }
    }
}

/// API error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    pub error: String,
    pub code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        ApiError {
            error: e.to_string(),
            code: e.status().as_u16(),
        }
    }
}

/// Namespace selector, the default namespace when omitted
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct NamespaceQuery {
    pub namespace: Option<String>,
}

// === System ===

/// Liveness probe
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Provider is up", body = String)
    ),
    tag = "system"
)]
pub async fn healthz() -> &'static str {
    "OK"
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct VersionInfo {
    pub release: String,
}

/// Provider information
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ProviderInfo {
    pub provider: String,
    pub version: VersionInfo,
    pub orchestration: String,
}

/// Get provider information
#[utoipa::path(
    get,
    path = "/system/info",
    responses(
        (status = 200, description = "Provider information", body = ProviderInfo)
    ),
    tag = "system"
)]
pub async fn get_info() -> Json<ProviderInfo> {
    Json(ProviderInfo {
        provider: env!("CARGO_PKG_NAME").to_string(),
        version: VersionInfo {
            release: env!("CARGO_PKG_VERSION").to_string(),
        },
        orchestration: "containerd".to_string(),
    })
}

// === Functions ===

/// List functions in a namespace with live replica counts
#[utoipa::path(
    get,
    path = "/system/functions",
    params(NamespaceQuery),
    responses(
        (status = 200, description = "Functions in the namespace", body = Vec<FunctionStatusView>),
        (status = 400, description = "Namespace not valid", body = ApiError),
        (status = 500, description = "Engine failure", body = ApiError)
    ),
    tag = "functions"
)]
pub async fn list_functions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NamespaceQuery>,
    request: Request,
) -> Result<Json<Vec<FunctionStatusView>>, ApiError> {
    let namespace = state.validator.require(query.namespace.as_deref()).await?;
    let records = state.directory.list(&namespace).await?;

    let (parts, _) = request.into_parts();
    let inbound = InboundRequest::from_parts(&parts, RelayBody::Empty);
    Ok(Json(state.replicas.list(records, inbound).await))
}

/// Get one function with live replica counts
#[utoipa::path(
    get,
    path = "/system/function/{name}",
    params(
        ("name" = String, Path, description = "Function name"),
        NamespaceQuery
    ),
    responses(
        (status = 200, description = "Function status", body = FunctionStatusView),
        (status = 400, description = "Namespace not valid", body = ApiError),
        (status = 404, description = "Function not found", body = ApiError),
        (status = 503, description = "No endpoints available", body = ApiError)
    ),
    tag = "functions"
)]
pub async fn get_function(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<NamespaceQuery>,
    request: Request,
) -> Result<Json<FunctionStatusView>, ApiError> {
    let namespace = state.validator.require(query.namespace.as_deref()).await?;
    let record = state.directory.get(&namespace, &name).await?;

    let (parts, body) = request.into_parts();
    let mut inbound = InboundRequest::from_parts(&parts, RelayBody::Streaming(body));
    inbound.method = Method::GET;
    Ok(Json(state.replicas.function_status(record, inbound).await?))
}

/// Scale a function
///
/// The request is relayed to the function's watchdog and the response status
/// and body are returned unchanged once the task transition has been applied.
#[utoipa::path(
    post,
    path = "/system/scale-function/{name}",
    params(
        ("name" = String, Path, description = "Function name"),
        NamespaceQuery
    ),
    request_body = ScaleServiceRequest,
    responses(
        (status = 200, description = "Watchdog response, status mirrored"),
        (status = 400, description = "Bad body, namespace not valid or rejected transition", body = ApiError),
        (status = 404, description = "Function not found", body = ApiError),
        (status = 500, description = "Watchdog unreachable or engine failure", body = ApiError),
        (status = 503, description = "No endpoints available", body = ApiError)
    ),
    tag = "functions"
)]
pub async fn scale_function(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<NamespaceQuery>,
    request: Request,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    let body = to_bytes(body, MAX_SCALE_BODY)
        .await
        .map_err(|e| ProviderError::BadRequest(format!("cannot read body: {e}")))?;
    let inbound = InboundRequest::from_parts(&parts, RelayBody::Empty);

    // Runs detached so the function's lock is held until the transition is
    // done; the token cancels the relay if the caller goes away.
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();
    let scaler = state.scaler.clone();
    let scaling = tokio::spawn(async move {
        scaler
            .scale(&name, query.namespace.as_deref(), inbound, body, &cancel)
            .await
    });

    let response = match scaling.await {
        Ok(result) => result?,
        Err(e) => {
            error!(error = %e, "Scale task failed");
            return Err(ApiError {
                error: format!("scale task failed: {e}"),
                code: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            });
        }
    };

    let content_type = response.headers.get(header::CONTENT_TYPE).cloned();
    let mut reply = (response.status, response.body).into_response();
    if let Some(content_type) = content_type {
        reply.headers_mut().insert(header::CONTENT_TYPE, content_type);
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_from_provider_error() {
        let err = ApiError::from(ProviderError::NoEndpoints("figlet".into()));
        assert_eq!(err.code, 503);
        assert_eq!(err.error, "No endpoints available for: figlet.");

        let response = ApiError::from(ProviderError::Validation {
            namespace: "kube-system".into(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
