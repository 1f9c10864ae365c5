//! Scale requests: relay to the watchdog, then move the task.
//!
//! A request is decoded, its namespace validated and the function's lock
//! taken before anything is resolved. The lock is held through resolution,
//! the relay to the watchdog's update path and the task transition, so two
//! requests for one function never interleave.
//!
//! Scaling up always applies the transition, even when the watchdog could not
//! be resolved or reached: an absent, stopped or paused task cannot answer
//! until it is brought up, and the caller's retry finds it serving. Scaling
//! down only pauses once the watchdog has accepted the update.
//!
//! Cancelling the request aborts the relay and stops a recreate before its
//! delete. Engine calls already dispatched still complete.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::config::ProviderConfig;
use crate::directory::FunctionDirectory;
use crate::error::{ProviderError, Result};
use crate::lifecycle::{DesiredScale, TaskController};
use crate::namespace::NamespaceValidator;
use crate::proxy::{Forward, InboundRequest, RelayBody, UpstreamResponse};
use crate::resolver::Resolve;

/// Body of a scale request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaleServiceRequest {
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub replicas: u64,
}

impl ScaleServiceRequest {
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Err(ProviderError::BadRequest("expected a body".to_string()));
        }
        serde_json::from_slice(body).map_err(|e| ProviderError::BadRequest(e.to_string()))
    }
}

#[derive(Clone)]
pub struct ScaleService {
    validator: NamespaceValidator,
    directory: FunctionDirectory,
    resolver: Arc<dyn Resolve>,
    proxy: Arc<dyn Forward>,
    controller: TaskController,
    config: Arc<ProviderConfig>,
}

impl ScaleService {
    pub fn new(
        validator: NamespaceValidator,
        directory: FunctionDirectory,
        resolver: Arc<dyn Resolve>,
        proxy: Arc<dyn Forward>,
        controller: TaskController,
        config: Arc<ProviderConfig>,
    ) -> Self {
        Self {
            validator,
            directory,
            resolver,
            proxy,
            controller,
            config,
        }
    }

    /// Handle a scale request for `path_name`. The watchdog's response is
    /// returned as-is for the caller to mirror.
    pub async fn scale(
        &self,
        path_name: &str,
        namespace: Option<&str>,
        mut inbound: InboundRequest,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<UpstreamResponse> {
        info!(function = %path_name, request = %String::from_utf8_lossy(&body), "Scale request");
        let request = ScaleServiceRequest::decode(&body)?;
        let function = if request.service_name.is_empty() {
            path_name.to_string()
        } else {
            request.service_name.clone()
        };

        let namespace = self.validator.require(namespace).await?;
        let guard = self.controller.exclusive(&namespace, &function).await;

        self.directory.get(&namespace, &function).await?;

        let desired = DesiredScale {
            function: function.clone(),
            namespace: namespace.clone(),
            replicas: request.replicas,
        };

        inbound.body = RelayBody::Buffered(body);
        let relayed = match self.resolver.resolve(&namespace, &function).await {
            Ok(endpoint) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ProviderError::Cancelled),
                relayed = self.proxy.forward(inbound, &endpoint, &self.config.update_path) => relayed,
            },
            Err(e) => Err(e),
        };

        match &relayed {
            Ok(response) => {
                info!(function = %function, replicas = request.replicas, status = %response.status, "Watchdog answered scale request");
            }
            Err(ProviderError::Upstream { target, reason, .. }) => {
                warn!(function = %function, target = %target, error = %reason, "Cannot reach watchdog");
            }
            Err(e) => {
                warn!(function = %function, error = %e, "Cannot relay scale request");
            }
        }

        let accepted = matches!(&relayed, Ok(response) if response.status.is_success());
        if desired.replicas > 0 || accepted {
            self.controller.apply(&guard, &desired, cancel).await?;
        }

        relayed
    }
}
