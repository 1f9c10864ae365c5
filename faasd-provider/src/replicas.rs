//! Replica status of functions, read live from their watchdogs.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::Method;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use utoipa::ToSchema;

use crate::config::ProviderConfig;
use crate::directory::FunctionRecord;
use crate::error::{ProviderError, Result};
use crate::proxy::{Forward, InboundRequest};
use crate::quantity;
use crate::resolver::Resolve;

/// Watchdog answer on the read path. Missing fields read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplicaStatus {
    pub invocation_count: f64,
    pub replicas: u64,
    pub available_replicas: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FunctionResources {
    /// Binary-SI quantity, e.g. `64Mi`.
    pub memory: String,
}

/// Function as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FunctionStatusView {
    pub name: String,
    pub image: String,
    pub replicas: u64,
    pub available_replicas: u64,
    pub invocation_count: f64,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub secrets: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub env_process: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<FunctionResources>,
    pub created_at: DateTime<Utc>,
}

/// Merge a record with its replica data. A zero memory limit is not a limit.
pub fn assemble(record: FunctionRecord, status: ReplicaStatus) -> FunctionStatusView {
    let limits = (record.memory_limit != 0).then(|| FunctionResources {
        memory: quantity::binary_si(record.memory_limit),
    });

    FunctionStatusView {
        name: record.name,
        image: record.image,
        replicas: status.replicas,
        available_replicas: status.available_replicas,
        invocation_count: status.invocation_count,
        namespace: record.namespace,
        labels: record.labels,
        annotations: record.annotations,
        secrets: record.secrets,
        env_vars: record.env_vars,
        env_process: record.env_process,
        limits,
        created_at: record.created_at,
    }
}

#[derive(Clone)]
pub struct ReplicaAggregator {
    resolver: Arc<dyn Resolve>,
    proxy: Arc<dyn Forward>,
    config: Arc<ProviderConfig>,
}

impl ReplicaAggregator {
    pub fn new(
        resolver: Arc<dyn Resolve>,
        proxy: Arc<dyn Forward>,
        config: Arc<ProviderConfig>,
    ) -> Self {
        Self {
            resolver,
            proxy,
            config,
        }
    }

    /// Ask the function's watchdog for its replica counts.
    pub async fn read_replicas(
        &self,
        namespace: &str,
        function: &str,
        inbound: InboundRequest,
    ) -> Result<ReplicaStatus> {
        let endpoint = self.resolver.resolve(namespace, function).await?;
        let response = self
            .proxy
            .forward(inbound, &endpoint, &self.config.read_path)
            .await?
            .error_for_status(function)?;
        let status = response.json::<ReplicaStatus>()?;
        debug!(function = %function, replicas = status.replicas, available = status.available_replicas, "Read replicas");
        Ok(status)
    }

    /// Status view for one function. Replica fields are zero when the
    /// watchdog cannot be resolved or read.
    pub async fn status(&self, record: FunctionRecord, inbound: InboundRequest) -> FunctionStatusView {
        let status = match self
            .read_replicas(&record.namespace, &record.name, inbound)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                log_degraded(&record.name, &e);
                ReplicaStatus::default()
            }
        };
        assemble(record, status)
    }

    /// Status view for a single-function read. A function with no endpoint
    /// is reported as such; watchdog failures still read as zero replicas.
    pub async fn function_status(
        &self,
        record: FunctionRecord,
        inbound: InboundRequest,
    ) -> Result<FunctionStatusView> {
        let status = match self
            .read_replicas(&record.namespace, &record.name, inbound)
            .await
        {
            Ok(status) => status,
            Err(e @ ProviderError::NoEndpoints(_)) => {
                warn!(function = %record.name, error = %e, "Function has no endpoint");
                return Err(e);
            }
            Err(e) => {
                log_degraded(&record.name, &e);
                ReplicaStatus::default()
            }
        };
        Ok(assemble(record, status))
    }

    /// Status views for many functions, read concurrently. Every record
    /// yields an entry, in input order.
    pub async fn list(
        &self,
        records: Vec<FunctionRecord>,
        inbound: InboundRequest,
    ) -> Vec<FunctionStatusView> {
        join_all(
            records
                .into_iter()
                .map(|record| self.status(record, inbound.without_body(Method::GET))),
        )
        .await
    }
}

fn log_degraded(function: &str, err: &ProviderError) {
    match err {
        ProviderError::Upstream { target, .. } | ProviderError::BadUpstreamPayload { target, .. } => {
            warn!(function = %function, target = %target, error = %err, "Replica read failed, reporting zero replicas");
        }
        _ => {
            warn!(function = %function, error = %err, "Replica read failed, reporting zero replicas");
        }
    }
}
