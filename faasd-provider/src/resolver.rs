//! Function name to live watchdog endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::engine::{ContainerEngine, EngineError, TaskState};
use crate::error::{ProviderError, Result};

/// Where a function's watchdog can be reached for the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEndpoint {
    pub function: String,
    pub host: String,
    pub port: Option<u16>,
}

impl NetworkEndpoint {
    pub fn new(function: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            function: function.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port`, using `default_port` when the endpoint has none.
    pub fn authority(&self, default_port: u16) -> String {
        let port = self.port.unwrap_or(default_port);
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, port)
        } else {
            format!("{}:{}", self.host, port)
        }
    }
}

/// Address resolution. Implementations look the address up on every call.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, namespace: &str, function: &str) -> Result<NetworkEndpoint>;
}

/// Resolves through the engine's task and network attachment.
#[derive(Clone)]
pub struct TaskResolver {
    engine: Arc<dyn ContainerEngine>,
}

impl TaskResolver {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Resolve for TaskResolver {
    async fn resolve(&self, namespace: &str, function: &str) -> Result<NetworkEndpoint> {
        let state = match self.engine.task_state(namespace, function).await {
            Ok(state) => state,
            Err(EngineError::NotFound { .. }) => {
                return Err(ProviderError::NoEndpoints(function.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if !matches!(state, TaskState::Running | TaskState::Paused) {
            debug!(function = %function, state = %state, "Task not serving");
            return Err(ProviderError::NoEndpoints(function.to_string()));
        }

        let address = match self.engine.task_address(namespace, function).await {
            Ok(Some(address)) => address,
            Ok(None) | Err(EngineError::NotFound { .. }) => {
                debug!(function = %function, "Task has no address");
                return Err(ProviderError::NoEndpoints(function.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(NetworkEndpoint::new(
            function,
            address.ip.to_string(),
            address.port,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ContainerInfo, MemoryEngine, TaskAddress};
    use chrono::Utc;
    use std::collections::HashMap;

    fn container(id: &str) -> ContainerInfo {
        ContainerInfo {
            id: id.to_string(),
            image: format!("{id}:latest"),
            labels: HashMap::new(),
            env: Vec::new(),
            mounts: Vec::new(),
            memory_limit: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_authority() {
        let v4 = NetworkEndpoint::new("figlet", "10.62.0.2", None);
        assert_eq!(v4.authority(8080), "10.62.0.2:8080");

        let pinned = NetworkEndpoint::new("figlet", "127.0.0.1", Some(9001));
        assert_eq!(pinned.authority(8080), "127.0.0.1:9001");

        let v6 = NetworkEndpoint::new("figlet", "fd00::2", None);
        assert_eq!(v6.authority(8080), "[fd00::2]:8080");
    }

    #[tokio::test]
    async fn test_resolve_by_state() {
        let engine = Arc::new(MemoryEngine::default());
        engine.insert_container("fn", container("figlet"));
        let resolver = TaskResolver::new(engine.clone());

        // Absent
        assert!(matches!(
            resolver.resolve("fn", "figlet").await,
            Err(ProviderError::NoEndpoints(_))
        ));

        engine.set_task_state("fn", "figlet", TaskState::Running).unwrap();
        let endpoint = resolver.resolve("fn", "figlet").await.unwrap();
        assert_eq!(endpoint.host, "10.62.0.2");
        assert_eq!(endpoint.port, None);

        engine.set_task_state("fn", "figlet", TaskState::Paused).unwrap();
        assert!(resolver.resolve("fn", "figlet").await.is_ok());

        engine.set_task_state("fn", "figlet", TaskState::Stopped).unwrap();
        assert!(matches!(
            resolver.resolve("fn", "figlet").await,
            Err(ProviderError::NoEndpoints(_))
        ));

        // Missing container
        assert!(matches!(
            resolver.resolve("fn", "nodeinfo").await,
            Err(ProviderError::NoEndpoints(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_is_fresh() {
        let engine = Arc::new(MemoryEngine::default());
        engine.insert_container("fn", container("figlet"));
        engine.set_task_state("fn", "figlet", TaskState::Running).unwrap();
        let resolver = TaskResolver::new(engine.clone());

        let before = resolver.resolve("fn", "figlet").await.unwrap();
        engine
            .pin_address("fn", "figlet", "127.0.0.1:9001".parse::<TaskAddress>().unwrap())
            .unwrap();
        let after = resolver.resolve("fn", "figlet").await.unwrap();

        assert_ne!(before, after);
        assert_eq!(after.authority(8080), "127.0.0.1:9001");
    }
}
