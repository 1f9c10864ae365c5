//! Namespace validation.

use std::sync::Arc;

use tracing::{debug, error};

use crate::config::ProviderConfig;
use crate::engine::{self, ContainerEngine};
use crate::error::{ProviderError, Result};

#[derive(Clone)]
pub struct NamespaceValidator {
    engine: Arc<dyn ContainerEngine>,
    config: Arc<ProviderConfig>,
}

impl NamespaceValidator {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: Arc<ProviderConfig>) -> Self {
        Self { engine, config }
    }

    /// Check that `namespace` exists and carries the marker label.
    ///
    /// A missing namespace or a wrong label is `Ok(false)`; only engine
    /// failures are errors.
    pub async fn validate(&self, namespace: &str) -> engine::Result<bool> {
        let Some(info) = self.engine.namespace(namespace).await? else {
            debug!(namespace = %namespace, "Namespace does not exist");
            return Ok(false);
        };

        let labelled = info
            .labels
            .get(&self.config.namespace_label)
            .is_some_and(|value| *value == self.config.namespace_label_value);
        if !labelled {
            debug!(namespace = %namespace, "Namespace lacks marker label");
        }
        Ok(labelled)
    }

    /// Resolve the requested namespace (default when blank) and reject it
    /// unless valid.
    pub async fn require(&self, requested: Option<&str>) -> Result<String> {
        let namespace = self.config.namespace_or_default(requested).to_string();

        match self.validate(&namespace).await {
            Ok(true) => Ok(namespace),
            Ok(false) => Err(ProviderError::Validation { namespace }),
            Err(e) => {
                error!(namespace = %namespace, error = %e, "Namespace lookup failed");
                Err(ProviderError::Engine(e))
            }
        }
    }
}
