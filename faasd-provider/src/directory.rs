//! Function metadata read from the container engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::engine::{ContainerEngine, ContainerInfo};
use crate::error::{ProviderError, Result};

/// Labels with this prefix are annotations.
pub const ANNOTATION_LABEL_PREFIX: &str = "com.openfaas.annotations.";

/// Mount destinations under this directory are secrets.
pub const SECRET_MOUNT_DIR: &str = "/var/openfaas/secrets/";

/// Environment entry holding the watchdog's function process.
pub const FPROCESS_ENV: &str = "fprocess";

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionRecord {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub secrets: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub env_process: String,
    pub created_at: DateTime<Utc>,
    /// Bytes, 0 when unset.
    pub memory_limit: i64,
}

impl FunctionRecord {
    pub fn from_container(namespace: &str, container: ContainerInfo) -> Self {
        let (labels, annotations) = split_labels(container.labels);

        let mut env_vars = BTreeMap::new();
        let mut env_process = String::new();
        for entry in &container.env {
            let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
            if key == FPROCESS_ENV {
                env_process = value.to_string();
            } else {
                env_vars.insert(key.to_string(), value.to_string());
            }
        }

        let secrets = container
            .mounts
            .iter()
            .filter_map(|destination| destination.strip_prefix(SECRET_MOUNT_DIR))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();

        Self {
            name: container.id,
            namespace: namespace.to_string(),
            image: container.image,
            labels,
            annotations,
            secrets,
            env_vars,
            env_process,
            created_at: container.created_at,
            memory_limit: container.memory_limit,
        }
    }
}

fn split_labels(
    all: HashMap<String, String>,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut labels = BTreeMap::new();
    let mut annotations = BTreeMap::new();
    for (key, value) in all {
        match key.strip_prefix(ANNOTATION_LABEL_PREFIX) {
            Some(annotation) => {
                annotations.insert(annotation.to_string(), value);
            }
            None => {
                labels.insert(key, value);
            }
        }
    }
    (labels, annotations)
}

/// Read-only function lookup.
#[derive(Clone)]
pub struct FunctionDirectory {
    engine: Arc<dyn ContainerEngine>,
}

impl FunctionDirectory {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// All functions in a namespace, sorted by name.
    pub async fn list(&self, namespace: &str) -> Result<Vec<FunctionRecord>> {
        let mut records: Vec<FunctionRecord> = self
            .engine
            .list_containers(namespace)
            .await?
            .into_iter()
            .map(|container| FunctionRecord::from_container(namespace, container))
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Result<FunctionRecord> {
        self.engine
            .container(namespace, name)
            .await?
            .map(|container| FunctionRecord::from_container(namespace, container))
            .ok_or_else(|| ProviderError::NotFound(name.to_string()))
    }
}
