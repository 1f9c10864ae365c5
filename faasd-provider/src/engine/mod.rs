//! Container engine contract.
//!
//! The provider never talks to the engine's wire protocol directly. Everything
//! it needs from the engine (namespace metadata, container metadata, task
//! status, the four task transitions and the paired network attach/detach) is
//! expressed by [`ContainerEngine`], so components depend on the contract and
//! tests can run against [`MemoryEngine`].

mod error;
pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use error::{EngineError, Result};
pub use memory::MemoryEngine;

/// Namespace as stored by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Container metadata. One container backs one function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub image: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Process environment as `KEY=VALUE` entries.
    #[serde(default)]
    pub env: Vec<String>,
    /// Mount destinations inside the container.
    #[serde(default)]
    pub mounts: Vec<String>,
    /// Memory limit in bytes, 0 when unset.
    #[serde(default)]
    pub memory_limit: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// State of the engine task backing a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Absent,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Absent => "absent",
            TaskState::Running => "running",
            TaskState::Paused => "paused",
            TaskState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Address assigned to a task by its network attachment.
///
/// `port` is only set when the attachment maps the watchdog to a specific
/// port; otherwise callers use the configured watchdog port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskAddress {
    pub ip: IpAddr,
    pub port: Option<u16>,
}

impl TaskAddress {
    pub fn new(ip: IpAddr) -> Self {
        Self { ip, port: None }
    }
}

impl FromStr for TaskAddress {
    type Err = String;

    /// Parses `ip` or `ip:port` (`[v6]:port` for IPv6).
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self {
                ip: addr.ip(),
                port: Some(addr.port()),
            });
        }
        s.parse::<IpAddr>()
            .map(Self::new)
            .map_err(|_| format!("invalid task address: {s}"))
    }
}

impl fmt::Display for TaskAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}", SocketAddr::new(self.ip, port)),
            None => write!(f, "{}", self.ip),
        }
    }
}

/// Outcome of attaching a container to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub address: TaskAddress,
    /// False when the container was already attached and nothing new was
    /// allocated.
    pub allocated: bool,
}

/// Capabilities the provider requires from a container engine.
///
/// Every call reflects the engine's current view; implementations must not
/// serve cached task state.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Look up a namespace. `Ok(None)` means it does not exist.
    async fn namespace(&self, name: &str) -> Result<Option<NamespaceInfo>>;

    /// List all containers in a namespace.
    async fn list_containers(&self, namespace: &str) -> Result<Vec<ContainerInfo>>;

    /// Get a container by ID. `Ok(None)` means it does not exist.
    async fn container(&self, namespace: &str, id: &str) -> Result<Option<ContainerInfo>>;

    /// Current state of the container's task.
    async fn task_state(&self, namespace: &str, id: &str) -> Result<TaskState>;

    /// Address of the container's network attachment, if any.
    async fn task_address(&self, namespace: &str, id: &str) -> Result<Option<TaskAddress>>;

    /// Freeze a running task.
    async fn pause_task(&self, namespace: &str, id: &str) -> Result<()>;

    /// Thaw a paused task.
    async fn resume_task(&self, namespace: &str, id: &str) -> Result<()>;

    /// Remove a stopped task.
    async fn delete_task(&self, namespace: &str, id: &str) -> Result<()>;

    /// Create and start a task. The network must already be attached.
    async fn create_task(&self, namespace: &str, id: &str) -> Result<()>;

    /// Allocate a network attachment for the container. An existing
    /// attachment is returned as-is.
    async fn attach_network(&self, namespace: &str, id: &str) -> Result<NetworkAttachment>;

    /// Release the container's network attachment. Releasing an absent
    /// attachment succeeds.
    async fn detach_network(&self, namespace: &str, id: &str) -> Result<()>;
}
