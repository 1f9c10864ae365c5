pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod lock;
pub mod namespace;
pub mod proxy;
pub mod quantity;
pub mod replicas;
pub mod resolver;
pub mod rest;
pub mod scale;

pub use config::ProviderConfig;
pub use engine::{ContainerEngine, EngineError, MemoryEngine, TaskState};
pub use error::ProviderError;
pub use lifecycle::{DesiredScale, ScaleAction, TaskController, plan};
pub use proxy::{Forward, WatchdogClient};
pub use replicas::{FunctionStatusView, ReplicaAggregator};
pub use resolver::{NetworkEndpoint, Resolve, TaskResolver};
