//! Shared test utilities for faasd-provider integration tests.

#![allow(dead_code)]

use axum::Router;
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::{get, post};
use chrono::Utc;
use faasd_provider::engine::{ContainerInfo, NamespaceInfo, TaskAddress};
use faasd_provider::rest::{AppState, create_router};
use faasd_provider::{MemoryEngine, ProviderConfig, TaskResolver, TaskState, WatchdogClient};
use reqwest::{Client, Response as ReqwestResponse};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

pub const NAMESPACE: &str = "openfaas-fn";

/// Replica reading served by a healthy watchdog.
pub const LIVE_REPLICAS: &str = r#"{"invocationCount": 7, "replicas": 1, "availableReplicas": 1}"#;

/// Allocate an available port for testing.
pub fn allocate_port() -> u16 {
    portpicker::pick_unused_port().expect("No available port")
}

/// Address nothing listens on.
pub fn unreachable_address() -> TaskAddress {
    TaskAddress {
        ip: "127.0.0.1".parse().unwrap(),
        port: Some(allocate_port()),
    }
}

/// Engine with a labelled default namespace and an unlabelled `default` one.
pub fn engine() -> MemoryEngine {
    let engine = MemoryEngine::default();
    engine.insert_namespace(NamespaceInfo {
        name: NAMESPACE.to_string(),
        labels: HashMap::from([("openfaas".to_string(), "1".to_string())]),
    });
    engine.insert_namespace(NamespaceInfo {
        name: "default".to_string(),
        labels: HashMap::new(),
    });
    engine
}

/// Register a function in the default namespace.
pub fn add_function(
    engine: &MemoryEngine,
    name: &str,
    memory_limit: i64,
    state: TaskState,
    address: Option<TaskAddress>,
) {
    engine.insert_container(
        NAMESPACE,
        ContainerInfo {
            id: name.to_string(),
            image: format!("ghcr.io/openfaas/{name}:latest"),
            labels: HashMap::from([("com.openfaas.annotations.topic".to_string(), "demo".to_string())]),
            env: vec!["fprocess=cat".to_string()],
            mounts: Vec::new(),
            memory_limit,
            created_at: Utc::now(),
        },
    );
    if let Some(address) = address {
        engine
            .pin_address(NAMESPACE, name, address)
            .expect("Failed to pin address");
    }
    engine
        .set_task_state(NAMESPACE, name, state)
        .expect("Failed to set task state");
}

/// A scale-updater call seen by a fake watchdog.
#[derive(Debug, Clone)]
pub struct RecordedUpdate {
    pub headers: HeaderMap,
    pub query: Option<String>,
    pub body: Bytes,
}

/// Watchdog stand-in serving the reader and updater paths.
pub struct FakeWatchdog {
    pub addr: SocketAddr,
    updates: Arc<Mutex<Vec<RecordedUpdate>>>,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl FakeWatchdog {
    pub async fn spawn(read_body: &'static str, update_status: StatusCode) -> Self {
        let updates: Arc<Mutex<Vec<RecordedUpdate>>> = Arc::default();
        let recorded = updates.clone();

        let router = Router::new()
            .route("/scale-reader", get(move || async move { read_body }))
            .route(
                "/scale-updater",
                post(move |uri: Uri, headers: HeaderMap, body: Bytes| {
                    let recorded = recorded.clone();
                    async move {
                        recorded.lock().unwrap().push(RecordedUpdate {
                            headers,
                            query: uri.query().map(str::to_string),
                            body,
                        });
                        (update_status, "updated")
                    }
                }),
            );

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("Watchdog error");
        });

        Self {
            addr,
            updates,
            shutdown_tx,
        }
    }

    pub fn address(&self) -> TaskAddress {
        TaskAddress {
            ip: self.addr.ip(),
            port: Some(self.addr.port()),
        }
    }

    pub fn updates(&self) -> Vec<RecordedUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Test server wrapper running the provider REST API over a memory engine.
pub struct TestServer {
    pub addr: SocketAddr,
    pub client: Client,
    pub engine: Arc<MemoryEngine>,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestServer {
    pub async fn spawn(engine: MemoryEngine) -> Self {
        let engine = Arc::new(engine);
        let config = Arc::new(ProviderConfig::default());
        let proxy = WatchdogClient::new(&config).expect("Failed to build watchdog client");

        let app_state = Arc::new(AppState::new(
            config,
            engine.clone(),
            Arc::new(TaskResolver::new(engine.clone())),
            Arc::new(proxy),
        ));
        let router = create_router(app_state);

        // Use port 0 to let OS choose available port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("Server error");
        });

        Self {
            addr,
            client: Client::new(),
            engine,
            shutdown_tx,
        }
    }

    /// Get base URL for the REST API.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Perform a GET request.
    pub async fn get(&self, path: &str) -> ReqwestResponse {
        self.client
            .get(format!("{}{}", self.base_url(), path))
            .send()
            .await
            .expect("Request failed")
    }

    /// Perform a POST request with JSON body.
    pub async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> ReqwestResponse {
        self.client
            .post(format!("{}{}", self.base_url(), path))
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    /// Perform a POST request with a raw body.
    pub async fn post_raw(&self, path: &str, body: &'static str) -> ReqwestResponse {
        self.client
            .post(format!("{}{}", self.base_url(), path))
            .body(body)
            .send()
            .await
            .expect("Request failed")
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}
