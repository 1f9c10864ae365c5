//! In-process container engine.
//!
//! Keeps the task table and an IPv4 address pool in memory. The daemon runs
//! against it when no external engine is wired in, and the tests use its call
//! log, fault injection and action delay to observe exactly which engine
//! operations the provider performs.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::Deserialize;
use tracing::debug;

use super::{
    ContainerEngine, ContainerInfo, EngineError, NamespaceInfo, NetworkAttachment, Result, TaskAddress,
    TaskState,
};

/// Default subnet handed out to function tasks.
pub const DEFAULT_SUBNET: &str = "10.62.0.0/16";

/// Engine operations that can be observed or made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    Namespace,
    Pause,
    Resume,
    DeleteTask,
    CreateTask,
    AttachNetwork,
    DetachNetwork,
}

/// One mutating call received by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCall {
    pub op: EngineOp,
    pub namespace: String,
    pub id: String,
}

/// Initial engine content, usually read from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineSeed {
    #[serde(default)]
    pub namespaces: Vec<NamespaceInfo>,
    #[serde(default)]
    pub containers: Vec<SeedContainer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedContainer {
    pub namespace: String,
    #[serde(flatten)]
    pub container: ContainerInfo,
    /// Initial task state, absent when omitted.
    #[serde(default)]
    pub task: Option<TaskState>,
    /// Fixed address (`ip` or `ip:port`) used instead of the pool.
    #[serde(default)]
    pub address: Option<String>,
}

struct ContainerEntry {
    info: ContainerInfo,
    task: TaskState,
    attachment: Option<TaskAddress>,
    pinned: Option<TaskAddress>,
}

struct AddressPool {
    subnet: Ipv4Net,
    used: HashSet<Ipv4Addr>,
}

impl AddressPool {
    fn new(subnet: Ipv4Net) -> Self {
        Self {
            subnet,
            used: HashSet::new(),
        }
    }

    /// Next free host address. `.1` is kept for the bridge gateway.
    fn allocate(&mut self) -> Option<Ipv4Addr> {
        let network = u32::from(self.subnet.network());
        let broadcast = u32::from(self.subnet.broadcast());

        for addr_int in network.saturating_add(2)..broadcast {
            let addr = Ipv4Addr::from(addr_int);
            if self.used.insert(addr) {
                return Some(addr);
            }
        }
        None
    }

    fn release(&mut self, addr: IpAddr) {
        if let IpAddr::V4(v4) = addr {
            self.used.remove(&v4);
        }
    }
}

struct EngineState {
    namespaces: HashMap<String, NamespaceInfo>,
    containers: HashMap<(String, String), ContainerEntry>,
    pool: AddressPool,
}

impl EngineState {
    fn entry_mut(&mut self, namespace: &str, id: &str) -> Result<&mut ContainerEntry> {
        self.containers
            .get_mut(&(namespace.to_string(), id.to_string()))
            .ok_or_else(|| EngineError::container_not_found(id))
    }

    fn attach(&mut self, namespace: &str, id: &str) -> Result<NetworkAttachment> {
        let key = (namespace.to_string(), id.to_string());
        let entry = self
            .containers
            .get_mut(&key)
            .ok_or_else(|| EngineError::container_not_found(id))?;

        if let Some(existing) = entry.attachment {
            return Ok(NetworkAttachment {
                address: existing,
                allocated: false,
            });
        }

        let address = match entry.pinned {
            Some(pinned) => pinned,
            None => {
                let ip = self
                    .pool
                    .allocate()
                    .ok_or_else(|| EngineError::Network("address pool exhausted".to_string()))?;
                TaskAddress::new(IpAddr::V4(ip))
            }
        };
        entry.attachment = Some(address);
        Ok(NetworkAttachment {
            address,
            allocated: true,
        })
    }

    fn detach(&mut self, namespace: &str, id: &str) -> Result<()> {
        let key = (namespace.to_string(), id.to_string());
        let entry = self
            .containers
            .get_mut(&key)
            .ok_or_else(|| EngineError::container_not_found(id))?;

        if let Some(address) = entry.attachment.take() {
            if entry.pinned.is_none() {
                self.pool.release(address.ip);
            }
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn expect_state(id: &str, actual: TaskState, expected: TaskState) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(EngineError::InvalidState {
            id: id.to_string(),
            expected,
            actual,
        })
    }
}

#[derive(Default, Clone, Copy)]
struct Flight {
    current: usize,
    max: usize,
}

/// Tracks concurrent mutating calls per container while alive.
struct FlightGuard<'a> {
    engine: &'a MemoryEngine,
    key: (String, String),
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut flights = lock(&self.engine.flights);
        if let Some(flight) = flights.get_mut(&self.key) {
            flight.current = flight.current.saturating_sub(1);
        }
    }
}

/// Container engine held entirely in memory.
pub struct MemoryEngine {
    state: Mutex<EngineState>,
    calls: Mutex<Vec<EngineCall>>,
    faults: Mutex<HashMap<EngineOp, EngineError>>,
    flights: Mutex<HashMap<(String, String), Flight>>,
    action_delay: Duration,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        let subnet = DEFAULT_SUBNET
            .parse()
            .unwrap_or_else(|_| Ipv4Net::from(Ipv4Addr::new(10, 62, 0, 0)));
        Self::new(subnet)
    }
}

impl MemoryEngine {
    pub fn new(subnet: Ipv4Net) -> Self {
        Self {
            state: Mutex::new(EngineState {
                namespaces: HashMap::new(),
                containers: HashMap::new(),
                pool: AddressPool::new(subnet),
            }),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            action_delay: Duration::ZERO,
        }
    }

    /// Build an engine from a seed. Tasks seeded as running or paused get an
    /// address straight away.
    pub fn from_seed(seed: EngineSeed, subnet: Ipv4Net) -> Result<Self> {
        let engine = Self::new(subnet);

        for namespace in seed.namespaces {
            engine.insert_namespace(namespace);
        }

        for seeded in seed.containers {
            let id = seeded.container.id.clone();
            let pinned = seeded
                .address
                .as_deref()
                .map(str::parse::<TaskAddress>)
                .transpose()
                .map_err(EngineError::Internal)?;

            engine.insert_container(&seeded.namespace, seeded.container);
            if let Some(address) = pinned {
                engine.pin_address(&seeded.namespace, &id, address)?;
            }
            if let Some(task) = seeded.task {
                engine.set_task_state(&seeded.namespace, &id, task)?;
            }
        }

        Ok(engine)
    }

    /// Sleep this long inside every mutating call, widening the window in
    /// which overlapping calls would be observed.
    pub fn with_action_delay(mut self, delay: Duration) -> Self {
        self.action_delay = delay;
        self
    }

    pub fn insert_namespace(&self, namespace: NamespaceInfo) {
        lock(&self.state)
            .namespaces
            .insert(namespace.name.clone(), namespace);
    }

    /// Register a container with no task.
    pub fn insert_container(&self, namespace: &str, info: ContainerInfo) {
        let key = (namespace.to_string(), info.id.clone());
        lock(&self.state).containers.insert(
            key,
            ContainerEntry {
                info,
                task: TaskState::Absent,
                attachment: None,
                pinned: None,
            },
        );
    }

    /// Fix the address the container's attachments will use.
    pub fn pin_address(&self, namespace: &str, id: &str, address: TaskAddress) -> Result<()> {
        let mut state = lock(&self.state);
        let entry = state.entry_mut(namespace, id)?;
        let pooled = match entry.attachment {
            Some(current) if entry.pinned.is_none() => Some(current.ip),
            _ => None,
        };
        if entry.attachment.is_some() {
            entry.attachment = Some(address);
        }
        entry.pinned = Some(address);
        if let Some(ip) = pooled {
            state.pool.release(ip);
        }
        Ok(())
    }

    /// Force a task state, as if changed outside the provider (task exit,
    /// operator action). Running and paused tasks are given an address.
    pub fn set_task_state(&self, namespace: &str, id: &str, task: TaskState) -> Result<()> {
        let mut state = lock(&self.state);
        match task {
            TaskState::Running | TaskState::Paused => {
                state.attach(namespace, id)?;
            }
            TaskState::Absent => state.detach(namespace, id)?,
            TaskState::Stopped => {}
        }
        state.entry_mut(namespace, id)?.task = task;
        Ok(())
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: EngineOp, error: EngineError) {
        lock(&self.faults).insert(op, error);
    }

    /// Mutating calls received so far, in order.
    pub fn calls(&self) -> Vec<EngineCall> {
        lock(&self.calls).clone()
    }

    pub fn ops(&self) -> Vec<EngineOp> {
        lock(&self.calls).iter().map(|call| call.op).collect()
    }

    /// Highest number of mutating calls seen in flight at once for a container.
    pub fn max_concurrent_actions(&self, namespace: &str, id: &str) -> usize {
        lock(&self.flights)
            .get(&(namespace.to_string(), id.to_string()))
            .map(|flight| flight.max)
            .unwrap_or(0)
    }

    pub fn attachment(&self, namespace: &str, id: &str) -> Option<TaskAddress> {
        lock(&self.state)
            .containers
            .get(&(namespace.to_string(), id.to_string()))
            .and_then(|entry| entry.attachment)
    }

    /// Number of pool addresses currently handed out.
    pub fn allocated_addresses(&self) -> usize {
        lock(&self.state).pool.used.len()
    }

    fn take_fault(&self, op: EngineOp) -> Result<()> {
        match lock(&self.faults).remove(&op) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn begin(&self, op: EngineOp, namespace: &str, id: &str) -> FlightGuard<'_> {
        let key = (namespace.to_string(), id.to_string());
        {
            let mut flights = lock(&self.flights);
            let flight = flights.entry(key.clone()).or_default();
            flight.current += 1;
            flight.max = flight.max.max(flight.current);
        }
        lock(&self.calls).push(EngineCall {
            op,
            namespace: namespace.to_string(),
            id: id.to_string(),
        });
        debug!(?op, namespace = %namespace, id = %id, "Engine call");
        FlightGuard { engine: self, key }
    }

    async fn mutate<T, F>(&self, op: EngineOp, namespace: &str, id: &str, apply: F) -> Result<T>
    where
        F: FnOnce(&mut EngineState) -> Result<T> + Send,
    {
        let _flight = self.begin(op, namespace, id);
        if !self.action_delay.is_zero() {
            tokio::time::sleep(self.action_delay).await;
        }
        self.take_fault(op)?;
        let mut state = lock(&self.state);
        apply(&mut state)
    }
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    async fn namespace(&self, name: &str) -> Result<Option<NamespaceInfo>> {
        self.take_fault(EngineOp::Namespace)?;
        Ok(lock(&self.state).namespaces.get(name).cloned())
    }

    async fn list_containers(&self, namespace: &str) -> Result<Vec<ContainerInfo>> {
        let state = lock(&self.state);
        let mut containers: Vec<ContainerInfo> = state
            .containers
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, entry)| entry.info.clone())
            .collect();
        containers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(containers)
    }

    async fn container(&self, namespace: &str, id: &str) -> Result<Option<ContainerInfo>> {
        Ok(lock(&self.state)
            .containers
            .get(&(namespace.to_string(), id.to_string()))
            .map(|entry| entry.info.clone()))
    }

    async fn task_state(&self, namespace: &str, id: &str) -> Result<TaskState> {
        Ok(lock(&self.state).entry_mut(namespace, id)?.task)
    }

    async fn task_address(&self, namespace: &str, id: &str) -> Result<Option<TaskAddress>> {
        Ok(lock(&self.state).entry_mut(namespace, id)?.attachment)
    }

    async fn pause_task(&self, namespace: &str, id: &str) -> Result<()> {
        self.mutate(EngineOp::Pause, namespace, id, |state| {
            let entry = state.entry_mut(namespace, id)?;
            expect_state(id, entry.task, TaskState::Running)?;
            entry.task = TaskState::Paused;
            Ok(())
        })
        .await
    }

    async fn resume_task(&self, namespace: &str, id: &str) -> Result<()> {
        self.mutate(EngineOp::Resume, namespace, id, |state| {
            let entry = state.entry_mut(namespace, id)?;
            expect_state(id, entry.task, TaskState::Paused)?;
            entry.task = TaskState::Running;
            Ok(())
        })
        .await
    }

    async fn delete_task(&self, namespace: &str, id: &str) -> Result<()> {
        self.mutate(EngineOp::DeleteTask, namespace, id, |state| {
            let entry = state.entry_mut(namespace, id)?;
            expect_state(id, entry.task, TaskState::Stopped)?;
            entry.task = TaskState::Absent;
            Ok(())
        })
        .await
    }

    async fn create_task(&self, namespace: &str, id: &str) -> Result<()> {
        self.mutate(EngineOp::CreateTask, namespace, id, |state| {
            let entry = state.entry_mut(namespace, id)?;
            expect_state(id, entry.task, TaskState::Absent)?;
            if entry.attachment.is_none() {
                return Err(EngineError::Network(format!("no network attached to {id}")));
            }
            entry.task = TaskState::Running;
            Ok(())
        })
        .await
    }

    async fn attach_network(&self, namespace: &str, id: &str) -> Result<NetworkAttachment> {
        self.mutate(EngineOp::AttachNetwork, namespace, id, |state| {
            state.attach(namespace, id)
        })
        .await
    }

    async fn detach_network(&self, namespace: &str, id: &str) -> Result<()> {
        self.mutate(EngineOp::DetachNetwork, namespace, id, |state| {
            state.detach(namespace, id)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn container(id: &str) -> ContainerInfo {
        ContainerInfo {
            id: id.to_string(),
            image: format!("ghcr.io/openfaas/{id}:latest"),
            labels: HashMap::new(),
            env: Vec::new(),
            mounts: Vec::new(),
            memory_limit: 0,
            created_at: Utc::now(),
        }
    }

    fn small_engine() -> MemoryEngine {
        MemoryEngine::new("10.62.0.0/29".parse().unwrap())
    }

    #[test]
    fn test_pool_skips_network_and_gateway() {
        let mut pool = AddressPool::new("10.62.0.0/29".parse().unwrap());
        let first = pool.allocate().unwrap();
        assert_eq!(first, Ipv4Addr::new(10, 62, 0, 2));

        // .2 through .6 are usable, .7 is broadcast
        let rest: Vec<_> = std::iter::from_fn(|| pool.allocate()).collect();
        assert_eq!(rest.len(), 4);
        assert_eq!(rest.last(), Some(&Ipv4Addr::new(10, 62, 0, 6)));

        pool.release(IpAddr::V4(first));
        assert_eq!(pool.allocate(), Some(first));
    }

    #[tokio::test]
    async fn test_create_requires_network() {
        let engine = small_engine();
        engine.insert_container("fn", container("figlet"));

        let err = engine.create_task("fn", "figlet").await.unwrap_err();
        assert!(matches!(err, EngineError::Network(_)));

        let attachment = engine.attach_network("fn", "figlet").await.unwrap();
        assert_eq!(attachment.address.ip, IpAddr::V4(Ipv4Addr::new(10, 62, 0, 2)));
        assert!(attachment.allocated);

        // Attaching again hands back the same address
        let again = engine.attach_network("fn", "figlet").await.unwrap();
        assert_eq!(again.address, attachment.address);
        assert!(!again.allocated);
        assert_eq!(engine.allocated_addresses(), 1);

        engine.create_task("fn", "figlet").await.unwrap();
        assert_eq!(
            engine.task_state("fn", "figlet").await.unwrap(),
            TaskState::Running
        );
    }

    #[tokio::test]
    async fn test_transitions_enforce_state() {
        let engine = small_engine();
        engine.insert_container("fn", container("figlet"));
        engine
            .set_task_state("fn", "figlet", TaskState::Running)
            .unwrap();

        assert!(matches!(
            engine.resume_task("fn", "figlet").await,
            Err(EngineError::InvalidState { .. })
        ));
        assert!(matches!(
            engine.delete_task("fn", "figlet").await,
            Err(EngineError::InvalidState { .. })
        ));

        engine.pause_task("fn", "figlet").await.unwrap();
        engine.resume_task("fn", "figlet").await.unwrap();

        engine
            .set_task_state("fn", "figlet", TaskState::Stopped)
            .unwrap();
        engine.delete_task("fn", "figlet").await.unwrap();
        assert_eq!(
            engine.task_state("fn", "figlet").await.unwrap(),
            TaskState::Absent
        );
    }

    #[tokio::test]
    async fn test_detach_releases_address() {
        let engine = small_engine();
        engine.insert_container("fn", container("figlet"));

        engine.attach_network("fn", "figlet").await.unwrap();
        assert_eq!(engine.allocated_addresses(), 1);

        engine.detach_network("fn", "figlet").await.unwrap();
        assert_eq!(engine.allocated_addresses(), 0);
        assert_eq!(engine.attachment("fn", "figlet"), None);

        // Releasing twice is fine
        engine.detach_network("fn", "figlet").await.unwrap();
    }

    #[tokio::test]
    async fn test_fault_is_one_shot() {
        let engine = small_engine();
        engine.insert_container("fn", container("figlet"));
        engine
            .set_task_state("fn", "figlet", TaskState::Running)
            .unwrap();

        engine.fail_next(EngineOp::Pause, EngineError::Internal("shim died".into()));
        assert!(engine.pause_task("fn", "figlet").await.is_err());
        assert_eq!(
            engine.task_state("fn", "figlet").await.unwrap(),
            TaskState::Running
        );
        engine.pause_task("fn", "figlet").await.unwrap();
        assert_eq!(engine.ops(), vec![EngineOp::Pause, EngineOp::Pause]);
    }

    #[test]
    fn test_from_seed() {
        let seed: EngineSeed = serde_json::from_str(
            r#"{
                "namespaces": [{"name": "openfaas-fn", "labels": {"openfaas": "1"}}],
                "containers": [
                    {"namespace": "openfaas-fn", "id": "figlet", "image": "figlet:latest",
                     "task": "running", "address": "127.0.0.1:9001"},
                    {"namespace": "openfaas-fn", "id": "nodeinfo", "image": "nodeinfo:latest",
                     "memory_limit": 67108864, "task": "paused"},
                    {"namespace": "openfaas-fn", "id": "env", "image": "env:latest"}
                ]
            }"#,
        )
        .unwrap();

        let engine = MemoryEngine::from_seed(seed, "10.62.0.0/16".parse().unwrap()).unwrap();

        assert_eq!(
            engine.attachment("openfaas-fn", "figlet"),
            Some("127.0.0.1:9001".parse().unwrap())
        );
        assert_eq!(
            engine.attachment("openfaas-fn", "nodeinfo"),
            Some("10.62.0.2".parse().unwrap())
        );
        assert_eq!(engine.attachment("openfaas-fn", "env"), None);
        // Pinned addresses do not come from the pool
        assert_eq!(engine.allocated_addresses(), 1);
        assert!(engine.calls().is_empty());
    }
}
