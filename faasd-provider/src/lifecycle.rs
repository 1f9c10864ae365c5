//! Task lifecycle transitions for scale requests.
//!
//! [`plan`] maps the live task state and the requested replica count to the
//! single action that reconciles them. [`TaskController`] runs that action
//! against the engine under the function's lock:
//!
//! | current | replicas = 0 | replicas > 0 |
//! |---------|--------------|--------------|
//! | absent  | -            | create       |
//! | running | pause        | -            |
//! | paused  | -            | resume       |
//! | stopped | -            | recreate     |
//!
//! Scale-to-zero only ever pauses. Stopped tasks are left alone until
//! replicas are requested again, at which point they are deleted (releasing
//! their network) and created afresh.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{self, ContainerEngine, EngineError, TaskState};
use crate::error::{FaultOrigin, ProviderError, Result};
use crate::lock::{FunctionKey, KeyGuard, KeyedLocks};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    None,
    Create,
    Pause,
    Resume,
    /// Delete the stopped task and its network, then create.
    Recreate,
}

impl ScaleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleAction::None => "none",
            ScaleAction::Create => "create",
            ScaleAction::Pause => "pause",
            ScaleAction::Resume => "resume",
            ScaleAction::Recreate => "recreate",
        }
    }
}

impl fmt::Display for ScaleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action and resulting state for a task in `current` asked for `replicas`.
pub fn plan(current: TaskState, replicas: u64) -> (ScaleAction, TaskState) {
    match (current, replicas > 0) {
        (TaskState::Absent, false) => (ScaleAction::None, TaskState::Absent),
        (TaskState::Absent, true) => (ScaleAction::Create, TaskState::Running),
        (TaskState::Running, false) => (ScaleAction::Pause, TaskState::Paused),
        (TaskState::Running, true) => (ScaleAction::None, TaskState::Running),
        (TaskState::Paused, false) => (ScaleAction::None, TaskState::Paused),
        (TaskState::Paused, true) => (ScaleAction::Resume, TaskState::Running),
        (TaskState::Stopped, false) => (ScaleAction::None, TaskState::Stopped),
        (TaskState::Stopped, true) => (ScaleAction::Recreate, TaskState::Running),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredScale {
    pub function: String,
    pub namespace: String,
    pub replicas: u64,
}

impl DesiredScale {
    pub fn key(&self) -> FunctionKey {
        FunctionKey::new(&self.namespace, &self.function)
    }
}

/// Outcome of an applied scale request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub action: ScaleAction,
    pub from: TaskState,
    pub to: TaskState,
}

fn transition_error(action: &'static str, key: &FunctionKey, source: EngineError) -> ProviderError {
    ProviderError::Transition {
        action,
        function: key.function.clone(),
        origin: FaultOrigin::from(&source),
        source,
    }
}

/// Runs scale transitions, one at a time per function.
#[derive(Clone)]
pub struct TaskController {
    engine: Arc<dyn ContainerEngine>,
    locks: KeyedLocks,
}

impl TaskController {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            locks: KeyedLocks::new(),
        }
    }

    /// Take the function's lock. Hold it across resolve, relay and
    /// [`apply`](Self::apply) so concurrent requests cannot interleave.
    pub async fn exclusive(&self, namespace: &str, function: &str) -> KeyGuard {
        self.locks.acquire(FunctionKey::new(namespace, function)).await
    }

    /// Lock, then apply.
    pub async fn scale(&self, desired: &DesiredScale, cancel: &CancellationToken) -> Result<Transition> {
        let guard = self.exclusive(&desired.namespace, &desired.function).await;
        self.apply(&guard, desired, cancel).await
    }

    /// Bring the task in line with `desired`, reading its state afresh.
    pub async fn apply(
        &self,
        guard: &KeyGuard,
        desired: &DesiredScale,
        cancel: &CancellationToken,
    ) -> Result<Transition> {
        let key = desired.key();
        if guard.key() != &key {
            return Err(EngineError::Internal(format!(
                "lock for {} held while scaling {key}",
                guard.key()
            ))
            .into());
        }

        let from = match self.engine.task_state(&key.namespace, &key.function).await {
            Ok(state) => state,
            Err(EngineError::NotFound { .. }) => {
                return Err(ProviderError::NotFound(key.function.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let (action, to) = plan(from, desired.replicas);
        debug!(function = %key.function, namespace = %key.namespace, from = %from, replicas = desired.replicas, action = %action, "Planned transition");

        let outcome = match action {
            ScaleAction::None => Ok(()),
            ScaleAction::Pause => self
                .dispatch(&key, |engine, ns, id| async move { engine.pause_task(&ns, &id).await })
                .await
                .map_err(|e| transition_error("pause", &key, e)),
            ScaleAction::Resume => self
                .dispatch(&key, |engine, ns, id| async move { engine.resume_task(&ns, &id).await })
                .await
                .map_err(|e| transition_error("resume", &key, e)),
            ScaleAction::Create => self.create(&key).await,
            ScaleAction::Recreate => {
                if cancel.is_cancelled() {
                    info!(function = %key.function, "Caller went away, not deleting task");
                    return Err(ProviderError::Cancelled);
                }
                match self.delete(&key).await {
                    Ok(()) => self.create(&key).await,
                    Err(e) => Err(e),
                }
            }
        };

        match outcome {
            Ok(()) => {
                if action != ScaleAction::None {
                    info!(function = %key.function, namespace = %key.namespace, action = %action, from = %from, to = %to, "Applied scale transition");
                }
                Ok(Transition { action, from, to })
            }
            Err(e) => {
                error!(function = %key.function, namespace = %key.namespace, action = %action, error = %e, "Scale transition failed");
                Err(e)
            }
        }
    }

    /// Attach, then create. A failed create releases the attachment only if
    /// this call allocated it.
    async fn create(&self, key: &FunctionKey) -> Result<()> {
        let attachment = self
            .dispatch(key, |engine, ns, id| async move { engine.attach_network(&ns, &id).await })
            .await
            .map_err(|e| transition_error("attach network", key, e))?;
        debug!(function = %key.function, address = %attachment.address, allocated = attachment.allocated, "Network attached");

        let created = self
            .dispatch(key, |engine, ns, id| async move { engine.create_task(&ns, &id).await })
            .await;
        if let Err(e) = created {
            if attachment.allocated {
                if let Err(rollback) = self
                    .dispatch(key, |engine, ns, id| async move { engine.detach_network(&ns, &id).await })
                    .await
                {
                    warn!(function = %key.function, address = %attachment.address, error = %rollback, "Failed to release network after create failure");
                }
            }
            return Err(transition_error("create", key, e));
        }
        Ok(())
    }

    async fn delete(&self, key: &FunctionKey) -> Result<()> {
        self.dispatch(key, |engine, ns, id| async move { engine.delete_task(&ns, &id).await })
            .await
            .map_err(|e| transition_error("delete", key, e))?;
        self.dispatch(key, |engine, ns, id| async move { engine.detach_network(&ns, &id).await })
            .await
            .map_err(|e| transition_error("detach network", key, e))
    }

    /// Run one engine call on its own task so it completes even if the
    /// request driving it is dropped.
    async fn dispatch<T, F, Fut>(&self, key: &FunctionKey, op: F) -> engine::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn ContainerEngine>, String, String) -> Fut,
        Fut: Future<Output = engine::Result<T>> + Send + 'static,
    {
        let call = op(
            self.engine.clone(),
            key.namespace.clone(),
            key.function.clone(),
        );
        tokio::spawn(call)
            .await
            .map_err(|e| EngineError::Internal(format!("engine call did not complete: {e}")))?
    }
}
