//! Per-function exclusion for scale transitions.
//!
//! Each (namespace, function) key gets its own async mutex, created on first
//! use and dropped once nobody holds or waits on it, including waiters that
//! gave up. Distinct keys never contend.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionKey {
    pub namespace: String,
    pub function: String,
}

impl FunctionKey {
    pub fn new(namespace: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            function: function.into(),
        }
    }
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.function)
    }
}

/// One key's mutex and how many holders and waiters are registered on it.
struct Slot {
    mutex: Arc<tokio::sync::Mutex<()>>,
    users: usize,
}

type LockTable = HashMap<FunctionKey, Slot>;

#[derive(Clone, Default)]
pub struct KeyedLocks {
    table: Arc<Mutex<LockTable>>,
}

fn table_lock(table: &Mutex<LockTable>) -> MutexGuard<'_, LockTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`. Dropping the returned future
    /// before it completes gives up the wait.
    pub async fn acquire(&self, key: FunctionKey) -> KeyGuard {
        let (mutex, registration) = {
            let mut table = table_lock(&self.table);
            let slot = table.entry(key.clone()).or_insert_with(|| Slot {
                mutex: Arc::new(tokio::sync::Mutex::new(())),
                users: 0,
            });
            slot.users += 1;
            (
                slot.mutex.clone(),
                Registration {
                    key,
                    table: self.table.clone(),
                },
            )
        };

        let guard = mutex.lock_owned().await;
        KeyGuard {
            _guard: guard,
            registration,
        }
    }

    /// Number of keys with a live lock entry.
    pub fn len(&self) -> usize {
        table_lock(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A holder's or waiter's claim on a key. The entry goes once the last
/// claim is dropped.
struct Registration {
    key: FunctionKey,
    table: Arc<Mutex<LockTable>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut table = table_lock(&self.table);
        if let Some(slot) = table.get_mut(&self.key) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                table.remove(&self.key);
            }
        }
    }
}

/// Exclusive access to one key, released on drop.
pub struct KeyGuard {
    // Unlocks before the registration is dropped.
    _guard: OwnedMutexGuard<()>,
    registration: Registration,
}

impl KeyGuard {
    pub fn key(&self) -> &FunctionKey {
        &self.registration.key
    }
}

impl fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGuard").field("key", self.key()).finish()
    }
}
