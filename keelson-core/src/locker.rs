//! Cooperative keyed locks.
//!
//! [`lock`] blocks the calling loop coroutine until every requested key is
//! free, acquires them atomically, and returns a guard that releases them on
//! drop. Keys of different types live in different tables, so `lock(["a"])`
//! and `lock([42u64])` never contend.
//!
//! Waiters queue per key in FIFO order; on release the first pending locker
//! whose full key set is free wins. Fairness is best-effort: under
//! adversarial key patterns a multi-key waiter can be overtaken repeatedly.

use std::any::{Any, TypeId};
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use hashbrown::{HashMap, HashSet};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::event_loop;

/// One lock table per key type.
static TABLES: Lazy<DashMap<TypeId, Arc<dyn Any + Send + Sync>>> = Lazy::new(DashMap::new);

type Keys<K> = SmallVec<[K; 2]>;

struct Waiter<K> {
    keys: Keys<K>,
    ready: flume::Sender<()>,
}

struct TypeTable<K> {
    held: HashSet<K>,
    waits: HashMap<K, Vec<Arc<Waiter<K>>>>,
}

impl<K: Eq + Hash + Clone> TypeTable<K> {
    fn new() -> Self {
        Self {
            held: HashSet::new(),
            waits: HashMap::new(),
        }
    }

    /// Acquire every key of `waiter` if all are free, deregistering it from
    /// the wait queues and signalling it ready.
    fn try_acquire(&mut self, waiter: &Arc<Waiter<K>>) -> bool {
        if waiter.keys.iter().any(|key| self.held.contains(key)) {
            return false;
        }
        for key in &waiter.keys {
            self.held.insert(key.clone());
        }
        for key in &waiter.keys {
            let empty = match self.waits.get_mut(key) {
                Some(queue) => {
                    queue.retain(|pending| !Arc::ptr_eq(pending, waiter));
                    queue.is_empty()
                }
                None => false,
            };
            if empty {
                self.waits.remove(key);
            }
        }
        let _ = waiter.ready.send(());
        true
    }
}

fn table_for<K: Eq + Hash + Clone + Send + Sync + 'static>() -> Arc<Mutex<TypeTable<K>>> {
    let table: Arc<dyn Any + Send + Sync> = {
        let entry = TABLES.entry(TypeId::of::<K>()).or_insert_with(|| {
            Arc::new(Mutex::new(TypeTable::<K>::new())) as Arc<dyn Any + Send + Sync>
        });
        entry.value().clone()
    };
    table
        .downcast::<Mutex<TypeTable<K>>>()
        .expect("lock table keyed by TypeId")
}

/// Releases its keys when dropped, waking the first pending locker whose
/// key set became satisfiable.
pub struct LockGuard<K: Eq + Hash + Clone + Send + Sync + 'static> {
    keys: Keys<K>,
    table: Arc<Mutex<TypeTable<K>>>,
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> Drop for LockGuard<K> {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        for key in &self.keys {
            table.held.remove(key);
        }
        for key in &self.keys {
            let Some(queue) = table.waits.get(key).cloned() else {
                continue;
            };
            for waiter in queue {
                if table.try_acquire(&waiter) {
                    break;
                }
            }
        }
    }
}

/// Atomically acquire every key, suspending the current loop coroutine
/// until all of them are free.
///
/// The coroutine always yields the loop once, even when the keys are free
/// on entry.
///
/// # Panics
///
/// Panics when called from outside a loop coroutine, or with no keys.
pub fn lock<K>(keys: impl IntoIterator<Item = K>) -> LockGuard<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    let keys: Keys<K> = keys.into_iter().collect();
    assert!(!keys.is_empty(), "lock requires at least one key");

    let table = table_for::<K>();
    let (ready_tx, ready_rx) = flume::bounded(1);
    let waiter = Arc::new(Waiter {
        keys: keys.clone(),
        ready: ready_tx,
    });
    {
        let mut locked = table.lock();
        if !locked.try_acquire(&waiter) {
            for key in &waiter.keys {
                locked
                    .waits
                    .entry(key.clone())
                    .or_default()
                    .push(Arc::clone(&waiter));
            }
        }
    }

    // yield the loop and park until the keys are ours
    let _ = event_loop::suspend(|| ready_rx.recv());

    LockGuard { keys, table }
}
