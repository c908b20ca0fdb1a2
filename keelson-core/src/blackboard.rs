//! Shared typed key/value store.
//!
//! Loops keep one for loop-scoped state, sessions keep one for per-session
//! user data, and pipeline contexts expose the session's board to decoder
//! stages that need to carry partial state across reads.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;

/// A concurrent map from string keys to type-erased shared values.
///
/// Cloning a `Blackboard` clones the handle, not the contents.
#[derive(Clone, Default)]
pub struct Blackboard {
    map: Arc<DashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Blackboard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under `key`, replacing any previous value.
    pub fn store<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.map.insert(key.into(), Arc::new(value));
    }

    /// Store an already type-erased value under `key`.
    pub fn store_any(&self, key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
        self.map.insert(key.into(), value);
    }

    /// Load the value under `key`, downcast to `T`.
    ///
    /// Returns `None` when the key is absent or holds a different type.
    #[must_use]
    pub fn load<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.load_any(key)?.downcast::<T>().ok()
    }

    /// Load the type-erased value under `key`.
    #[must_use]
    pub fn load_any(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.map.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove the value under `key`.
    pub fn delete(&self, key: &str) {
        self.map.remove(key);
    }
}

impl std::fmt::Debug for Blackboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blackboard").field("len", &self.map.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_load_delete() {
        let board = Blackboard::new();
        board.store("answer", 42u32);
        assert_eq!(*board.load::<u32>("answer").unwrap(), 42);

        // wrong type yields None without disturbing the entry
        assert!(board.load::<String>("answer").is_none());
        assert!(board.load::<u32>("answer").is_some());

        board.delete("answer");
        assert!(board.load::<u32>("answer").is_none());
    }

    #[test]
    fn handles_share_contents() {
        let board = Blackboard::new();
        let other = board.clone();
        other.store("shared", String::from("yes"));
        assert_eq!(*board.load::<String>("shared").unwrap(), "yes");
    }
}
