//! Named registries for render passes and layouts
//!
//! A registry is a key → handle store with a register-once / fetch-many /
//! bulk-dispose lifecycle. The application context owns one instance per
//! namespace (render passes, descriptor-set layouts, pipeline layouts), so
//! keys can never collide across namespaces. Keys are caller-defined enums
//! rather than strings, and re-registering a key fails loudly instead of
//! silently replacing the previous handle.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use crate::backend::{BackendError, BackendResult};

pub struct Registry<K, H> {
    entries: HashMap<K, H>,
}

impl<K, H> Registry<K, H>
where
    K: Copy + Eq + Hash + Debug,
    H: Copy,
{
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Store `handle` under `key`. The registry takes ownership of the
    /// handle's lifetime: it is disposed in `cleanup`, nowhere else.
    pub fn register(&mut self, key: K, handle: H) -> BackendResult<()> {
        if self.entries.contains_key(&key) {
            return Err(BackendError::DuplicateRegistryKey(format!("{key:?}")));
        }
        self.entries.insert(key, handle);
        Ok(())
    }

    pub fn get(&self, key: K) -> Option<H> {
        self.entries.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dispose every held handle through `disposer` and clear the registry.
    pub fn cleanup(&mut self, mut disposer: impl FnMut(H)) {
        for (_, handle) in self.entries.drain() {
            disposer(handle);
        }
    }
}

impl<K, H> Default for Registry<K, H>
where
    K: Copy + Eq + Hash + Debug,
    H: Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum PassKey {
        Deferred,
        Overlay,
    }

    #[test]
    fn register_and_get() {
        let mut registry = Registry::new();
        registry.register(PassKey::Deferred, 7u64).unwrap();
        registry.register(PassKey::Overlay, 9u64).unwrap();

        assert_eq!(registry.get(PassKey::Deferred), Some(7));
        assert_eq!(registry.get(PassKey::Overlay), Some(9));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn duplicate_key_fails_loudly() {
        let mut registry = Registry::new();
        registry.register(PassKey::Deferred, 1u64).unwrap();

        let err = registry.register(PassKey::Deferred, 2u64).unwrap_err();
        assert!(matches!(err, BackendError::DuplicateRegistryKey(_)));
        // The original registration survives the failed attempt.
        assert_eq!(registry.get(PassKey::Deferred), Some(1));
    }

    #[test]
    fn cleanup_disposes_every_handle() {
        let mut registry = Registry::new();
        registry.register(PassKey::Deferred, 3u64).unwrap();
        registry.register(PassKey::Overlay, 4u64).unwrap();

        let mut disposed = Vec::new();
        registry.cleanup(|h| disposed.push(h));
        disposed.sort_unstable();

        assert_eq!(disposed, vec![3, 4]);
        assert!(registry.is_empty());
        assert_eq!(registry.get(PassKey::Deferred), None);
    }
}
