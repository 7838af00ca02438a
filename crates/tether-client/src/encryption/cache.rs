//! Bounded memo of decrypted values.
//!
//! A ciphertext for a given `(entity, version)` or message id never changes,
//! so an entry is valid forever once written. Failures (`None`) are cached
//! as well; retrying them cannot succeed.

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tether_protocol::domain::{
    AgentState, ArtifactBody, ArtifactHeader, DaemonState, MachineMetadata, Metadata, RawRecord,
};

pub const MESSAGE_CAPACITY: usize = 1000;
pub const METADATA_CAPACITY: usize = 500;
pub const AGENT_STATE_CAPACITY: usize = 500;
pub const MACHINE_METADATA_CAPACITY: usize = 500;
pub const DAEMON_STATE_CAPACITY: usize = 500;
pub const ARTIFACT_CAPACITY: usize = 200;

/// `(entity id, version)`.
pub type VersionKey = (String, u64);

pub(crate) struct Bounded<K: Hash + Eq, V> {
    inner: Mutex<LruCache<K, V>>,
}

impl<K: Hash + Eq, V: Clone> Bounded<K, V> {
    fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(key).cloned()
    }

    pub(crate) fn put(&self, key: K, value: V) {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(key, value);
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn clear(&self) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

pub struct EncryptionCache {
    pub(crate) messages: Bounded<String, Option<RawRecord>>,
    pub(crate) metadata: Bounded<VersionKey, Option<Metadata>>,
    pub(crate) agent_states: Bounded<VersionKey, Option<AgentState>>,
    pub(crate) machine_metadata: Bounded<VersionKey, Option<MachineMetadata>>,
    pub(crate) daemon_states: Bounded<VersionKey, Option<DaemonState>>,
    pub(crate) artifact_headers: Bounded<VersionKey, Option<ArtifactHeader>>,
    pub(crate) artifact_bodies: Bounded<VersionKey, Option<ArtifactBody>>,
}

impl Default for EncryptionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EncryptionCache {
    pub fn new() -> Self {
        Self {
            messages: Bounded::new(MESSAGE_CAPACITY),
            metadata: Bounded::new(METADATA_CAPACITY),
            agent_states: Bounded::new(AGENT_STATE_CAPACITY),
            machine_metadata: Bounded::new(MACHINE_METADATA_CAPACITY),
            daemon_states: Bounded::new(DAEMON_STATE_CAPACITY),
            artifact_headers: Bounded::new(ARTIFACT_CAPACITY),
            artifact_bodies: Bounded::new(ARTIFACT_CAPACITY),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            messages: self.messages.len(),
            metadata: self.metadata.len(),
            agent_states: self.agent_states.len(),
            machine_metadata: self.machine_metadata.len(),
            daemon_states: self.daemon_states.len(),
            artifacts: self.artifact_headers.len() + self.artifact_bodies.len(),
        }
    }

    /// Drop every entry. Called when the engine is disposed.
    pub fn clear(&self) {
        self.messages.clear();
        self.metadata.clear();
        self.agent_states.clear();
        self.machine_metadata.clear();
        self.daemon_states.clear();
        self.artifact_headers.clear();
        self.artifact_bodies.clear();
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub messages: usize,
    pub metadata: usize,
    pub agent_states: usize,
    pub machine_metadata: usize,
    pub daemon_states: usize,
    pub artifacts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let cache: Bounded<String, u32> = Bounded::new(2);
        cache.put("a".into(), 1);
        cache.put("b".into(), 2);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        cache.put("c".into(), 3);
        assert_eq!(cache.get(&"b".to_string()), None);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn message_cache_is_bounded() {
        let cache = EncryptionCache::new();
        for i in 0..(MESSAGE_CAPACITY + 50) {
            cache.messages.put(format!("m{i}"), None);
        }
        assert_eq!(cache.stats().messages, MESSAGE_CAPACITY);
        cache.clear();
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn failures_are_cached_per_version() {
        let cache = EncryptionCache::new();
        cache.metadata.put(("s1".into(), 3), None);
        assert_eq!(cache.metadata.get(&("s1".into(), 3)), Some(None));
        assert_eq!(cache.metadata.get(&("s1".into(), 4)), None);
    }
}
