// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! TLS session cache for HTTPS agents.
//!
//! Sessions are stored per endpoint key so that new connections to the same
//! origin can resume. When full, the key cached first is evicted.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::key::EndpointKey;

/// Session cache shared between an agent and its TLS layer
pub type SharedSessionCache = Arc<Mutex<SessionCache>>;

/// Bounded map from endpoint key to serialized TLS session
#[derive(Debug, Clone)]
pub struct SessionCache {
    max_cached_sessions: usize,
    map: HashMap<EndpointKey, Bytes>,
    /// Insertion order of `map` keys
    list: VecDeque<EndpointKey>,
}

impl SessionCache {
    /// Create a cache holding at most `max_cached_sessions` entries
    pub fn new(max_cached_sessions: usize) -> Self {
        Self {
            max_cached_sessions,
            map: HashMap::new(),
            list: VecDeque::new(),
        }
    }

    /// Create a cache wrapped for sharing
    pub fn shared(max_cached_sessions: usize) -> SharedSessionCache {
        Arc::new(Mutex::new(Self::new(max_cached_sessions)))
    }

    /// Remember the session for `key`.
    ///
    /// An existing entry is replaced in place and keeps its age.
    pub fn cache(&mut self, key: EndpointKey, session: Bytes) {
        if self.max_cached_sessions == 0 {
            return;
        }
        if let Some(existing) = self.map.get_mut(&key) {
            *existing = session;
            return;
        }
        if self.list.len() >= self.max_cached_sessions {
            if let Some(oldest) = self.list.pop_front() {
                tracing::debug!(key = %oldest, "evicting cached TLS session");
                self.map.remove(&oldest);
            }
        }
        self.list.push_back(key.clone());
        self.map.insert(key, session);
    }

    /// Session stored for `key`
    pub fn get(&self, key: &EndpointKey) -> Option<Bytes> {
        self.map.get(key).cloned()
    }

    /// Forget the session for `key`, e.g. after a failed resumption
    pub fn evict(&mut self, key: &EndpointKey) {
        if self.map.remove(key).is_some() {
            self.list.retain(|k| k != key);
        }
    }

    /// Number of cached sessions
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(crate::options::DEFAULT_MAX_CACHED_SESSIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> EndpointKey {
        EndpointKey::from(name)
    }

    #[test]
    fn test_cache_and_get() {
        let mut cache = SessionCache::new(2);
        cache.cache(key("a"), Bytes::from_static(b"one"));
        assert_eq!(cache.get(&key("a")), Some(Bytes::from_static(b"one")));
        assert_eq!(cache.get(&key("b")), None);
    }

    #[test]
    fn test_evicts_oldest() {
        let mut cache = SessionCache::new(2);
        cache.cache(key("a"), Bytes::from_static(b"1"));
        cache.cache(key("b"), Bytes::from_static(b"2"));
        // Replacing keeps the original position
        cache.cache(key("a"), Bytes::from_static(b"3"));
        cache.cache(key("c"), Bytes::from_static(b"4"));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&key("a")), None);
        assert_eq!(cache.get(&key("b")), Some(Bytes::from_static(b"2")));
        assert_eq!(cache.get(&key("c")), Some(Bytes::from_static(b"4")));
    }

    #[test]
    fn test_disabled() {
        let mut cache = SessionCache::new(0);
        cache.cache(key("a"), Bytes::from_static(b"1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evict() {
        let shared = SessionCache::shared(4);
        shared.lock().cache(key("a"), Bytes::from_static(b"1"));
        shared.lock().evict(&key("a"));
        shared.lock().evict(&key("missing"));
        assert!(shared.lock().is_empty());
    }
}
