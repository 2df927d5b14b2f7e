//! Per-request state carried from the request phase to the response phase.
//!
//! Entries are inserted when a request phase completes, taken (removed) when
//! the matching response phase starts, and evicted by a background sweeper
//! once older than the configured TTL. An expired entry is never returned,
//! even before the sweeper has removed it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use chainward_core::context::{Metadata, RequestSnapshot};

use crate::chain::PolicyChain;

#[derive(Debug, Clone)]
pub struct InflightEntry {
    pub request: Arc<RequestSnapshot>,
    pub chain: Arc<PolicyChain>,
    pub metadata: Metadata,
    inserted_at: Instant,
}

impl InflightEntry {
    pub fn new(request: RequestSnapshot, chain: Arc<PolicyChain>, metadata: Metadata) -> Self {
        Self {
            request: Arc::new(request),
            chain,
            metadata,
            inserted_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.inserted_at.elapsed()
    }
}

pub struct InflightTable {
    map: DashMap<String, InflightEntry>,
    ttl: Duration,
}

impl InflightTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            map: DashMap::new(),
            ttl,
        }
    }

    /// Insert unless a live entry already holds `request_id`; returns whether
    /// the entry was stored. An expired holder is replaced.
    pub fn insert(&self, request_id: String, entry: InflightEntry) -> bool {
        let ttl = self.ttl;
        match self.map.entry(request_id) {
            Entry::Occupied(mut held) if held.get().age() > ttl => {
                held.insert(entry);
                true
            }
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    /// Remove and return the live entry for `request_id`.
    pub fn take(&self, request_id: &str) -> Option<InflightEntry> {
        let (_, entry) = self.map.remove(request_id)?;
        (entry.age() <= self.ttl).then_some(entry)
    }

    /// Chain stored for `request_id`, without removing it.
    pub fn peek_chain(&self, request_id: &str) -> Option<Arc<PolicyChain>> {
        self.map
            .get(request_id)
            .filter(|e| e.age() <= self.ttl)
            .map(|e| e.chain.clone())
    }

    pub fn remove(&self, request_id: &str) -> bool {
        self.map.remove(request_id).is_some()
    }

    /// Drop every entry older than the TTL; returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let before = self.map.len();
        let ttl = self.ttl;
        self.map.retain(|_, e| e.age() <= ttl);
        before.saturating_sub(self.map.len())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::chain::build_chain;
    use crate::registry::builtin_registry;
    use chainward_core::headers::Headers;
    use chainward_core::protocol::discovery::RouteChainResource;

    fn entry() -> InflightEntry {
        let reg = builtin_registry().unwrap();
        let chain = build_chain(&reg, &RouteChainResource::new("r")).unwrap();
        let snap = RequestSnapshot {
            request_id: "id".into(),
            method: "GET".into(),
            path: "/".into(),
            headers: Headers::new(),
            body: None,
        };
        InflightEntry::new(snap, Arc::new(chain), Metadata::new())
    }

    #[test]
    fn take_removes() {
        let t = InflightTable::new(Duration::from_secs(60));
        t.insert("a".into(), entry());
        assert!(t.take("a").is_some());
        assert!(t.take("a").is_none());
        assert!(t.is_empty());
    }

    #[test]
    fn live_id_is_never_overwritten() {
        let t = InflightTable::new(Duration::from_secs(60));
        assert!(t.insert("a".into(), entry()));
        assert!(!t.insert("a".into(), entry()));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn expired_holder_gives_way() {
        let t = InflightTable::new(Duration::from_millis(10));
        assert!(t.insert("a".into(), entry()));
        std::thread::sleep(Duration::from_millis(30));
        assert!(t.insert("a".into(), entry()));
        assert!(t.take("a").is_some());
    }

    #[test]
    fn expired_entries_are_swept_and_never_returned() {
        let t = InflightTable::new(Duration::from_millis(10));
        t.insert("a".into(), entry());
        t.insert("b".into(), entry());
        std::thread::sleep(Duration::from_millis(30));
        assert!(t.peek_chain("a").is_none());
        assert!(t.take("a").is_none());
        assert_eq!(t.sweep(), 1);
        assert!(t.is_empty());
    }
}
