//! Read-mostly route → chain table, replaced atomically.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::chain::{ChainMap, PolicyChain};

/// One accepted configuration version.
#[derive(Debug, Default)]
pub struct RouteSnapshot {
    /// Distribution version this snapshot was accepted at (empty before the first).
    pub version: String,
    pub chains: ChainMap,
}

/// Lookups never block and never observe a half-applied update.
pub struct RouteTable {
    current: ArcSwap<RouteSnapshot>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RouteSnapshot::default()),
        }
    }

    pub fn get(&self, route_key: &str) -> Option<Arc<PolicyChain>> {
        self.current.load().chains.get(route_key).cloned()
    }

    pub fn replace(&self, snapshot: RouteSnapshot) {
        self.current.store(Arc::new(snapshot));
    }

    pub fn snapshot(&self) -> Arc<RouteSnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> String {
        self.current.load().version.clone()
    }

    pub fn len(&self) -> usize {
        self.current.load().chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
