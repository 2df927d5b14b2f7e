//! Embedded configuration-distribution server.
//!
//! Holds the authoritative route snapshot. Every publish bumps the snapshot
//! version; each resource keeps its own `resource_version`, bumped only when
//! its content changes. Streams are state-of-the-world: a subscriber always
//! receives every resource it asked for.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use chainward_core::error::{EngineError, Result};
use chainward_core::protocol::discovery::{
    DiscoveryRequest, DiscoveryResponse, ErrorDetail, ResourceMeta, RouteChainResource,
    ROUTE_CHAIN_TYPE_URL,
};

/// Published state. Version 0 means nothing was published yet.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub version: u64,
    pub resources: BTreeMap<String, RouteChainResource>,
}

impl Snapshot {
    fn response_for(&self, req: &DiscoveryRequest) -> DiscoveryResponse {
        DiscoveryResponse {
            version_info: self.version.to_string(),
            resources: self
                .resources
                .values()
                .filter(|r| req.wants(&r.route_key))
                .cloned()
                .collect(),
            nonce: uuid::Uuid::new_v4().to_string(),
            type_url: ROUTE_CHAIN_TYPE_URL.to_string(),
        }
    }
}

/// Per-stream ACK/NACK bookkeeping, served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStatus {
    pub stream_id: u64,
    pub node_id: String,
    pub resource_names: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub last_pushed_version: Option<String>,
    pub acked_version: Option<String>,
    pub last_error: Option<ErrorDetail>,
    pub nack_count: u64,
    pub updated_at: DateTime<Utc>,
}

pub struct DistributionServer {
    snapshot: watch::Sender<Arc<Snapshot>>,
    subscribers: DashMap<u64, SubscriberStatus>,
    next_stream: AtomicU64,
}

impl Default for DistributionServer {
    fn default() -> Self {
        Self::new()
    }
}

impl DistributionServer {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Snapshot::default()));
        Self {
            snapshot,
            subscribers: DashMap::new(),
            next_stream: AtomicU64::new(1),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn version(&self) -> u64 {
        self.snapshot.borrow().version
    }

    /// Replace the whole snapshot. Returns the new snapshot version.
    pub fn publish_snapshot(&self, resources: Vec<RouteChainResource>) -> Result<u64> {
        let mut seen = HashSet::new();
        for r in &resources {
            if r.route_key.is_empty() {
                return Err(EngineError::InvalidConfig("route_key must not be empty".into()));
            }
            if !seen.insert(r.route_key.as_str()) {
                return Err(EngineError::InvalidConfig(format!(
                    "duplicate route_key `{}`",
                    r.route_key
                )));
            }
        }

        let now = Utc::now();
        let mut version = 0;
        self.snapshot.send_modify(|snap| {
            let mut next = BTreeMap::new();
            for mut r in resources {
                r.metadata = stamp(snap.resources.get(&r.route_key), &r, now);
                next.insert(r.route_key.clone(), r);
            }
            version = snap.version + 1;
            *snap = Arc::new(Snapshot {
                version,
                resources: next,
            });
        });
        tracing::info!(version, "snapshot published");
        Ok(version)
    }

    /// Insert or replace one resource. When `expected_version` is given it
    /// must equal the stored `resource_version` (0 for a new route).
    pub fn upsert(&self, resource: RouteChainResource, expected_version: Option<u64>) -> Result<u64> {
        if resource.route_key.is_empty() {
            return Err(EngineError::InvalidConfig("route_key must not be empty".into()));
        }
        let now = Utc::now();
        let mut outcome = Ok(0);
        self.snapshot.send_if_modified(|snap| {
            let current = snap.resources.get(&resource.route_key);
            let current_version = current.map(|r| r.metadata.resource_version).unwrap_or(0);
            if let Some(expected) = expected_version {
                if expected != current_version {
                    outcome = Err(EngineError::Conflict(format!(
                        "route `{}` is at resource_version {current_version}, expected {expected}",
                        resource.route_key
                    )));
                    return false;
                }
            }
            let mut r = resource.clone();
            r.metadata = stamp(current, &r, now);
            let mut resources = snap.resources.clone();
            resources.insert(r.route_key.clone(), r);
            let version = snap.version + 1;
            *snap = Arc::new(Snapshot { version, resources });
            outcome = Ok(version);
            true
        });
        if let Ok(version) = &outcome {
            tracing::info!(version, route = %resource.route_key, "route upserted");
        }
        outcome
    }

    /// Remove one resource, with the same optimistic check as `upsert`.
    pub fn remove(&self, route_key: &str, expected_version: Option<u64>) -> Result<u64> {
        let mut outcome = Ok(0);
        self.snapshot.send_if_modified(|snap| {
            let Some(current) = snap.resources.get(route_key) else {
                outcome = Err(EngineError::RouteNotFound(route_key.to_string()));
                return false;
            };
            let current_version = current.metadata.resource_version;
            if expected_version.is_some_and(|e| e != current_version) {
                outcome = Err(EngineError::Conflict(format!(
                    "route `{route_key}` is at resource_version {current_version}"
                )));
                return false;
            }
            let mut resources = snap.resources.clone();
            resources.remove(route_key);
            let version = snap.version + 1;
            *snap = Arc::new(Snapshot { version, resources });
            outcome = Ok(version);
            true
        });
        if let Ok(version) = &outcome {
            tracing::info!(version, route = route_key, "route removed");
        }
        outcome
    }

    pub fn subscribers(&self) -> Vec<SubscriberStatus> {
        let mut out: Vec<_> = self.subscribers.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|s| s.stream_id);
        out
    }

    /// Serve one subscription stream until either side closes.
    ///
    /// The first request opens the subscription. Later requests either answer
    /// the outstanding push (ACK or NACK, matched by nonce) or change the
    /// subscribed names, which triggers a fresh push.
    pub async fn serve_stream(
        &self,
        mut requests: mpsc::Receiver<DiscoveryRequest>,
        responses: mpsc::Sender<DiscoveryResponse>,
    ) {
        let Some(mut sub) = requests.recv().await else {
            return;
        };
        if !sub.type_url.is_empty() && sub.type_url != ROUTE_CHAIN_TYPE_URL {
            tracing::warn!(node = %sub.node_id, type_url = %sub.type_url, "unsupported resource type; closing stream");
            return;
        }

        let stream_id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        self.subscribers.insert(
            stream_id,
            SubscriberStatus {
                stream_id,
                node_id: sub.node_id.clone(),
                resource_names: sub.resource_names.clone(),
                connected_at: now,
                last_pushed_version: None,
                acked_version: None,
                last_error: None,
                nack_count: 0,
                updated_at: now,
            },
        );
        tracing::info!(stream_id, node = %sub.node_id, names = ?sub.resource_names, "subscriber connected");

        let mut watch = self.snapshot.subscribe();
        let mut pending_nonce = String::new();

        // initial push once something has been published
        let published = watch.borrow_and_update().version > 0;
        if published {
            match self.push(stream_id, &sub, &watch, &responses).await {
                Some(nonce) => pending_nonce = nonce,
                None => return self.disconnect(stream_id),
            }
        }

        loop {
            tokio::select! {
                biased;
                req = requests.recv() => {
                    let Some(req) = req else { break; };
                    if req.resource_names != sub.resource_names {
                        sub.resource_names = req.resource_names.clone();
                        if let Some(mut s) = self.subscribers.get_mut(&stream_id) {
                            s.resource_names = sub.resource_names.clone();
                        }
                        match self.push(stream_id, &sub, &watch, &responses).await {
                            Some(nonce) => pending_nonce = nonce,
                            None => break,
                        }
                        continue;
                    }
                    if req.response_nonce.is_empty() || req.response_nonce != pending_nonce {
                        tracing::debug!(stream_id, nonce = %req.response_nonce, "stale or unsolicited discovery request ignored");
                        continue;
                    }
                    self.record_answer(stream_id, &req);
                }
                changed = watch.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    match self.push(stream_id, &sub, &watch, &responses).await {
                        Some(nonce) => pending_nonce = nonce,
                        None => break,
                    }
                }
            }
        }
        self.disconnect(stream_id);
    }

    async fn push(
        &self,
        stream_id: u64,
        sub: &DiscoveryRequest,
        watch: &watch::Receiver<Arc<Snapshot>>,
        responses: &mpsc::Sender<DiscoveryResponse>,
    ) -> Option<String> {
        let resp = watch.borrow().response_for(sub);
        let nonce = resp.nonce.clone();
        let version = resp.version_info.clone();
        if responses.send(resp).await.is_err() {
            return None;
        }
        if let Some(mut s) = self.subscribers.get_mut(&stream_id) {
            s.last_pushed_version = Some(version.clone());
            s.updated_at = Utc::now();
        }
        tracing::debug!(stream_id, version = %version, "snapshot pushed");
        Some(nonce)
    }

    fn record_answer(&self, stream_id: u64, req: &DiscoveryRequest) {
        let Some(mut s) = self.subscribers.get_mut(&stream_id) else {
            return;
        };
        s.updated_at = Utc::now();
        match &req.error_detail {
            Some(err) => {
                tracing::warn!(
                    stream_id,
                    node = %s.node_id,
                    accepted = %req.version_info,
                    code = %err.code,
                    error = %err.message,
                    "subscriber rejected snapshot"
                );
                s.nack_count += 1;
                s.last_error = Some(err.clone());
            }
            None => {
                tracing::debug!(stream_id, version = %req.version_info, "snapshot acknowledged");
                s.acked_version = Some(req.version_info.clone());
                s.last_error = None;
            }
        }
    }

    fn disconnect(&self, stream_id: u64) {
        if let Some((_, s)) = self.subscribers.remove(&stream_id) {
            tracing::info!(stream_id, node = %s.node_id, "subscriber disconnected");
        }
    }
}

/// Bookkeeping for `next` given the stored `prev`.
fn stamp(prev: Option<&RouteChainResource>, next: &RouteChainResource, now: DateTime<Utc>) -> ResourceMeta {
    match prev {
        Some(p) if p.same_content(next) => p.metadata.clone(),
        Some(p) => ResourceMeta {
            created_at: p.metadata.created_at.or(Some(now)),
            updated_at: Some(now),
            resource_version: p.metadata.resource_version + 1,
        },
        None => ResourceMeta {
            created_at: Some(now),
            updated_at: Some(now),
            resource_version: 1,
        },
    }
}
