//! Metric families with dynamic labels backed by `DashMap`.
//!
//! Label sets are flattened into sorted key vectors so rendering order is
//! deterministic per family. Histogram buckets are fixed in microseconds.

use std::fmt::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

type LabelKey = Vec<(String, String)>;

fn label_key(labels: &[(&str, &str)]) -> LabelKey {
    let mut key: LabelKey = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    key.sort();
    key
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn label_str(key: &LabelKey) -> String {
    key.iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label(v)))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Default)]
pub struct CounterVec {
    map: DashMap<LabelKey, AtomicU64>,
}

impl CounterVec {
    pub fn inc(&self, labels: &[(&str, &str)]) {
        self.add(labels, 1);
    }

    pub fn add(&self, labels: &[(&str, &str)], v: u64) {
        self.map
            .entry(label_key(labels))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(v, Ordering::Relaxed);
    }

    /// Current value for one label set (0 when never touched).
    pub fn get(&self, labels: &[(&str, &str)]) -> u64 {
        self.map
            .get(&label_key(labels))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {name} counter");
        for r in self.map.iter() {
            let _ = writeln!(out, "{name}{{{}}} {}", label_str(r.key()), r.value().load(Ordering::Relaxed));
        }
    }
}

#[derive(Default)]
pub struct GaugeVec {
    map: DashMap<LabelKey, AtomicI64>,
}

impl GaugeVec {
    pub fn inc(&self, labels: &[(&str, &str)]) {
        self.add(labels, 1);
    }

    pub fn dec(&self, labels: &[(&str, &str)]) {
        self.add(labels, -1);
    }

    pub fn add(&self, labels: &[(&str, &str)], v: i64) {
        self.map
            .entry(label_key(labels))
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(v, Ordering::Relaxed);
    }

    pub fn set(&self, labels: &[(&str, &str)], v: i64) {
        self.map
            .entry(label_key(labels))
            .or_insert_with(|| AtomicI64::new(0))
            .store(v, Ordering::Relaxed);
    }

    pub fn get(&self, labels: &[(&str, &str)]) -> i64 {
        self.map
            .get(&label_key(labels))
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {name} gauge");
        for r in self.map.iter() {
            let _ = writeln!(out, "{name}{{{}}} {}", label_str(r.key()), r.value().load(Ordering::Relaxed));
        }
    }
}

// 50us .. 2s
const BUCKETS_MICROS: [u64; 10] = [
    50, 100, 500, 1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 2_000_000,
];

#[derive(Default)]
struct AtomicHistogram {
    count: AtomicU64,
    sum: AtomicU64,
    buckets: [AtomicU64; BUCKETS_MICROS.len()],
}

#[derive(Default)]
pub struct HistogramVec {
    map: DashMap<LabelKey, AtomicHistogram>,
}

impl HistogramVec {
    pub fn observe(&self, labels: &[(&str, &str)], duration: Duration) {
        let hist = self.map.entry(label_key(labels)).or_default();
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);

        hist.count.fetch_add(1, Ordering::Relaxed);
        hist.sum.fetch_add(micros, Ordering::Relaxed);
        for (i, &b) in BUCKETS_MICROS.iter().enumerate() {
            if micros <= b {
                hist.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self, labels: &[(&str, &str)]) -> u64 {
        self.map
            .get(&label_key(labels))
            .map(|h| h.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {name} histogram");
        for r in self.map.iter() {
            let labels = label_str(r.key());
            let hist = r.value();
            let prefix = if labels.is_empty() { String::new() } else { format!("{labels},") };

            for (i, le) in BUCKETS_MICROS.iter().enumerate() {
                let n = hist.buckets[i].load(Ordering::Relaxed);
                let _ = writeln!(out, "{name}_bucket{{{prefix}le=\"{le}\"}} {n}");
            }
            let count = hist.count.load(Ordering::Relaxed);
            let _ = writeln!(out, "{name}_bucket{{{prefix}le=\"+Inf\"}} {count}");
            let _ = writeln!(out, "{name}_sum{{{labels}}} {}", hist.sum.load(Ordering::Relaxed));
            let _ = writeln!(out, "{name}_count{{{labels}}} {count}");
        }
    }
}

#[derive(Default)]
pub struct EngineMetrics {
    /// phase, outcome (continue | immediate | pass_through | error)
    pub exchanges: CounterVec,
    pub phase_duration: HistogramVec,
    /// policy, phase
    pub policy_duration: HistogramVec,
    /// route, policy
    pub short_circuits: CounterVec,
    /// policy, phase, kind (error | timeout)
    pub policy_errors: CounterVec,
    /// mode
    pub missing_routes: CounterVec,
    pub orphaned_responses: CounterVec,
    pub inflight_evictions: CounterVec,
    pub inflight_entries: GaugeVec,
    /// result (ack | nack), source
    pub config_updates: CounterVec,
    /// stream (ext_proc | discovery)
    pub active_streams: GaugeVec,
    pub decode_errors: CounterVec,
    draining: AtomicBool,
    config_ready: AtomicBool,
}

impl EngineMetrics {
    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    /// First configuration has been accepted.
    pub fn set_config_ready(&self) {
        self.config_ready.store(true, Ordering::Relaxed);
    }

    pub fn is_config_ready(&self) -> bool {
        self.config_ready.load(Ordering::Relaxed)
    }

    /// Render every family plus caller-provided gauges.
    pub fn render(&self, extra: &[(&str, u64)]) -> String {
        let mut out = String::new();
        self.exchanges.render("chainward_exchanges_total", &mut out);
        self.phase_duration.render("chainward_phase_duration_micros", &mut out);
        self.policy_duration.render("chainward_policy_duration_micros", &mut out);
        self.short_circuits.render("chainward_short_circuits_total", &mut out);
        self.policy_errors.render("chainward_policy_errors_total", &mut out);
        self.missing_routes.render("chainward_missing_routes_total", &mut out);
        self.orphaned_responses.render("chainward_orphaned_responses_total", &mut out);
        self.inflight_evictions.render("chainward_inflight_evictions_total", &mut out);
        self.inflight_entries.render("chainward_inflight_entries", &mut out);
        self.config_updates.render("chainward_config_updates_total", &mut out);
        self.active_streams.render("chainward_streams_active", &mut out);
        self.decode_errors.render("chainward_decode_errors_total", &mut out);

        let _ = writeln!(
            out,
            "# TYPE chainward_draining gauge\nchainward_draining {}",
            u8::from(self.is_draining())
        );
        let _ = writeln!(
            out,
            "# TYPE chainward_config_ready gauge\nchainward_config_ready {}",
            u8::from(self.is_config_ready())
        );
        for (k, v) in extra {
            let _ = writeln!(out, "{k} {v}");
        }
        out
    }
}
