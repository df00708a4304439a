//! C10 — Metrics Collector.
//!
//! In-memory counters, gauges, histograms (capped at 1000 samples) and
//! timers with category gating. Ground: `pg_mcp_server/utils/metrics.py`.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

/// Metric name constants, mirroring the Python `StandardMetrics` class so
/// C9 never scatters stringly-typed metric names.
pub mod standard {
    pub const QUERY_TOTAL: &str = "mcp.query.total";
    pub const QUERY_SUCCESS: &str = "mcp.query.success";
    pub const QUERY_ERROR: &str = "mcp.query.error";
    pub const QUERY_DURATION_MS: &str = "mcp.query.duration_ms";

    pub const SQL_GENERATION_TOTAL: &str = "mcp.sql.generation.total";
    pub const SQL_GENERATION_SUCCESS: &str = "mcp.sql.generation.success";
    pub const SQL_GENERATION_ERROR: &str = "mcp.sql.generation.error";
    pub const SQL_GENERATION_DURATION: &str = "mcp.sql.generation.duration_ms";

    pub const SQL_EXECUTION_TOTAL: &str = "mcp.sql.execution.total";
    pub const SQL_EXECUTION_SUCCESS: &str = "mcp.sql.execution.success";
    pub const SQL_EXECUTION_ERROR: &str = "mcp.sql.execution.error";
    pub const SQL_EXECUTION_DURATION: &str = "mcp.sql.execution.duration_ms";

    pub const VALIDATION_TOTAL: &str = "mcp.validation.total";
    pub const VALIDATION_SUCCESS: &str = "mcp.validation.success";
    pub const VALIDATION_FAILED: &str = "mcp.validation.failed";
    pub const VALIDATION_DURATION: &str = "mcp.validation.duration_ms";

    pub const SCHEMA_LOAD: &str = "mcp.schema.load";
    pub const DB_CONNECTION: &str = "mcp.db.connection";
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub collect_query: bool,
    pub collect_sql: bool,
    pub collect_db: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MetricStats {
    pub count: u64,
    pub total: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

#[derive(Debug, Clone, Default)]
struct Timer {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, f64>,
    pub gauges: BTreeMap<String, f64>,
    pub histogram_stats: BTreeMap<String, (u64, f64, f64, f64)>,
    pub timer_stats: BTreeMap<String, (u64, f64, f64, f64, f64)>,
}

pub struct MetricsCollector {
    config: MetricsConfig,
    counters: Mutex<BTreeMap<String, f64>>,
    gauges: Mutex<BTreeMap<String, f64>>,
    histograms: Mutex<BTreeMap<String, Vec<f64>>>,
    timers: Mutex<BTreeMap<String, Timer>>,
}

/// `name{k1=v1,k2=v2}` with labels sorted before joining.
fn make_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<&(&str, &str)> = labels.iter().collect();
    sorted.sort_by_key(|(k, _)| *k);
    let joined = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{name}{{{joined}}}")
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(BTreeMap::new()),
            gauges: Mutex::new(BTreeMap::new()),
            histograms: Mutex::new(BTreeMap::new()),
            timers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Category gating per spec.md §4.10: `mcp.query.*` gated by
    /// `collect_query`, `mcp.sql.*` by `collect_sql`, and
    /// `mcp.db.*`/`mcp.schema.*`/`mcp.validation.*` by `collect_db`. Any
    /// other prefix is always recorded while the collector is enabled.
    fn should_collect(&self, name: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        if let Some(rest) = name.strip_prefix("mcp.") {
            if rest.starts_with("query.") {
                return self.config.collect_query;
            }
            if rest.starts_with("sql.") {
                return self.config.collect_sql;
            }
            if rest.starts_with("db.") || rest.starts_with("schema.") || rest.starts_with("validation.") {
                return self.config.collect_db;
            }
        }
        true
    }

    pub fn increment(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        if !self.should_collect(name) {
            return;
        }
        let key = make_key(name, labels);
        let mut counters = self.counters.lock().expect("counters mutex poisoned");
        *counters.entry(key).or_insert(0.0) += value;
    }

    pub fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        if !self.should_collect(name) {
            return;
        }
        let key = make_key(name, labels);
        self.gauges
            .lock()
            .expect("gauges mutex poisoned")
            .insert(key, value);
    }

    pub fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        if !self.should_collect(name) {
            return;
        }
        let key = make_key(name, labels);
        let mut histograms = self.histograms.lock().expect("histograms mutex poisoned");
        let samples = histograms.entry(key).or_default();
        samples.push(value);
        if samples.len() > 1000 {
            let overflow = samples.len() - 1000;
            samples.drain(0..overflow);
        }
    }

    pub fn record_timer(&self, name: &str, duration_ms: f64, labels: &[(&str, &str)]) {
        if !self.should_collect(name) {
            return;
        }
        let key = make_key(name, labels);
        let mut timers = self.timers.lock().expect("timers mutex poisoned");
        let timer = timers.entry(key).or_insert_with(|| Timer {
            count: 0,
            sum: 0.0,
            min: f64::MAX,
            max: f64::MIN,
        });
        timer.count += 1;
        timer.sum += duration_ms;
        timer.min = timer.min.min(duration_ms);
        timer.max = timer.max.max(duration_ms);
    }

    pub fn get_histogram_stats(&self, name: &str, labels: &[(&str, &str)]) -> Option<MetricStats> {
        let key = make_key(name, labels);
        let histograms = self.histograms.lock().expect("histograms mutex poisoned");
        let samples = histograms.get(&key)?;
        if samples.is_empty() {
            return None;
        }
        let count = samples.len() as u64;
        let total: f64 = samples.iter().sum();
        let min = samples.iter().cloned().fold(f64::MAX, f64::min);
        let max = samples.iter().cloned().fold(f64::MIN, f64::max);
        Some(MetricStats {
            count,
            total,
            min,
            max,
            avg: total / count as f64,
        })
    }

    pub fn percentile(&self, name: &str, labels: &[(&str, &str)], p: f64) -> Option<f64> {
        let key = make_key(name, labels);
        let histograms = self.histograms.lock().expect("histograms mutex poisoned");
        let samples = histograms.get(&key)?;
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted.get(idx).copied()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.counters.lock().expect("counters mutex poisoned").clone();
        let gauges = self.gauges.lock().expect("gauges mutex poisoned").clone();
        let histogram_stats = self
            .histograms
            .lock()
            .expect("histograms mutex poisoned")
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(k, samples)| {
                let count = samples.len() as u64;
                let total: f64 = samples.iter().sum();
                let min = samples.iter().cloned().fold(f64::MAX, f64::min);
                let max = samples.iter().cloned().fold(f64::MIN, f64::max);
                (k.clone(), (count, total, min, max))
            })
            .collect();
        let timer_stats = self
            .timers
            .lock()
            .expect("timers mutex poisoned")
            .iter()
            .map(|(k, t)| {
                let avg = if t.count > 0 { t.sum / t.count as f64 } else { 0.0 };
                (k.clone(), (t.count, t.sum, t.min, t.max, avg))
            })
            .collect();

        MetricsSnapshot {
            counters,
            gauges,
            histogram_stats,
            timer_stats,
        }
    }
}

/// RAII timer guard: records elapsed milliseconds into `name` on drop,
/// mirroring the Python context-manager idiom via `Drop`.
pub struct MetricsTimer<'a> {
    collector: &'a MetricsCollector,
    name: &'static str,
    labels: Vec<(&'static str, String)>,
    start: Instant,
}

impl<'a> MetricsTimer<'a> {
    pub fn start(collector: &'a MetricsCollector, name: &'static str, labels: Vec<(&'static str, String)>) -> Self {
        Self {
            collector,
            name,
            labels,
            start: Instant::now(),
        }
    }
}

impl Drop for MetricsTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_secs_f64() * 1000.0;
        let labels: Vec<(&str, &str)> = self
            .labels
            .iter()
            .map(|(k, v)| (*k, v.as_str()))
            .collect();
        self.collector.record_timer(self.name, elapsed, &labels);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> MetricsCollector {
        MetricsCollector::new(MetricsConfig {
            enabled: true,
            collect_query: true,
            collect_sql: true,
            collect_db: true,
        })
    }

    #[test]
    fn counters_are_monotone() {
        let c = collector();
        c.increment(standard::QUERY_TOTAL, 1.0, &[]);
        c.increment(standard::QUERY_TOTAL, 1.0, &[]);
        let snap = c.snapshot();
        assert_eq!(snap.counters[standard::QUERY_TOTAL], 2.0);
    }

    #[test]
    fn histogram_caps_at_1000_samples() {
        let c = collector();
        for i in 0..1500 {
            c.record_histogram("mcp.sql.latency", i as f64, &[]);
        }
        let stats = c.get_histogram_stats("mcp.sql.latency", &[]).unwrap();
        assert_eq!(stats.count, 1000);
        assert_eq!(stats.min, 500.0);
        assert_eq!(stats.max, 1499.0);
    }

    #[test]
    fn category_gating_blocks_disabled_category() {
        let c = MetricsCollector::new(MetricsConfig {
            enabled: true,
            collect_query: false,
            collect_sql: true,
            collect_db: true,
        });
        c.increment(standard::QUERY_TOTAL, 1.0, &[]);
        assert!(c.snapshot().counters.is_empty());
    }

    #[test]
    fn unknown_prefix_always_recorded_when_enabled() {
        let c = MetricsCollector::new(MetricsConfig {
            enabled: true,
            collect_query: false,
            collect_sql: false,
            collect_db: false,
        });
        c.increment("custom.metric", 1.0, &[]);
        assert_eq!(c.snapshot().counters["custom.metric"], 1.0);
    }

    #[test]
    fn snapshot_histogram_stats_report_real_min_and_max() {
        let c = collector();
        for v in [10.0, 5.0, 40.0, 20.0] {
            c.record_histogram("mcp.sql.latency", v, &[]);
        }
        let (count, total, min, max) = c.snapshot().histogram_stats["mcp.sql.latency"];
        assert_eq!(count, 4);
        assert_eq!(total, 75.0);
        assert_eq!(min, 5.0);
        assert_eq!(max, 40.0);
    }

    #[test]
    fn key_sorts_labels() {
        assert_eq!(
            make_key("x", &[("b", "2"), ("a", "1")]),
            "x{a=1,b=2}".to_string()
        );
    }
}
