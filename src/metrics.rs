//! Prometheus-compatible metrics collection.
//!
//! Counters and gauges are atomics; histograms use atomic per-bucket
//! counters plus a sum stored as fixed-point nanoseconds so observation
//! never takes a lock. Only the per-endpoint/per-model sub-maps and the
//! batch-size window take a short mutex.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::config::MetricsConfig;

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge holding an f64 as raw bits.
#[derive(Debug, Default)]
pub struct Gauge {
    bits: AtomicU64,
}

impl Gauge {
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn value(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Latency histogram with cumulative buckets and an implicit +Inf bucket.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    /// Sum in nanoseconds; fixed-point sidesteps f64 atomics.
    sum_nanos: AtomicU64,
}

impl Histogram {
    pub fn new(mut bounds: Vec<f64>) -> Self {
        bounds.push(f64::INFINITY);
        let buckets = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            count: AtomicU64::new(0),
            sum_nanos: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.sum_nanos
            .fetch_add((value * 1e9) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            if value <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.sum_nanos.load(Ordering::Relaxed) as f64 / 1e9
    }

    fn export(&self, out: &mut String, name: &str) {
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            let le = if bound.is_infinite() {
                "+Inf".to_string()
            } else {
                format!("{}", bound)
            };
            let _ = writeln!(
                out,
                "{}_bucket{{le=\"{}\"}} {}",
                name,
                le,
                bucket.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(out, "{}_sum {}", name, self.sum());
        let _ = writeln!(out, "{}_count {}", name, self.count());
    }
}

/// Passive metrics collector exported in Prometheus text format 0.0.4.
pub struct MetricsCollector {
    requests_total: Counter,
    request_errors: Counter,
    inference_total: Counter,
    batches_total: Counter,

    request_latency: Histogram,
    inference_latency: Histogram,
    batch_latency: Histogram,

    active_sessions: Gauge,
    loaded_models: Gauge,

    request_counts: Mutex<BTreeMap<String, u64>>,
    model_inference_counts: Mutex<BTreeMap<String, u64>>,
    model_load_seconds: Mutex<BTreeMap<String, f64>>,
    /// Last 1,000 batch sizes, for the moving average.
    batch_sizes: Mutex<VecDeque<usize>>,

    start_time: Instant,
}

impl MetricsCollector {
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            requests_total: Counter::default(),
            request_errors: Counter::default(),
            inference_total: Counter::default(),
            batches_total: Counter::default(),
            request_latency: Histogram::new(config.latency_buckets.clone()),
            inference_latency: Histogram::new(config.latency_buckets.clone()),
            batch_latency: Histogram::new(config.latency_buckets.clone()),
            active_sessions: Gauge::default(),
            loaded_models: Gauge::default(),
            request_counts: Mutex::new(BTreeMap::new()),
            model_inference_counts: Mutex::new(BTreeMap::new()),
            model_load_seconds: Mutex::new(BTreeMap::new()),
            batch_sizes: Mutex::new(VecDeque::new()),
            start_time: Instant::now(),
        }
    }

    pub fn record_request(&self, endpoint: &str, method: &str, status: u16, latency_s: f64) {
        let key = format!("{}_{}_{}", method, endpoint, status);
        if let Ok(mut counts) = self.request_counts.lock() {
            *counts.entry(key).or_insert(0) += 1;
        }

        self.requests_total.inc();
        self.request_latency.observe(latency_s);

        if status >= 400 {
            self.request_errors.inc();
        }
    }

    pub fn record_inference(&self, model: &str, latency_s: f64) {
        self.inference_total.inc();
        self.inference_latency.observe(latency_s);

        if let Ok(mut counts) = self.model_inference_counts.lock() {
            *counts.entry(model.to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_batch(&self, batch_size: usize, latency_s: f64) {
        self.batches_total.inc();
        self.batch_latency.observe(latency_s);

        if let Ok(mut sizes) = self.batch_sizes.lock() {
            sizes.push_back(batch_size);
            while sizes.len() > 1000 {
                sizes.pop_front();
            }
        }
    }

    pub fn record_model_load(&self, model: &str, load_time_s: f64) {
        if let Ok(mut times) = self.model_load_seconds.lock() {
            times.insert(model.to_string(), load_time_s);
        }
    }

    pub fn set_active_sessions(&self, count: usize) {
        self.active_sessions.set(count as f64);
    }

    pub fn set_loaded_models(&self, count: usize) {
        self.loaded_models.set(count as f64);
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.value()
    }

    pub fn request_errors_total(&self) -> u64 {
        self.request_errors.value()
    }

    pub fn inference_total(&self) -> u64 {
        self.inference_total.value()
    }

    pub fn batches_total(&self) -> u64 {
        self.batches_total.value()
    }

    pub fn model_inference_total(&self, model: &str) -> u64 {
        self.model_inference_counts
            .lock()
            .ok()
            .and_then(|counts| counts.get(model).copied())
            .unwrap_or(0)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .map(|sizes| sizes.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        let uptime = self.start_time.elapsed().as_secs_f64();
        let _ = writeln!(out, "# HELP onnx_server_uptime_seconds Time since server started");
        let _ = writeln!(out, "# TYPE onnx_server_uptime_seconds gauge");
        let _ = writeln!(out, "onnx_server_uptime_seconds {}\n", uptime);

        let _ = writeln!(out, "# HELP onnx_requests_total Total number of HTTP requests");
        let _ = writeln!(out, "# TYPE onnx_requests_total counter");
        let _ = writeln!(out, "onnx_requests_total {}\n", self.requests_total.value());

        let _ = writeln!(
            out,
            "# HELP onnx_request_errors_total Total number of HTTP error responses"
        );
        let _ = writeln!(out, "# TYPE onnx_request_errors_total counter");
        let _ = writeln!(out, "onnx_request_errors_total {}\n", self.request_errors.value());

        let _ = writeln!(out, "# HELP onnx_request_duration_seconds HTTP request latency");
        let _ = writeln!(out, "# TYPE onnx_request_duration_seconds histogram");
        self.request_latency.export(&mut out, "onnx_request_duration_seconds");
        out.push('\n');

        let _ = writeln!(out, "# HELP onnx_inference_total Total number of inference requests");
        let _ = writeln!(out, "# TYPE onnx_inference_total counter");
        let _ = writeln!(out, "onnx_inference_total {}\n", self.inference_total.value());

        let _ = writeln!(out, "# HELP onnx_inference_duration_seconds Inference latency");
        let _ = writeln!(out, "# TYPE onnx_inference_duration_seconds histogram");
        self.inference_latency
            .export(&mut out, "onnx_inference_duration_seconds");
        out.push('\n');

        if let Ok(counts) = self.model_inference_counts.lock() {
            if !counts.is_empty() {
                let _ = writeln!(
                    out,
                    "# HELP onnx_model_inference_total Inference requests per model"
                );
                let _ = writeln!(out, "# TYPE onnx_model_inference_total counter");
                for (model, count) in counts.iter() {
                    let _ = writeln!(
                        out,
                        "onnx_model_inference_total{{model=\"{}\"}} {}",
                        model, count
                    );
                }
                out.push('\n');
            }
        }

        if let Ok(times) = self.model_load_seconds.lock() {
            if !times.is_empty() {
                let _ = writeln!(out, "# HELP onnx_model_load_seconds Last model load duration");
                let _ = writeln!(out, "# TYPE onnx_model_load_seconds gauge");
                for (model, secs) in times.iter() {
                    let _ = writeln!(out, "onnx_model_load_seconds{{model=\"{}\"}} {}", model, secs);
                }
                out.push('\n');
            }
        }

        let _ = writeln!(out, "# HELP onnx_batches_total Total number of batch executions");
        let _ = writeln!(out, "# TYPE onnx_batches_total counter");
        let _ = writeln!(out, "onnx_batches_total {}\n", self.batches_total.value());

        let _ = writeln!(out, "# HELP onnx_batch_duration_seconds Batch execution latency");
        let _ = writeln!(out, "# TYPE onnx_batch_duration_seconds histogram");
        self.batch_latency.export(&mut out, "onnx_batch_duration_seconds");
        out.push('\n');

        if let Ok(sizes) = self.batch_sizes.lock() {
            if !sizes.is_empty() {
                let avg = sizes.iter().sum::<usize>() as f64 / sizes.len() as f64;
                let _ = writeln!(out, "# HELP onnx_average_batch_size Average batch size");
                let _ = writeln!(out, "# TYPE onnx_average_batch_size gauge");
                let _ = writeln!(out, "onnx_average_batch_size {}\n", avg);
            }
        }

        let _ = writeln!(
            out,
            "# HELP onnx_active_sessions Currently active inference sessions"
        );
        let _ = writeln!(out, "# TYPE onnx_active_sessions gauge");
        let _ = writeln!(out, "onnx_active_sessions {}\n", self.active_sessions.value());

        let _ = writeln!(out, "# HELP onnx_loaded_models Number of loaded models");
        let _ = writeln!(out, "# TYPE onnx_loaded_models gauge");
        let _ = writeln!(out, "onnx_loaded_models {}", self.loaded_models.value());

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;

    fn collector() -> MetricsCollector {
        MetricsCollector::new(&MetricsConfig::default())
    }

    #[test]
    fn test_counter() {
        let counter = Counter::default();
        assert_eq!(counter.value(), 0);
        counter.inc();
        counter.inc();
        assert_eq!(counter.value(), 2);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::default();
        gauge.set(3.5);
        assert_eq!(gauge.value(), 3.5);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let hist = Histogram::new(vec![0.01, 0.1, 1.0]);
        hist.observe(0.005);
        hist.observe(0.05);
        hist.observe(5.0);

        assert_eq!(hist.count(), 3);
        assert!((hist.sum() - 5.055).abs() < 1e-6);

        let mut out = String::new();
        hist.export(&mut out, "test");
        assert!(out.contains("test_bucket{le=\"0.01\"} 1"));
        assert!(out.contains("test_bucket{le=\"0.1\"} 2"));
        assert!(out.contains("test_bucket{le=\"1\"} 2"));
        assert!(out.contains("test_bucket{le=\"+Inf\"} 3"));
        assert!(out.contains("test_count 3"));
    }

    #[test]
    fn test_request_errors_counted_for_4xx_and_5xx() {
        let metrics = collector();
        metrics.record_request("/v1/models/a/infer", "POST", 200, 0.01);
        metrics.record_request("/v1/models/ghost/infer", "POST", 404, 0.01);
        metrics.record_request("/v1/models/a/infer", "POST", 500, 0.01);

        assert_eq!(metrics.requests_total(), 3);
        assert_eq!(metrics.request_errors_total(), 2);
    }

    #[test]
    fn test_inference_additivity() {
        let metrics = collector();
        metrics.record_inference("a", 0.01);
        metrics.record_inference("a", 0.02);
        metrics.record_inference("b", 0.03);

        assert_eq!(metrics.inference_total(), 3);
        assert_eq!(
            metrics.model_inference_total("a") + metrics.model_inference_total("b"),
            metrics.inference_total()
        );
        assert_eq!(metrics.inference_latency.count(), metrics.inference_total());
    }

    #[test]
    fn test_batch_size_window_is_bounded() {
        let metrics = collector();
        for i in 0..1100 {
            metrics.record_batch(i, 0.001);
        }
        let sizes = metrics.batch_sizes();
        assert_eq!(sizes.len(), 1000);
        assert_eq!(sizes[0], 100);
        assert_eq!(metrics.batches_total(), 1100);
    }

    #[test]
    fn test_export_contains_expected_families() {
        let metrics = collector();
        metrics.record_request("/health", "GET", 200, 0.001);
        metrics.record_inference("a", 0.01);
        metrics.record_batch(4, 0.02);
        metrics.record_model_load("a", 0.5);
        metrics.set_loaded_models(1);
        metrics.set_active_sessions(0);

        let text = metrics.export_prometheus();
        for family in [
            "onnx_server_uptime_seconds",
            "onnx_requests_total 1",
            "onnx_request_errors_total 0",
            "onnx_request_duration_seconds_bucket",
            "onnx_inference_total 1",
            "onnx_inference_duration_seconds_count 1",
            "onnx_model_inference_total{model=\"a\"} 1",
            "onnx_model_load_seconds{model=\"a\"} 0.5",
            "onnx_batches_total 1",
            "onnx_batch_duration_seconds_bucket",
            "onnx_average_batch_size 4",
            "onnx_active_sessions 0",
            "onnx_loaded_models 1",
        ] {
            assert!(text.contains(family), "missing {} in:\n{}", family, text);
        }
    }
}
