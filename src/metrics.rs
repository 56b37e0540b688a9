//! Process-local metrics with Prometheus text exposition.
//!
//! Counters, gauges and histograms are kept in a global registry and
//! rendered on demand; the daemon serves the rendering from a dedicated
//! listener so the registry surface stays pure.

use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

use axum::routing::get;

use crate::error::Result;

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// The process-wide metric registry.
pub fn global() -> &'static Registry {
    GLOBAL.get_or_init(Registry::new)
}

const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

const SIZE_BUCKETS: &[f64] = &[
    256.0,
    1024.0,
    4096.0,
    16384.0,
    65536.0,
    262144.0,
    1048576.0,
    4194304.0,
    16777216.0,
    67108864.0,
    268435456.0,
];

#[derive(Debug, Clone)]
struct Histogram {
    buckets: &'static [f64],
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(buckets: &'static [f64]) -> Self {
        Self {
            buckets,
            counts: vec![0; buckets.len()],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        for (i, bound) in self.buckets.iter().enumerate() {
            if value <= *bound {
                self.counts[i] += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }
}

/// Labels for one HTTP observation.
type HttpLabels = (String, String, u16);

/// Labels for one mirror request: registry, cache, source.
type MirrorLabels = (String, &'static str, &'static str);

#[derive(Debug)]
pub struct Registry {
    mirror_requests: Mutex<BTreeMap<MirrorLabels, u64>>,
    request_durations: Mutex<BTreeMap<HttpLabels, Histogram>>,
    response_sizes: Mutex<BTreeMap<HttpLabels, Histogram>>,
    inflight: Mutex<BTreeMap<String, i64>>,
}

impl Registry {
    fn new() -> Self {
        Self {
            mirror_requests: Mutex::new(BTreeMap::new()),
            request_durations: Mutex::new(BTreeMap::new()),
            response_sizes: Mutex::new(BTreeMap::new()),
            inflight: Mutex::new(BTreeMap::new()),
        }
    }

    /// Count a completed mirror-mode request.
    pub fn record_mirror_request(&self, registry: &str, hit: bool, external: bool) {
        let labels = (
            registry.to_owned(),
            if hit { "hit" } else { "miss" },
            if external { "external" } else { "internal" },
        );
        let mut requests = self.mirror_requests.lock().expect("metrics lock poisoned");
        *requests.entry(labels).or_insert(0) += 1;
    }

    /// Current value of the mirror request counter for a label set.
    pub fn mirror_requests_total(&self, registry: &str, cache: &str, source: &str) -> u64 {
        let requests = self.mirror_requests.lock().expect("metrics lock poisoned");
        requests
            .iter()
            .find(|((r, c, s), _)| r == registry && *c == cache && *s == source)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    /// Record latency and response size for a finished request.
    pub fn observe_http(
        &self,
        handler: &str,
        method: &str,
        status: u16,
        latency_seconds: f64,
        response_bytes: f64,
    ) {
        let labels = (handler.to_owned(), method.to_owned(), status);
        self.request_durations
            .lock()
            .expect("metrics lock poisoned")
            .entry(labels.clone())
            .or_insert_with(|| Histogram::new(DURATION_BUCKETS))
            .observe(latency_seconds);
        self.response_sizes
            .lock()
            .expect("metrics lock poisoned")
            .entry(labels)
            .or_insert_with(|| Histogram::new(SIZE_BUCKETS))
            .observe(response_bytes);
    }

    /// Adjust the in-flight request gauge for a handler.
    pub fn inflight_add(&self, handler: &str, delta: i64) {
        let mut inflight = self.inflight.lock().expect("metrics lock poisoned");
        *inflight.entry(handler.to_owned()).or_insert(0) += delta;
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# TYPE spegel_mirror_requests_total counter\n");
        for ((registry, cache, source), count) in
            self.mirror_requests.lock().expect("metrics lock poisoned").iter()
        {
            out.push_str(&format!(
                "spegel_mirror_requests_total{{registry=\"{registry}\",cache=\"{cache}\",source=\"{source}\"}} {count}\n"
            ));
        }

        render_histograms(
            &mut out,
            "http_request_duration_seconds",
            &self.request_durations.lock().expect("metrics lock poisoned"),
        );
        render_histograms(
            &mut out,
            "http_response_size_bytes",
            &self.response_sizes.lock().expect("metrics lock poisoned"),
        );

        out.push_str("# TYPE http_requests_inflight gauge\n");
        for (handler, value) in self.inflight.lock().expect("metrics lock poisoned").iter() {
            out.push_str(&format!(
                "http_requests_inflight{{handler=\"{handler}\"}} {value}\n"
            ));
        }

        out
    }
}

fn render_histograms(out: &mut String, name: &str, histograms: &BTreeMap<HttpLabels, Histogram>) {
    out.push_str(&format!("# TYPE {name} histogram\n"));
    for ((handler, method, status), histogram) in histograms.iter() {
        let labels = format!("handler=\"{handler}\",method=\"{method}\",status=\"{status}\"");
        for (i, bound) in histogram.buckets.iter().enumerate() {
            out.push_str(&format!(
                "{name}_bucket{{{labels},le=\"{bound}\"}} {}\n",
                histogram.counts[i]
            ));
        }
        out.push_str(&format!(
            "{name}_bucket{{{labels},le=\"+Inf\"}} {}\n",
            histogram.count
        ));
        out.push_str(&format!("{name}_sum{{{labels}}} {}\n", histogram.sum));
        out.push_str(&format!("{name}_count{{{labels}}} {}\n", histogram.count));
    }
}

/// Serve `/metrics` on a dedicated listener.
pub async fn serve(listener: tokio::net::TcpListener) -> Result<()> {
    let app = axum::Router::new().route("/metrics", get(|| async { global().render() }));
    tracing::info!(addr = %listener.local_addr()?, "metrics listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror_counter_increments() {
        let registry = Registry::new();
        registry.record_mirror_request("docker.io", true, false);
        registry.record_mirror_request("docker.io", true, false);
        registry.record_mirror_request("docker.io", false, true);

        assert_eq!(registry.mirror_requests_total("docker.io", "hit", "internal"), 2);
        assert_eq!(registry.mirror_requests_total("docker.io", "miss", "external"), 1);
        assert_eq!(registry.mirror_requests_total("quay.io", "hit", "internal"), 0);
    }

    #[test]
    fn test_histogram_observation() {
        let mut histogram = Histogram::new(DURATION_BUCKETS);
        histogram.observe(0.003);
        histogram.observe(0.3);
        assert_eq!(histogram.count, 2);
        // 0.003 lands in every bucket from 0.005 up; 0.3 only from 0.5 up.
        assert_eq!(histogram.counts[DURATION_BUCKETS.len() - 1], 2);
        assert_eq!(histogram.counts[0], 0);
    }

    #[test]
    fn test_render_contains_families() {
        let registry = Registry::new();
        registry.record_mirror_request("docker.io", true, false);
        registry.observe_http("/v2/*", "GET", 200, 0.01, 1024.0);
        registry.inflight_add("/v2/*", 1);

        let text = registry.render();
        assert!(text.contains(
            "spegel_mirror_requests_total{registry=\"docker.io\",cache=\"hit\",source=\"internal\"} 1"
        ));
        assert!(text.contains("http_request_duration_seconds_bucket"));
        assert!(text.contains("http_response_size_bytes_sum"));
        assert!(text.contains("http_requests_inflight{handler=\"/v2/*\"} 1"));
    }
}
