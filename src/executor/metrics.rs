//! Per-run Prometheus metrics pushed to a pushgateway

use std::time::Duration;

use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tracing::debug;

use crate::{Error, Result};

const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Gauges describing one backup run
pub struct SessionMetrics {
    registry: Registry,
    success: Gauge,
    fail: Gauge,
    duration_total: Gauge,
    duration: GaugeVec,
}

fn metric_err(e: prometheus::Error) -> Error {
    Error::metrics(e.to_string())
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace("restic").subsystem("session")
}

/// Label values may not carry `/` through the pushgateway path
pub fn sanitize_label_value(value: &str) -> String {
    value.replace('/', "|")
}

impl SessionMetrics {
    /// Fresh registry with all session gauges registered
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let success = Gauge::with_opts(opts(
            "success",
            "Indicates if session was successfully completed",
        ))
        .map_err(metric_err)?;
        let fail =
            Gauge::with_opts(opts("fail", "Indicates if session failed")).map_err(metric_err)?;
        let duration_total = Gauge::with_opts(opts(
            "duration_seconds_total",
            "Total seconds taken to complete restic session",
        ))
        .map_err(metric_err)?;
        let duration = GaugeVec::new(
            opts(
                "duration_seconds",
                "Seconds taken by one operation of the session",
            ),
            &["filegroup", "op"],
        )
        .map_err(metric_err)?;

        registry
            .register(Box::new(success.clone()))
            .map_err(metric_err)?;
        registry.register(Box::new(fail.clone())).map_err(metric_err)?;
        registry
            .register(Box::new(duration_total.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(duration.clone()))
            .map_err(metric_err)?;

        Ok(Self {
            registry,
            success,
            fail,
            duration_total,
            duration,
        })
    }

    /// Record how long `op` took for one file group
    pub fn observe(&self, file_group: &str, op: &str, took: Duration) {
        let file_group = sanitize_label_value(file_group);
        self.duration
            .with_label_values(&[file_group.as_str(), op])
            .set(took.as_secs_f64());
    }

    /// Record the overall outcome
    pub fn finish(&self, succeeded: bool, took: Duration) {
        self.success.set(if succeeded { 1.0 } else { 0.0 });
        self.fail.set(if succeeded { 0.0 } else { 1.0 });
        self.duration_total.set(took.as_secs_f64());
    }

    /// Text exposition of every gauge
    pub fn encode(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(metric_err)?;
        String::from_utf8(buf).map_err(|e| Error::metrics(e.to_string()))
    }
}

/// HTTP client for the pushgateway
#[derive(Clone)]
pub struct MetricsPusher {
    client: reqwest::Client,
    base_url: String,
}

impl MetricsPusher {
    /// Pusher targeting `base_url`
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .map_err(|e| Error::metrics(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Pushgateway URL for one job and host grouping key
    pub fn url(&self, job: &str, hostname: &str) -> String {
        format!("{}/metrics/job/{job}/hostname/{hostname}", self.base_url)
    }

    /// Replace the metrics of `job`/`hostname` with `metrics`
    pub async fn push(&self, job: &str, hostname: &str, metrics: &SessionMetrics) -> Result<()> {
        let url = self.url(job, hostname);
        let body = metrics.encode()?;
        let response = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, TextEncoder::new().format_type())
            .body(body)
            .send()
            .await
            .map_err(|e| Error::metrics(format!("push to {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::metrics(format!(
                "push to {url}: status {}",
                response.status()
            )));
        }
        debug!(%url, "Pushed session metrics");
        Ok(())
    }
}
