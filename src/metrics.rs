//! Prometheus metrics for CSI operations and provider API traffic,
//! plus the HTTP exporter both processes run.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;
use prometheus::core::Collector;
use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts,
    Registry, TextEncoder,
};
use tracing::info;

const NAMESPACE: &str = "emma_csi";

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static OPERATION_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static API_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static API_REQUEST_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static VOLUME_ATTACH_DURATION: OnceLock<Histogram> = OnceLock::new();
static VOLUME_DETACH_DURATION: OnceLock<Histogram> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some(NAMESPACE.to_owned()), None)
            .expect("failed to initialise metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register metric collector");
    collector
}

fn operations_total() -> &'static IntCounterVec {
    OPERATIONS_TOTAL.get_or_init(|| {
        let opts = Opts::new("operations_total", "Total number of CSI operations");
        let counter = IntCounterVec::new(opts, &["operation", "status"])
            .expect("failed to build operations counter");
        register_collector(counter)
    })
}

fn operation_duration() -> &'static HistogramVec {
    OPERATION_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "operation_duration_seconds",
            "Duration of CSI operations in seconds",
        )
        .buckets(exponential_buckets(0.1, 2.0, 10).expect("static bucket spec"));
        let histogram =
            HistogramVec::new(opts, &["operation"]).expect("failed to build operation histogram");
        register_collector(histogram)
    })
}

fn api_requests_total() -> &'static IntCounterVec {
    API_REQUESTS_TOTAL.get_or_init(|| {
        let opts = Opts::new("api_requests_total", "Total number of provider API requests");
        let counter = IntCounterVec::new(opts, &["method", "endpoint", "status"])
            .expect("failed to build API request counter");
        register_collector(counter)
    })
}

fn api_request_duration() -> &'static HistogramVec {
    API_REQUEST_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "api_request_duration_seconds",
            "Duration of provider API requests in seconds",
        )
        .buckets(exponential_buckets(0.05, 2.0, 10).expect("static bucket spec"));
        let histogram = HistogramVec::new(opts, &["method", "endpoint"])
            .expect("failed to build API request histogram");
        register_collector(histogram)
    })
}

fn volume_attach_duration() -> &'static Histogram {
    VOLUME_ATTACH_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "volume_attach_duration_seconds",
            "Duration of volume attach operations in seconds",
        )
        .buckets(exponential_buckets(1.0, 2.0, 10).expect("static bucket spec"));
        let histogram = Histogram::with_opts(opts).expect("failed to build attach histogram");
        register_collector(histogram)
    })
}

fn volume_detach_duration() -> &'static Histogram {
    VOLUME_DETACH_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "volume_detach_duration_seconds",
            "Duration of volume detach operations in seconds",
        )
        .buckets(exponential_buckets(1.0, 2.0, 10).expect("static bucket spec"));
        let histogram = Histogram::with_opts(opts).expect("failed to build detach histogram");
        register_collector(histogram)
    })
}

/// Record one finished CSI operation.
pub fn record_operation(operation: &str, status: &str, duration: Duration) {
    operations_total()
        .with_label_values(&[operation, status])
        .inc();
    operation_duration()
        .with_label_values(&[operation])
        .observe(duration.as_secs_f64());
}

/// Record one provider API round-trip. `endpoint` is the path template,
/// never the concrete path, to keep label cardinality bounded.
pub fn observe_api_request(method: &str, endpoint: &str, status: u16, duration: Duration) {
    api_requests_total()
        .with_label_values(&[method, endpoint, &status.to_string()])
        .inc();
    api_request_duration()
        .with_label_values(&[method, endpoint])
        .observe(duration.as_secs_f64());
}

/// Record the end-to-end duration of a volume attach.
pub fn record_volume_attach(duration: Duration) {
    volume_attach_duration().observe(duration.as_secs_f64());
}

/// Record the end-to-end duration of a volume detach.
pub fn record_volume_detach(duration: Duration) {
    volume_detach_duration().observe(duration.as_secs_f64());
}

/// Times one CSI operation and records its outcome.
#[derive(Debug)]
pub struct OperationTimer {
    operation: &'static str,
    started: Instant,
}

impl OperationTimer {
    /// Start timing `operation`.
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            started: Instant::now(),
        }
    }

    /// Record the operation as succeeded or failed.
    pub fn record(self, success: bool) {
        let status = if success { "success" } else { "error" };
        record_operation(self.operation, status, self.started.elapsed());
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&registry().gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

async fn health_handler() -> &'static str {
    "OK"
}

/// Serve `/metrics` and `/health` on `addr`. Accepts the `:8080`
/// shorthand for all-interfaces binding.
pub async fn serve(addr: &str) -> anyhow::Result<()> {
    let addr = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_owned()
    };

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "metrics server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recorded_operations_show_up_in_the_exposition() {
        record_operation("CreateVolume", "success", Duration::from_millis(250));
        observe_api_request("POST", "/v1/volumes", 201, Duration::from_millis(80));

        let families = registry().gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"emma_csi_operations_total"), "got {names:?}");
        assert!(names.contains(&"emma_csi_api_requests_total"), "got {names:?}");
    }

    #[tokio::test]
    async fn exporter_serves_metrics_and_health() {
        record_operation("DeleteVolume", "success", Duration::from_millis(10));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let health = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(health, "OK");

        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("emma_csi_operations_total"), "got {body}");
    }
}
