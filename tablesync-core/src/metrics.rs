//! Prometheus metrics and the health endpoints, served over plain HTTP by axum.
//!
//! Every metric lives in one global registry under the `tablesync` prefix. Partition scoped
//! metrics carry a `partition` label, the skip counter additionally carries the `reason`.

use std::iter;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::source::LagReader;
use crate::{Error, Result};

const REGISTRY_PREFIX: &str = "tablesync";

const READ_TOTAL: &str = "read";
const WRITE_TOTAL: &str = "write";
const SKIPPED_TOTAL: &str = "skipped";
const RETRY_TOTAL: &str = "retry";
const COMMIT_TOTAL: &str = "commit";
const PENDING: &str = "pending";
const WRITE_TIME: &str = "write_time";

const PARTITION_LABEL: &str = "partition";
const REASON_LABEL: &str = "reason";
const TOPIC_LABEL: &str = "topic";

pub(crate) type Labels = Vec<(String, String)>;

#[derive(Default)]
struct GlobalRegistry {
    // metrics are registered once, at first use
    registry: parking_lot::Mutex<Registry>,
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::default)
}

pub(crate) struct SyncMetrics {
    pub(crate) read_total: Family<Labels, Counter>,
    pub(crate) write_total: Family<Labels, Counter>,
    pub(crate) skipped_total: Family<Labels, Counter>,
    pub(crate) retry_total: Family<Labels, Counter>,
    pub(crate) commit_total: Family<Labels, Counter>,
    /// Messages in the topic not yet committed by the group, -1 when unknown.
    pub(crate) pending: Family<Labels, Gauge>,
    /// Duration of successful writes in microseconds.
    pub(crate) write_time: Family<Labels, Histogram>,
}

impl SyncMetrics {
    fn new() -> Self {
        let metrics = Self {
            read_total: Family::<Labels, Counter>::default(),
            write_total: Family::<Labels, Counter>::default(),
            skipped_total: Family::<Labels, Counter>::default(),
            retry_total: Family::<Labels, Counter>::default(),
            commit_total: Family::<Labels, Counter>::default(),
            pending: Family::<Labels, Gauge>::default(),
            // 100 microseconds to 1 minute
            write_time: Family::<Labels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets_range(100.0, 60_000_000.0, 10))
            }),
        };

        let mut registry = global_registry().registry.lock();
        let registry = registry.sub_registry_with_prefix(REGISTRY_PREFIX);
        registry.register(
            READ_TOTAL,
            "Messages read from the stream",
            metrics.read_total.clone(),
        );
        registry.register(
            WRITE_TOTAL,
            "Records written to the table",
            metrics.write_total.clone(),
        );
        registry.register(
            SKIPPED_TOTAL,
            "Messages skipped because they can never be written",
            metrics.skipped_total.clone(),
        );
        registry.register(
            RETRY_TOTAL,
            "Write attempts repeated after a transient failure",
            metrics.retry_total.clone(),
        );
        registry.register(
            COMMIT_TOTAL,
            "Offsets committed for the consumer group",
            metrics.commit_total.clone(),
        );
        registry.register(
            PENDING,
            "Messages in the topic not yet committed by the consumer group",
            metrics.pending.clone(),
        );
        registry.register(
            WRITE_TIME,
            "Time taken by successful writes in microseconds",
            metrics.write_time.clone(),
        );
        metrics
    }
}

static SYNC_METRICS: OnceLock<SyncMetrics> = OnceLock::new();

pub(crate) fn sync_metrics() -> &'static SyncMetrics {
    SYNC_METRICS.get_or_init(SyncMetrics::new)
}

pub(crate) fn partition_labels(partition: i32) -> Labels {
    vec![(PARTITION_LABEL.to_string(), partition.to_string())]
}

pub(crate) fn skip_labels(partition: i32, reason: &str) -> Labels {
    vec![
        (PARTITION_LABEL.to_string(), partition.to_string()),
        (REASON_LABEL.to_string(), reason.to_string()),
    ]
}

fn topic_labels(topic: &str) -> Labels {
    vec![(TOPIC_LABEL.to_string(), topic.to_string())]
}

/// `length` buckets from `min` to `max` (both included), growing by a constant factor.
fn exponential_buckets_range(min: f64, max: f64, length: u16) -> impl Iterator<Item = f64> {
    let growth_factor = (max / min).powf(1.0 / (f64::from(length.max(2)) - 1.0));
    iter::successors(Some(min), move |bucket| Some(bucket * growth_factor)).take(length.into())
}

/// Readiness of the pipeline. Ready once both ends are connected, unready again on shutdown.
#[derive(Clone, Default)]
pub(crate) struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    pub(crate) fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub(crate) fn mark_unready(&self) {
        self.ready.store(false, Ordering::Release);
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let mut buffer = String::new();
    {
        let registry = global_registry().registry.lock();
        if let Err(e) = encode(&mut buffer, &registry) {
            error!(?e, "Failed to encode metrics");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    debug!("Exposing metrics: {:?}", buffer);
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        Body::from(buffer),
    )
        .into_response()
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn readyz(State(state): State<HealthState>) -> impl IntoResponse {
    if state.is_ready() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

fn metrics_router(state: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// Serves `/metrics`, `/livez` and `/readyz` until the token is cancelled.
pub(crate) async fn start_metrics_server(
    addr: SocketAddr,
    state: HealthState,
    cancel: CancellationToken,
) -> Result<()> {
    // force registration so that the first scrape already lists every metric
    let _ = sync_metrics();

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding metrics server to {addr}: {e}")))?;
    info!(?addr, "Metrics server listening");

    axum::serve(listener, metrics_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Metrics(format!("Running metrics server: {e}")))
}

/// Runs [start_metrics_server] in its own task. A failure is logged as soon as it happens, the
/// sync keeps running without metrics and health endpoints.
pub(crate) fn spawn_metrics_server(
    addr: SocketAddr,
    state: HealthState,
    cancel: CancellationToken,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let result = start_metrics_server(addr, state, cancel).await;
        if let Err(e) = &result {
            error!(error = %e, "Metrics server stopped, metrics and health endpoints are unavailable");
        }
        result
    })
}

/// Periodically copies the consumer lag into the pending gauge.
pub(crate) async fn expose_pending<L: LagReader>(
    mut lag_reader: L,
    topic: String,
    refresh_interval: Duration,
    cancel: CancellationToken,
) {
    let gauge = sync_metrics().pending.get_or_create(&topic_labels(&topic)).clone();
    let mut ticker = time::interval(refresh_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match lag_reader.pending().await {
            Ok(pending) => {
                let pending = pending.map_or(-1, |p| p as i64);
                debug!(topic, pending, "Consumer lag");
                gauge.set(pending);
            }
            Err(e) => {
                warn!(?e, topic, "Failed to fetch consumer lag");
                gauge.set(-1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;
    use crate::source::test_utils::{StubSource, message};
    use crate::test_utils::capture_logs;

    #[tokio::test]
    async fn test_metrics_handler_lists_sync_metrics() {
        sync_metrics()
            .read_total
            .get_or_create(&partition_labels(77))
            .inc();

        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8_lossy(&body);
        assert!(body.contains(r#"tablesync_read_total{partition="77"}"#), "{body}");
        assert!(body.contains("tablesync_write_time"), "{body}");
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported_right_away() {
        let (logs, _guard) = capture_logs();
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let server = spawn_metrics_server(addr, HealthState::default(), cancel.clone());
        let result = time::timeout(Duration::from_secs(1), server)
            .await
            .expect("bind failure must not wait for shutdown")
            .unwrap();

        assert!(matches!(result, Err(Error::Metrics(_))));
        assert!(!cancel.is_cancelled());
        let logs = logs.contents();
        assert!(logs.contains("Metrics server stopped"), "{logs}");
        assert!(logs.contains(&addr.to_string()), "{logs}");
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let state = HealthState::default();
        assert_eq!(livez().await.into_response().status(), StatusCode::NO_CONTENT);
        assert_eq!(
            readyz(State(state.clone())).await.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.mark_ready();
        assert_eq!(
            readyz(State(state.clone())).await.into_response().status(),
            StatusCode::NO_CONTENT
        );

        state.mark_unready();
        assert!(!state.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expose_pending() {
        let source = StubSource::new(vec![
            message(0, 0, r#"{"id": "1", "valor": 1}"#),
            message(0, 1, r#"{"id": "2", "valor": 2}"#),
        ]);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(expose_pending(
            source,
            "pending-test-topic".to_string(),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        time::sleep(Duration::from_millis(25)).await;
        let pending = sync_metrics()
            .pending
            .get_or_create(&topic_labels("pending-test-topic"))
            .get();
        assert_eq!(pending, 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_exponential_buckets_range() {
        let buckets: Vec<f64> = exponential_buckets_range(100.0, 60_000_000.0, 10).collect();
        assert_eq!(buckets.len(), 10);
        assert_eq!(buckets.first().copied(), Some(100.0));
        let last = buckets.last().copied().unwrap();
        assert!((last - 60_000_000.0).abs() < 1.0, "{last}");
    }
}
