//! Prometheus metrics for the knowledge pipeline and CLI.
//!
//! Exposes:
//! - `slidegraph_command_duration_seconds`, `slidegraph_command_total`,
//!   `slidegraph_command_inflight` for CLI commands
//! - `slidegraph_stage_duration_seconds` (histogram per pipeline stage)
//! - `slidegraph_fallback_total` (counter per recovered failure kind)

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

static COMMAND_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "slidegraph_command_duration_seconds",
        "CLI command duration in seconds",
        &["command"],
        prometheus::exponential_buckets(0.05, 2.0, 14).expect("valid buckets")
    )
    .expect("failed to register command duration histogram")
});

static COMMAND_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "slidegraph_command_total",
        "Command executions by status",
        &["command", "status"]
    )
    .expect("failed to register command counter")
});

static COMMAND_INFLIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "slidegraph_command_inflight",
        "Commands currently running",
        &["command"]
    )
    .expect("failed to register inflight gauge")
});

static STAGE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    // 1ms up to ~2 minutes; extraction dominates the top buckets.
    register_histogram_vec!(
        "slidegraph_stage_duration_seconds",
        "Pipeline stage duration in seconds",
        &["stage"],
        prometheus::exponential_buckets(0.001, 2.0, 18).expect("valid buckets")
    )
    .expect("failed to register stage duration histogram")
});

static FALLBACK_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "slidegraph_fallback_total",
        "Recovered failures by kind",
        &["kind"]
    )
    .expect("failed to register fallback counter")
});

/// Tracks one CLI command from start to finish.
#[derive(Debug)]
pub struct CommandTimer {
    command: &'static str,
    started: Instant,
}

impl CommandTimer {
    pub fn start(command: &'static str) -> Self {
        COMMAND_INFLIGHT.with_label_values(&[command]).inc();
        Self {
            command,
            started: Instant::now(),
        }
    }

    pub fn finish(self, success: bool) -> Duration {
        let elapsed = self.started.elapsed();
        COMMAND_INFLIGHT.with_label_values(&[self.command]).dec();
        COMMAND_DURATION
            .with_label_values(&[self.command])
            .observe(elapsed.as_secs_f64());
        COMMAND_TOTAL
            .with_label_values(&[self.command, if success { "ok" } else { "error" }])
            .inc();
        elapsed
    }
}

/// Record how long one pipeline stage took.
pub fn observe_stage(stage: &str, duration: Duration) {
    STAGE_DURATION
        .with_label_values(&[stage])
        .observe(duration.as_secs_f64());
}

/// Count a failure that was recovered by a fallback path.
pub fn record_fallback(kind: &str) {
    FALLBACK_TOTAL.with_label_values(&[kind]).inc();
}

/// Text exposition of everything registered so far.
fn render() -> prometheus::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(buffer)
}

fn respond(path: &str) -> Response<Full<Bytes>> {
    let (status, body) = match path {
        "/metrics" => match render() {
            Ok(body) => (StatusCode::OK, body),
            Err(err) => {
                error!("Failed to encode metrics: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, b"encode error".to_vec())
            }
        },
        _ => (StatusCode::NOT_FOUND, Vec::new()),
    };
    let mut response = Response::new(Full::from(body));
    *response.status_mut() = status;
    if status == StatusCode::OK {
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain; version=0.0.4"),
        );
    }
    response
}

/// Spawn the `/metrics` HTTP endpoint on the given address.
pub fn spawn_metrics_server(addr: SocketAddr) {
    // Register every family up front so the first scrape lists them all.
    Lazy::force(&COMMAND_DURATION);
    Lazy::force(&COMMAND_TOTAL);
    Lazy::force(&COMMAND_INFLIGHT);
    Lazy::force(&STAGE_DURATION);
    Lazy::force(&FALLBACK_TOTAL);

    tokio::spawn(async move {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(%addr, "Metrics server failed to bind: {}", err);
                return;
            }
        };
        info!(%addr, "Prometheus metrics endpoint started");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("Metrics accept failed: {}", err);
                    continue;
                }
            };
            let service = service_fn(|req: Request<Incoming>| async move {
                Ok::<_, Infallible>(respond(req.uri().path()))
            });
            tokio::spawn(async move {
                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    warn!(?peer, "Metrics connection error: {}", err);
                }
            });
        }
    });
}
