//! HTTP surface of the orchestrator
//!
//! | Route | Purpose |
//! |---|---|
//! | `POST /api/v1/analyze` | run the requested stages (all by default) |
//! | `POST /api/v1/<stage>` | run one stage and its dependencies |
//! | `GET /health` | orchestrator liveness, never touches the services |
//! | `GET /ready` | plan built and listener bound |
//! | `GET /services/health` | probe every inference service |
//! | `GET /metrics` | Prometheus exposition |
//! | `GET /stats` | JSON statistics snapshot |

pub mod request;

pub use request::AnalyzeRequest;

use crate::aggregator::{aggregate, ErrorBody};
use crate::config::LimitsSection;
use crate::error::{EepError, EepResult};
use crate::health::HealthCheckManager;
use crate::observability::metrics;
use crate::pipeline::PipelineExecutor;
use crate::stages::StageName;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

/// Everything a request handler needs, shared across connections
pub struct AppState {
    executor: PipelineExecutor,
    health: HealthCheckManager,
    limits: LimitsSection,
    prometheus: Option<PrometheusHandle>,
    ready: AtomicBool,
    started_at: Instant,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(executor: PipelineExecutor, health: HealthCheckManager, limits: LimitsSection) -> Self {
        Self {
            executor,
            health,
            limits,
            prometheus: None,
            ready: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn executor(&self) -> &PipelineExecutor {
        &self.executor
    }
}

/// All routes, with rejections rendered as JSON errors
pub fn routes(
    state: SharedState,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let body_limit = state.limits.max_body_bytes;

    // POST /api/v1/analyze
    let analyze = warp::path!("api" / "v1" / "analyze")
        .and(warp::post())
        .and(warp::body::content_length_limit(body_limit))
        .and(warp::body::bytes())
        .and(with_state(state.clone()))
        .and_then(|body: Bytes, state: SharedState| async move {
            Ok::<_, Infallible>(run_analysis(state, None, body).await)
        });

    // POST /api/v1/<stage>
    let single_stage = warp::path!("api" / "v1" / String)
        .and(warp::post())
        .and(warp::body::content_length_limit(body_limit))
        .and(warp::body::bytes())
        .and(with_state(state.clone()))
        .and_then(|name: String, body: Bytes, state: SharedState| async move {
            let reply = match StageName::from_str(&name) {
                Ok(stage) => run_analysis(state, Some(stage), body).await,
                Err(message) => json_reply(&ErrorBody::new("not_found", message), StatusCode::NOT_FOUND),
            };
            Ok::<_, Infallible>(reply)
        });

    // GET /health - liveness only
    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: SharedState| {
            json_reply(
                &LivenessResponse {
                    status: "ok",
                    uptime_seconds: state.started_at.elapsed().as_secs(),
                },
                StatusCode::OK,
            )
        });

    // GET /ready
    let ready = warp::path("ready")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: SharedState| {
            let ready = state.is_ready() && !state.executor.plan().is_empty();
            let status = if ready {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json_reply(
                &ReadinessResponse {
                    ready,
                    stages: state.executor.plan().len(),
                },
                status,
            )
        });

    // GET /services/health
    let services_health = warp::path!("services" / "health")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(|state: SharedState| async move {
            let report = state.health.report().await;
            let status = if report.status == "healthy" {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            Ok::<_, Infallible>(json_reply(&report, status))
        });

    // GET /metrics - Prometheus text format
    let prometheus = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: SharedState| match &state.prometheus {
            Some(handle) => warp::reply::with_header(
                handle.render(),
                "content-type",
                "text/plain; version=0.0.4",
            )
            .into_response(),
            None => json_reply(
                &ErrorBody::new("unavailable", "metrics exporter not installed"),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        });

    // GET /stats - JSON snapshot
    let stats = warp::path("stats")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| json_reply(&metrics().get_metrics(), StatusCode::OK));

    analyze
        .or(single_stage)
        .unify()
        .or(health)
        .unify()
        .or(ready)
        .unify()
        .or(services_health)
        .unify()
        .or(prometheus)
        .unify()
        .or(stats)
        .unify()
        .recover(handle_rejection)
        .with(warp::trace::request())
}

/// Bind and serve until `shutdown` resolves
pub async fn serve<F>(state: SharedState, addr: SocketAddr, shutdown: F) -> EepResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (bound, server) = warp::serve(routes(state.clone()))
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .map_err(|e| EepError::server(format!("cannot bind {addr}: {e}")))?;

    state.set_ready(true);
    info!(addr = %bound, stages = state.executor.plan().len(), "Orchestrator listening");

    server.await;

    state.set_ready(false);
    info!("Orchestrator stopped");
    Ok(())
}

fn with_state(state: SharedState) -> impl Filter<Extract = (SharedState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Counts a request as cancelled unless it reaches a verdict
struct InFlightRequest {
    finished: bool,
}

impl InFlightRequest {
    fn start() -> Self {
        metrics().request_received();
        Self { finished: false }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for InFlightRequest {
    fn drop(&mut self) {
        if !self.finished {
            metrics().request_cancelled();
        }
    }
}

async fn run_analysis(state: SharedState, only: Option<StageName>, body: Bytes) -> Response {
    let in_flight = InFlightRequest::start();
    let started = Instant::now();

    let envelope = match AnalyzeRequest::from_slice(&body)
        .and_then(|request| request.into_envelope(only, &state.limits, state.executor.plan()))
    {
        Ok(envelope) => envelope,
        Err(error) => {
            warn!(field = %error.field, message = %error.message, "Rejected analysis request");
            metrics().request_rejected();
            in_flight.finish();
            return json_reply(&ErrorBody::validation(&error), StatusCode::BAD_REQUEST);
        }
    };

    let result = state.executor.execute(&envelope).await;
    metrics().request_completed(result.status(), started.elapsed());
    in_flight.finish();

    let aggregated = aggregate(&result);
    let status =
        StatusCode::from_u16(aggregated.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_reply(&aggregated.body, status)
}

fn json_reply<T: Serialize>(body: &T, status: StatusCode) -> Response {
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

async fn handle_rejection(rejection: Rejection) -> Result<Response, Infallible> {
    let (status, kind, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not_found", "no such endpoint".to_string())
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
            "request body exceeds the configured limit".to_string(),
        )
    } else if rejection.find::<warp::reject::LengthRequired>().is_some() {
        (
            StatusCode::LENGTH_REQUIRED,
            "length_required",
            "content-length header is required".to_string(),
        )
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            "method not allowed".to_string(),
        )
    } else {
        warn!(rejection = ?rejection, "Unhandled rejection");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            format!("{rejection:?}"),
        )
    };

    Ok(json_reply(&ErrorBody::new(kind, message), status))
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    status: &'static str,
    uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    stages: usize,
}
