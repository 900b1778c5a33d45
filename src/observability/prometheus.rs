//! Prometheus export through the `metrics` facade
//!
//! The recorder is installed once per process; the handle renders the text
//! exposition served at `/metrics`. Without an installed recorder every
//! `record_*` call is a no-op.

use crate::error::{EepError, EepResult, StageErrorKind};
use crate::pipeline::OverallStatus;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the global recorder, or return the one already installed
pub fn install() -> EepResult<PrometheusHandle> {
    HANDLE
        .get_or_try_init(|| {
            let handle = PrometheusBuilder::new()
                .set_buckets_for_metric(
                    Matcher::Suffix("duration_seconds".to_string()),
                    DURATION_BUCKETS,
                )
                .map_err(|e| EepError::internal(format!("invalid histogram buckets: {e}")))?
                .install_recorder()
                .map_err(|e| EepError::internal(format!("cannot install metrics recorder: {e}")))?;
            describe_metrics();
            Ok(handle)
        })
        .cloned()
}

fn describe_metrics() {
    describe_counter!(
        "eep_requests_total",
        "Analysis requests received by the orchestrator"
    );
    describe_counter!(
        "eep_requests_rejected_total",
        "Requests rejected by validation before any stage ran"
    );
    describe_counter!(
        "eep_requests_cancelled_total",
        "Requests dropped before the pipeline finished"
    );
    describe_counter!(
        "eep_requests_completed_total",
        "Requests completed, by overall status"
    );
    describe_histogram!(
        "eep_request_duration_seconds",
        "End-to-end pipeline duration in seconds"
    );
    describe_counter!(
        "eep_stage_outcomes_total",
        "Stage outcomes by stage, outcome and error kind"
    );
    describe_histogram!(
        "eep_stage_duration_seconds",
        "Inference service call duration in seconds, across attempts"
    );
    describe_counter!(
        "eep_stage_retries_total",
        "Retries drawn from the per-request retry budget"
    );
}

pub fn record_request_received() {
    counter!("eep_requests_total").increment(1);
}

pub fn record_request_rejected() {
    counter!("eep_requests_rejected_total").increment(1);
}

pub fn record_request_cancelled() {
    counter!("eep_requests_cancelled_total").increment(1);
}

pub fn record_request_completed(status: OverallStatus, duration: Duration) {
    counter!("eep_requests_completed_total",
        "status" => status_label(status)
    )
    .increment(1);
    histogram!("eep_request_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_stage_call(
    stage: &str,
    outcome: &'static str,
    kind: Option<StageErrorKind>,
    duration: Option<Duration>,
) {
    counter!("eep_stage_outcomes_total",
        "stage" => stage.to_string(),
        "outcome" => outcome,
        "error_kind" => kind.map(|k| k.as_str()).unwrap_or("none")
    )
    .increment(1);
    if let Some(duration) = duration {
        histogram!("eep_stage_duration_seconds",
            "stage" => stage.to_string()
        )
        .record(duration.as_secs_f64());
    }
}

pub fn record_stage_retry(stage: &str) {
    counter!("eep_stage_retries_total",
        "stage" => stage.to_string()
    )
    .increment(1);
}

fn status_label(status: OverallStatus) -> &'static str {
    match status {
        OverallStatus::Complete => "complete",
        OverallStatus::PartialSuccess => "partial_success",
        OverallStatus::Failed => "failed",
    }
}
