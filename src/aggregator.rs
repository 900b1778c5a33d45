//! Response aggregation: result envelope to client response
//!
//! Stage payloads pass through as the services returned them. Failures become
//! a stable `{kind, message}` descriptor with the message sanitized.

use crate::error::{sanitize_error_message, StageErrorKind, ValidationError};
use crate::pipeline::{OverallStatus, ResultEnvelope, StageOutcome, StageRecord};
use crate::stages::{StageName, StageOutput};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorDescriptor {
    pub kind: StageErrorKind,
    pub message: String,
}

/// Client view of one stage
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageReport {
    Succeeded {
        latency_ms: u64,
        data: StageOutput,
    },
    Failed {
        required: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        latency_ms: Option<u64>,
        error: ErrorDescriptor,
    },
    Skipped {
        reason: String,
    },
}

impl StageReport {
    fn from_record(record: &StageRecord) -> Self {
        let latency_ms = record.latency.map(|l| l.as_millis() as u64);
        match &record.outcome {
            StageOutcome::Succeeded(data) => StageReport::Succeeded {
                latency_ms: latency_ms.unwrap_or(0),
                data: data.clone(),
            },
            StageOutcome::Failed { kind, message } => StageReport::Failed {
                required: record.required,
                latency_ms,
                error: ErrorDescriptor {
                    kind: *kind,
                    message: sanitize_error_message(message),
                },
            },
            StageOutcome::Skipped(reason) => StageReport::Skipped {
                reason: reason.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResponse {
    pub request_id: Uuid,
    pub status: OverallStatus,
    pub stages: BTreeMap<StageName, StageReport>,
    /// Stages that did not succeed, in stage order
    pub partial_failures: Vec<StageName>,
    pub completed_at: DateTime<Utc>,
}

/// Response body plus the HTTP status it is sent with
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedResponse {
    pub status_code: u16,
    pub body: AnalysisResponse,
}

pub fn aggregate(result: &ResultEnvelope) -> AggregatedResponse {
    let stages = result
        .records()
        .iter()
        .map(|(stage, record)| (*stage, StageReport::from_record(record)))
        .collect();

    let partial_failures = result
        .records()
        .iter()
        .filter(|(_, record)| !record.outcome.is_succeeded())
        .map(|(stage, _)| *stage)
        .collect();

    AggregatedResponse {
        status_code: status_code(result),
        body: AnalysisResponse {
            request_id: result.request_id(),
            status: result.status(),
            stages,
            partial_failures,
            completed_at: Utc::now(),
        },
    }
}

/// 200 unless the request failed; then 503 when every failure behind it is an
/// unreachable or slow service, 502 otherwise.
///
/// The failures considered are those of required stages, or of any stage when
/// the required ones were only skipped.
pub fn status_code(result: &ResultEnvelope) -> u16 {
    if result.status() != OverallStatus::Failed {
        return 200;
    }

    let failed_kinds = |required_only: bool| -> Vec<StageErrorKind> {
        result
            .records()
            .values()
            .filter(|record| !required_only || record.required)
            .filter_map(|record| record.outcome.error_kind())
            .collect()
    };

    let mut kinds = failed_kinds(true);
    if kinds.is_empty() {
        kinds = failed_kinds(false);
    }

    if !kinds.is_empty() && kinds.iter().all(StageErrorKind::is_unavailable) {
        503
    } else {
        502
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorDetail {
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl ErrorBody {
    pub fn validation(error: &ValidationError) -> Self {
        Self {
            error: ErrorDetail {
                kind: "validation_error",
                field: Some(error.field.clone()),
                message: error.message.clone(),
            },
        }
    }

    pub fn new(kind: &'static str, message: impl AsRef<str>) -> Self {
        Self {
            error: ErrorDetail {
                kind,
                field: None,
                message: sanitize_error_message(message.as_ref()),
            },
        }
    }
}
