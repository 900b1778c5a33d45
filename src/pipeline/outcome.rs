//! Stage outcomes and the per-request result envelope

use crate::error::StageErrorKind;
use crate::stages::{StageName, StageOutput};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Why a stage did not run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A consumed dependency did not succeed
    DependencyFailed(StageName),
    /// A required stage failed and later layers were not scheduled
    Aborted(StageName),
    /// The request lacks what this stage needs
    MissingInput(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DependencyFailed(stage) => write!(f, "dependency failed: {stage}"),
            SkipReason::Aborted(stage) => write!(f, "aborted: required stage {stage} failed"),
            SkipReason::MissingInput(reason) => write!(f, "missing input: {reason}"),
        }
    }
}

/// Terminal result of one stage
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Succeeded(StageOutput),
    Failed {
        kind: StageErrorKind,
        message: String,
    },
    Skipped(SkipReason),
}

impl StageOutcome {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, StageOutcome::Succeeded(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StageOutcome::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, StageOutcome::Skipped(_))
    }

    pub fn error_kind(&self) -> Option<StageErrorKind> {
        match self {
            StageOutcome::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Outcome plus the bookkeeping around it
#[derive(Debug, Clone, PartialEq)]
pub struct StageRecord {
    pub outcome: StageOutcome,
    pub required: bool,
    /// Wall time across all attempts; `None` when the stage never dispatched
    pub latency: Option<Duration>,
    pub attempts: u32,
}

impl StageRecord {
    pub fn skipped(reason: SkipReason, required: bool) -> Self {
        Self {
            outcome: StageOutcome::Skipped(reason),
            required,
            latency: None,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    /// Every stage succeeded
    Complete,
    /// Every required stage succeeded, some optional stage did not
    PartialSuccess,
    /// A required stage did not succeed
    Failed,
}

/// Every stage outcome of one request, plus the overall status
#[derive(Debug, Clone, PartialEq)]
pub struct ResultEnvelope {
    request_id: Uuid,
    records: BTreeMap<StageName, StageRecord>,
    status: OverallStatus,
}

impl ResultEnvelope {
    pub fn new(request_id: Uuid, records: BTreeMap<StageName, StageRecord>) -> Self {
        let status = overall_status(&records);
        Self {
            request_id,
            records,
            status,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn status(&self) -> OverallStatus {
        self.status
    }

    pub fn records(&self) -> &BTreeMap<StageName, StageRecord> {
        &self.records
    }

    pub fn record(&self, stage: StageName) -> Option<&StageRecord> {
        self.records.get(&stage)
    }

    pub fn outcome(&self, stage: StageName) -> Option<&StageOutcome> {
        self.records.get(&stage).map(|r| &r.outcome)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Outcomes only, for comparing runs without timing noise
    pub fn outcomes(&self) -> BTreeMap<StageName, StageOutcome> {
        self.records
            .iter()
            .map(|(stage, record)| (*stage, record.outcome.clone()))
            .collect()
    }
}

/// An empty record set is `Complete`
pub fn overall_status(records: &BTreeMap<StageName, StageRecord>) -> OverallStatus {
    let required_ok = records
        .values()
        .filter(|r| r.required)
        .all(|r| r.outcome.is_succeeded());
    let all_ok = records.values().all(|r| r.outcome.is_succeeded());

    match (required_ok, all_ok) {
        (true, true) => OverallStatus::Complete,
        (true, false) => OverallStatus::PartialSuccess,
        (false, _) => OverallStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn succeeded(stage: StageName, required: bool) -> StageRecord {
        let body = match stage {
            StageName::Elegance => json!({"score": 0.5}),
            _ => json!({"style": "casual"}),
        };
        StageRecord {
            outcome: StageOutcome::Succeeded(stage.decode_output(body).unwrap()),
            required,
            latency: Some(Duration::from_millis(5)),
            attempts: 1,
        }
    }

    fn failed(required: bool) -> StageRecord {
        StageRecord {
            outcome: StageOutcome::Failed {
                kind: StageErrorKind::TimeoutError,
                message: "slow".to_string(),
            },
            required,
            latency: Some(Duration::from_millis(100)),
            attempts: 1,
        }
    }

    #[test]
    fn test_empty_envelope_is_complete() {
        let envelope = ResultEnvelope::new(Uuid::new_v4(), BTreeMap::new());
        assert_eq!(envelope.status(), OverallStatus::Complete);
        assert!(envelope.is_empty());
    }

    #[test]
    fn test_all_succeeded_is_complete() {
        let records = BTreeMap::from([
            (StageName::Style, succeeded(StageName::Style, true)),
            (StageName::Elegance, succeeded(StageName::Elegance, false)),
        ]);
        assert_eq!(overall_status(&records), OverallStatus::Complete);
    }

    #[test]
    fn test_optional_failure_is_partial() {
        let records = BTreeMap::from([
            (StageName::Style, failed(false)),
            (StageName::Elegance, succeeded(StageName::Elegance, true)),
        ]);
        assert_eq!(overall_status(&records), OverallStatus::PartialSuccess);
    }

    #[test]
    fn test_optional_skip_is_partial() {
        let records = BTreeMap::from([
            (StageName::Elegance, succeeded(StageName::Elegance, true)),
            (
                StageName::VirtualTryOn,
                StageRecord::skipped(SkipReason::MissingInput("no garment".into()), false),
            ),
        ]);
        assert_eq!(overall_status(&records), OverallStatus::PartialSuccess);
    }

    #[test]
    fn test_required_failure_is_failed() {
        let records = BTreeMap::from([
            (StageName::Style, failed(true)),
            (StageName::Elegance, succeeded(StageName::Elegance, false)),
        ]);
        assert_eq!(overall_status(&records), OverallStatus::Failed);
    }

    #[test]
    fn test_required_skip_is_failed() {
        let records = BTreeMap::from([(
            StageName::Match,
            StageRecord::skipped(SkipReason::DependencyFailed(StageName::Feature), true),
        )]);
        assert_eq!(overall_status(&records), OverallStatus::Failed);
    }

    #[test]
    fn test_skip_reason_display() {
        assert_eq!(
            SkipReason::DependencyFailed(StageName::Feature).to_string(),
            "dependency failed: feature"
        );
        assert_eq!(
            SkipReason::Aborted(StageName::Detection).to_string(),
            "aborted: required stage detection failed"
        );
        assert_eq!(
            SkipReason::MissingInput("no garment image supplied".into()).to_string(),
            "missing input: no garment image supplied"
        );
    }
}
