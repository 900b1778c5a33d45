//! Layered concurrent execution of one request's sub-graph
//!
//! Layers run one after another; the stages of a layer are polled together with
//! `join_all` and nothing is spawned, so dropping the future returned by
//! [`PipelineExecutor::execute`] drops every in-flight service call.

use super::outcome::{ResultEnvelope, SkipReason, StageOutcome, StageRecord};
use crate::client::{ServiceClient, ServiceError};
use crate::config::OrchestratorConfig;
use crate::envelope::RequestEnvelope;
use crate::observability::metrics;
use crate::stages::{DependencyMode, ExecutionPlan, PlannedStage, StageName, StageOutput, StageOutputs};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn, Instrument};

/// Re-dispatch of transiently failed stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts allowed for any single stage
    pub max_retries_per_stage: u32,
    /// Extra attempts allowed across all stages of one request
    pub budget_per_request: u32,
    /// Delay before the first retry; doubles on each further retry
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            max_retries_per_stage: 0,
            budget_per_request: 0,
            backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (zero-based)
    pub fn backoff_for(&self, retry: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(retry.min(16)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionPolicy {
    /// Skip every later layer once a required stage fails
    pub abort_on_required_failure: bool,
    pub retry: RetryPolicy,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            abort_on_required_failure: true,
            retry: RetryPolicy::disabled(),
        }
    }
}

impl ExecutionPolicy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            abort_on_required_failure: config.pipeline.abort_on_required_failure,
            retry: RetryPolicy {
                max_retries_per_stage: config.retry.max_attempts_per_stage,
                budget_per_request: config.retry.budget_per_request,
                backoff: Duration::from_millis(config.retry.backoff_ms),
            },
        }
    }
}

/// Retries left for one request, shared by all of its stages
#[derive(Debug)]
struct RetryBudget(AtomicU32);

impl RetryBudget {
    fn new(retries: u32) -> Self {
        Self(AtomicU32::new(retries))
    }

    fn try_take(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

/// Runs requests against a shared, read-only execution plan
#[derive(Clone)]
pub struct PipelineExecutor {
    plan: Arc<ExecutionPlan>,
    client: Arc<dyn ServiceClient>,
    policy: ExecutionPolicy,
}

impl PipelineExecutor {
    pub fn new(
        plan: Arc<ExecutionPlan>,
        client: Arc<dyn ServiceClient>,
        policy: ExecutionPolicy,
    ) -> Self {
        Self {
            plan,
            client,
            policy,
        }
    }

    pub fn from_config(
        plan: Arc<ExecutionPlan>,
        client: Arc<dyn ServiceClient>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self::new(plan, client, ExecutionPolicy::from_config(config))
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    /// Run the requested stages and their dependencies.
    ///
    /// Never fails: every stage of the sub-graph ends up in the envelope as
    /// succeeded, failed or skipped.
    pub async fn execute(&self, envelope: &RequestEnvelope) -> ResultEnvelope {
        let span = crate::request_span!(request_id = %envelope.request_id());
        self.execute_layers(envelope).instrument(span).await
    }

    async fn execute_layers(&self, envelope: &RequestEnvelope) -> ResultEnvelope {
        let started = Instant::now();
        let layers = self.plan.layers_for(envelope.selection());
        let budget = RetryBudget::new(self.policy.retry.budget_per_request);

        let mut records: BTreeMap<StageName, StageRecord> = BTreeMap::new();
        let mut outputs = StageOutputs::new();
        let mut aborted_by: Option<StageName> = None;

        debug!(layers = layers.len(), "Executing pipeline");

        for layer in layers {
            if let Some(failed) = aborted_by {
                for stage in layer {
                    let required = self.plan.stage(stage).is_some_and(PlannedStage::required);
                    metrics().stage_skipped(stage.as_str());
                    records.insert(stage, StageRecord::skipped(SkipReason::Aborted(failed), required));
                }
                continue;
            }

            let mut dispatches = Vec::with_capacity(layer.len());
            for stage in layer {
                let Some(planned) = self.plan.stage(stage) else {
                    continue;
                };
                match prepare(planned, envelope, &records, &outputs) {
                    Ok(body) => dispatches.push(self.run_stage(planned, body, &budget)),
                    Err(reason) => {
                        debug!(stage = %stage, reason = %reason, "Stage skipped");
                        metrics().stage_skipped(stage.as_str());
                        records.insert(stage, StageRecord::skipped(reason, planned.required()));
                    }
                }
            }

            for (stage, record) in join_all(dispatches).await {
                if let StageOutcome::Succeeded(output) = &record.outcome {
                    outputs.insert(stage, output.clone());
                }
                if record.required
                    && record.outcome.is_failed()
                    && self.policy.abort_on_required_failure
                    && aborted_by.is_none()
                {
                    warn!(stage = %stage, "Required stage failed, later layers will not run");
                    aborted_by = Some(stage);
                }
                records.insert(stage, record);
            }
        }

        let result = ResultEnvelope::new(envelope.request_id(), records);
        info!(
            status = ?result.status(),
            stages = result.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Pipeline finished"
        );
        result
    }

    /// Call one stage, retrying transient failures while the budget allows
    async fn run_stage(
        &self,
        planned: &PlannedStage,
        body: Vec<u8>,
        budget: &RetryBudget,
    ) -> (StageName, StageRecord) {
        let stage = planned.name();
        let span = crate::stage_span!(stage = %stage, endpoint = %planned.endpoint);

        async move {
            let started = Instant::now();
            let mut attempts = 0u32;

            let result = loop {
                attempts += 1;
                let error = match self.attempt(planned, &body).await {
                    Ok(output) => break Ok(output),
                    Err(error) => error,
                };

                let retry = attempts - 1;
                if error.is_retryable()
                    && retry < self.policy.retry.max_retries_per_stage
                    && budget.try_take()
                {
                    let delay = self.policy.retry.backoff_for(retry);
                    warn!(
                        error = %error,
                        attempt = attempts,
                        backoff_ms = delay.as_millis() as u64,
                        "Retrying stage"
                    );
                    metrics().stage_retried(stage.as_str());
                    tokio::time::sleep(delay).await;
                    continue;
                }
                break Err(error);
            };

            let latency = started.elapsed();
            let outcome = match result {
                Ok(output) => {
                    debug!(latency_ms = latency.as_millis() as u64, "Stage succeeded");
                    metrics().stage_succeeded(stage.as_str(), latency);
                    StageOutcome::Succeeded(output)
                }
                Err(error) => {
                    warn!(error = %error, attempts, "Stage failed");
                    metrics().stage_failed(stage.as_str(), error.kind(), latency);
                    StageOutcome::Failed {
                        kind: error.kind(),
                        message: error.client_message(),
                    }
                }
            };

            (
                stage,
                StageRecord {
                    outcome,
                    required: planned.required(),
                    latency: Some(latency),
                    attempts,
                },
            )
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, planned: &PlannedStage, body: &[u8]) -> Result<StageOutput, ServiceError> {
        let call = self.client.invoke(&planned.endpoint, body, planned.timeout);
        let response = tokio::time::timeout(planned.timeout, call)
            .await
            .map_err(|_| ServiceError::timeout(&planned.endpoint, planned.timeout))??;

        planned.name().decode_output(response.body).map_err(|e| {
            ServiceError::decode(&planned.endpoint, format!("unexpected response shape: {e}"))
        })
    }
}

/// Dependency check and request body for one stage, or why it cannot run
fn prepare(
    planned: &PlannedStage,
    envelope: &RequestEnvelope,
    records: &BTreeMap<StageName, StageRecord>,
    outputs: &StageOutputs,
) -> Result<Vec<u8>, SkipReason> {
    let failed_dependency = planned
        .definition
        .dependencies
        .iter()
        .filter(|dependency| dependency.mode == DependencyMode::Consumes)
        .find(|dependency| {
            !records
                .get(&dependency.stage)
                .is_some_and(|record| record.outcome.is_succeeded())
        });
    if let Some(dependency) = failed_dependency {
        return Err(SkipReason::DependencyFailed(dependency.stage));
    }

    let input = planned
        .name()
        .build_input(envelope, outputs)
        .map_err(SkipReason::MissingInput)?;

    serde_json::to_vec(&input)
        .map_err(|e| SkipReason::MissingInput(format!("request body not encodable: {e}")))
}
