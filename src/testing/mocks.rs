//! Scripted service client for exercising the executor without live services

use crate::client::{RawResponse, ServiceClient, ServiceError};
use crate::stages::{ExecutionPlan, StageName};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// What the stub does for one call
#[derive(Debug, Clone)]
pub enum StubBehavior {
    /// Answer 200 with this body
    Respond(Value),
    /// Fail with this error
    Fail(ServiceError),
    /// Sleep, then answer 200 with this body
    Delay(Duration, Value),
    /// Never answer; only the caller's timeout ends the call
    Hang,
}

/// One call observed by the stub
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub endpoint: String,
    pub body: Value,
}

/// Per-endpoint scripted client. Each endpoint has a queue of behaviours; the
/// last one repeats once the queue is drained. Unscripted endpoints fail with a
/// connection error.
#[derive(Debug, Default)]
pub struct StubServiceClient {
    scripts: Mutex<HashMap<String, VecDeque<StubBehavior>>>,
    calls: Mutex<Vec<RecordedCall>>,
    unhealthy: Mutex<HashSet<String>>,
}

impl StubServiceClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stage of `plan` answers with its canonical fixture
    pub fn for_plan(plan: &ExecutionPlan) -> Self {
        let stub = Self::new();
        for planned in plan.stages() {
            stub.script(
                &planned.endpoint,
                vec![StubBehavior::Respond(stage_response(planned.name()))],
            );
        }
        stub
    }

    pub fn script(&self, endpoint: &str, behaviors: Vec<StubBehavior>) {
        lock(&self.scripts).insert(endpoint.to_string(), behaviors.into());
    }

    /// Script a stage by name, resolving its endpoint through `plan`
    pub fn script_stage(&self, plan: &ExecutionPlan, stage: StageName, behaviors: Vec<StubBehavior>) {
        if let Some(planned) = plan.stage(stage) {
            self.script(&planned.endpoint, behaviors);
        }
    }

    /// `GET {base_url}/health` fails for this base URL
    pub fn mark_unhealthy(&self, base_url: &str) {
        lock(&self.unhealthy).insert(base_url.trim_end_matches('/').to_string());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, endpoint: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| call.endpoint == endpoint)
            .count()
    }

    /// Calls made on behalf of `stage`, resolved through `plan`
    pub fn stage_calls(&self, plan: &ExecutionPlan, stage: StageName) -> usize {
        plan.stage(stage)
            .map(|planned| self.call_count(&planned.endpoint))
            .unwrap_or(0)
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn next_behavior(&self, endpoint: &str) -> Option<StubBehavior> {
        let mut scripts = lock(&self.scripts);
        let queue = scripts.get_mut(endpoint)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl ServiceClient for StubServiceClient {
    async fn invoke(
        &self,
        endpoint: &str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<RawResponse, ServiceError> {
        lock(&self.calls).push(RecordedCall {
            endpoint: endpoint.to_string(),
            body: serde_json::from_slice(body).unwrap_or(Value::Null),
        });

        let behavior = self
            .next_behavior(endpoint)
            .unwrap_or_else(|| StubBehavior::Fail(ServiceError::connection(endpoint, "no stub")));

        let respond = |body: Value| Ok::<_, ServiceError>(RawResponse { status: 200, body });
        match behavior {
            StubBehavior::Respond(body) => respond(body),
            StubBehavior::Fail(error) => Err(error),
            StubBehavior::Delay(delay, body) => {
                if delay >= timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(ServiceError::timeout(endpoint, timeout));
                }
                tokio::time::sleep(delay).await;
                respond(body)
            }
            StubBehavior::Hang => {
                std::future::pending::<()>().await;
                Err(ServiceError::timeout(endpoint, timeout))
            }
        }
    }

    async fn health(&self, base_url: &str, _timeout: Duration) -> Result<(), ServiceError> {
        let base_url = base_url.trim_end_matches('/');
        if lock(&self.unhealthy).contains(base_url) {
            Err(ServiceError::connection(
                &format!("{base_url}/health"),
                "connection refused",
            ))
        } else {
            Ok(())
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Canonical well-formed response body for each stage
pub fn stage_response(stage: StageName) -> Value {
    match stage {
        StageName::Detection => json!({
            "detections": [
                {"label": "dress", "confidence": 0.93, "bbox": [12.0, 40.0, 220.0, 480.0]},
                {"label": "handbag", "confidence": 0.71}
            ]
        }),
        StageName::Style => json!({"style": "casual", "confidence": 0.81}),
        StageName::Feature => json!({"features": [0.12, 0.5, 0.33, 0.9]}),
        StageName::Elegance => json!({"score": 0.72}),
        StageName::Person => json!({
            "persons": [{"bbox": [0.0, 0.0, 256.0, 512.0], "confidence": 0.98}]
        }),
        StageName::Match => json!({
            "matches": [{"id": "sku-1042", "score": 0.91}, {"id": "sku-2210", "score": 0.84}]
        }),
        StageName::Recommendation => json!({
            "recommendations": [{"id": "sku-7731", "reason": "pairs with casual dress"}]
        }),
        StageName::VirtualTryOn => json!({"image": "dHJ5LW9uLXJlc3VsdA=="}),
        StageName::TextToImage => json!({"image": "Z2VuZXJhdGVkLW91dGZpdA=="}),
    }
}
