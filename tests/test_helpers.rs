//! Test helpers and utilities for integration tests

use fashion_eep::config::OrchestratorConfig;
use fashion_eep::stages::{builtin_definitions, ExecutionPlan, ServiceId, StageName};
use fashion_eep::testing::stage_response;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Small valid base64 image
#[allow(dead_code)]
pub const IMAGE: &str = "aW1hZ2UtYnl0ZXM=";

/// Every service mounted under its own prefix of one base URL,
/// e.g. `{base}/detection/detect`
#[allow(dead_code)]
pub fn config_for(base_url: &str) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    for service in ServiceId::ALL {
        config.services.insert(
            service.as_str().to_string(),
            format!("{}/{}", base_url.trim_end_matches('/'), service),
        );
    }
    config
}

#[allow(dead_code)]
pub fn plan_for(config: &OrchestratorConfig) -> Arc<ExecutionPlan> {
    Arc::new(ExecutionPlan::build(builtin_definitions(), config).unwrap())
}

/// Path a stage is served on under [`config_for`]
#[allow(dead_code)]
pub fn stage_path(plan: &ExecutionPlan, stage: StageName) -> String {
    let planned = plan.stage(stage).unwrap();
    format!("/{}{}", planned.definition.service, planned.definition.path)
}

/// Mount the canonical response for every stage of `plan`
#[allow(dead_code)]
pub async fn mount_all_stages(server: &MockServer, plan: &ExecutionPlan) {
    for planned in plan.stages() {
        Mock::given(method("POST"))
            .and(path(stage_path(plan, planned.name())))
            .respond_with(ResponseTemplate::new(200).set_body_json(stage_response(planned.name())))
            .mount(server)
            .await;
    }
}

/// Mount a healthy `GET /health` for every service
#[allow(dead_code)]
pub async fn mount_health(server: &MockServer) {
    for service in ServiceId::ALL {
        Mock::given(method("GET"))
            .and(path(format!("/{service}/health")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "ok"})))
            .mount(server)
            .await;
    }
}
