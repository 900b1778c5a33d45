//! Health checks for the inference services
//!
//! Reported on `/services/health`, separately from the orchestrator's own
//! liveness: a down service degrades the pipeline but does not make the
//! orchestrator unhealthy.

use crate::client::ServiceClient;
use crate::config::OrchestratorConfig;
use crate::stages::{ExecutionPlan, ServiceId};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Health check result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    pub component: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub response_time_ms: Option<u64>,
}

/// Trait for components that can be health checked
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Perform health check on this component
    async fn health_check(&self) -> HealthCheckResult;

    /// Get the component name for reporting
    fn component_name(&self) -> &str;
}

/// `GET /health` on one inference service
pub struct ServiceHealthCheck {
    service: ServiceId,
    base_url: String,
    client: Arc<dyn ServiceClient>,
    timeout: Duration,
}

impl ServiceHealthCheck {
    pub fn new(
        service: ServiceId,
        base_url: impl Into<String>,
        client: Arc<dyn ServiceClient>,
        timeout: Duration,
    ) -> Self {
        Self {
            service,
            base_url: base_url.into(),
            client,
            timeout,
        }
    }
}

#[async_trait]
impl HealthCheck for ServiceHealthCheck {
    async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let result = self.client.health(&self.base_url, self.timeout).await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                debug!(service = %self.service, response_time_ms, "Service healthy");
                HealthCheckResult {
                    component: self.component_name().to_string(),
                    healthy: true,
                    message: None,
                    response_time_ms: Some(response_time_ms),
                }
            }
            Err(e) => {
                warn!(service = %self.service, error = %e, response_time_ms, "Service health check failed");
                HealthCheckResult {
                    component: self.component_name().to_string(),
                    healthy: false,
                    message: Some(format!("{}: {}", e.kind(), e)),
                    response_time_ms: Some(response_time_ms),
                }
            }
        }
    }

    fn component_name(&self) -> &str {
        self.service.as_str()
    }
}

/// Aggregated view returned by `/services/health`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServicesHealthReport {
    /// `healthy` when every service answered, `degraded` otherwise
    pub status: &'static str,
    pub services: BTreeMap<String, HealthCheckResult>,
}

/// Aggregated health check manager
#[derive(Default)]
pub struct HealthCheckManager {
    health_checks: Vec<Box<dyn HealthCheck>>,
}

impl HealthCheckManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// One check per service used by a stage of `plan`
    pub fn for_plan(
        plan: &ExecutionPlan,
        config: &OrchestratorConfig,
        client: Arc<dyn ServiceClient>,
    ) -> Self {
        let services: BTreeSet<ServiceId> = plan.stages().map(|s| s.definition.service).collect();

        let mut manager = Self::new();
        for service in services {
            if let Some(base_url) = config.service_url(service) {
                manager.add_health_check(Box::new(ServiceHealthCheck::new(
                    service,
                    base_url,
                    client.clone(),
                    config.health_timeout(),
                )));
            }
        }
        manager
    }

    /// Add a health check to the manager
    pub fn add_health_check(&mut self, health_check: Box<dyn HealthCheck>) {
        self.health_checks.push(health_check);
    }

    pub fn len(&self) -> usize {
        self.health_checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.health_checks.is_empty()
    }

    /// Run all health checks concurrently
    pub async fn run_health_checks(&self) -> Vec<HealthCheckResult> {
        join_all(self.health_checks.iter().map(|check| check.health_check())).await
    }

    pub async fn report(&self) -> ServicesHealthReport {
        let results = self.run_health_checks().await;
        let healthy_count = results.iter().filter(|r| r.healthy).count();
        let total_count = results.len();

        debug!(
            "Service health: {}/{} services healthy",
            healthy_count, total_count
        );

        ServicesHealthReport {
            status: if healthy_count == total_count {
                "healthy"
            } else {
                "degraded"
            },
            services: results
                .into_iter()
                .map(|result| (result.component.clone(), result))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::builtin_definitions;
    use crate::testing::StubServiceClient;

    fn plan(config: &OrchestratorConfig) -> ExecutionPlan {
        ExecutionPlan::build(builtin_definitions(), config).unwrap()
    }

    #[tokio::test]
    async fn test_service_health_check_healthy() {
        let client = Arc::new(StubServiceClient::new());
        let check = ServiceHealthCheck::new(
            ServiceId::Style,
            "http://style.test",
            client,
            Duration::from_secs(1),
        );

        let result = check.health_check().await;

        assert_eq!(result.component, "style");
        assert!(result.healthy);
        assert!(result.message.is_none());
        assert!(result.response_time_ms.is_some());
    }

    #[tokio::test]
    async fn test_service_health_check_unhealthy() {
        let client = Arc::new(StubServiceClient::new());
        client.mark_unhealthy("http://style.test");
        let check = ServiceHealthCheck::new(
            ServiceId::Style,
            "http://style.test",
            client,
            Duration::from_secs(1),
        );

        let result = check.health_check().await;

        assert!(!result.healthy);
        assert!(result.message.unwrap().starts_with("connection_error"));
    }

    #[tokio::test]
    async fn test_manager_covers_every_planned_service() {
        let config = OrchestratorConfig::test_config();
        let client = Arc::new(StubServiceClient::new());
        let manager = HealthCheckManager::for_plan(&plan(&config), &config, client);

        assert_eq!(manager.len(), ServiceId::ALL.len());

        let report = manager.report().await;
        assert_eq!(report.status, "healthy");
        assert!(report.services.contains_key("matching"));
    }

    #[tokio::test]
    async fn test_manager_reports_degraded() {
        let config = OrchestratorConfig::test_config();
        let client = Arc::new(StubServiceClient::new());
        client.mark_unhealthy(config.service_url(ServiceId::Elegance).unwrap());
        let manager = HealthCheckManager::for_plan(&plan(&config), &config, client);

        let report = manager.report().await;

        assert_eq!(report.status, "degraded");
        assert!(!report.services["elegance"].healthy);
        assert!(report.services["detection"].healthy);
    }

    #[tokio::test]
    async fn test_disabled_services_are_not_checked() {
        let mut config = OrchestratorConfig::test_config();
        config.pipeline.enabled_stages = Some(vec!["detection".into(), "style".into()]);
        let client = Arc::new(StubServiceClient::new());
        let manager = HealthCheckManager::for_plan(&plan(&config), &config, client);

        assert_eq!(manager.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_manager_is_healthy() {
        let manager = HealthCheckManager::new();
        assert!(manager.is_empty());
        assert_eq!(manager.report().await.status, "healthy");
    }
}
