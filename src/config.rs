//! Orchestrator configuration
//!
//! Loaded once at startup from an optional TOML file, then overlaid with
//! environment keys. The result is treated as immutable and handed explicitly
//! to the execution plan builder and the executor.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8000"
//!
//! [timeouts]
//! default_timeout_ms = 10000
//!
//! [services]
//! detection = "http://detection:8001"
//! style = "http://style:8002"
//!
//! [stages.style]
//! required = true
//! timeout_ms = 3000
//!
//! [pipeline]
//! enabled_stages = ["detection", "style"]
//! abort_on_required_failure = true
//! ```
//!
//! Environment keys: `EEP_BIND`, `EEP_TIMEOUT_MS`, `EEP_HEALTH_TIMEOUT_MS`,
//! `EEP_<SERVICE>_URL`, `EEP_STAGE_<STAGE>_TIMEOUT_MS`, `EEP_STAGE_<STAGE>_REQUIRED`,
//! `EEP_ENABLED_STAGES`, `EEP_ABORT_ON_REQUIRED_FAILURE`, `EEP_RETRY_ATTEMPTS`,
//! `EEP_RETRY_BUDGET`, `EEP_MAX_IMAGE_BYTES`.

use crate::stages::{ServiceId, StageName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Main orchestrator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    /// Base URL per inference service, keyed by service id
    #[serde(default)]
    pub services: BTreeMap<String, String>,
    /// Per-stage overrides, keyed by stage name
    #[serde(default)]
    pub stages: BTreeMap<String, StageOverride>,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub limits: LimitsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutSection {
    /// Applies to every stage without its own `timeout_ms`
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Timeout for downstream `GET /health` probes
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            health_timeout_ms: default_health_timeout_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_health_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageOverride {
    pub required: Option<bool>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSection {
    /// Stages known to the plan; `None` enables all of them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_stages: Option<Vec<String>>,
    /// Stop scheduling later layers once a required stage fails
    #[serde(default = "default_abort_on_required_failure")]
    pub abort_on_required_failure: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            enabled_stages: None,
            abort_on_required_failure: default_abort_on_required_failure(),
        }
    }
}

fn default_abort_on_required_failure() -> bool {
    true
}

/// Retry policy. The budget is shared by every stage of one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default)]
    pub max_attempts_per_stage: u32,
    #[serde(default = "default_retry_budget")]
    pub budget_per_request: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts_per_stage: 0,
            budget_per_request: default_retry_budget(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_retry_budget() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsSection {
    /// Maximum decoded size of any single image
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
    #[serde(default = "default_max_garment_images")]
    pub max_garment_images: usize,
    /// Maximum raw request body size accepted by the API
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_image_bytes: default_max_image_bytes(),
            max_garment_images: default_max_garment_images(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_max_image_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_garment_images() -> usize {
    4
}

fn default_max_body_bytes() -> u64 {
    64 * 1024 * 1024
}

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Unknown stage in configuration: {0}")]
    UnknownStage(String),
    #[error("Unknown service in configuration: {0}")]
    UnknownService(String),
    #[error("Stage '{stage}' requires a URL for service '{service}'")]
    MissingServiceUrl { stage: String, service: String },
    #[error("Invalid URL for service '{service}': {url} ({reason})")]
    InvalidServiceUrl {
        service: String,
        url: String,
        reason: String,
    },
    #[error("Stage '{0}' is defined more than once")]
    DuplicateStage(String),
    #[error("Stage '{stage}' depends on undefined stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },
    #[error("Dependency cycle among stages: {}", .0.join(", "))]
    CycleDetected(Vec<String>),
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file, then apply process environment overrides
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: OrchestratorConfig = toml::from_str(&content)?;
        config.normalize_keys()?;
        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from defaults and process environment only
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = OrchestratorConfig::default();
        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment-style keys. Unrelated keys are ignored.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut vars: Vec<(String, String)> = vars
            .into_iter()
            .filter(|(key, _)| key.starts_with("EEP_"))
            .collect();
        vars.sort();

        for (key, value) in vars {
            match key.as_str() {
                "EEP_BIND" => self.server.bind = value,
                "EEP_TIMEOUT_MS" => self.timeouts.default_timeout_ms = parse_value(&key, &value)?,
                "EEP_HEALTH_TIMEOUT_MS" => {
                    self.timeouts.health_timeout_ms = parse_value(&key, &value)?
                }
                "EEP_ABORT_ON_REQUIRED_FAILURE" => {
                    self.pipeline.abort_on_required_failure = parse_bool(&key, &value)?
                }
                "EEP_ENABLED_STAGES" => {
                    self.pipeline.enabled_stages = Some(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect(),
                    )
                }
                "EEP_RETRY_ATTEMPTS" => {
                    self.retry.max_attempts_per_stage = parse_value(&key, &value)?
                }
                "EEP_RETRY_BUDGET" => self.retry.budget_per_request = parse_value(&key, &value)?,
                "EEP_MAX_IMAGE_BYTES" => self.limits.max_image_bytes = parse_value(&key, &value)?,
                _ => self.apply_pattern_override(&key, value)?,
            }
        }

        self.normalize_keys()
    }

    fn apply_pattern_override(&mut self, key: &str, value: String) -> Result<(), ConfigError> {
        if let Some(rest) = key.strip_prefix("EEP_STAGE_") {
            if let Some(stage) = rest.strip_suffix("_TIMEOUT_MS") {
                let timeout = parse_value(key, &value)?;
                self.stage_override_mut(stage).timeout_ms = Some(timeout);
            } else if let Some(stage) = rest.strip_suffix("_REQUIRED") {
                let required = parse_bool(key, &value)?;
                self.stage_override_mut(stage).required = Some(required);
            }
        } else if let Some(service) = key
            .strip_prefix("EEP_")
            .and_then(|rest| rest.strip_suffix("_URL"))
        {
            self.services.insert(service.to_ascii_lowercase(), value);
        }
        Ok(())
    }

    /// Rewrite `[services]`, `[stages.*]` and `enabled_stages` names to their
    /// canonical form (`Virtual-TryOn` becomes `virtual_tryon`), so lookups by
    /// stage or service id see them. Two keys naming the same thing are an error.
    pub fn normalize_keys(&mut self) -> Result<(), ConfigError> {
        let mut services = BTreeMap::new();
        for (key, url) in std::mem::take(&mut self.services) {
            let service =
                ServiceId::from_str(&key).map_err(|_| ConfigError::UnknownService(key.clone()))?;
            if services.insert(service.as_str().to_string(), url).is_some() {
                return Err(ConfigError::InvalidConfig(format!(
                    "service '{service}' is configured more than once"
                )));
            }
        }
        self.services = services;

        let mut stages = BTreeMap::new();
        for (key, overrides) in std::mem::take(&mut self.stages) {
            let stage =
                StageName::from_str(&key).map_err(|_| ConfigError::UnknownStage(key.clone()))?;
            if stages.insert(stage.as_str().to_string(), overrides).is_some() {
                return Err(ConfigError::InvalidConfig(format!(
                    "stage '{stage}' has more than one override section"
                )));
            }
        }
        self.stages = stages;

        if let Some(enabled) = &mut self.pipeline.enabled_stages {
            for name in enabled.iter_mut() {
                let stage =
                    StageName::from_str(name).map_err(|_| ConfigError::UnknownStage(name.clone()))?;
                *name = stage.as_str().to_string();
            }
        }

        Ok(())
    }

    fn stage_override_mut(&mut self, stage: &str) -> &mut StageOverride {
        self.stages.entry(stage.to_ascii_lowercase()).or_default()
    }

    /// Validate everything that can be checked without the stage table
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;

        if self.timeouts.default_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "default_timeout_ms must be greater than zero".to_string(),
            ));
        }

        for (service, url) in &self.services {
            let id = ServiceId::from_str(service)
                .map_err(|_| ConfigError::UnknownService(service.clone()))?;
            ensure_canonical("service", service, id.as_str())?;
            validate_service_url(service, url)?;
        }

        for (stage, overrides) in &self.stages {
            let name =
                StageName::from_str(stage).map_err(|_| ConfigError::UnknownStage(stage.clone()))?;
            ensure_canonical("stage", stage, name.as_str())?;
            if overrides.timeout_ms == Some(0) {
                return Err(ConfigError::InvalidConfig(format!(
                    "timeout_ms for stage '{stage}' must be greater than zero"
                )));
            }
        }

        if let Some(enabled) = &self.pipeline.enabled_stages {
            for stage in enabled {
                StageName::from_str(stage)
                    .map_err(|_| ConfigError::UnknownStage(stage.clone()))?;
            }
        }

        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                key: "server.bind".to_string(),
                value: self.server.bind.clone(),
            })
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.default_timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.health_timeout_ms)
    }

    pub fn service_url(&self, service: ServiceId) -> Option<&str> {
        self.services.get(service.as_str()).map(String::as_str)
    }

    pub fn stage_override(&self, stage: StageName) -> Option<&StageOverride> {
        self.stages.get(stage.as_str())
    }

    /// Whether a stage is part of the deployment
    pub fn is_stage_enabled(&self, stage: StageName) -> bool {
        match &self.pipeline.enabled_stages {
            None => true,
            Some(enabled) => enabled
                .iter()
                .any(|name| StageName::from_str(name).is_ok_and(|s| s == stage)),
        }
    }

    /// Create a test configuration with every service on a local address
    #[cfg(test)]
    pub fn test_config() -> Self {
        let mut config = OrchestratorConfig::default();
        for service in ServiceId::ALL {
            config
                .services
                .insert(service.as_str().to_string(), format!("http://{service}.test"));
        }
        config
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Lookups use the canonical name, so a key in any other spelling would be ignored
fn ensure_canonical(what: &str, key: &str, canonical: &str) -> Result<(), ConfigError> {
    if key == canonical {
        Ok(())
    } else {
        Err(ConfigError::InvalidConfig(format!(
            "{what} key '{key}' must be written '{canonical}'"
        )))
    }
}

fn validate_service_url(service: &str, url: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidServiceUrl {
        service: service.to_string(),
        url: url.to_string(),
        reason,
    };

    let parsed = url::Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", parsed.scheme())));
    }
    if parsed.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(())
}
