//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading: what a deployment file
//! produces, and which mistakes are refused at startup.

use fashion_eep::config::{ConfigError, OrchestratorConfig};
use fashion_eep::envelope::StageSelection;
use fashion_eep::stages::{builtin_definitions, ExecutionPlan, ServiceId, StageName};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{content}").unwrap();
    file
}

const FULL_DEPLOYMENT: &str = r#"
[server]
bind = "0.0.0.0:8080"

[timeouts]
default_timeout_ms = 8000
health_timeout_ms = 1500

[services]
detection = "http://detection:8001"
style = "http://style:8002"
feature = "http://feature:8003"
elegance = "http://elegance:8004"
person = "http://person:8005"
matching = "http://matching:8006"
recommendation = "http://recommendation:8007"
virtual_tryon = "http://tryon:8008"
text_to_image = "http://t2i:8009"

[stages.virtual_tryon]
timeout_ms = 60000

[stages.elegance]
required = true

[retry]
max_attempts_per_stage = 2
budget_per_request = 3
backoff_ms = 50

[limits]
max_image_bytes = 1048576
max_garment_images = 2
"#;

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let file = write_config(FULL_DEPLOYMENT);

    let config = OrchestratorConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.bind_addr().unwrap().port(), 8080);
    assert_eq!(config.default_timeout(), Duration::from_millis(8000));
    assert_eq!(config.health_timeout(), Duration::from_millis(1500));
    assert_eq!(config.service_url(ServiceId::VirtualTryOn), Some("http://tryon:8008"));
    assert_eq!(config.retry.max_attempts_per_stage, 2);
    assert_eq!(config.limits.max_garment_images, 2);
}

#[test]
fn test_loaded_config_builds_plan_with_overrides() {
    let file = write_config(FULL_DEPLOYMENT);
    let config = OrchestratorConfig::load_from_file(file.path()).unwrap();

    let plan = ExecutionPlan::build(builtin_definitions(), &config).unwrap();

    assert_eq!(plan.len(), StageName::ALL.len());
    let tryon = plan.stage(StageName::VirtualTryOn).unwrap();
    assert_eq!(tryon.timeout, Duration::from_secs(60));
    assert_eq!(tryon.endpoint, "http://tryon:8008/tryon");
    assert!(plan.stage(StageName::Elegance).unwrap().required());
    let style = plan.stage(StageName::Style).unwrap();
    assert_eq!(style.timeout, Duration::from_millis(8000));
    assert!(!style.required());
}

#[test]
fn test_partial_deployment_with_enabled_stages() {
    let file = write_config(
        r#"
[services]
feature = "http://feature:8003"
matching = "http://matching:8006"

[pipeline]
enabled_stages = ["feature", "match"]
"#,
    );
    let config = OrchestratorConfig::load_from_file(file.path()).unwrap();

    let plan = ExecutionPlan::build(builtin_definitions(), &config).unwrap();

    assert_eq!(plan.len(), 2);
    assert!(!plan.contains(StageName::Detection));
    assert_eq!(
        plan.layers_for(&StageSelection::All),
        vec![vec![StageName::Feature], vec![StageName::Match]]
    );
}

#[test]
fn test_key_spelling_does_not_drop_settings() {
    let file = write_config(
        r#"
[services]
Style = "http://style:8002"
virtual-tryon = "http://tryon:8008"
person = "http://person:8005"

[stages.Style]
required = true
timeout_ms = 300

[pipeline]
enabled_stages = ["style", "Virtual-TryOn", "person"]
"#,
    );
    let config = OrchestratorConfig::load_from_file(file.path()).unwrap();

    let plan = ExecutionPlan::build(builtin_definitions(), &config).unwrap();

    let style = plan.stage(StageName::Style).unwrap();
    assert!(style.required());
    assert_eq!(style.timeout, Duration::from_millis(300));
    assert_eq!(
        plan.stage(StageName::VirtualTryOn).unwrap().endpoint,
        "http://tryon:8008/tryon"
    );
}

#[test]
fn test_enabled_stage_without_url_fails_plan() {
    let file = write_config(
        r#"
[services]
matching = "http://matching:8006"

[pipeline]
enabled_stages = ["feature", "match"]
"#,
    );
    let config = OrchestratorConfig::load_from_file(file.path()).unwrap();

    let result = ExecutionPlan::build(builtin_definitions(), &config);

    assert!(matches!(
        result,
        Err(ConfigError::MissingServiceUrl { ref stage, ref service })
            if stage == "feature" && service == "feature"
    ));
}

#[test]
fn test_enabling_dependent_without_dependency_fails_plan() {
    let file = write_config(
        r#"
[services]
matching = "http://matching:8006"

[pipeline]
enabled_stages = ["match"]
"#,
    );
    let config = OrchestratorConfig::load_from_file(file.path()).unwrap();

    let result = ExecutionPlan::build(builtin_definitions(), &config);

    assert!(matches!(result, Err(ConfigError::UnknownDependency { .. })));
}

#[test]
fn test_missing_file_is_read_error() {
    let result = OrchestratorConfig::load_from_file(std::path::Path::new(
        "/nonexistent/eep.toml",
    ));

    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let file = write_config("[services\ndetection = ");

    let result = OrchestratorConfig::load_from_file(file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_wrong_type_is_parse_error() {
    let file = write_config("[timeouts]\ndefault_timeout_ms = \"fast\"\n");

    let result = OrchestratorConfig::load_from_file(file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_unknown_service_key_rejected() {
    let file = write_config("[services]\nhairstyle = \"http://hair:9000\"\n");

    let result = OrchestratorConfig::load_from_file(file.path());

    assert!(matches!(result, Err(ConfigError::UnknownService(ref s)) if s == "hairstyle"));
}

#[test]
fn test_non_http_service_url_rejected() {
    let file = write_config("[services]\nstyle = \"ftp://style:21\"\n");

    let result = OrchestratorConfig::load_from_file(file.path());

    assert!(matches!(result, Err(ConfigError::InvalidServiceUrl { .. })));
}

#[test]
fn test_zero_stage_timeout_rejected() {
    let file = write_config(
        "[services]\nstyle = \"http://style:8002\"\n\n[stages.style]\ntimeout_ms = 0\n",
    );

    let result = OrchestratorConfig::load_from_file(file.path());

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_error_messages_name_the_problem() {
    let error = ConfigError::MissingServiceUrl {
        stage: "style".to_string(),
        service: "style".to_string(),
    };
    assert_eq!(
        error.to_string(),
        "Stage 'style' requires a URL for service 'style'"
    );

    let error = ConfigError::CycleDetected(vec!["a".to_string(), "b".to_string()]);
    assert!(error.to_string().contains("a, b"));
}
