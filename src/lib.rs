//! Fashion EEP - external endpoint orchestrator
//!
//! One HTTP request in, a fan-out of calls to the internal inference services
//! (detection, style, features, elegance, person, matching, recommendation,
//! virtual try-on, text-to-image), one aggregated JSON response out.
//!
//! # Overview
//!
//! - [`stages`]: the closed set of stages, their request/response shapes and the
//!   validated, layered [`ExecutionPlan`] built once at startup
//! - [`pipeline`]: per-request execution of the plan's sub-graph
//! - [`aggregator`]: result envelope to HTTP status and response body
//! - [`api`]: warp routes, validation and serving
//! - [`client`]: the outbound HTTP client behind the [`ServiceClient`] trait
//!
//! # Quick Start
//!
//! ```rust
//! use fashion_eep::config::OrchestratorConfig;
//! use fashion_eep::envelope::StageSelection;
//! use fashion_eep::stages::{builtin_definitions, ExecutionPlan, StageName};
//!
//! let mut config = OrchestratorConfig::default();
//! config.pipeline.enabled_stages = Some(vec!["feature".into(), "match".into()]);
//! config.services.insert("feature".into(), "http://feature:8003".into());
//! config.services.insert("matching".into(), "http://matching:8006".into());
//!
//! let plan = ExecutionPlan::build(builtin_definitions(), &config).unwrap();
//! let layers = plan.layers_for(&StageSelection::only([StageName::Match]));
//! assert_eq!(layers, vec![vec![StageName::Feature], vec![StageName::Match]]);
//! ```

pub mod aggregator;
pub mod api;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod health;
pub mod observability;
pub mod pipeline;
pub mod stages;
pub mod testing;

pub use client::{HttpServiceClient, ServiceClient, ServiceError};
pub use config::{ConfigError, OrchestratorConfig};
pub use envelope::{RequestEnvelope, StageSelection};
pub use error::{EepError, EepResult, StageErrorKind, ValidationError};
pub use pipeline::{OverallStatus, PipelineExecutor, ResultEnvelope, StageOutcome};
pub use stages::{ExecutionPlan, StageName};
