//! Stage definitions for the analysis pipeline
//!
//! The set of stages is closed: every stage the orchestrator knows about is a
//! [`StageName`] variant with an explicit request and response shape (see [`io`]).
//! A [`StageDefinition`] binds a stage to the inference service it targets, the
//! POST path on that service, its dependencies and its failure policy.
//!
//! | Stage | Service | Path | Depends on |
//! |---|---|---|---|
//! | detection | detection | `/detect` | - |
//! | style | style | `/classify` | - |
//! | feature | feature | `/extract` | - |
//! | elegance | elegance | `/score` | - |
//! | person | person | `/detect` | - |
//! | match | matching | `/match` | feature |
//! | recommendation | recommendation | `/recommend` | style, detection (optional) |
//! | virtual_tryon | virtual_tryon | `/tryon` | person (optional) |
//! | text_to_image | text_to_image | `/generate` | style (optional) |

pub mod io;
pub mod plan;

pub use io::{StageInput, StageOutput, StageOutputs};
pub use plan::{ExecutionPlan, PlannedStage};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Name of an analysis stage
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Detection,
    Style,
    Feature,
    Elegance,
    Person,
    Match,
    Recommendation,
    #[serde(rename = "virtual_tryon")]
    VirtualTryOn,
    TextToImage,
}

impl StageName {
    pub const ALL: [StageName; 9] = [
        StageName::Detection,
        StageName::Style,
        StageName::Feature,
        StageName::Elegance,
        StageName::Person,
        StageName::Match,
        StageName::Recommendation,
        StageName::VirtualTryOn,
        StageName::TextToImage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Detection => "detection",
            StageName::Style => "style",
            StageName::Feature => "feature",
            StageName::Elegance => "elegance",
            StageName::Person => "person",
            StageName::Match => "match",
            StageName::Recommendation => "recommendation",
            StageName::VirtualTryOn => "virtual_tryon",
            StageName::TextToImage => "text_to_image",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        StageName::ALL
            .into_iter()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

/// Identifier of an internal inference service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceId {
    Detection,
    Style,
    Feature,
    Elegance,
    Person,
    Matching,
    Recommendation,
    #[serde(rename = "virtual_tryon")]
    VirtualTryOn,
    TextToImage,
}

impl ServiceId {
    pub const ALL: [ServiceId; 9] = [
        ServiceId::Detection,
        ServiceId::Style,
        ServiceId::Feature,
        ServiceId::Elegance,
        ServiceId::Person,
        ServiceId::Matching,
        ServiceId::Recommendation,
        ServiceId::VirtualTryOn,
        ServiceId::TextToImage,
    ];

    /// Key under `[services]` in the config file
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceId::Detection => "detection",
            ServiceId::Style => "style",
            ServiceId::Feature => "feature",
            ServiceId::Elegance => "elegance",
            ServiceId::Person => "person",
            ServiceId::Matching => "matching",
            ServiceId::Recommendation => "recommendation",
            ServiceId::VirtualTryOn => "virtual_tryon",
            ServiceId::TextToImage => "text_to_image",
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ServiceId::ALL
            .into_iter()
            .find(|service| service.as_str() == normalized)
            .ok_or_else(|| format!("unknown service '{s}'"))
    }
}

/// How a stage uses one of its dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyMode {
    /// The dependency's payload is needed to build the request
    Consumes,
    /// Ordering only; the payload enriches the request when available
    Optional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub stage: StageName,
    pub mode: DependencyMode,
}

impl Dependency {
    pub fn consumes(stage: StageName) -> Self {
        Self {
            stage,
            mode: DependencyMode::Consumes,
        }
    }

    pub fn optional(stage: StageName) -> Self {
        Self {
            stage,
            mode: DependencyMode::Optional,
        }
    }
}

/// Declarative description of one analysis stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageDefinition {
    pub name: StageName,
    pub service: ServiceId,
    /// POST path on the target service
    pub path: String,
    pub dependencies: Vec<Dependency>,
    /// Failure of a required stage fails the whole request
    pub required: bool,
    /// Overrides the global timeout when set
    pub timeout: Option<Duration>,
}

impl StageDefinition {
    pub fn new(name: StageName, service: ServiceId, path: impl Into<String>) -> Self {
        Self {
            name,
            service,
            path: path.into(),
            dependencies: Vec::new(),
            required: false,
            timeout: None,
        }
    }

    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The built-in definition for a stage
    pub fn builtin(name: StageName) -> Self {
        match name {
            StageName::Detection => {
                Self::new(name, ServiceId::Detection, "/detect").required(true)
            }
            StageName::Style => Self::new(name, ServiceId::Style, "/classify"),
            StageName::Feature => Self::new(name, ServiceId::Feature, "/extract").required(true),
            StageName::Elegance => Self::new(name, ServiceId::Elegance, "/score"),
            StageName::Person => Self::new(name, ServiceId::Person, "/detect"),
            StageName::Match => Self::new(name, ServiceId::Matching, "/match")
                .depends_on(Dependency::consumes(StageName::Feature)),
            StageName::Recommendation => {
                Self::new(name, ServiceId::Recommendation, "/recommend")
                    .depends_on(Dependency::consumes(StageName::Style))
                    .depends_on(Dependency::optional(StageName::Detection))
            }
            StageName::VirtualTryOn => Self::new(name, ServiceId::VirtualTryOn, "/tryon")
                .depends_on(Dependency::optional(StageName::Person)),
            StageName::TextToImage => Self::new(name, ServiceId::TextToImage, "/generate")
                .depends_on(Dependency::optional(StageName::Style)),
        }
    }
}

/// The full built-in stage table
pub fn builtin_definitions() -> Vec<StageDefinition> {
    StageName::ALL
        .into_iter()
        .map(StageDefinition::builtin)
        .collect()
}
