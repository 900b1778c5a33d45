//! Execution plan: the validated, layered stage graph
//!
//! Built once at startup from stage definitions and configuration, then shared
//! read-only across every request. Layer `n` holds the stages whose longest
//! dependency chain has length `n`, so all stages in a layer can run together.

use super::{StageDefinition, StageName};
use crate::config::{ConfigError, OrchestratorConfig};
use crate::envelope::StageSelection;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info};

/// A stage resolved against configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStage {
    pub definition: StageDefinition,
    /// Full URL of the stage's POST endpoint
    pub endpoint: String,
    pub timeout: Duration,
    pub layer: usize,
}

impl PlannedStage {
    pub fn name(&self) -> StageName {
        self.definition.name
    }

    pub fn required(&self) -> bool {
        self.definition.required
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    stages: BTreeMap<StageName, PlannedStage>,
    layers: Vec<Vec<StageName>>,
}

impl ExecutionPlan {
    /// Validate definitions against configuration and layer them.
    ///
    /// Stages disabled in configuration are dropped first; a remaining stage that
    /// depends on a dropped or undefined stage is an error, as is any cycle.
    pub fn build(
        definitions: Vec<StageDefinition>,
        config: &OrchestratorConfig,
    ) -> Result<Self, ConfigError> {
        let mut resolved: BTreeMap<StageName, StageDefinition> = BTreeMap::new();

        for mut definition in definitions {
            if !config.is_stage_enabled(definition.name) {
                debug!(stage = %definition.name, "Stage disabled by configuration");
                continue;
            }
            if let Some(overrides) = config.stage_override(definition.name) {
                if let Some(required) = overrides.required {
                    definition.required = required;
                }
                if let Some(timeout_ms) = overrides.timeout_ms {
                    definition.timeout = Some(Duration::from_millis(timeout_ms));
                }
            }
            if resolved.contains_key(&definition.name) {
                return Err(ConfigError::DuplicateStage(definition.name.to_string()));
            }
            resolved.insert(definition.name, definition);
        }

        for definition in resolved.values() {
            for dependency in &definition.dependencies {
                if !resolved.contains_key(&dependency.stage) {
                    return Err(ConfigError::UnknownDependency {
                        stage: definition.name.to_string(),
                        dependency: dependency.stage.to_string(),
                    });
                }
            }
        }

        let layer_of = layer_stages(&resolved)?;

        let mut stages = BTreeMap::new();
        let mut layers: Vec<Vec<StageName>> = Vec::new();
        for (name, definition) in resolved {
            let base_url = config.service_url(definition.service).ok_or_else(|| {
                ConfigError::MissingServiceUrl {
                    stage: name.to_string(),
                    service: definition.service.to_string(),
                }
            })?;
            let endpoint = join_endpoint(base_url, &definition.path);
            let timeout = definition.timeout.unwrap_or_else(|| config.default_timeout());
            let layer = layer_of[&name];

            if layers.len() <= layer {
                layers.resize_with(layer + 1, Vec::new);
            }
            layers[layer].push(name);

            stages.insert(
                name,
                PlannedStage {
                    definition,
                    endpoint,
                    timeout,
                    layer,
                },
            );
        }

        info!(
            stages = stages.len(),
            layers = layers.len(),
            "Execution plan built"
        );

        Ok(Self { stages, layers })
    }

    pub fn stage(&self, name: StageName) -> Option<&PlannedStage> {
        self.stages.get(&name)
    }

    pub fn contains(&self, name: StageName) -> bool {
        self.stages.contains_key(&name)
    }

    pub fn stages(&self) -> impl Iterator<Item = &PlannedStage> {
        self.stages.values()
    }

    pub fn layers(&self) -> &[Vec<StageName>] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Requested stages plus everything they transitively depend on.
    /// Names not in the plan are ignored.
    pub fn closure(&self, selection: &StageSelection) -> BTreeSet<StageName> {
        let requested: Vec<StageName> = match selection {
            StageSelection::All => return self.stages.keys().copied().collect(),
            StageSelection::Only(stages) => stages.iter().copied().collect(),
        };

        let mut included = BTreeSet::new();
        let mut pending: Vec<StageName> = requested
            .into_iter()
            .filter(|stage| self.contains(*stage))
            .collect();

        while let Some(stage) = pending.pop() {
            if !included.insert(stage) {
                continue;
            }
            if let Some(planned) = self.stages.get(&stage) {
                pending.extend(planned.definition.dependencies.iter().map(|d| d.stage));
            }
        }

        included
    }

    /// Layers of the sub-graph induced by a selection.
    ///
    /// The closure is dependency-complete, so each stage keeps its layer from the
    /// full plan and the induced layering is still a valid topological order.
    pub fn layers_for(&self, selection: &StageSelection) -> Vec<Vec<StageName>> {
        let included = self.closure(selection);
        self.layers
            .iter()
            .map(|layer| {
                layer
                    .iter()
                    .copied()
                    .filter(|stage| included.contains(stage))
                    .collect::<Vec<_>>()
            })
            .filter(|layer| !layer.is_empty())
            .collect()
    }
}

/// Kahn's algorithm, processed in rounds so each round is one layer
fn layer_stages(
    definitions: &BTreeMap<StageName, StageDefinition>,
) -> Result<BTreeMap<StageName, usize>, ConfigError> {
    let mut remaining: BTreeMap<StageName, BTreeSet<StageName>> = definitions
        .iter()
        .map(|(name, definition)| {
            (
                *name,
                definition.dependencies.iter().map(|d| d.stage).collect(),
            )
        })
        .collect();

    let mut layer_of = BTreeMap::new();
    let mut layer = 0;

    while !remaining.is_empty() {
        let ready: Vec<StageName> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| *name)
            .collect();

        if ready.is_empty() {
            let cycle = remaining.keys().map(StageName::to_string).collect();
            return Err(ConfigError::CycleDetected(cycle));
        }

        for stage in &ready {
            remaining.remove(stage);
            layer_of.insert(*stage, layer);
        }
        for deps in remaining.values_mut() {
            for stage in &ready {
                deps.remove(stage);
            }
        }
        layer += 1;
    }

    Ok(layer_of)
}

fn join_endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
