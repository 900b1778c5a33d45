//! Inbound request body and its validation into a [`RequestEnvelope`]

use crate::config::LimitsSection;
use crate::envelope::{RequestEnvelope, StageSelection};
use crate::error::ValidationError;
use crate::stages::{ExecutionPlan, StageName};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::str::FromStr;

/// Body of `POST /api/v1/analyze` and the single-stage endpoints
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub garment_images: Vec<String>,
    /// Requested stages; absent means every enabled stage
    #[serde(default)]
    pub stages: Option<Vec<String>>,
    #[serde(default)]
    pub prompt: Option<String>,
}

impl AnalyzeRequest {
    pub fn from_slice(body: &[u8]) -> Result<Self, ValidationError> {
        serde_json::from_slice(body)
            .map_err(|e| ValidationError::new("body", format!("invalid JSON: {e}")))
    }

    /// Validate and build the envelope.
    ///
    /// `only` comes from a single-stage endpoint and takes precedence over the
    /// body's `stages` list.
    pub fn into_envelope(
        self,
        only: Option<StageName>,
        limits: &LimitsSection,
        plan: &ExecutionPlan,
    ) -> Result<RequestEnvelope, ValidationError> {
        let image = match self.image.as_deref() {
            None => return Err(ValidationError::new("image", "is required")),
            Some(image) => normalize_image("image", image, limits.max_image_bytes)?,
        };

        if self.garment_images.len() > limits.max_garment_images {
            return Err(ValidationError::new(
                "garment_images",
                format!("at most {} images are accepted", limits.max_garment_images),
            ));
        }
        let garment_images = self
            .garment_images
            .iter()
            .enumerate()
            .map(|(i, garment)| {
                normalize_image(&format!("garment_images[{i}]"), garment, limits.max_image_bytes)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let selection = match (only, self.stages) {
            (Some(stage), _) => {
                ensure_enabled("stage", stage, plan)?;
                StageSelection::only([stage])
            }
            (None, None) => StageSelection::All,
            (None, Some(names)) => StageSelection::Only(parse_stages(&names, plan)?),
        };

        let prompt = self
            .prompt
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        Ok(RequestEnvelope::new(image, garment_images, selection, prompt))
    }
}

fn parse_stages(names: &[String], plan: &ExecutionPlan) -> Result<BTreeSet<StageName>, ValidationError> {
    names
        .iter()
        .map(|name| {
            let stage = StageName::from_str(name)
                .map_err(|_| ValidationError::new("stages", format!("unknown stage '{name}'")))?;
            ensure_enabled("stages", stage, plan)?;
            Ok(stage)
        })
        .collect()
}

fn ensure_enabled(field: &str, stage: StageName, plan: &ExecutionPlan) -> Result<(), ValidationError> {
    if plan.contains(stage) {
        Ok(())
    } else {
        Err(ValidationError::new(field, format!("stage '{stage}' is disabled")))
    }
}

/// Strip a `data:` URL prefix and check the payload is base64 within the size
/// limit. Returns the bare base64 text forwarded to the services.
pub fn normalize_image(field: &str, value: &str, max_bytes: usize) -> Result<String, ValidationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }

    let payload = if value.starts_with("data:") {
        match value.split_once(',') {
            Some((_, payload)) => payload.trim(),
            None => return Err(ValidationError::new(field, "malformed data URL")),
        }
    } else {
        value
    };
    if payload.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }

    // Reject obviously oversized payloads before allocating the decoded buffer
    let estimated = payload.len() / 4 * 3;
    if estimated > max_bytes.saturating_add(3) {
        return Err(too_large(field, max_bytes));
    }

    let decoded = STANDARD
        .decode(payload)
        .map_err(|e| ValidationError::new(field, format!("not valid base64: {e}")))?;
    if decoded.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    if decoded.len() > max_bytes {
        return Err(too_large(field, max_bytes));
    }

    Ok(payload.to_string())
}

fn too_large(field: &str, max_bytes: usize) -> ValidationError {
    ValidationError::new(field, format!("decoded image exceeds {max_bytes} bytes"))
}
