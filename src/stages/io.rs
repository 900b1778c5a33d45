//! Typed request and response bodies for each stage
//!
//! Every stage declares what it sends and what it expects back. Responses that
//! do not fit the declared shape are decode failures; unknown extra fields are
//! kept and passed through to the client.

use super::StageName;
use crate::envelope::RequestEnvelope;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Number of catalogue matches requested from the matching service
pub const DEFAULT_MATCH_TOP_K: usize = 5;

/// `[x_min, y_min, x_max, y_max]` in pixels
pub type BoundingBox = [f64; 4];

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRequest {
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchRequest {
    pub features: Vec<f64>,
    pub top_k: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecommendationRequest {
    pub style: String,
    /// Garment labels found by detection, empty when detection did not run
    pub items: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TryOnRequest {
    pub person_image: String,
    pub garment_image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_bbox: Option<BoundingBox>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextToImageRequest {
    pub prompt: String,
}

/// Request body sent to a stage's service
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StageInput {
    Image(ImageRequest),
    Match(MatchRequest),
    Recommendation(RecommendationRequest),
    TryOn(TryOnRequest),
    TextToImage(TextToImageRequest),
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionOutput {
    pub detections: Vec<Detection>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleOutput {
    pub style: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureOutput {
    pub features: Vec<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EleganceOutput {
    pub score: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonBox {
    pub bbox: BoundingBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonOutput {
    pub persons: Vec<PersonBox>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchItem {
    pub id: String,
    pub score: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOutput {
    pub matches: Vec<MatchItem>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationOutput {
    pub recommendations: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Generated image, base64 encoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageOutput {
    pub image: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Decoded response of a stage's service
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StageOutput {
    Detection(DetectionOutput),
    Style(StyleOutput),
    Feature(FeatureOutput),
    Elegance(EleganceOutput),
    Person(PersonOutput),
    Match(MatchOutput),
    Recommendation(RecommendationOutput),
    VirtualTryOn(ImageOutput),
    TextToImage(ImageOutput),
}

/// Payloads of the stages that succeeded so far in one request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutputs(BTreeMap<StageName, StageOutput>);

impl StageOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stage: StageName, output: StageOutput) {
        self.0.insert(stage, output);
    }

    pub fn contains(&self, stage: StageName) -> bool {
        self.0.contains_key(&stage)
    }

    pub fn get(&self, stage: StageName) -> Option<&StageOutput> {
        self.0.get(&stage)
    }

    pub fn detection(&self) -> Option<&DetectionOutput> {
        match self.0.get(&StageName::Detection) {
            Some(StageOutput::Detection(output)) => Some(output),
            _ => None,
        }
    }

    pub fn style(&self) -> Option<&StyleOutput> {
        match self.0.get(&StageName::Style) {
            Some(StageOutput::Style(output)) => Some(output),
            _ => None,
        }
    }

    pub fn feature(&self) -> Option<&FeatureOutput> {
        match self.0.get(&StageName::Feature) {
            Some(StageOutput::Feature(output)) => Some(output),
            _ => None,
        }
    }

    pub fn person(&self) -> Option<&PersonOutput> {
        match self.0.get(&StageName::Person) {
            Some(StageOutput::Person(output)) => Some(output),
            _ => None,
        }
    }
}

impl StageName {
    /// Build this stage's request body from the envelope and prior outputs.
    ///
    /// Pure: no I/O and no shared state, so it can be replayed freely. An `Err`
    /// carries the reason the request cannot be built; the stage is then skipped.
    pub fn build_input(
        &self,
        envelope: &RequestEnvelope,
        outputs: &StageOutputs,
    ) -> Result<StageInput, String> {
        match self {
            StageName::Detection
            | StageName::Style
            | StageName::Feature
            | StageName::Elegance
            | StageName::Person => Ok(StageInput::Image(ImageRequest {
                image: envelope.image().to_string(),
            })),
            StageName::Match => {
                let feature = outputs
                    .feature()
                    .ok_or_else(|| "feature vector unavailable".to_string())?;
                Ok(StageInput::Match(MatchRequest {
                    features: feature.features.clone(),
                    top_k: DEFAULT_MATCH_TOP_K,
                }))
            }
            StageName::Recommendation => {
                let style = outputs
                    .style()
                    .ok_or_else(|| "style label unavailable".to_string())?;
                let items = outputs
                    .detection()
                    .map(|d| d.detections.iter().map(|i| i.label.clone()).collect())
                    .unwrap_or_default();
                Ok(StageInput::Recommendation(RecommendationRequest {
                    style: style.style.clone(),
                    items,
                }))
            }
            StageName::VirtualTryOn => {
                let garment = envelope
                    .garment_images()
                    .first()
                    .ok_or_else(|| "no garment image supplied".to_string())?;
                let person_bbox = outputs
                    .person()
                    .and_then(|p| p.persons.first())
                    .map(|p| p.bbox);
                Ok(StageInput::TryOn(TryOnRequest {
                    person_image: envelope.image().to_string(),
                    garment_image: garment.clone(),
                    person_bbox,
                }))
            }
            StageName::TextToImage => {
                let style = outputs.style().map(|s| s.style.as_str());
                let prompt = match (envelope.prompt(), style) {
                    (Some(prompt), Some(style)) => format!("{prompt}, {style} style"),
                    (Some(prompt), None) => prompt.to_string(),
                    (None, Some(style)) => format!("a {style} style outfit"),
                    (None, None) => return Err("no prompt supplied and no style available".into()),
                };
                Ok(StageInput::TextToImage(TextToImageRequest { prompt }))
            }
        }
    }

    /// Decode this stage's response body into its declared shape
    pub fn decode_output(&self, body: Value) -> Result<StageOutput, serde_json::Error> {
        Ok(match self {
            StageName::Detection => StageOutput::Detection(serde_json::from_value(body)?),
            StageName::Style => StageOutput::Style(serde_json::from_value(body)?),
            StageName::Feature => StageOutput::Feature(serde_json::from_value(body)?),
            StageName::Elegance => StageOutput::Elegance(serde_json::from_value(body)?),
            StageName::Person => StageOutput::Person(serde_json::from_value(body)?),
            StageName::Match => StageOutput::Match(serde_json::from_value(body)?),
            StageName::Recommendation => {
                StageOutput::Recommendation(serde_json::from_value(body)?)
            }
            StageName::VirtualTryOn => StageOutput::VirtualTryOn(serde_json::from_value(body)?),
            StageName::TextToImage => StageOutput::TextToImage(serde_json::from_value(body)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::StageSelection;
    use serde_json::json;

    fn envelope() -> RequestEnvelope {
        RequestEnvelope::new("aW1hZ2U=", vec![], StageSelection::All, None)
    }

    #[test]
    fn test_image_stages_send_the_primary_image() {
        let outputs = StageOutputs::new();
        for stage in [StageName::Detection, StageName::Style, StageName::Person] {
            let input = stage.build_input(&envelope(), &outputs).unwrap();
            assert_eq!(
                serde_json::to_value(&input).unwrap(),
                json!({"image": "aW1hZ2U="})
            );
        }
    }

    #[test]
    fn test_feature_vector_keeps_full_precision() {
        let mut outputs = StageOutputs::new();
        let feature = StageName::Feature
            .decode_output(json!({"features": [0.123456789012, -1.0e300, 3.0e-12]}))
            .unwrap();
        outputs.insert(StageName::Feature, feature.clone());

        let input = StageName::Match.build_input(&envelope(), &outputs).unwrap();
        assert_eq!(
            serde_json::to_value(&input).unwrap()["features"],
            json!([0.123456789012, -1.0e300, 3.0e-12])
        );
        assert_eq!(
            serde_json::to_value(&feature).unwrap(),
            json!({"features": [0.123456789012, -1.0e300, 3.0e-12]})
        );
    }

    #[test]
    fn test_scores_pass_through_unchanged() {
        let output = StageName::Elegance
            .decode_output(json!({"score": 0.7234567891}))
            .unwrap();
        assert_eq!(serde_json::to_value(&output).unwrap(), json!({"score": 0.7234567891}));
    }

    #[test]
    fn test_match_requires_feature_output() {
        let mut outputs = StageOutputs::new();
        assert!(StageName::Match.build_input(&envelope(), &outputs).is_err());

        outputs.insert(
            StageName::Feature,
            StageName::Feature
                .decode_output(json!({"features": [0.5, 0.25]}))
                .unwrap(),
        );
        let input = StageName::Match.build_input(&envelope(), &outputs).unwrap();
        assert_eq!(
            serde_json::to_value(&input).unwrap(),
            json!({"features": [0.5, 0.25], "top_k": DEFAULT_MATCH_TOP_K})
        );
    }

    #[test]
    fn test_recommendation_uses_detection_labels_when_present() {
        let mut outputs = StageOutputs::new();
        outputs.insert(
            StageName::Style,
            StageName::Style.decode_output(json!({"style": "casual"})).unwrap(),
        );

        let without = StageName::Recommendation
            .build_input(&envelope(), &outputs)
            .unwrap();
        assert_eq!(
            serde_json::to_value(&without).unwrap(),
            json!({"style": "casual", "items": []})
        );

        outputs.insert(
            StageName::Detection,
            StageName::Detection
                .decode_output(json!({"detections": [{"label": "jacket", "confidence": 0.9}]}))
                .unwrap(),
        );
        let with = StageName::Recommendation
            .build_input(&envelope(), &outputs)
            .unwrap();
        assert_eq!(
            serde_json::to_value(&with).unwrap(),
            json!({"style": "casual", "items": ["jacket"]})
        );
    }

    #[test]
    fn test_virtual_tryon_needs_a_garment_image() {
        let outputs = StageOutputs::new();
        let err = StageName::VirtualTryOn
            .build_input(&envelope(), &outputs)
            .unwrap_err();
        assert_eq!(err, "no garment image supplied");

        let with_garment = RequestEnvelope::new(
            "cGVyc29u",
            vec!["Z2FybWVudA==".to_string()],
            StageSelection::All,
            None,
        );
        let input = StageName::VirtualTryOn
            .build_input(&with_garment, &outputs)
            .unwrap();
        assert_eq!(
            serde_json::to_value(&input).unwrap(),
            json!({"person_image": "cGVyc29u", "garment_image": "Z2FybWVudA=="})
        );
    }

    #[test]
    fn test_text_to_image_prompt_combinations() {
        let mut outputs = StageOutputs::new();
        assert!(StageName::TextToImage
            .build_input(&envelope(), &outputs)
            .is_err());

        outputs.insert(
            StageName::Style,
            StageName::Style.decode_output(json!({"style": "boho"})).unwrap(),
        );
        let derived = StageName::TextToImage
            .build_input(&envelope(), &outputs)
            .unwrap();
        assert_eq!(
            serde_json::to_value(&derived).unwrap(),
            json!({"prompt": "a boho style outfit"})
        );

        let prompted = RequestEnvelope::new(
            "aW1hZ2U=",
            vec![],
            StageSelection::All,
            Some("summer dress".to_string()),
        );
        let combined = StageName::TextToImage
            .build_input(&prompted, &outputs)
            .unwrap();
        assert_eq!(
            serde_json::to_value(&combined).unwrap(),
            json!({"prompt": "summer dress, boho style"})
        );
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        assert!(StageName::Elegance
            .decode_output(json!({"score": "high"}))
            .is_err());
        assert!(StageName::Detection.decode_output(json!({})).is_err());
    }

    #[test]
    fn test_decode_keeps_extra_fields() {
        let output = StageName::Elegance
            .decode_output(json!({"score": 0.75, "model": "v3"}))
            .unwrap();
        assert_eq!(
            serde_json::to_value(&output).unwrap(),
            json!({"score": 0.75, "model": "v3"})
        );
    }
}
