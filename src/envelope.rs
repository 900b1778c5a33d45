//! Request envelope: the validated, immutable input of one analysis call

use crate::stages::StageName;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Which stages a request asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageSelection {
    /// Every stage in the execution plan
    All,
    /// An explicit, deduplicated subset
    Only(BTreeSet<StageName>),
}

impl StageSelection {
    pub fn only<I: IntoIterator<Item = StageName>>(stages: I) -> Self {
        StageSelection::Only(stages.into_iter().collect())
    }
}

/// Client request after validation. Images stay transport-encoded (base64)
/// because that is what the inference services accept.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    request_id: Uuid,
    image: String,
    garment_images: Vec<String>,
    selection: StageSelection,
    prompt: Option<String>,
}

impl RequestEnvelope {
    pub fn new(
        image: impl Into<String>,
        garment_images: Vec<String>,
        selection: StageSelection,
        prompt: Option<String>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            image: image.into(),
            garment_images,
            selection,
            prompt,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn garment_images(&self) -> &[String] {
        &self.garment_images
    }

    pub fn selection(&self) -> &StageSelection {
        &self.selection
    }

    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }
}
