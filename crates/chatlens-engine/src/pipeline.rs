use std::path::Path;

use chatlens_contracts::anchors::AnchorStore;
use chatlens_contracts::chat::{
    build_role_messages, extract_inbound, parse_chat_payload, parse_classified_payload,
    CanonicalMessage, ChatPayload, RoleMessage,
};
use chatlens_contracts::events::CycleEvent;
use image::DynamicImage;
use serde::Serialize;
use tracing::debug;

use crate::preprocess::{prepare_chat_message_list, CropSource, PreparedCrop, PreprocessError};
use crate::side_inference::{classify_message_sides, SideInferenceConfig};

/// One screenshot's worth of perception.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Perception {
    /// Vision payload after side correction, as handed to the parser.
    pub corrected_raw: String,
    pub payload: ChatPayload,
    pub role_messages: Vec<RoleMessage>,
}

impl Perception {
    pub fn inbound(&self) -> Vec<CanonicalMessage> {
        extract_inbound(&self.payload)
    }

    /// Log entry for this cycle; `fresh` is what the conversation state let through.
    pub fn cycle_event(&self, screenshot: &Path, crop: &CropSource, fresh: usize) -> CycleEvent {
        let profile = match crop {
            CropSource::Profile { key } => Some(key.clone()),
            CropSource::Fallback => None,
        };
        CycleEvent::ChatPerceived {
            screenshot: screenshot.display().to_string(),
            profile,
            chat_region_detected: self.payload.chat_region_detected,
            messages: self.payload.messages.len(),
            inbound: self.inbound().len(),
            fresh,
        }
    }
}

/// Screenshot-to-conversation pipeline around an external vision model:
/// [`prepare`](Self::prepare) produces the crop to send, and
/// [`perceive`](Self::perceive) turns the model's answer into a payload.
#[derive(Debug, Clone, Default)]
pub struct ChatPerception {
    anchors: AnchorStore,
    config: SideInferenceConfig,
}

impl ChatPerception {
    pub fn new(anchors: AnchorStore, config: SideInferenceConfig) -> Self {
        Self { anchors, config }
    }

    pub fn anchors(&self) -> &AnchorStore {
        &self.anchors
    }

    pub fn config(&self) -> &SideInferenceConfig {
        &self.config
    }

    pub fn prepare(&self, screenshot: &DynamicImage) -> Result<PreparedCrop, PreprocessError> {
        prepare_chat_message_list(screenshot, &self.anchors)
    }

    /// Sides settled by the classifier are final. Input the classifier cannot
    /// read as strict JSON goes to the parser as-is, geometry pre-pass included.
    pub fn perceive(&self, raw_payload: &str, crop: &PreparedCrop) -> Perception {
        let classified =
            classify_message_sides(raw_payload, &crop.image, crop.hints.as_ref(), &self.config);
        let (corrected_raw, payload) = match classified {
            Some(corrected) => {
                let payload = parse_classified_payload(&corrected);
                (corrected, payload)
            }
            None => (raw_payload.to_string(), parse_chat_payload(raw_payload)),
        };
        let role_messages = build_role_messages(&payload);
        debug!(
            detected = payload.chat_region_detected,
            messages = payload.messages.len(),
            "perceived chat payload"
        );
        Perception {
            corrected_raw,
            payload,
            role_messages,
        }
    }
}
