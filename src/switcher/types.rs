use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Reserved id of the synthetic silence + test-card source.
pub const FALLBACK_ID: &str = "fallback";

/// Separator between the id and key parts of a pin. Raw source ids must not
/// contain it, which keeps pin encoding reversible.
const KEY_DELIMITER: &str = "__";

/// Identity of a logical source, optionally scoped by a sub-key (e.g. one
/// program of a multiplexed input). Key absence and an empty key are distinct.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key: None,
        }
    }

    pub fn with_key(id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key: Some(key.into()),
        }
    }

    pub fn fallback() -> Self {
        Self::new(FALLBACK_ID)
    }

    #[allow(dead_code)]
    pub fn is_fallback(&self) -> bool {
        self.id == FALLBACK_ID && self.key.is_none()
    }

    /// Pipeline-facing handle: `id` alone, or `id__key`.
    pub fn pin(&self) -> String {
        match &self.key {
            Some(key) => format!("{}{}{}", self.id, KEY_DELIMITER, key),
            None => self.id.clone(),
        }
    }

    /// Inverse of [`SourceId::pin`]. Splits on the first delimiter only.
    pub fn from_pin(pin: &str) -> Self {
        match pin.split_once(KEY_DELIMITER) {
            Some((id, key)) => Self::with_key(id, key),
            None => Self::new(pin),
        }
    }
}

impl Display for SourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.pin())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Display for Resolution {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Placement rectangle in pixel space (source or output, depending on use).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// One picture-in-picture layer. The overlay's source need not equal the
/// background source. Missing rectangles mean full-frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overlay {
    pub source: SourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_rect: Option<Rect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_rect: Option<Rect>,
}

/// A source/overlay combination that can be on air. Two selections are the
/// same selection iff their pins match.
#[derive(Clone, Debug)]
pub struct Selection {
    pub pin: String,
    pub primary: SourceId,
    pub overlays: Vec<Overlay>,
}

impl Selection {
    /// A single source, no overlays.
    pub fn solo(source: SourceId) -> Self {
        Self {
            pin: source.pin(),
            primary: source,
            overlays: Vec::new(),
        }
    }

    pub fn fallback() -> Self {
        Self::solo(SourceId::fallback())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Video,
}

/// What the pipeline reports a pin to be carrying.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamDescriptor {
    Audio,
    Video {
        resolution: Resolution,
        frame_rate: Option<f64>,
    },
}

impl StreamDescriptor {
    pub fn is_video(&self) -> bool {
        matches!(self, StreamDescriptor::Video { .. })
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, StreamDescriptor::Audio)
    }
}

/// The pipeline's current view of upstream composition: pin -> streams.
pub type ContextSnapshot = HashMap<String, Vec<StreamDescriptor>>;

/// A source currently carrying a complete audio + video pair.
#[derive(Clone, Debug)]
pub struct AvailableSource {
    pub source: SourceId,
    pub resolution: Resolution,
    pub frame_rate: Option<f64>,
    pub went_live_at: Instant,
}
