//! Animation payload (Lottie/Bodymovin JSON) as seen by the orchestration core.
//!
//! Only the top-level fields the core needs are typed; everything else is kept
//! verbatim so the payload round-trips to the engine untouched.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Parsed animation description handed to the rendering engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationPayload {
    /// Exporter version string
    #[serde(default)]
    pub v: String,
    /// Frame rate
    pub fr: f64,
    /// In point (first frame)
    #[serde(default)]
    pub ip: f64,
    /// Out point (frame after last)
    pub op: f64,
    pub w: u32,
    pub h: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nm: Option<String>,
    #[serde(default)]
    pub layers: Vec<Value>,
    #[serde(default)]
    pub assets: Vec<Value>,
    /// Remaining top-level fields (markers, fonts, chars, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload validation failure
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadError {
    InvalidFrameRate(f64),
    InvalidFrameRange { ip: f64, op: f64 },
    InvalidDimensions { w: u32, h: u32 },
    NoLayers,
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadError::InvalidFrameRate(fr) => write!(f, "Invalid frame rate: {}", fr),
            PayloadError::InvalidFrameRange { ip, op } => {
                write!(f, "Invalid frame range: ip={} op={}", ip, op)
            }
            PayloadError::InvalidDimensions { w, h } => write!(f, "Invalid dimensions: {}x{}", w, h),
            PayloadError::NoLayers => write!(f, "Payload has no layers"),
        }
    }
}

impl std::error::Error for PayloadError {}

impl AnimationPayload {
    /// Parse from JSON text (no validation)
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Check the external-contract fields the core relies on.
    pub fn validate(&self) -> Result<(), PayloadError> {
        if !(self.fr.is_finite() && self.fr > 0.0) {
            return Err(PayloadError::InvalidFrameRate(self.fr));
        }
        if !(self.op > self.ip) {
            return Err(PayloadError::InvalidFrameRange { ip: self.ip, op: self.op });
        }
        if self.w == 0 || self.h == 0 {
            return Err(PayloadError::InvalidDimensions { w: self.w, h: self.h });
        }
        if self.layers.is_empty() {
            return Err(PayloadError::NoLayers);
        }
        Ok(())
    }

    /// Number of frames between in and out point
    pub fn total_frames(&self) -> f64 {
        (self.op - self.ip).max(0.0)
    }

    /// Playback duration at 1x speed
    pub fn duration_ms(&self) -> f64 {
        if self.fr <= 0.0 {
            0.0
        } else {
            self.total_frames() / self.fr * 1000.0
        }
    }

    /// Display name, falls back to "untitled"
    pub fn name(&self) -> &str {
        self.nm.as_deref().unwrap_or("untitled")
    }

    /// Minimal valid payload (used by headless hosts and tests)
    pub fn synthetic(name: &str, fr: f64, frames: f64, w: u32, h: u32) -> Self {
        Self {
            v: "5.7.4".to_string(),
            fr,
            ip: 0.0,
            op: frames,
            w,
            h,
            nm: Some(name.to_string()),
            layers: vec![serde_json::json!({ "ty": 4, "nm": "shape", "ip": 0, "op": frames })],
            assets: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// Where an instance gets its payload from
#[derive(Debug, Clone)]
pub enum PayloadSource {
    /// Fetched through the loader, cached under this key
    Path(String),
    /// Already parsed, supplied by the caller
    Inline(Arc<AnimationPayload>),
}

impl PayloadSource {
    /// Cache key (only path sources are cached)
    pub fn cache_key(&self) -> Option<&str> {
        match self {
            PayloadSource::Path(p) => Some(p.as_str()),
            PayloadSource::Inline(_) => None,
        }
    }
}

impl From<AnimationPayload> for PayloadSource {
    fn from(payload: AnimationPayload) -> Self {
        PayloadSource::Inline(Arc::new(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "v": "5.7.4", "fr": 30, "ip": 0, "op": 90, "w": 512, "h": 512,
        "nm": "spinner", "layers": [{"ty": 4}], "assets": [], "markers": []
    }"#;

    #[test]
    fn test_parse_and_derive_timing() {
        let payload = AnimationPayload::from_json(MINIMAL).unwrap();
        assert!(payload.validate().is_ok());
        assert_eq!(payload.total_frames(), 90.0);
        assert_eq!(payload.duration_ms(), 3000.0);
        assert_eq!(payload.name(), "spinner");
        // Unknown fields are preserved
        assert!(payload.extra.contains_key("markers"));
    }

    #[test]
    fn test_validation_errors() {
        let mut payload = AnimationPayload::synthetic("x", 30.0, 10.0, 100, 100);
        payload.fr = 0.0;
        assert_eq!(payload.validate(), Err(PayloadError::InvalidFrameRate(0.0)));

        let mut payload = AnimationPayload::synthetic("x", 30.0, 10.0, 100, 100);
        payload.op = payload.ip;
        assert!(matches!(payload.validate(), Err(PayloadError::InvalidFrameRange { .. })));

        let mut payload = AnimationPayload::synthetic("x", 30.0, 10.0, 0, 100);
        assert!(matches!(payload.validate(), Err(PayloadError::InvalidDimensions { .. })));
        payload.w = 100;
        payload.layers.clear();
        assert_eq!(payload.validate(), Err(PayloadError::NoLayers));
    }

    #[test]
    fn test_missing_required_field_fails_parse() {
        assert!(AnimationPayload::from_json(r#"{"fr": 30, "w": 1, "h": 1}"#).is_err());
    }
}
