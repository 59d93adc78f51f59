use crate::core::{MppError, PixelFormat, Rect, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Rotation applied by the graphics engine before display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    #[serde(rename = "0")]
    Deg0,
    #[serde(rename = "90")]
    Deg90,
    #[serde(rename = "180")]
    Deg180,
    #[serde(rename = "270")]
    Deg270,
}

impl Rotation {
    pub fn degrees(&self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    pub fn swaps_axes(&self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

/// Pool sizing handed to decoders at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub packet_count: usize,
    pub packet_buffer_size: usize,
    pub frame_count: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            packet_count: 8,
            packet_buffer_size: 16 * 1024,
            frame_count: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub layer_id: u32,
    pub dev_id: u32,
    pub rotation: Rotation,
    pub display_rect: Option<Rect>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            layer_id: 1,
            dev_id: 0,
            rotation: Rotation::Deg0,
            display_rect: None,
        }
    }
}

/// Geometry of the frames a pass-through video decoder emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoOutputConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub frame_slots: usize,
}

impl Default for VideoOutputConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            format: PixelFormat::Yuv420p,
            frame_slots: 4,
        }
    }
}

/// Top-level pipeline description. Components take the pieces by value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub uri: String,
    pub decoder: DecoderConfig,
    pub render: RenderConfig,
    pub video: VideoOutputConfig,
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.decoder.packet_count == 0 || self.decoder.frame_count == 0 {
            return Err(MppError::Config("pool counts must be non-zero".into()));
        }
        if self.decoder.packet_buffer_size == 0 {
            return Err(MppError::Config("packet_buffer_size must be non-zero".into()));
        }
        if self.video.frame_slots < 2 {
            return Err(MppError::Config("frame_slots must be at least 2".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = PipelineConfig::from_json_str(
            r#"{ "uri": "/tmp/a.264", "render": { "rotation": "90" } }"#,
        )
        .unwrap();
        assert_eq!(config.uri, "/tmp/a.264");
        assert_eq!(config.render.rotation, Rotation::Deg90);
        assert_eq!(config.render.layer_id, 1);
        assert_eq!(config.decoder, DecoderConfig::default());
        assert_eq!(config.video.format, PixelFormat::Yuv420p);
    }

    #[test]
    fn test_validate_rejects_zero_pools() {
        let err = PipelineConfig::from_json_str(r#"{ "decoder": { "packet_count": 0 } }"#)
            .unwrap_err();
        assert!(matches!(err, MppError::Config(_)));
    }

    #[test]
    fn test_bad_json() {
        let err = PipelineConfig::from_json_str("{ nope").unwrap_err();
        assert!(matches!(err, MppError::Json(_)));
    }
}
