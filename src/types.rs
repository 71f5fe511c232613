/// Core types for the display-class server
///
/// Handles exchanged with backends, surface descriptions that flow through
/// configure requests, and the server configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Identifier of the host-driver node a device was registered on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Identifier of a display context in the process-wide context list
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(pub u64);

/// Backend-owned display context handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeContext(pub u64);

/// Backend-owned buffer handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeBuffer(pub u64);

/// Pixel layouts a backend may scan out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Argb8888,
    Xrgb8888,
    Abgr8888,
    Rgb565,
    Nv12,
}

impl PixelFormat {
    /// Bytes per pixel of the first plane
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Argb8888 | PixelFormat::Xrgb8888 | PixelFormat::Abgr8888 => 4,
            PixelFormat::Rgb565 => 2,
            PixelFormat::Nv12 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Format and size of a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceAttributes {
    pub format: PixelFormat,
    pub dims: Dimensions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    #[default]
    None,
    Premultiplied,
    Coverage,
}

/// Per-plane placement of one buffer in a display configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SurfaceConfig {
    /// Source rectangle within the buffer
    pub crop: Rect,
    /// Destination rectangle on the panel
    pub display: Rect,
    pub alpha: u8,
    pub blend: BlendMode,
    /// Rotation in quarter turns
    pub transform: u8,
}

/// Parameters for allocating a device-backed buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCreateInfo {
    pub surface: SurfaceAttributes,
    pub bytes_per_pixel: u32,
}

/// Page layout reported by the backend for a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGeometry {
    pub log2_page_size: u32,
    pub page_count: u32,
    pub byte_stride: u32,
}

impl BufferGeometry {
    pub fn page_size(&self) -> u64 {
        1u64 << self.log2_page_size
    }

    pub fn size(&self) -> u64 {
        self.page_size() * self.page_count as u64
    }
}

/// Static description of a display device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayInfo {
    pub name: String,
    /// Shortest display period (in vsyncs) the device can honour
    pub min_display_period: u32,
    pub max_display_period: u32,
    /// Number of hardware planes
    pub max_pipes: u32,
    /// Whether configurations can be applied outside vblank
    pub unlatched_support: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelInfo {
    pub surface: SurfaceAttributes,
    pub refresh_rate_hz: u32,
    pub x_dpi: u32,
    pub y_dpi: u32,
}

/// Configuration for the display-class server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DcConfig {
    /// Command slots per display context (queued plus awaiting retirement)
    pub command_queue_depth: usize,
    /// Queue runs attempted by one flush before giving up
    pub flush_iterations: u32,
    /// Pause between flush runs (milliseconds)
    pub flush_interval_ms: u64,
    /// How long destroy waits for in-flight configurations to retire (milliseconds)
    pub drain_timeout_ms: u64,
    /// Period of the background queue runner tick (milliseconds)
    pub runner_period_ms: u64,
}

impl Default for DcConfig {
    fn default() -> Self {
        Self {
            command_queue_depth: 32,
            flush_iterations: 500,
            flush_interval_ms: 1,
            drain_timeout_ms: 2000,
            runner_period_ms: 16, // one 60Hz frame
        }
    }
}

impl DcConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: DcConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        log::info!("Loading display-class config from: {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.command_queue_depth == 0 {
            anyhow::bail!("command_queue_depth must be at least 1");
        }
        if self.runner_period_ms == 0 {
            anyhow::bail!("runner_period_ms must be non-zero");
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn runner_period(&self) -> Duration {
        Duration::from_millis(self.runner_period_ms)
    }
}
