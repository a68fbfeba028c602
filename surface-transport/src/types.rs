//! Common types for the driver layer

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Integration a panel was opened through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntegrationType {
    /// In-process virtual panel
    Emulator,
    /// Locally attached USB/HID panel
    Usb,
    /// Remote panel speaking the satellite text protocol
    Satellite,
    /// Other network attached panel
    Network,
}

impl IntegrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Emulator => "emulator",
            Self::Usb => "usb",
            Self::Satellite => "satellite",
            Self::Network => "network",
        }
    }

    /// Check if panels of this integration are reached over the network
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Satellite | Self::Network)
    }
}

impl fmt::Display for IntegrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical key layout of a panel, in device-local terms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PanelGeometry {
    pub keys_per_row: u32,
    pub keys_total: u32,
}

impl PanelGeometry {
    pub const fn new(keys_per_row: u32, keys_total: u32) -> Self {
        Self {
            keys_per_row,
            keys_total,
        }
    }

    /// Number of rows, counting a partially filled last row
    pub fn rows(&self) -> u32 {
        if self.keys_per_row == 0 {
            0
        } else {
            self.keys_total.div_ceil(self.keys_per_row)
        }
    }

    pub fn columns(&self) -> u32 {
        self.keys_per_row
    }
}

/// Panel settings a user may change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigField {
    Brightness,
    Rotation,
    NeverLock,
    Offset,
}

/// Static description of an opened panel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelInfo {
    /// Stable identity (serial number or emulator id)
    pub device_id: String,
    /// Transport-specific path; two handlers never share one
    pub device_path: String,
    /// Hardware family name, see `device_registry`
    pub family: String,
    pub integration: IntegrationType,
    pub geometry: PanelGeometry,
    #[serde(default)]
    pub config_fields: Vec<ConfigField>,
    /// Remote address for network panels
    #[serde(default)]
    pub location: Option<String>,
}

/// Physical rotation applied to a panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Half,
    Cw270,
}

impl TryFrom<i32> for Rotation {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            90 => Ok(Self::Cw90),
            180 | -180 => Ok(Self::Half),
            270 | -90 => Ok(Self::Cw270),
            other => Err(format!("Unsupported rotation: {other}")),
        }
    }
}

impl From<Rotation> for i32 {
    fn from(rotation: Rotation) -> Self {
        match rotation {
            Rotation::None => 0,
            Rotation::Cw90 => 90,
            Rotation::Half => 180,
            Rotation::Cw270 => 270,
        }
    }
}

impl Rotation {
    /// True if the logical column/row counts are swapped
    pub fn is_quarter_turn(&self) -> bool {
        matches!(self, Self::Cw90 | Self::Cw270)
    }
}

/// Per-panel settings persisted with the device record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub brightness: u8,
    pub rotation: Rotation,
    pub never_lock: bool,
    pub x_offset: u32,
    pub y_offset: u32,
    /// Page the panel was last showing
    pub page: u32,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            brightness: 100,
            rotation: Rotation::None,
            never_lock: false,
            x_offset: 0,
            y_offset: 0,
            page: 1,
        }
    }
}

/// Address of one drawable key, possibly on an extra page the panel spans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DrawKey {
    /// Offset from the panel's current page (0 for the page itself)
    pub page_offset: i32,
    /// Device-local linear key index
    pub key: u32,
}

impl DrawKey {
    pub const fn local(key: u32) -> Self {
        Self {
            page_offset: 0,
            key,
        }
    }
}

/// Presentation hints shipped alongside the pixels
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawStyle {
    pub text: Option<String>,
    pub color: u32,
    pub bgcolor: u32,
    pub pushed: bool,
}

/// An already-rendered key image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedImage {
    pub buffer: Arc<[u8]>,
    pub style: DrawStyle,
}

impl RenderedImage {
    pub fn new(buffer: impl Into<Arc<[u8]>>, style: DrawStyle) -> Self {
        Self {
            buffer: buffer.into(),
            style,
        }
    }

    /// Image used to blank a key that has nothing rendered
    pub fn blank() -> Self {
        Self {
            buffer: Arc::from(Vec::new()),
            style: DrawStyle::default(),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Encoder/dial turn direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RotateDirection {
    Left,
    Right,
}

impl RotateDirection {
    pub fn is_right(&self) -> bool {
        matches!(self, Self::Right)
    }
}

/// Events a panel reports to its handler
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Key pressed or released
    Click {
        key: u32,
        pressed: bool,
        page_offset: Option<i32>,
    },
    /// Encoder turned
    Rotate {
        key: u32,
        direction: RotateDirection,
        page_offset: Option<i32>,
    },
    /// Panel went away
    Remove,
    /// Vendor side channel: panel wants a custom variable set
    SetVariable { name: String, value: String },
    /// Vendor side channel: panel displays additional pages
    SubscribeExtraPages { offsets: Vec<i32> },
}

/// Panel found by a discovery scan that can be opened
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPanel {
    pub device_path: String,
    pub integration: IntegrationType,
    pub family: String,
    pub serial: Option<String>,
}

/// Discovery events for hot-plug support
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// A panel was added
    PanelAdded(DiscoveredPanel),
    /// A panel was removed
    PanelRemoved { device_path: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_rows_partial() {
        assert_eq!(PanelGeometry::new(5, 15).rows(), 3);
        assert_eq!(PanelGeometry::new(4, 6).rows(), 2);
        assert_eq!(PanelGeometry::new(0, 6).rows(), 0);
    }

    #[test]
    fn test_rotation_serde() {
        let json = serde_json::to_string(&Rotation::Cw90).unwrap();
        assert_eq!(json, "90");
        let parsed: Rotation = serde_json::from_str("-90").unwrap();
        assert_eq!(parsed, Rotation::Cw270);
        assert!(serde_json::from_str::<Rotation>("45").is_err());
    }

    #[test]
    fn test_panel_config_defaults_fill_missing() {
        let cfg: PanelConfig = serde_json::from_str(r#"{"x_offset": 2}"#).unwrap();
        assert_eq!(cfg.x_offset, 2);
        assert_eq!(cfg.brightness, 100);
        assert_eq!(cfg.page, 1);
        assert!(!cfg.never_lock);
    }
}
