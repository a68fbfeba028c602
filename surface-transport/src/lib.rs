//! Panel driver abstraction for button/dial control surfaces
//!
//! This crate provides a unified interface for talking to control surfaces
//! across different integrations:
//!
//! - Emulator (in-process virtual panel)
//! - USB panels (vendor drivers implement [`PanelDriver`])
//! - Satellite/network panels
//!
//! Byte-level vendor framing lives in the drivers themselves; everything above
//! this crate only sees device-local key indexes, rendered images and
//! [`DeviceEvent`]s.

pub mod device_registry;
pub mod error;
pub mod types;

mod discovery;
mod emulator;
mod monitor;

pub use device_registry::{
    family_or_generic, find_family, pin_layout, pin_layout_for, HardwareFamily, PinLayout,
    GENERIC_FAMILY, KNOWN_FAMILIES,
};
pub use discovery::{EmulatorDiscovery, EmulatorSpec, PanelDiscovery};
pub use emulator::{EmulatorPanel, EMULATOR_ID_PREFIX};
pub use error::DriverError;
pub use monitor::{MonitorConfig, MonitorFilter, MonitoredPanel};
pub use types::{
    ConfigField, DeviceEvent, DiscoveredPanel, DiscoveryEvent, DrawKey, DrawStyle,
    IntegrationType, PanelConfig, PanelGeometry, PanelInfo, RenderedImage, RotateDirection,
    Rotation,
};

use async_trait::async_trait;
use tokio::sync::broadcast;

/// The core driver trait - every integration implements this
///
/// Handlers own an `Arc<dyn PanelDriver>` and never look past this interface,
/// so geometry and event translation are shared by composition instead of a
/// common driver base.
#[async_trait]
pub trait PanelDriver: Send + Sync {
    /// Static panel description
    fn info(&self) -> &PanelInfo;

    /// Draw one key
    ///
    /// Best effort: returns `Ok(false)` when the panel has no display for the
    /// key. Errors are reported, never panicked.
    async fn draw(&self, key: DrawKey, image: &RenderedImage) -> Result<bool, DriverError>;

    /// Blank every key
    async fn clear_deck(&self) -> Result<(), DriverError>;

    /// Push panel settings (brightness etc.)
    ///
    /// # Arguments
    /// * `config` - Current panel config
    /// * `force` - Apply even if the driver thinks nothing changed
    async fn set_config(&self, config: &PanelConfig, force: bool) -> Result<(), DriverError>;

    /// Release the device
    async fn quit(&self) -> Result<(), DriverError>;

    /// Subscribe to device events
    ///
    /// Returns None if the panel never reports input (display-only panels).
    fn subscribe_events(&self) -> Option<broadcast::Receiver<DeviceEvent>> {
        None
    }
}
