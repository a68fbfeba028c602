//! Emulator panel - an in-process virtual surface
//!
//! The emulator keeps the last image drawn to every key and lets callers
//! inject input, which makes it the reference integration for tests and for
//! running the hub without hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::DriverError;
use crate::types::{
    ConfigField, DeviceEvent, DrawKey, IntegrationType, PanelConfig, PanelGeometry, PanelInfo,
    RenderedImage, RotateDirection,
};
use crate::PanelDriver;

/// Broadcast channel capacity for device events
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Prefix shared by every emulator device id
pub const EMULATOR_ID_PREFIX: &str = "emulator:";

/// Virtual panel backed by memory
pub struct EmulatorPanel {
    info: PanelInfo,
    /// Last image per key
    images: Mutex<HashMap<DrawKey, RenderedImage>>,
    /// Every draw in order, for inspection
    draw_log: Mutex<Vec<DrawKey>>,
    config: Mutex<Option<PanelConfig>>,
    event_tx: broadcast::Sender<DeviceEvent>,
    clear_count: AtomicUsize,
    fail_draws: AtomicBool,
    disconnected: AtomicBool,
    reject_config: AtomicBool,
    quit: AtomicBool,
}

impl EmulatorPanel {
    /// Create an emulator panel
    ///
    /// # Arguments
    /// * `id` - Emulator id; `emulator:` is prepended when missing
    /// * `geometry` - Key layout
    pub fn new(id: &str, geometry: PanelGeometry) -> Self {
        let device_id = if id.starts_with(EMULATOR_ID_PREFIX) {
            id.to_string()
        } else {
            format!("{EMULATOR_ID_PREFIX}{id}")
        };
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            info: PanelInfo {
                device_path: device_id.clone(),
                device_id,
                family: "emulator".to_string(),
                integration: IntegrationType::Emulator,
                geometry,
                config_fields: vec![ConfigField::Rotation, ConfigField::Offset],
                location: None,
            },
            images: Mutex::new(HashMap::new()),
            draw_log: Mutex::new(Vec::new()),
            config: Mutex::new(None),
            event_tx,
            clear_count: AtomicUsize::new(0),
            fail_draws: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            reject_config: AtomicBool::new(false),
            quit: AtomicBool::new(false),
        }
    }

    /// Override the reported family (changes the PIN layout)
    pub fn with_family(mut self, family: &str) -> Self {
        self.info.family = family.to_string();
        self
    }

    // ---- input injection ----

    fn emit(&self, event: DeviceEvent) {
        // No receivers simply means no handler is attached yet
        let _ = self.event_tx.send(event);
    }

    pub fn click(&self, key: u32, pressed: bool) {
        self.emit(DeviceEvent::Click {
            key,
            pressed,
            page_offset: None,
        });
    }

    /// Press and release a key
    pub fn tap(&self, key: u32) {
        self.click(key, true);
        self.click(key, false);
    }

    pub fn rotate(&self, key: u32, direction: RotateDirection) {
        self.emit(DeviceEvent::Rotate {
            key,
            direction,
            page_offset: None,
        });
    }

    /// Simulate the panel being unplugged
    pub fn unplug(&self) {
        self.emit(DeviceEvent::Remove);
    }

    pub fn send_event(&self, event: DeviceEvent) {
        self.emit(event);
    }

    // ---- inspection ----

    pub fn image(&self, key: DrawKey) -> Option<RenderedImage> {
        self.images.lock().get(&key).cloned()
    }

    pub fn draw_log(&self) -> Vec<DrawKey> {
        self.draw_log.lock().clone()
    }

    pub fn draw_count(&self) -> usize {
        self.draw_log.lock().len()
    }

    pub fn clear_count(&self) -> usize {
        self.clear_count.load(Ordering::SeqCst)
    }

    pub fn last_config(&self) -> Option<PanelConfig> {
        self.config.lock().clone()
    }

    pub fn has_quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Make subsequent draws fail, as a flaky endpoint would
    pub fn set_fail_draws(&self, fail: bool) {
        self.fail_draws.store(fail, Ordering::SeqCst);
    }

    /// Act as if the cable was pulled without a remove event: every later
    /// driver call reports `Disconnected`
    pub fn set_disconnected(&self, gone: bool) {
        self.disconnected.store(gone, Ordering::SeqCst);
    }

    /// Refuse config updates from now on
    pub fn set_reject_config(&self, reject: bool) {
        self.reject_config.store(reject, Ordering::SeqCst);
    }

    fn is_gone(&self) -> bool {
        self.quit.load(Ordering::SeqCst) || self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PanelDriver for EmulatorPanel {
    fn info(&self) -> &PanelInfo {
        &self.info
    }

    async fn draw(&self, key: DrawKey, image: &RenderedImage) -> Result<bool, DriverError> {
        if self.is_gone() {
            return Err(DriverError::Disconnected);
        }
        if self.fail_draws.load(Ordering::SeqCst) {
            return Err(DriverError::DrawRejected {
                key: key.key,
                reason: "emulated failure".into(),
            });
        }
        if key.key >= self.info.geometry.keys_total {
            return Ok(false);
        }

        self.images.lock().insert(key, image.clone());
        self.draw_log.lock().push(key);
        Ok(true)
    }

    async fn clear_deck(&self) -> Result<(), DriverError> {
        if self.is_gone() {
            return Err(DriverError::Disconnected);
        }
        self.images.lock().clear();
        self.clear_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_config(&self, config: &PanelConfig, force: bool) -> Result<(), DriverError> {
        debug!(
            "Emulator {} config (force={}): {:?}",
            self.info.device_id, force, config
        );
        if self.is_gone() {
            return Err(DriverError::Disconnected);
        }
        if self.reject_config.load(Ordering::SeqCst) {
            return Err(DriverError::Unsupported("config rejected".into()));
        }
        *self.config.lock() = Some(config.clone());
        Ok(())
    }

    async fn quit(&self) -> Result<(), DriverError> {
        self.quit.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe_events(&self) -> Option<broadcast::Receiver<DeviceEvent>> {
        Some(self.event_tx.subscribe())
    }
}
