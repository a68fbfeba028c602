//! Collaborators the hub talks to but does not implement: the render
//! pipeline, the control (action) engine, and observers of hub state.

use std::collections::HashMap;

use parking_lot::RwLock;
use surface_transport::{DrawStyle, RenderedImage, RotateDirection};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::coords::GridPoint;
use crate::snapshot::Patch;

const RENDER_CHANNEL_CAPACITY: usize = 1024;

/// A rendered button changed
#[derive(Debug, Clone, PartialEq)]
pub struct RenderInvalidation {
    pub page: u32,
    /// Grid position, before any surface offset is applied
    pub point: GridPoint,
    pub image: RenderedImage,
}

/// Lock screen artwork
#[derive(Debug, Clone, PartialEq)]
pub struct PincodeImages {
    /// Keypad images, indexed by digit
    pub digits: Vec<RenderedImage>,
    /// Preview of the code entered so far
    pub code: RenderedImage,
}

/// Source of already-rendered button images
pub trait RenderSource: Send + Sync {
    /// Stream of per-button invalidations
    fn subscribe(&self) -> broadcast::Receiver<RenderInvalidation>;

    /// Every rendered button of a page
    fn page_images(&self, page: u32) -> HashMap<GridPoint, RenderedImage>;

    /// Lock screen images for the given partial entry
    fn pincode_images(&self, entry: &str) -> PincodeImages;
}

/// Executes whatever is bound to a button
pub trait ControlDispatch: Send + Sync {
    /// Returns true if a control exists at the location
    fn press_control(&self, page: u32, point: GridPoint, pressed: bool, surface_id: &str) -> bool;

    /// Returns true if a control exists at the location
    fn rotate_control(
        &self,
        page: u32,
        point: GridPoint,
        direction: RotateDirection,
        surface_id: &str,
    ) -> bool;

    /// Panel asked for a custom variable to be set
    fn set_custom_variable(&self, _name: &str, _value: &str) {}
}

/// Notifications for UIs and other observers
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// Change to the surface/group listing
    SurfacesPatch(Patch),
    PageChanged { surface_id: String, page: u32 },
    LockChanged { surface_id: String, locked: bool },
}

/// Render source holding images in memory
///
/// Used by the daemon when no render pipeline is attached, and by tests.
pub struct MemoryRenderer {
    pages: RwLock<HashMap<u32, HashMap<GridPoint, RenderedImage>>>,
    tx: broadcast::Sender<RenderInvalidation>,
}

impl Default for MemoryRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRenderer {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(RENDER_CHANNEL_CAPACITY);
        Self {
            pages: RwLock::new(HashMap::new()),
            tx,
        }
    }

    /// Store an image and notify subscribers
    pub fn set_image(&self, page: u32, point: GridPoint, image: RenderedImage) {
        self.pages
            .write()
            .entry(page)
            .or_default()
            .insert(point, image.clone());
        let _ = self.tx.send(RenderInvalidation { page, point, image });
    }

    /// Image with a text label and no pixels of its own
    pub fn text_image(text: &str) -> RenderedImage {
        RenderedImage::new(
            text.as_bytes().to_vec(),
            DrawStyle {
                text: Some(text.to_string()),
                color: 0xffffff,
                bgcolor: 0,
                pushed: false,
            },
        )
    }
}

impl RenderSource for MemoryRenderer {
    fn subscribe(&self) -> broadcast::Receiver<RenderInvalidation> {
        self.tx.subscribe()
    }

    fn page_images(&self, page: u32) -> HashMap<GridPoint, RenderedImage> {
        self.pages.read().get(&page).cloned().unwrap_or_default()
    }

    fn pincode_images(&self, entry: &str) -> PincodeImages {
        PincodeImages {
            digits: (0..10).map(|d| Self::text_image(&d.to_string())).collect(),
            code: Self::text_image(&"*".repeat(entry.len())),
        }
    }
}

/// Dispatch that only logs, for running without an action engine
#[derive(Debug, Default)]
pub struct LoggingDispatch;

impl ControlDispatch for LoggingDispatch {
    fn press_control(&self, page: u32, point: GridPoint, pressed: bool, surface_id: &str) -> bool {
        info!(
            "{}: {} page {} ({}, {})",
            surface_id,
            if pressed { "press" } else { "release" },
            page,
            point.x,
            point.y
        );
        false
    }

    fn rotate_control(
        &self,
        page: u32,
        point: GridPoint,
        direction: RotateDirection,
        surface_id: &str,
    ) -> bool {
        info!(
            "{}: rotate {:?} page {} ({}, {})",
            surface_id, direction, page, point.x, point.y
        );
        false
    }

    fn set_custom_variable(&self, name: &str, value: &str) {
        debug!("Custom variable {} = {}", name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_renderer_notifies_and_stores() {
        let renderer = MemoryRenderer::new();
        let mut rx = renderer.subscribe();
        let image = MemoryRenderer::text_image("GO");
        renderer.set_image(3, GridPoint::new(1, 2), image.clone());

        let event = rx.try_recv().unwrap();
        assert_eq!(event.page, 3);
        assert_eq!(event.point, GridPoint::new(1, 2));
        assert_eq!(
            renderer.page_images(3).get(&GridPoint::new(1, 2)),
            Some(&image)
        );
        assert!(renderer.page_images(4).is_empty());
    }

    #[test]
    fn test_pincode_images() {
        let images = MemoryRenderer::new().pincode_images("12");
        assert_eq!(images.digits.len(), 10);
        assert_eq!(images.digits[7].style.text.as_deref(), Some("7"));
        assert_eq!(images.code.style.text.as_deref(), Some("**"));
    }
}
