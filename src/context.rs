//! State shared by the controller, its groups and its handlers

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::config::{
    GridLimits, HubConfig, LockoutSettings, PagingSettings, QueueSettings, RedrawSettings,
};
use crate::services::{ControlDispatch, HubEvent, RenderSource};
use crate::store::SurfaceStore;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Messages from handlers back to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerSignal {
    /// PIN entered correctly on this surface
    Unlocked { surface_id: String },
    /// Driver reported removal or a fatal error
    Removed { surface_id: String },
    /// Name or config changed, listing needs refreshing
    Changed { surface_id: String },
}

/// Collaborators and settings every component needs
pub struct HubContext {
    pub store: SurfaceStore,
    pub renderer: Arc<dyn RenderSource>,
    pub controls: Arc<dyn ControlDispatch>,
    pub grid: GridLimits,
    pub queue: QueueSettings,
    pub redraw: RedrawSettings,
    pub lockout: RwLock<LockoutSettings>,
    pub paging: RwLock<PagingSettings>,
    events: broadcast::Sender<HubEvent>,
    signals: mpsc::UnboundedSender<HandlerSignal>,
}

impl HubContext {
    /// Build a context; the receiver gets every [`HandlerSignal`]
    pub fn new(
        store: SurfaceStore,
        renderer: Arc<dyn RenderSource>,
        controls: Arc<dyn ControlDispatch>,
        config: &HubConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<HandlerSignal>) {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(Self {
            store,
            renderer,
            controls,
            grid: config.grid,
            queue: config.queue.clone(),
            redraw: config.redraw.clone(),
            lockout: RwLock::new(config.lockout.clone()),
            paging: RwLock::new(config.paging.clone()),
            events,
            signals,
        });
        (ctx, signal_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: HubEvent) {
        trace!("Hub event: {:?}", event);
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    pub fn signal(&self, signal: HandlerSignal) {
        let _ = self.signals.send(signal);
    }

    pub fn pin(&self) -> String {
        self.lockout.read().pin.clone()
    }

    pub fn page_direction_flipped(&self) -> bool {
        self.paging.read().page_direction_flipped
    }
}
