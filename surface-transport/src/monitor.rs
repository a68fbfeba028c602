//! MonitoredPanel middleware for tracing driver traffic
//!
//! Wraps any `PanelDriver` and logs every call and device event passing
//! through it.
//!
//! # Example
//!
//! ```ignore
//! use surface_transport::{EmulatorPanel, MonitoredPanel, MonitorConfig};
//!
//! let panel = Arc::new(EmulatorPanel::new("main", PanelGeometry::new(8, 32)));
//! let monitored = MonitoredPanel::wrap(panel, MonitorConfig::default());
//! // Now all draws/events are logged
//! ```

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::DriverError;
use crate::types::{DeviceEvent, DrawKey, PanelConfig, PanelInfo, RenderedImage};
use crate::PanelDriver;

/// Traffic filter for selective logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorFilter {
    #[default]
    All,
    Events,
    Draws,
}

impl FromStr for MonitorFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" | "" => Ok(Self::All),
            "events" | "event" => Ok(Self::Events),
            "draws" | "draw" => Ok(Self::Draws),
            _ => Err(format!("Unknown filter: {}", s)),
        }
    }
}

/// Configuration for MonitoredPanel
#[derive(Debug, Clone, Default)]
pub struct MonitorConfig {
    /// Log image byte counts and styles for draws
    pub show_payload: bool,
    pub filter: MonitorFilter,
}

impl MonitorConfig {
    pub fn with_payload(mut self, show: bool) -> Self {
        self.show_payload = show;
        self
    }

    pub fn with_filter(mut self, filter: MonitorFilter) -> Self {
        self.filter = filter;
        self
    }

    fn show_draws(&self) -> bool {
        matches!(self.filter, MonitorFilter::All | MonitorFilter::Draws)
    }

    fn show_events(&self) -> bool {
        matches!(self.filter, MonitorFilter::All | MonitorFilter::Events)
    }
}

/// Driver middleware that logs all traffic
pub struct MonitoredPanel {
    inner: Arc<dyn PanelDriver>,
    config: MonitorConfig,
}

impl MonitoredPanel {
    /// Wrap a driver with logging middleware
    pub fn wrap(driver: Arc<dyn PanelDriver>, config: MonitorConfig) -> Arc<dyn PanelDriver> {
        Arc::new(Self {
            inner: driver,
            config,
        })
    }

    fn id(&self) -> &str {
        &self.inner.info().device_id
    }
}

#[async_trait]
impl PanelDriver for MonitoredPanel {
    fn info(&self) -> &PanelInfo {
        self.inner.info()
    }

    async fn draw(&self, key: DrawKey, image: &RenderedImage) -> Result<bool, DriverError> {
        let result = self.inner.draw(key, image).await;
        if self.config.show_draws() {
            if self.config.show_payload {
                debug!(
                    ">>> {} DRAW key={} page_offset={} bytes={} style={:?} -> {:?}",
                    self.id(),
                    key.key,
                    key.page_offset,
                    image.buffer.len(),
                    image.style,
                    result
                );
            } else {
                debug!(
                    ">>> {} DRAW key={} page_offset={} -> {:?}",
                    self.id(),
                    key.key,
                    key.page_offset,
                    result
                );
            }
        }
        result
    }

    async fn clear_deck(&self) -> Result<(), DriverError> {
        if self.config.show_draws() {
            debug!(">>> {} CLEAR", self.id());
        }
        self.inner.clear_deck().await
    }

    async fn set_config(&self, config: &PanelConfig, force: bool) -> Result<(), DriverError> {
        info!(">>> {} CONFIG force={} {:?}", self.id(), force, config);
        self.inner.set_config(config, force).await
    }

    async fn quit(&self) -> Result<(), DriverError> {
        info!(">>> {} QUIT", self.id());
        self.inner.quit().await
    }

    fn subscribe_events(&self) -> Option<broadcast::Receiver<DeviceEvent>> {
        let mut inner_rx = self.inner.subscribe_events()?;
        if !self.config.show_events() {
            return Some(inner_rx);
        }

        let (tx, rx) = broadcast::channel(256);
        let id = self.id().to_string();
        tokio::spawn(async move {
            loop {
                match inner_rx.recv().await {
                    Ok(event) => {
                        info!("<<< {} EVENT {:?}", id, event);
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("<<< {} lagged by {} events", id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Some(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::EmulatorPanel;
    use crate::types::PanelGeometry;

    #[test]
    fn test_filter_parse() {
        assert_eq!("events".parse::<MonitorFilter>().unwrap(), MonitorFilter::Events);
        assert_eq!("".parse::<MonitorFilter>().unwrap(), MonitorFilter::All);
        assert!("bogus".parse::<MonitorFilter>().is_err());
    }

    #[tokio::test]
    async fn test_wrapped_draw_reaches_inner() {
        let panel = Arc::new(EmulatorPanel::new("m", PanelGeometry::new(5, 15)));
        let monitored = MonitoredPanel::wrap(panel.clone(), MonitorConfig::default());
        assert_eq!(monitored.info().device_id, "emulator:m");
        monitored
            .draw(DrawKey::local(2), &RenderedImage::blank())
            .await
            .unwrap();
        assert_eq!(panel.draw_count(), 1);
    }

    #[tokio::test]
    async fn test_events_forwarded() {
        let panel = Arc::new(EmulatorPanel::new("m", PanelGeometry::new(5, 15)));
        let monitored = MonitoredPanel::wrap(panel.clone(), MonitorConfig::default());
        let mut rx = monitored.subscribe_events().unwrap();
        panel.unplug();
        assert_eq!(rx.recv().await.unwrap(), DeviceEvent::Remove);
    }
}
