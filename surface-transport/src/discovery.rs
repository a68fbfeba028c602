//! Panel discovery

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::emulator::{EmulatorPanel, EMULATOR_ID_PREFIX};
use crate::error::DriverError;
use crate::monitor::{MonitorConfig, MonitoredPanel};
use crate::types::{DiscoveredPanel, DiscoveryEvent, IntegrationType, PanelGeometry};
use crate::PanelDriver;

/// Panel discovery abstraction, one per integration
#[async_trait]
pub trait PanelDiscovery: Send + Sync {
    /// Integration this discovery opens panels for
    fn integration(&self) -> IntegrationType;

    /// List currently available panels
    async fn list_panels(&self) -> Result<Vec<DiscoveredPanel>, DriverError>;

    /// Open a specific panel
    async fn open_panel(
        &self,
        panel: &DiscoveredPanel,
    ) -> Result<Arc<dyn PanelDriver>, DriverError>;

    /// Subscribe to hot-plug events
    fn watch(&self) -> broadcast::Receiver<DiscoveryEvent>;
}

/// Emulator definition, as found in the hub config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmulatorSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_columns")]
    pub columns: u32,
    #[serde(default = "default_rows")]
    pub rows: u32,
}

fn default_columns() -> u32 {
    8
}

fn default_rows() -> u32 {
    4
}

impl EmulatorSpec {
    pub fn new(id: &str, columns: u32, rows: u32) -> Self {
        Self {
            id: id.to_string(),
            name: String::new(),
            columns,
            rows,
        }
    }

    fn device_path(&self) -> String {
        if self.id.starts_with(EMULATOR_ID_PREFIX) {
            self.id.clone()
        } else {
            format!("{EMULATOR_ID_PREFIX}{}", self.id)
        }
    }

    /// Key layout, or None when the key count does not fit a u32
    pub fn geometry(&self) -> Option<PanelGeometry> {
        let keys_total = self.columns.checked_mul(self.rows)?;
        Some(PanelGeometry::new(self.columns, keys_total))
    }
}

/// Discovery for in-process emulator panels
pub struct EmulatorDiscovery {
    specs: RwLock<Vec<EmulatorSpec>>,
    /// Opened panels, kept so callers can inject input
    opened: RwLock<HashMap<String, Arc<EmulatorPanel>>>,
    /// Hot-plug event sender
    event_tx: broadcast::Sender<DiscoveryEvent>,
    /// Optional monitor config - wraps opened panels automatically
    monitor: Option<MonitorConfig>,
}

impl Default for EmulatorDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatorDiscovery {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(16);
        Self {
            specs: RwLock::new(Vec::new()),
            opened: RwLock::new(HashMap::new()),
            event_tx,
            monitor: None,
        }
    }

    /// Create with monitor config
    /// All panels opened via open_panel() will be wrapped with MonitoredPanel
    pub fn with_monitor(config: MonitorConfig) -> Self {
        Self {
            monitor: Some(config),
            ..Self::new()
        }
    }

    fn discovered(spec: &EmulatorSpec) -> DiscoveredPanel {
        DiscoveredPanel {
            device_path: spec.device_path(),
            integration: IntegrationType::Emulator,
            family: "emulator".to_string(),
            serial: Some(spec.device_path()),
        }
    }

    /// Register an emulator and announce it as hot-plugged
    pub fn add_emulator(&self, spec: EmulatorSpec) {
        let discovered = Self::discovered(&spec);
        {
            let mut specs = self.specs.write();
            if specs.iter().any(|s| s.device_path() == discovered.device_path) {
                debug!("Emulator {} already registered", discovered.device_path);
                return;
            }
            specs.push(spec);
        }
        info!("Emulator {} added", discovered.device_path);
        let _ = self.event_tx.send(DiscoveryEvent::PanelAdded(discovered));
    }

    /// Unregister an emulator and announce its removal
    pub fn remove_emulator(&self, id: &str) {
        let path = EmulatorSpec::new(id, 0, 0).device_path();
        self.specs.write().retain(|s| s.device_path() != path);
        if let Some(panel) = self.opened.write().remove(&path) {
            panel.unplug();
        }
        let _ = self
            .event_tx
            .send(DiscoveryEvent::PanelRemoved { device_path: path });
    }

    /// Opened emulator by id, for input injection
    pub fn panel(&self, id: &str) -> Option<Arc<EmulatorPanel>> {
        let path = EmulatorSpec::new(id, 0, 0).device_path();
        self.opened.read().get(&path).cloned()
    }
}

#[async_trait]
impl PanelDiscovery for EmulatorDiscovery {
    fn integration(&self) -> IntegrationType {
        IntegrationType::Emulator
    }

    async fn list_panels(&self) -> Result<Vec<DiscoveredPanel>, DriverError> {
        let panels: Vec<_> = self.specs.read().iter().map(Self::discovered).collect();
        debug!("Found {} emulators", panels.len());
        Ok(panels)
    }

    async fn open_panel(
        &self,
        panel: &DiscoveredPanel,
    ) -> Result<Arc<dyn PanelDriver>, DriverError> {
        let spec = self
            .specs
            .read()
            .iter()
            .find(|s| s.device_path() == panel.device_path)
            .cloned()
            .ok_or_else(|| DriverError::PanelNotFound(panel.device_path.clone()))?;

        if spec.columns == 0 || spec.rows == 0 {
            return Err(DriverError::Unsupported(format!(
                "Emulator {} has no keys",
                panel.device_path
            )));
        }

        let geometry = spec.geometry().ok_or_else(|| {
            DriverError::Unsupported(format!(
                "Emulator {} is too large ({}x{})",
                panel.device_path, spec.columns, spec.rows
            ))
        })?;

        let emulator = Arc::new(EmulatorPanel::new(&spec.id, geometry));
        self.opened
            .write()
            .insert(panel.device_path.clone(), Arc::clone(&emulator));

        info!(
            "Opened emulator {} ({}x{})",
            panel.device_path, spec.columns, spec.rows
        );

        let driver: Arc<dyn PanelDriver> = emulator;
        let driver = match &self.monitor {
            Some(config) => MonitoredPanel::wrap(driver, config.clone()),
            None => driver,
        };
        Ok(driver)
    }

    fn watch(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.event_tx.subscribe()
    }
}
