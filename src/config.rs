//! Hub configuration
//!
//! Stored as TOML, by default at `~/.config/surface-hub/hub.toml`. Every
//! field has a default so partial files load.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use surface_transport::EmulatorSpec;
use tracing::warn;

use crate::write_queue::DEFAULT_MAX_CONCURRENCY;

/// Size of the logical button grid every surface is mapped onto
///
/// Passed by value into every geometry calculation; there is no global grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridLimits {
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

impl Default for GridLimits {
    fn default() -> Self {
        Self {
            columns: default_columns(),
            rows: default_rows(),
        }
    }
}

impl GridLimits {
    pub const fn new(columns: u32, rows: u32) -> Self {
        Self { columns, rows }
    }

    /// Largest x/y offset at which a panel of the given logical size still
    /// fits inside the grid
    pub fn max_offset(&self, logical_columns: u32, logical_rows: u32) -> (u32, u32) {
        (
            self.columns.saturating_sub(logical_columns),
            self.rows.saturating_sub(logical_rows),
        )
    }
}

/// How linked lockouts decide that every surface should lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkedPolicy {
    /// Lock everything as soon as one surface times out
    #[default]
    Any,
    /// Lock only once every lockable surface has timed out
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutSettings {
    #[serde(default)]
    pub pin_enable: bool,
    #[serde(default)]
    pub pin: String,
    /// Idle time before a surface locks; 0 disables the timeout
    #[serde(default = "default_pin_timeout")]
    pub pin_timeout_secs: u64,
    /// Lock and unlock all surfaces together
    #[serde(default)]
    pub link_lockouts: bool,
    #[serde(default)]
    pub linked_policy: LinkedPolicy,
}

fn default_pin_timeout() -> u64 {
    0
}

impl Default for LockoutSettings {
    fn default() -> Self {
        Self {
            pin_enable: false,
            pin: String::new(),
            pin_timeout_secs: default_pin_timeout(),
            link_lockouts: false,
            linked_policy: LinkedPolicy::Any,
        }
    }
}

impl LockoutSettings {
    /// PIN locking is in force. A PIN that can't be typed on a keypad
    /// (empty, or with anything but digits) disables locking.
    pub fn is_active(&self) -> bool {
        self.pin_enable && self.pin_is_enterable()
    }

    pub fn pin_is_enterable(&self) -> bool {
        !self.pin.is_empty() && self.pin.chars().all(|c| c.is_ascii_digit())
    }

    /// Idle timeout, if the lockout timer should run
    pub fn timeout(&self) -> Option<Duration> {
        (self.is_active() && self.pin_timeout_secs > 0)
            .then(|| Duration::from_secs(self.pin_timeout_secs))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagingSettings {
    /// Swap the meaning of page up and page down
    #[serde(default)]
    pub page_direction_flipped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Concurrent image writes per surface
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedrawSettings {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

fn default_tick_ms() -> u64 {
    10
}

fn default_max_wait_ms() -> u64 {
    50
}

impl Default for RedrawSettings {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

impl RedrawSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms.max(self.tick_ms).max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Database directory (default: ~/.local/share/surface-hub/db)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StoreSettings {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("surface-hub")
                .join("db")
        })
    }
}

/// Complete hub configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub grid: GridLimits,
    #[serde(default)]
    pub lockout: LockoutSettings,
    #[serde(default)]
    pub paging: PagingSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub redraw: RedrawSettings,
    #[serde(default)]
    pub store: StoreSettings,
    /// Virtual panels to create at startup
    #[serde(default)]
    pub emulators: Vec<EmulatorSpec>,
}

impl HubConfig {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("surface-hub")
            .join("hub.toml")
    }

    /// Load config from a file, or return default if not found
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: HubConfig = toml::from_str(&content)?;
            if config.lockout.pin_enable && !config.lockout.pin_is_enterable() {
                warn!("PIN must be digits only; surface locking is disabled");
            }
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to a file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: HubConfig = toml::from_str(
            r#"
            [lockout]
            pin_enable = true
            pin = "1234"

            [grid]
            columns = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.grid, GridLimits::new(10, 4));
        assert!(config.lockout.is_active());
        assert!(!config.lockout.link_lockouts);
        assert_eq!(config.lockout.linked_policy, LinkedPolicy::Any);
        assert_eq!(config.queue.max_concurrency, 3);
        assert!(config.emulators.is_empty());
    }

    #[test]
    fn test_empty_pin_disables_locking() {
        let settings = LockoutSettings {
            pin_enable: true,
            pin_timeout_secs: 30,
            ..Default::default()
        };
        assert!(!settings.is_active());
        assert_eq!(settings.timeout(), None);
    }

    #[test]
    fn test_non_digit_pin_disables_locking() {
        let mut settings = LockoutSettings {
            pin_enable: true,
            pin: "12a4".into(),
            pin_timeout_secs: 30,
            ..Default::default()
        };
        assert!(!settings.is_active());
        assert_eq!(settings.timeout(), None);

        for pin in [" 1234", "١٢٣", "12-4"] {
            settings.pin = pin.into();
            assert!(!settings.is_active(), "{pin:?} accepted");
        }
        settings.pin = "0042".into();
        assert!(settings.is_active());
    }

    #[test]
    fn test_timeout_requires_active_pin() {
        let mut settings = LockoutSettings {
            pin_enable: true,
            pin: "42".into(),
            pin_timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(settings.timeout(), None);
        settings.pin_timeout_secs = 5;
        assert_eq!(settings.timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_emulators_section() {
        let config: HubConfig = toml::from_str(
            r#"
            [[emulators]]
            id = "desk"
            columns = 5
            rows = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.emulators.len(), 1);
        assert_eq!(config.emulators[0].geometry().unwrap().keys_total, 15);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hub.toml");
        let mut config = HubConfig::default();
        config.lockout.link_lockouts = true;
        config.lockout.linked_policy = LinkedPolicy::All;
        config.save(&path).unwrap();
        assert_eq!(HubConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = HubConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, HubConfig::default());
    }

    #[test]
    fn test_max_offset() {
        let grid = GridLimits::default();
        assert_eq!(grid.max_offset(5, 3), (3, 1));
        assert_eq!(grid.max_offset(10, 5), (0, 0));
    }
}
