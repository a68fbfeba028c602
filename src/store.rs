//! Persistence for surface and group records
//!
//! The hub only needs a key-value map of JSON documents per table.
//! [`KeyValueStore`] is that seam; [`SledStore`] backs it on disk and
//! [`MemoryStore`] keeps it in memory. [`SurfaceStore`] adds the typed
//! records on top.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use surface_transport::{IntegrationType, PanelConfig};
use tracing::{info, warn};

use crate::error::{HubError, Result};
use crate::group::GroupConfig;

/// Table of device records, keyed by device id
pub const SURFACES_TABLE: &str = "surfaces";
/// Table of manual group configs, keyed by group id
pub const GROUPS_TABLE: &str = "surface_groups";

/// Closure applied by [`KeyValueStore::update`]; may run more than once
pub type UpdateFn<'a> = &'a mut dyn FnMut(Option<Value>) -> Option<Value>;

/// Minimal table-oriented document store
pub trait KeyValueStore: Send + Sync {
    fn get(&self, table: &str, key: &str) -> Result<Option<Value>>;

    fn set(&self, table: &str, key: &str, value: Value) -> Result<()>;

    fn delete(&self, table: &str, key: &str) -> Result<()>;

    /// Every entry of a table, ordered by key
    fn all(&self, table: &str) -> Result<Vec<(String, Value)>>;

    /// Atomically replace a value with `f(current)`
    ///
    /// `f` sees the latest stored value, never a cached copy. Returning None
    /// deletes the entry. Returns the new value.
    fn update(&self, table: &str, key: &str, f: UpdateFn<'_>) -> Result<Option<Value>>;

    /// Drop every entry of a table
    fn clear(&self, table: &str) -> Result<()>;

    /// Make pending writes durable
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

fn decode_bytes(table: &str, key: &str, bytes: &[u8]) -> Option<Value> {
    match serde_json::from_slice(bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring undecodable {}/{}: {}", table, key, e);
            None
        }
    }
}

/// On-disk store, one sled tree per table
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening surface database at {}", path.display());
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    fn tree(&self, table: &str) -> Result<sled::Tree> {
        Ok(self.db.open_tree(table)?)
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, table: &str, key: &str) -> Result<Option<Value>> {
        let bytes = self.tree(table)?.get(key)?;
        Ok(bytes.and_then(|b| decode_bytes(table, key, &b)))
    }

    fn set(&self, table: &str, key: &str, value: Value) -> Result<()> {
        self.tree(table)?.insert(key, serde_json::to_vec(&value)?)?;
        Ok(())
    }

    fn delete(&self, table: &str, key: &str) -> Result<()> {
        self.tree(table)?.remove(key)?;
        Ok(())
    }

    fn all(&self, table: &str) -> Result<Vec<(String, Value)>> {
        let mut entries = Vec::new();
        for item in self.tree(table)?.iter() {
            let (key, bytes) = item?;
            let key = String::from_utf8_lossy(&key).into_owned();
            if let Some(value) = decode_bytes(table, &key, &bytes) {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }

    fn update(&self, table: &str, key: &str, f: UpdateFn<'_>) -> Result<Option<Value>> {
        let updated = self.tree(table)?.update_and_fetch(key, |old| {
            let current = old.and_then(|bytes| decode_bytes(table, key, bytes));
            f(current).map(|value| value.to_string().into_bytes())
        })?;
        Ok(updated.and_then(|b| decode_bytes(table, key, &b)))
    }

    fn clear(&self, table: &str) -> Result<()> {
        self.tree(table)?.clear()?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Volatile store for tests and throwaway runs
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, table: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|t| t.get(key))
            .cloned())
    }

    fn set(&self, table: &str, key: &str, value: Value) -> Result<()> {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, table: &str, key: &str) -> Result<()> {
        if let Some(t) = self.tables.write().get_mut(table) {
            t.remove(key);
        }
        Ok(())
    }

    fn all(&self, table: &str) -> Result<Vec<(String, Value)>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn update(&self, table: &str, key: &str, f: UpdateFn<'_>) -> Result<Option<Value>> {
        let mut tables = self.tables.write();
        let entries = tables.entry(table.to_string()).or_default();
        let updated = f(entries.get(key).cloned());
        match &updated {
            Some(value) => {
                entries.insert(key.to_string(), value.clone());
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(updated)
    }

    fn clear(&self, table: &str) -> Result<()> {
        self.tables.write().remove(table);
        Ok(())
    }
}

/// Persisted record of one device, kept while the device is disconnected
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfigRecord {
    /// Hardware family
    #[serde(rename = "type")]
    pub family: String,
    pub integration_type: Option<IntegrationType>,
    /// User-assigned display name
    pub name: String,
    pub config: PanelConfig,
    /// Auto-group config, present while the device is not in a manual group
    pub group_config: Option<GroupConfig>,
    /// Manual group the device belongs to
    pub group_id: Option<String>,
}

fn decode_record<T: DeserializeOwned>(table: &str, key: &str, value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("Ignoring malformed {}/{}: {}", table, key, e);
            None
        }
    }
}

/// Typed access to surface and group records
#[derive(Clone)]
pub struct SurfaceStore {
    kv: Arc<dyn KeyValueStore>,
}

impl SurfaceStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn surface(&self, id: &str) -> Result<Option<DeviceConfigRecord>> {
        Ok(self
            .kv
            .get(SURFACES_TABLE, id)?
            .and_then(|v| decode_record(SURFACES_TABLE, id, v)))
    }

    pub fn surfaces(&self) -> Result<Vec<(String, DeviceConfigRecord)>> {
        Ok(self
            .kv
            .all(SURFACES_TABLE)?
            .into_iter()
            .filter_map(|(id, v)| decode_record(SURFACES_TABLE, &id, v).map(|r| (id, r)))
            .collect())
    }

    /// Read-modify-write a device record against its latest stored state
    ///
    /// Creates the record from defaults if missing. `f` may run more than
    /// once under contention.
    pub fn update_surface(
        &self,
        id: &str,
        mut f: impl FnMut(&mut DeviceConfigRecord),
    ) -> Result<DeviceConfigRecord> {
        let mut failure = None;
        let updated = self.kv.update(SURFACES_TABLE, id, &mut |current| {
            let mut record: DeviceConfigRecord = current
                .clone()
                .and_then(|v| decode_record(SURFACES_TABLE, id, v))
                .unwrap_or_default();
            f(&mut record);
            match serde_json::to_value(&record) {
                Ok(value) => Some(value),
                Err(e) => {
                    failure = Some(e);
                    current
                }
            }
        })?;
        if let Some(e) = failure {
            return Err(HubError::Serialization(e));
        }
        Ok(updated
            .and_then(|v| decode_record(SURFACES_TABLE, id, v))
            .unwrap_or_default())
    }

    pub fn delete_surface(&self, id: &str) -> Result<()> {
        self.kv.delete(SURFACES_TABLE, id)
    }

    pub fn group(&self, id: &str) -> Result<Option<GroupConfig>> {
        Ok(self
            .kv
            .get(GROUPS_TABLE, id)?
            .and_then(|v| decode_record(GROUPS_TABLE, id, v)))
    }

    pub fn groups(&self) -> Result<Vec<(String, GroupConfig)>> {
        Ok(self
            .kv
            .all(GROUPS_TABLE)?
            .into_iter()
            .filter_map(|(id, v)| decode_record(GROUPS_TABLE, &id, v).map(|c| (id, c)))
            .collect())
    }

    pub fn set_group(&self, id: &str, config: &GroupConfig) -> Result<()> {
        self.kv.set(GROUPS_TABLE, id, serde_json::to_value(config)?)
    }

    pub fn delete_group(&self, id: &str) -> Result<()> {
        self.kv.delete(GROUPS_TABLE, id)
    }

    /// Forget every surface and group record
    pub fn purge(&self) -> Result<()> {
        self.kv.clear(SURFACES_TABLE)?;
        self.kv.clear(GROUPS_TABLE)?;
        self.kv.flush()
    }

    pub fn flush(&self) -> Result<()> {
        self.kv.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exercise(kv: Arc<dyn KeyValueStore>) {
        kv.set("t", "b", json!({"n": 2})).unwrap();
        kv.set("t", "a", json!({"n": 1})).unwrap();
        assert_eq!(kv.get("t", "a").unwrap(), Some(json!({"n": 1})));
        assert_eq!(kv.get("t", "missing").unwrap(), None);
        let keys: Vec<_> = kv.all("t").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);

        let updated = kv
            .update("t", "a", &mut |v| {
                let n = v.and_then(|v| v["n"].as_i64()).unwrap_or(0);
                Some(json!({"n": n + 10}))
            })
            .unwrap();
        assert_eq!(updated, Some(json!({"n": 11})));

        kv.update("t", "b", &mut |_| None).unwrap();
        assert_eq!(kv.get("t", "b").unwrap(), None);

        kv.delete("t", "a").unwrap();
        assert!(kv.all("t").unwrap().is_empty());

        kv.set("t", "c", json!(1)).unwrap();
        kv.clear("t").unwrap();
        assert!(kv.all("t").unwrap().is_empty());
    }

    #[test]
    fn test_memory_store() {
        exercise(Arc::new(MemoryStore::new()));
    }

    #[test]
    fn test_sled_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise(Arc::new(SledStore::open(dir.path()).unwrap()));
    }

    #[test]
    fn test_sled_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SurfaceStore::new(Arc::new(SledStore::open(dir.path()).unwrap()));
            store
                .update_surface("emulator:a", |r| r.name = "Desk".into())
                .unwrap();
            store.flush().unwrap();
        }
        let store = SurfaceStore::new(Arc::new(SledStore::open(dir.path()).unwrap()));
        let record = store.surface("emulator:a").unwrap().unwrap();
        assert_eq!(record.name, "Desk");
    }

    #[test]
    fn test_record_defaults_fill_missing_fields() {
        let kv = Arc::new(MemoryStore::new());
        kv.set(SURFACES_TABLE, "x", json!({"name": "Old", "config": {"x_offset": 1}}))
            .unwrap();
        let store = SurfaceStore::new(kv);
        let record = store.surface("x").unwrap().unwrap();
        assert_eq!(record.name, "Old");
        assert_eq!(record.config.x_offset, 1);
        assert_eq!(record.config.page, 1);
        assert_eq!(record.group_id, None);
    }

    #[test]
    fn test_malformed_record_is_absent() {
        let kv = Arc::new(MemoryStore::new());
        kv.set(SURFACES_TABLE, "x", json!({"config": "not a table"}))
            .unwrap();
        let store = SurfaceStore::new(kv);
        assert_eq!(store.surface("x").unwrap(), None);
        assert!(store.surfaces().unwrap().is_empty());
    }

    #[test]
    fn test_update_surface_merges_with_latest() {
        let store = SurfaceStore::in_memory();
        store.update_surface("d", |r| r.config.page = 4).unwrap();
        // A second writer only touches its own field
        store
            .update_surface("d", |r| {
                r.group_config = Some(GroupConfig {
                    last_page: 4,
                    ..Default::default()
                })
            })
            .unwrap();
        let record = store.surface("d").unwrap().unwrap();
        assert_eq!(record.config.page, 4);
        assert_eq!(record.group_config.unwrap().last_page, 4);
    }

    #[test]
    fn test_purge() {
        let store = SurfaceStore::in_memory();
        store.update_surface("d", |_| {}).unwrap();
        store.set_group("group:1", &GroupConfig::default()).unwrap();
        store.purge().unwrap();
        assert!(store.surfaces().unwrap().is_empty());
        assert!(store.groups().unwrap().is_empty());
    }
}
