//! Surface controller - owns every handler and group
//!
//! The controller is the only place handlers and groups are created or
//! dropped. It also runs discovery and hot-plug, the PIN lockout timer, and
//! publishes the surface listing to observers as structural patches.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use surface_transport::{
    family_or_generic, DiscoveryEvent, IntegrationType, PanelConfig, PanelDiscovery, PanelDriver,
    RenderedImage,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{HubConfig, LinkedPolicy, LockoutSettings};
use crate::context::{HandlerSignal, HubContext};
use crate::coords::GridPoint;
use crate::error::{HubError, Result};
use crate::group::SurfaceGroup;
use crate::handler::SurfaceHandler;
use crate::services::{ControlDispatch, HubEvent, RenderSource};
use crate::snapshot::{diff, full_listing, GroupSummary, SurfaceSummary};
use crate::store::{DeviceConfigRecord, SurfaceStore};

/// Lockout timer resolution
const LOCKOUT_TICK: Duration = Duration::from_secs(1);

struct ControllerState {
    /// Connected surfaces by device id
    handlers: HashMap<String, Arc<SurfaceHandler>>,
    /// Auto groups are keyed by their surface id
    groups: HashMap<String, Arc<SurfaceGroup>>,
    /// Linked lockout state
    all_locked: bool,
    /// Last listing pushed to observers
    last_listing: Option<Value>,
}

#[derive(Default)]
struct ScanState {
    running: bool,
    /// Another scan was requested while one was running
    pending: bool,
}

struct LockoutTimer {
    timeout: Duration,
    task: JoinHandle<()>,
}

pub struct SurfaceController {
    ctx: Arc<HubContext>,
    state: Mutex<ControllerState>,
    scan: Mutex<ScanState>,
    discoveries: RwLock<Vec<Arc<dyn PanelDiscovery>>>,
    lockout_timer: Mutex<Option<LockoutTimer>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SurfaceController {
    /// Create the controller and load stored manual groups
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        store: SurfaceStore,
        renderer: Arc<dyn RenderSource>,
        controls: Arc<dyn ControlDispatch>,
        config: &HubConfig,
    ) -> Arc<Self> {
        let (ctx, signals) = HubContext::new(store, renderer, controls, config);
        let controller = Arc::new(Self {
            state: Mutex::new(ControllerState {
                handlers: HashMap::new(),
                groups: HashMap::new(),
                all_locked: config.lockout.is_active(),
                last_listing: None,
            }),
            ctx,
            scan: Mutex::new(ScanState::default()),
            discoveries: RwLock::new(Vec::new()),
            lockout_timer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        controller.load_manual_groups();
        controller
            .tasks
            .lock()
            .push(tokio::spawn(run_signals(Arc::downgrade(&controller), signals)));
        controller.restart_lockout_timer();
        controller
    }

    fn load_manual_groups(&self) {
        let stored = match self.ctx.store.groups() {
            Ok(groups) => groups,
            Err(e) => {
                error!("Failed to load surface groups: {}", e);
                return;
            }
        };
        let mut st = self.state.lock();
        for (id, _) in stored {
            match SurfaceGroup::new_manual(&id, None, Arc::clone(&self.ctx)) {
                Ok(group) => {
                    debug!("Loaded group {}", id);
                    st.groups.insert(id, Arc::new(group));
                }
                Err(e) => warn!("Skipping group {}: {}", id, e),
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.ctx.subscribe()
    }

    pub fn handler(&self, surface_id: &str) -> Option<Arc<SurfaceHandler>> {
        self.state.lock().handlers.get(surface_id).cloned()
    }

    pub fn handlers(&self) -> Vec<Arc<SurfaceHandler>> {
        self.state.lock().handlers.values().cloned().collect()
    }

    pub fn group(&self, group_id: &str) -> Option<Arc<SurfaceGroup>> {
        self.state.lock().groups.get(group_id).cloned()
    }

    fn has_device_path(&self, path: &str) -> bool {
        self.state
            .lock()
            .handlers
            .values()
            .any(|h| h.device_path() == path)
    }

    fn is_duplicate(&self, id: &str, path: &str) -> bool {
        let st = self.state.lock();
        st.handlers.contains_key(id) || st.handlers.values().any(|h| h.device_path() == path)
    }

    // ---- attach / detach ----

    fn initial_lock_state(&self) -> bool {
        let settings = self.ctx.lockout.read().clone();
        if !settings.is_active() {
            return false;
        }
        if settings.link_lockouts {
            self.state.lock().all_locked
        } else {
            true
        }
    }

    /// Take ownership of a freshly opened panel
    ///
    /// Rejects a device whose path or id is already attached.
    pub async fn add_device(&self, driver: Arc<dyn PanelDriver>) -> Result<Arc<SurfaceHandler>> {
        let info = driver.info().clone();
        if self.is_duplicate(&info.device_id, &info.device_path) {
            return Err(HubError::DuplicateDevice(info.device_path));
        }

        let locked = self.initial_lock_state();
        let handler = SurfaceHandler::attach(driver, Arc::clone(&self.ctx), locked).await?;

        // Another add may have won while the handler was attaching
        let inserted = {
            let mut st = self.state.lock();
            let duplicate = st.handlers.contains_key(&info.device_id)
                || st
                    .handlers
                    .values()
                    .any(|h| h.device_path() == info.device_path);
            if !duplicate {
                st.handlers
                    .insert(info.device_id.clone(), Arc::clone(&handler));
            }
            !duplicate
        };
        if !inserted {
            handler.unload(false).await;
            return Err(HubError::DuplicateDevice(info.device_path));
        }

        if let Err(e) = self.attach_to_resolved_group(&handler) {
            warn!("{}: failed to attach to group: {}", info.device_id, e);
        }
        info!(
            "Added {} surface {} ({})",
            info.integration, info.device_id, info.device_path
        );
        self.update_devices_list();
        Ok(handler)
    }

    /// Stored manual group if it still exists, else the surface's auto group
    fn attach_to_resolved_group(&self, handler: &Arc<SurfaceHandler>) -> Result<()> {
        let id = handler.id();
        let record = self.ctx.store.surface(id)?.unwrap_or_default();
        let group = {
            let mut st = self.state.lock();
            let manual = record
                .group_id
                .as_ref()
                .and_then(|gid| st.groups.get(gid))
                .filter(|g| !g.is_auto())
                .cloned();
            match manual {
                Some(group) => group,
                None => {
                    if let Some(gid) = &record.group_id {
                        warn!("{}: group {} is gone, using auto group", id, gid);
                        self.ctx
                            .store
                            .update_surface(id, |record| record.group_id = None)?;
                    }
                    let group = Arc::new(SurfaceGroup::new_auto(id, Arc::clone(&self.ctx))?);
                    st.groups.insert(id.to_string(), Arc::clone(&group));
                    group
                }
            }
        };
        group.attach_surface(handler)
    }

    /// Detach a surface from whichever group holds it
    ///
    /// An emptied auto group is dropped; with `forget_auto` its stored
    /// config goes too.
    fn detach_from_group(&self, surface_id: &str, forget_auto: bool) {
        let groups: Vec<_> = self.state.lock().groups.values().cloned().collect();
        for group in groups {
            if !group.detach_surface(surface_id) {
                continue;
            }
            if group.is_auto() {
                self.state.lock().groups.remove(group.id());
                if forget_auto {
                    if let Err(e) = group.forget_config() {
                        warn!("{}: failed to forget auto group: {}", surface_id, e);
                    }
                }
            }
        }
    }

    /// Drop a connected surface, keeping its record
    pub async fn remove_device(&self, surface_id: &str) -> bool {
        let Some(handler) = self.state.lock().handlers.remove(surface_id) else {
            return false;
        };
        self.detach_from_group(surface_id, false);
        handler.unload(false).await;
        info!("Removed surface {}", surface_id);
        self.update_devices_list();
        true
    }

    /// Delete the stored record of a disconnected surface
    pub fn forget_surface(&self, surface_id: &str) -> Result<()> {
        if self.state.lock().handlers.contains_key(surface_id) {
            return Err(HubError::SurfaceConnected(surface_id.to_string()));
        }
        if self.ctx.store.surface(surface_id)?.is_none() {
            return Err(HubError::UnknownSurface(surface_id.to_string()));
        }
        self.ctx.store.delete_surface(surface_id)?;
        info!("Forgot surface {}", surface_id);
        self.update_devices_list();
        Ok(())
    }

    // ---- discovery ----

    /// Register a discovery and follow its hot-plug events
    pub fn add_discovery(self: &Arc<Self>, discovery: Arc<dyn PanelDiscovery>) {
        let rx = discovery.watch();
        self.discoveries.write().push(discovery);
        self.tasks
            .lock()
            .push(tokio::spawn(run_hotplug(Arc::downgrade(self), rx)));
    }

    /// Open every discovered panel that is not attached yet
    ///
    /// Single flight: a scan requested while one runs is folded into one
    /// follow-up run.
    pub async fn scan(&self) {
        {
            let mut scan = self.scan.lock();
            if scan.running {
                debug!("Scan in progress, queueing another");
                scan.pending = true;
                return;
            }
            scan.running = true;
        }

        loop {
            self.scan_once().await;
            let again = {
                let mut scan = self.scan.lock();
                if scan.pending {
                    scan.pending = false;
                    true
                } else {
                    scan.running = false;
                    false
                }
            };
            if !again {
                break;
            }
        }
    }

    async fn scan_once(&self) {
        let discoveries = self.discoveries.read().clone();
        for discovery in discoveries {
            let panels = match discovery.list_panels().await {
                Ok(panels) => panels,
                Err(e) => {
                    warn!("{} discovery failed: {}", discovery.integration(), e);
                    continue;
                }
            };
            let fresh: Vec<_> = panels
                .into_iter()
                .filter(|p| !self.has_device_path(&p.device_path))
                .collect();
            if fresh.is_empty() {
                continue;
            }
            debug!("Opening {} {} panels", fresh.len(), discovery.integration());

            let opened = join_all(fresh.iter().map(|p| discovery.open_panel(p))).await;
            for (panel, result) in fresh.iter().zip(opened) {
                match result {
                    Ok(driver) => {
                        if let Err(e) = self.add_device(driver).await {
                            warn!("Failed to add {}: {}", panel.device_path, e);
                        }
                    }
                    Err(e) => warn!("Skipping {}: {}", panel.device_path, e),
                }
            }
        }
    }

    async fn remove_device_by_path(&self, path: &str) {
        let id = self
            .state
            .lock()
            .handlers
            .values()
            .find(|h| h.device_path() == path)
            .map(|h| h.id().to_string());
        if let Some(id) = id {
            self.remove_device(&id).await;
        }
    }

    // ---- groups ----

    /// Group a surface or group id refers to
    fn group_for(&self, id: &str) -> Result<Arc<SurfaceGroup>> {
        let st = self.state.lock();
        if let Some(group) = st.groups.get(id) {
            return Ok(Arc::clone(group));
        }
        if st.handlers.contains_key(id) {
            if let Some(group) = st
                .groups
                .values()
                .find(|g| g.surface_ids().iter().any(|s| s == id))
            {
                return Ok(Arc::clone(group));
            }
        }
        Err(HubError::UnknownGroup(id.to_string()))
    }

    fn manual_group(&self, group_id: &str) -> Result<Arc<SurfaceGroup>> {
        match self.group(group_id) {
            Some(group) if group.is_auto() => {
                Err(HubError::AutoGroupOccupied(group_id.to_string()))
            }
            Some(group) => Ok(group),
            None => Err(HubError::UnknownGroup(group_id.to_string())),
        }
    }

    /// Create an empty manual group. Returns its id.
    pub fn create_group(&self, name: &str) -> Result<String> {
        let id = format!("group:{}", Uuid::new_v4());
        let group = SurfaceGroup::new_manual(&id, Some(name), Arc::clone(&self.ctx))?;
        self.state.lock().groups.insert(id.clone(), Arc::new(group));
        info!("Created group {} ({})", id, name);
        self.update_devices_list();
        Ok(id)
    }

    /// Delete a manual group, moving its members back to auto groups
    pub fn delete_group(&self, group_id: &str) -> Result<()> {
        let group = match self.group(group_id) {
            Some(group) if group.is_auto() => {
                return Err(HubError::AutoGroupNotDeletable(group_id.to_string()))
            }
            Some(group) => group,
            None => return Err(HubError::UnknownGroup(group_id.to_string())),
        };

        self.state.lock().groups.remove(group_id);
        group.forget_config()?;

        for handler in group.surfaces() {
            group.detach_surface(handler.id());
            self.ctx
                .store
                .update_surface(handler.id(), |record| record.group_id = None)?;
            self.attach_to_resolved_group(&handler)?;
        }
        // Offline members fall back to auto groups when they return
        for (id, record) in self.ctx.store.surfaces()? {
            if record.group_id.as_deref() == Some(group_id) {
                self.ctx
                    .store
                    .update_surface(&id, |record| record.group_id = None)?;
            }
        }

        info!("Deleted group {}", group_id);
        self.update_devices_list();
        Ok(())
    }

    /// Move a surface into a manual group
    ///
    /// Disconnected surfaces only have their record updated.
    pub fn add_to_group(&self, surface_id: &str, group_id: &str) -> Result<()> {
        let group = self.manual_group(group_id)?;
        let handler = self.handler(surface_id);
        if handler.is_none() && self.ctx.store.surface(surface_id)?.is_none() {
            return Err(HubError::UnknownSurface(surface_id.to_string()));
        }

        self.detach_from_group(surface_id, true);
        self.ctx.store.update_surface(surface_id, |record| {
            record.group_id = Some(group_id.to_string());
            record.group_config = None;
        })?;
        if let Some(handler) = handler {
            group.attach_surface(&handler)?;
        }
        info!("Surface {} joined group {}", surface_id, group_id);
        self.update_devices_list();
        Ok(())
    }

    /// Take a surface out of its manual group into its own auto group
    pub fn remove_from_group(&self, surface_id: &str) -> Result<()> {
        let handler = self.handler(surface_id);
        if handler.is_none() && self.ctx.store.surface(surface_id)?.is_none() {
            return Err(HubError::UnknownSurface(surface_id.to_string()));
        }
        if self.group(surface_id).is_some_and(|g| g.is_auto()) {
            return Ok(());
        }

        self.detach_from_group(surface_id, true);
        self.ctx
            .store
            .update_surface(surface_id, |record| record.group_id = None)?;
        if let Some(handler) = handler {
            self.attach_to_resolved_group(&handler)?;
        }
        self.update_devices_list();
        Ok(())
    }

    // ---- paging ----

    pub fn page_up(&self, id: &str) -> Result<u32> {
        Ok(self.group_for(id)?.do_page_up())
    }

    pub fn page_down(&self, id: &str) -> Result<u32> {
        Ok(self.group_for(id)?.do_page_down())
    }

    pub fn set_page(&self, id: &str, page: u32) -> Result<u32> {
        Ok(self.group_for(id)?.set_current_page(page))
    }

    pub fn current_page(&self, id: &str) -> Result<u32> {
        Ok(self.group_for(id)?.current_page())
    }

    pub fn set_group_config_value(&self, id: &str, key: &str, value: &str) -> Result<()> {
        self.group_for(id)?.set_group_config_value(key, value)?;
        self.update_devices_list();
        Ok(())
    }

    pub fn set_group_name(&self, group_id: &str, name: &str) -> Result<()> {
        self.group_for(group_id)?.set_name(name)?;
        self.update_devices_list();
        Ok(())
    }

    // ---- surface settings ----

    pub fn set_surface_name(&self, surface_id: &str, name: &str) -> Result<()> {
        match self.handler(surface_id) {
            Some(handler) => handler.set_name(name)?,
            None => {
                if self.ctx.store.surface(surface_id)?.is_none() {
                    return Err(HubError::UnknownSurface(surface_id.to_string()));
                }
                self.ctx
                    .store
                    .update_surface(surface_id, |record| record.name = name.to_string())?;
            }
        }
        self.update_devices_list();
        Ok(())
    }

    pub async fn set_panel_config(
        &self,
        surface_id: &str,
        config: PanelConfig,
    ) -> Result<PanelConfig> {
        let handler = self
            .handler(surface_id)
            .ok_or_else(|| HubError::UnknownSurface(surface_id.to_string()))?;
        let applied = handler.set_panel_config(config).await?;
        self.update_devices_list();
        Ok(applied)
    }

    pub async fn reset_panel_config(&self, surface_id: &str) -> Result<PanelConfig> {
        let handler = self
            .handler(surface_id)
            .ok_or_else(|| HubError::UnknownSurface(surface_id.to_string()))?;
        let applied = handler.reset_config().await?;
        self.update_devices_list();
        Ok(applied)
    }

    /// Push an invalidation straight to every handler
    pub fn render_invalidated(&self, page: u32, point: GridPoint, image: &RenderedImage) {
        for handler in self.handlers() {
            handler.on_render_invalidated(page, point, image);
        }
    }

    // ---- lockout ----

    /// Lock or unlock one surface (all of them with linked lockouts)
    pub fn set_surface_locked(&self, surface_id: &str, locked: bool) -> Result<bool> {
        let handler = self
            .handler(surface_id)
            .ok_or_else(|| HubError::UnknownSurface(surface_id.to_string()))?;
        if self.ctx.lockout.read().link_lockouts {
            return Ok(self.set_all_locked(locked));
        }
        let changed = handler.set_locked(locked);
        if changed {
            self.update_devices_list();
        }
        Ok(changed)
    }

    /// Lock or unlock every surface. Returns true if any surface changed.
    pub fn set_all_locked(&self, locked: bool) -> bool {
        if locked && !self.ctx.lockout.read().is_active() {
            return false;
        }
        let handlers = {
            let mut st = self.state.lock();
            st.all_locked = locked;
            st.handlers.values().cloned().collect::<Vec<_>>()
        };
        let mut changed = false;
        for handler in handlers {
            changed |= handler.set_locked(locked);
        }
        if changed {
            info!("All surfaces {}", if locked { "locked" } else { "unlocked" });
            self.update_devices_list();
        }
        changed
    }

    pub fn lockout_settings(&self) -> LockoutSettings {
        self.ctx.lockout.read().clone()
    }

    /// Replace the PIN settings, restarting or stopping the lockout timer
    ///
    /// Disabling the PIN unlocks everything.
    pub fn update_lockout_settings(self: &Arc<Self>, settings: LockoutSettings) {
        let was_active = {
            let mut current = self.ctx.lockout.write();
            let was_active = current.is_active();
            *current = settings.clone();
            was_active
        };
        if was_active && !settings.is_active() {
            self.set_all_locked(false);
        }
        self.restart_lockout_timer();
    }

    /// Make the lockout timer match the settings
    ///
    /// At most one timer runs; an unchanged timeout keeps the running one.
    fn restart_lockout_timer(self: &Arc<Self>) {
        let timeout = self.ctx.lockout.read().timeout();
        let mut timer = self.lockout_timer.lock();

        match (timeout, timer.as_ref()) {
            (Some(timeout), Some(running)) if running.timeout == timeout => return,
            (None, None) => return,
            _ => {}
        }
        if let Some(old) = timer.take() {
            old.task.abort();
            debug!("Lockout timer stopped");
        }
        let Some(timeout) = timeout else {
            return;
        };

        let controller = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(LOCKOUT_TICK);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.check_lockouts();
            }
        });
        info!("Lockout timer started ({}s)", timeout.as_secs());
        *timer = Some(LockoutTimer { timeout, task });
    }

    pub fn lockout_timer_running(&self) -> bool {
        self.lockout_timer.lock().is_some()
    }

    /// Lock idle surfaces; run by the lockout timer every tick
    pub fn check_lockouts(&self) {
        let settings = self.ctx.lockout.read().clone();
        let Some(timeout) = settings.timeout() else {
            return;
        };
        let (handlers, all_locked) = {
            let st = self.state.lock();
            let handlers: Vec<_> = st
                .handlers
                .values()
                .filter(|h| !h.never_lock())
                .cloned()
                .collect();
            (handlers, st.all_locked)
        };

        if settings.link_lockouts {
            if all_locked || handlers.is_empty() {
                return;
            }
            let expired = handlers
                .iter()
                .filter(|h| h.idle_for() >= timeout)
                .count();
            let trip = match settings.linked_policy {
                LinkedPolicy::Any => expired > 0,
                LinkedPolicy::All => expired == handlers.len(),
            };
            if trip {
                info!("Lockout timeout reached, locking all surfaces");
                self.set_all_locked(true);
            }
        } else {
            let mut changed = false;
            for handler in handlers {
                if !handler.is_locked() && handler.idle_for() >= timeout {
                    info!("{}: lockout timeout reached", handler.id());
                    changed |= handler.set_locked(true);
                }
            }
            if changed {
                self.update_devices_list();
            }
        }
    }

    fn on_surface_unlocked(&self, surface_id: &str) {
        if self.ctx.lockout.read().link_lockouts {
            debug!("{} unlocked, unlocking linked surfaces", surface_id);
            self.set_all_locked(false);
        } else {
            self.update_devices_list();
        }
    }

    // ---- listing ----

    /// Groups with their surfaces, connected or not
    ///
    /// Manual groups come first, then auto groups with emulators ahead of
    /// hardware, each in id order.
    pub fn devices_list(&self) -> Vec<GroupSummary> {
        let (online, groups): (HashSet<String>, Vec<Arc<SurfaceGroup>>) = {
            let st = self.state.lock();
            (
                st.handlers.keys().cloned().collect(),
                st.groups.values().cloned().collect(),
            )
        };

        let mut manual = Vec::new();
        let mut auto = Vec::new();
        for group in groups {
            let summary = GroupSummary {
                id: group.id().to_string(),
                name: group.name(),
                is_auto: group.is_auto(),
                current_page: group.current_page(),
                surfaces: group.surfaces().iter().map(|h| h.summary()).collect(),
            };
            if group.is_auto() {
                auto.push(summary);
            } else {
                manual.push(summary);
            }
        }

        let records = self.ctx.store.surfaces().unwrap_or_else(|e| {
            warn!("Failed to read surface records: {}", e);
            Vec::new()
        });
        for (id, record) in records {
            if online.contains(&id) {
                continue;
            }
            let surface = offline_summary(&id, &record);
            let group = record
                .group_id
                .as_ref()
                .and_then(|gid| manual.iter_mut().find(|g| &g.id == gid));
            match group {
                Some(group) => group.surfaces.push(surface),
                None => {
                    let config = record.group_config.clone().unwrap_or_default();
                    auto.push(GroupSummary {
                        id,
                        name: config.name.clone(),
                        is_auto: true,
                        current_page: config.initial_page(),
                        surfaces: vec![surface],
                    });
                }
            }
        }

        manual.sort_by(|a, b| a.id.cmp(&b.id));
        auto.sort_by_cached_key(|g| {
            let emulator = g
                .surfaces
                .first()
                .is_some_and(|s| s.integration_type == Some(IntegrationType::Emulator));
            (!emulator, g.id.clone())
        });
        manual.extend(auto);
        manual
    }

    /// Recompute the listing and push the difference to observers
    pub fn update_devices_list(&self) {
        let listing = match serde_json::to_value(self.devices_list()) {
            Ok(listing) => listing,
            Err(e) => {
                warn!("Failed to serialize surface listing: {}", e);
                return;
            }
        };
        // Emitted under the lock so observers see patches in diff order
        let mut st = self.state.lock();
        let patch = match &st.last_listing {
            Some(previous) => diff(previous, &listing),
            None => full_listing(listing.clone()),
        };
        st.last_listing = Some(listing);
        if !patch.is_empty() {
            self.ctx.emit(HubEvent::SurfacesPatch(patch));
        }
    }

    // ---- shutdown ----

    fn stop_background(&self) {
        if let Some(timer) = self.lockout_timer.lock().take() {
            timer.task.abort();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    async fn unload_all(&self) {
        let handlers: Vec<_> = {
            let mut st = self.state.lock();
            st.groups.retain(|_, g| !g.is_auto());
            st.handlers.drain().map(|(_, h)| h).collect()
        };
        for group in self.state.lock().groups.values() {
            for id in group.surface_ids() {
                group.detach_surface(&id);
            }
        }
        join_all(handlers.iter().map(|h| h.unload(false))).await;
    }

    /// Release every panel, keeping stored config
    pub async fn quit(&self) {
        info!("Shutting down surfaces");
        self.stop_background();
        self.unload_all().await;
        if let Err(e) = self.ctx.store.flush() {
            warn!("Failed to flush surface store: {}", e);
        }
    }

    /// Erase all stored surface and group config, then release every panel
    pub async fn reset(&self) -> Result<()> {
        info!("Resetting surface configuration");
        self.ctx.store.purge()?;
        self.unload_all().await;
        self.state.lock().groups.clear();
        self.update_devices_list();
        Ok(())
    }
}

impl Drop for SurfaceController {
    fn drop(&mut self) {
        self.stop_background();
    }
}

fn offline_summary(id: &str, record: &DeviceConfigRecord) -> SurfaceSummary {
    SurfaceSummary {
        id: id.to_string(),
        name: record.name.clone(),
        family: record.family.clone(),
        display_name: family_or_generic(&record.family).display_name.to_string(),
        integration_type: record.integration_type,
        is_connected: false,
        location: None,
        config: record.config.clone(),
        locked: false,
    }
}

async fn run_signals(
    controller: Weak<SurfaceController>,
    mut signals: mpsc::UnboundedReceiver<HandlerSignal>,
) {
    while let Some(signal) = signals.recv().await {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        match signal {
            HandlerSignal::Unlocked { surface_id } => controller.on_surface_unlocked(&surface_id),
            HandlerSignal::Removed { surface_id } => {
                controller.remove_device(&surface_id).await;
            }
            HandlerSignal::Changed { .. } => controller.update_devices_list(),
        }
    }
}

async fn run_hotplug(
    controller: Weak<SurfaceController>,
    mut events: broadcast::Receiver<DiscoveryEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Missed {} hot-plug events, rescanning", n);
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                tokio::spawn(async move { controller.scan().await });
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(controller) = controller.upgrade() else {
            break;
        };
        match event {
            DiscoveryEvent::PanelAdded(panel) => {
                debug!("Hot-plug: {} added", panel.device_path);
                tokio::spawn(async move { controller.scan().await });
            }
            DiscoveryEvent::PanelRemoved { device_path } => {
                debug!("Hot-plug: {} removed", device_path);
                controller.remove_device_by_path(&device_path).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{LoggingDispatch, MemoryRenderer};
    use surface_transport::{EmulatorPanel, PanelGeometry};

    fn controller(config: &HubConfig) -> Arc<SurfaceController> {
        SurfaceController::new(
            SurfaceStore::in_memory(),
            Arc::new(MemoryRenderer::new()),
            Arc::new(LoggingDispatch),
            config,
        )
    }

    fn emulator(id: &str) -> Arc<EmulatorPanel> {
        Arc::new(EmulatorPanel::new(id, PanelGeometry::new(5, 15)))
    }

    #[tokio::test]
    async fn test_duplicate_device_rejected() {
        let c = controller(&HubConfig::default());
        let panel = emulator("a");
        c.add_device(panel.clone()).await.unwrap();
        assert!(matches!(
            c.add_device(panel).await,
            Err(HubError::DuplicateDevice(_))
        ));
        assert_eq!(c.handlers().len(), 1);
    }

    #[tokio::test]
    async fn test_new_surface_gets_auto_group() {
        let c = controller(&HubConfig::default());
        c.add_device(emulator("a")).await.unwrap();
        let group = c.group("emulator:a").unwrap();
        assert!(group.is_auto());
        assert_eq!(group.current_page(), 1);
        assert_eq!(c.current_page("emulator:a").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_initial_lock_follows_policy() {
        let mut config = HubConfig::default();
        config.lockout.pin_enable = true;
        config.lockout.pin = "1234".into();
        let c = controller(&config);
        let handler = c.add_device(emulator("a")).await.unwrap();
        assert!(handler.is_locked());

        config.lockout.pin_enable = false;
        let c = controller(&config);
        let handler = c.add_device(emulator("b")).await.unwrap();
        assert!(!handler.is_locked());
    }

    #[tokio::test]
    async fn test_group_membership_round_trip() {
        let c = controller(&HubConfig::default());
        c.add_device(emulator("a")).await.unwrap();
        let gid = c.create_group("Desk").unwrap();

        c.add_to_group("emulator:a", &gid).unwrap();
        assert!(c.group("emulator:a").is_none());
        assert_eq!(c.group(&gid).unwrap().surface_ids(), vec!["emulator:a"]);
        assert_eq!(c.set_page("emulator:a", 6).unwrap(), 6);
        assert_eq!(c.current_page(&gid).unwrap(), 6);

        c.remove_from_group("emulator:a").unwrap();
        assert!(c.group(&gid).unwrap().is_empty());
        assert!(c.group("emulator:a").unwrap().is_auto());
    }

    #[tokio::test]
    async fn test_delete_group_returns_members_to_auto_groups() {
        let c = controller(&HubConfig::default());
        c.add_device(emulator("a")).await.unwrap();
        let gid = c.create_group("Desk").unwrap();
        c.add_to_group("emulator:a", &gid).unwrap();

        assert!(matches!(
            c.delete_group("emulator:a"),
            Err(HubError::UnknownGroup(_))
        ));
        c.delete_group(&gid).unwrap();
        assert!(c.group(&gid).is_none());
        assert!(c.group("emulator:a").unwrap().is_auto());
        assert!(matches!(
            c.delete_group("emulator:a"),
            Err(HubError::AutoGroupNotDeletable(_))
        ));
    }

    #[tokio::test]
    async fn test_cannot_add_to_auto_group() {
        let c = controller(&HubConfig::default());
        c.add_device(emulator("a")).await.unwrap();
        c.add_device(emulator("b")).await.unwrap();
        assert!(matches!(
            c.add_to_group("emulator:b", "emulator:a"),
            Err(HubError::AutoGroupOccupied(_))
        ));
    }

    #[tokio::test]
    async fn test_lockout_timer_follows_settings() {
        let c = controller(&HubConfig::default());
        assert!(!c.lockout_timer_running());

        let settings = LockoutSettings {
            pin_enable: true,
            pin: "1".into(),
            pin_timeout_secs: 30,
            ..Default::default()
        };
        c.update_lockout_settings(settings.clone());
        assert!(c.lockout_timer_running());
        c.update_lockout_settings(settings);
        assert!(c.lockout_timer_running());

        c.update_lockout_settings(LockoutSettings::default());
        assert!(!c.lockout_timer_running());
    }

    const IDLE: Duration = Duration::from_secs(61);

    fn pin_config(linked: bool, policy: LinkedPolicy) -> HubConfig {
        let mut config = HubConfig::default();
        config.lockout = LockoutSettings {
            pin_enable: true,
            pin: "1234".into(),
            pin_timeout_secs: 60,
            link_lockouts: linked,
            linked_policy: policy,
        };
        config
    }

    #[tokio::test]
    async fn test_idle_surface_locks_alone() {
        let c = controller(&pin_config(false, LinkedPolicy::Any));
        let a = c.add_device(emulator("a")).await.unwrap();
        let b = c.add_device(emulator("b")).await.unwrap();
        c.set_surface_locked("emulator:a", false).unwrap();
        c.set_surface_locked("emulator:b", false).unwrap();

        c.check_lockouts();
        assert!(!a.is_locked());
        assert!(!b.is_locked());

        a.backdate_interaction(IDLE);
        c.check_lockouts();
        assert!(a.is_locked());
        assert!(!b.is_locked());
    }

    #[tokio::test]
    async fn test_linked_any_locks_everything() {
        let c = controller(&pin_config(true, LinkedPolicy::Any));
        let a = c.add_device(emulator("a")).await.unwrap();
        let b = c.add_device(emulator("b")).await.unwrap();
        assert!(c.set_all_locked(false));

        c.check_lockouts();
        assert!(!a.is_locked());

        b.backdate_interaction(IDLE);
        c.check_lockouts();
        assert!(a.is_locked());
        assert!(b.is_locked());
    }

    #[tokio::test]
    async fn test_linked_all_waits_for_every_surface() {
        let c = controller(&pin_config(true, LinkedPolicy::All));
        let a = c.add_device(emulator("a")).await.unwrap();
        let b = c.add_device(emulator("b")).await.unwrap();
        assert!(c.set_all_locked(false));

        a.backdate_interaction(IDLE);
        c.check_lockouts();
        assert!(!a.is_locked());
        assert!(!b.is_locked());

        b.backdate_interaction(IDLE);
        c.check_lockouts();
        assert!(a.is_locked());
        assert!(b.is_locked());
    }

    #[tokio::test]
    async fn test_never_lock_surface_ignored_by_timeout() {
        for linked in [false, true] {
            let c = controller(&pin_config(linked, LinkedPolicy::All));
            let a = c.add_device(emulator("a")).await.unwrap();
            let b = c.add_device(emulator("b")).await.unwrap();
            c.set_panel_config(
                "emulator:b",
                PanelConfig {
                    never_lock: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
            c.set_all_locked(false);
            c.set_surface_locked("emulator:a", false).unwrap();

            // Only `a` counts, so its timeout alone satisfies All
            a.backdate_interaction(IDLE);
            c.check_lockouts();
            assert!(a.is_locked(), "linked={linked}");
            assert!(!b.is_locked(), "linked={linked}");

            b.backdate_interaction(IDLE);
            c.check_lockouts();
            assert!(!b.is_locked(), "linked={linked}");
        }
    }

    #[tokio::test]
    async fn test_offline_surfaces_listed() {
        let c = controller(&HubConfig::default());
        c.add_device(emulator("a")).await.unwrap();
        c.add_device(emulator("b")).await.unwrap();
        assert!(c.remove_device("emulator:b").await);

        let listing = c.devices_list();
        let ids: Vec<_> = listing.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["emulator:a", "emulator:b"]);
        assert!(listing[0].surfaces[0].is_connected);
        assert!(!listing[1].surfaces[0].is_connected);

        assert!(matches!(
            c.forget_surface("emulator:a"),
            Err(HubError::SurfaceConnected(_))
        ));
        c.forget_surface("emulator:b").unwrap();
        assert_eq!(c.devices_list().len(), 1);
    }
}
