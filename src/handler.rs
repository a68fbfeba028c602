//! Surface handler
//!
//! One handler per connected panel. It owns the panel's page, offset and
//! lock state, turns device events into logical presses, and turns render
//! invalidations into draws through its [`ImageWriteQueue`].
//!
//! Coordinates pass through three frames:
//!
//! ```text
//! device key ──► device (x, y) ──rotation──► logical (x, y) ──+offset──► grid (x, y)
//! ```
//!
//! The PIN keypad is laid out in the device frame, so it stays put when a
//! panel is rotated.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use surface_transport::{
    family_or_generic, pin_layout_for, DeviceEvent, DrawKey, PanelConfig, PanelDriver,
    PanelGeometry, PanelInfo, RenderedImage, RotateDirection,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::GridLimits;
use crate::context::{HandlerSignal, HubContext};
use crate::coords::{
    logical_size, panel_index_to_xy, rotate_to_device, rotate_to_logical, xy_to_panel_index,
    GridPoint,
};
use crate::error::{HubError, Result};
use crate::lock::{LockState, PinLock, PinOutcome};
use crate::page::{offset_page, wrap_page};
use crate::redraw::RedrawBatcher;
use crate::services::{HubEvent, RenderInvalidation};
use crate::snapshot::SurfaceSummary;
use crate::write_queue::{ImageWriteQueue, WriteFuture, Writer};

struct HandlerState {
    name: String,
    page: u32,
    config: PanelConfig,
    lock: PinLock,
    /// Page each held key resolved to when it went down
    press_pages: HashMap<DrawKey, u32>,
    /// Additional page offsets the panel displays
    extra_pages: Vec<i32>,
    last_interaction: Instant,
    unloaded: bool,
}

/// Runtime binding of one panel to the logical grid
pub struct SurfaceHandler {
    id: String,
    driver: Arc<dyn PanelDriver>,
    ctx: Arc<HubContext>,
    queue: ImageWriteQueue<DrawKey, RenderedImage>,
    redraw: RedrawBatcher<i32>,
    state: Mutex<HandlerState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Keep a panel of the given geometry inside the grid
fn clamp_offsets(config: &mut PanelConfig, geometry: PanelGeometry, grid: GridLimits) {
    let (columns, rows) = logical_size(geometry, config.rotation);
    let (max_x, max_y) = grid.max_offset(columns, rows);
    config.x_offset = config.x_offset.min(max_x);
    config.y_offset = config.y_offset.min(max_y);
}

impl SurfaceHandler {
    /// Bind an opened panel
    ///
    /// Creates the device record on first sight, pushes the stored config to
    /// the driver and schedules a full redraw. The panel is left unloaded if
    /// the driver rejects its config.
    ///
    /// # Arguments
    /// * `driver` - Opened panel
    /// * `ctx` - Shared collaborators
    /// * `locked` - Initial lock state; ignored for never-lock panels
    pub async fn attach(
        driver: Arc<dyn PanelDriver>,
        ctx: Arc<HubContext>,
        locked: bool,
    ) -> Result<Arc<Self>> {
        let info = driver.info().clone();
        let id = info.device_id.clone();

        let record = ctx.store.update_surface(&id, |record| {
            if record.family.is_empty() {
                record.family = info.family.clone();
            }
            record.integration_type = Some(info.integration);
        })?;

        let mut config = record.config;
        clamp_offsets(&mut config, info.geometry, ctx.grid);
        config.page = wrap_page(config.page as i64);
        let locked = locked && !config.never_lock;

        let queue = ImageWriteQueue::new(
            id.clone(),
            ctx.queue.max_concurrency,
            Self::writer(&id, &driver, &ctx),
        );

        let handler = Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let redraw = RedrawBatcher::spawn(
                ctx.redraw.tick(),
                ctx.redraw.max_wait(),
                Box::new(move |offsets: Vec<i32>| -> BoxFuture<'static, ()> {
                    let weak = weak.clone();
                    Box::pin(async move {
                        if let Some(handler) = weak.upgrade() {
                            handler.redraw(offsets).await;
                        }
                    })
                }),
            );

            Self {
                id: id.clone(),
                driver: Arc::clone(&driver),
                ctx: Arc::clone(&ctx),
                queue,
                redraw,
                state: Mutex::new(HandlerState {
                    name: record.name,
                    page: config.page,
                    config: config.clone(),
                    lock: PinLock::new(locked),
                    press_pages: HashMap::new(),
                    extra_pages: Vec::new(),
                    last_interaction: Instant::now(),
                    unloaded: false,
                }),
                tasks: Mutex::new(Vec::new()),
            }
        });

        handler.start_tasks();

        if let Err(e) = handler.driver.set_config(&config, true).await {
            warn!("{}: rejected config: {}", id, e);
            handler.unload(false).await;
            return Err(e.into());
        }

        info!(
            "{}: attached {} ({}x{}, page {}{})",
            id,
            info.family,
            info.geometry.columns(),
            info.geometry.rows(),
            config.page,
            if locked { ", locked" } else { "" }
        );
        handler.request_redraw();
        Ok(handler)
    }

    /// Queue writer: forwards to the driver and reports lost panels
    fn writer(
        id: &str,
        driver: &Arc<dyn PanelDriver>,
        ctx: &Arc<HubContext>,
    ) -> Writer<DrawKey, RenderedImage> {
        let id = id.to_string();
        let driver = Arc::clone(driver);
        let ctx = Arc::clone(ctx);
        Arc::new(move |key: DrawKey, image: RenderedImage| -> WriteFuture {
            let id = id.clone();
            let driver = Arc::clone(&driver);
            let ctx = Arc::clone(&ctx);
            Box::pin(async move {
                match driver.draw(key, &image).await {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        if e.is_fatal() {
                            ctx.signal(HandlerSignal::Removed { surface_id: id });
                        }
                        Err(anyhow::Error::new(e).context(format!("drawing key {}", key.key)))
                    }
                }
            })
        })
    }

    fn start_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if let Some(rx) = self.driver.subscribe_events() {
            tasks.push(tokio::spawn(run_device_events(Arc::downgrade(self), rx)));
        }
        tasks.push(tokio::spawn(run_render_updates(
            Arc::downgrade(self),
            self.ctx.renderer.subscribe(),
        )));
    }

    // ---- accessors ----

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn info(&self) -> &PanelInfo {
        self.driver.info()
    }

    pub fn device_path(&self) -> &str {
        &self.driver.info().device_path
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn current_page(&self) -> u32 {
        self.state.lock().page
    }

    pub fn config(&self) -> PanelConfig {
        self.state.lock().config.clone()
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().lock.is_locked()
    }

    pub fn lock_state(&self) -> LockState {
        self.state.lock().lock.state()
    }

    pub fn never_lock(&self) -> bool {
        self.state.lock().config.never_lock
    }

    /// Time since the last press or rotation
    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_interaction.elapsed()
    }

    /// Pretend the last interaction happened `by` earlier
    #[cfg(test)]
    pub(crate) fn backdate_interaction(&self, by: Duration) {
        let mut st = self.state.lock();
        if let Some(earlier) = st.last_interaction.checked_sub(by) {
            st.last_interaction = earlier;
        }
    }

    pub fn is_unloaded(&self) -> bool {
        self.state.lock().unloaded
    }

    pub fn summary(&self) -> SurfaceSummary {
        let info = self.driver.info();
        let st = self.state.lock();
        SurfaceSummary {
            id: self.id.clone(),
            name: st.name.clone(),
            family: info.family.clone(),
            display_name: family_or_generic(&info.family).display_name.to_string(),
            integration_type: Some(info.integration),
            is_connected: true,
            location: info.location.clone(),
            config: st.config.clone(),
            locked: st.lock.is_locked(),
        }
    }

    // ---- coordinate translation ----

    /// Device key for a grid position, if this panel shows it
    fn grid_to_key(&self, point: GridPoint, config: &PanelConfig) -> Option<u32> {
        let geometry = self.driver.info().geometry;
        let logical = GridPoint::new(
            point.x.checked_sub(config.x_offset)?,
            point.y.checked_sub(config.y_offset)?,
        );
        let device = rotate_to_device(logical, geometry, config.rotation)?;
        xy_to_panel_index(device, geometry)
    }

    /// Grid position of a device key, if it falls inside the grid
    fn key_to_grid(&self, key: u32, config: &PanelConfig) -> Option<GridPoint> {
        let geometry = self.driver.info().geometry;
        let device = panel_index_to_xy(key, geometry)?;
        let logical = rotate_to_logical(device, geometry, config.rotation)?;
        let point = GridPoint::new(logical.x + config.x_offset, logical.y + config.y_offset);
        (point.x < self.ctx.grid.columns && point.y < self.ctx.grid.rows).then_some(point)
    }

    // ---- render path ----

    /// A button image changed
    ///
    /// Returns true if a draw was queued.
    pub fn on_render_invalidated(&self, page: u32, point: GridPoint, image: &RenderedImage) -> bool {
        let (page_offset, key) = {
            let st = self.state.lock();
            if st.unloaded || st.lock.is_locked() {
                return false;
            }
            let page_offset = if page == st.page {
                0
            } else {
                match st
                    .extra_pages
                    .iter()
                    .find(|offset| offset_page(st.page, **offset) == page)
                {
                    Some(offset) => *offset,
                    None => return false,
                }
            };
            let Some(key) = self.grid_to_key(point, &st.config) else {
                return false;
            };
            (page_offset, key)
        };

        self.queue
            .submit(DrawKey { page_offset, key }, image.clone());
        true
    }

    /// Schedule a full redraw of every displayed page
    pub fn request_redraw(&self) {
        let extra = self.state.lock().extra_pages.clone();
        self.redraw.mark(0);
        for offset in extra {
            self.redraw.mark(offset);
        }
    }

    async fn redraw(&self, mut offsets: Vec<i32>) {
        let (locked, page, config, extra, entry) = {
            let st = self.state.lock();
            if st.unloaded {
                return;
            }
            (
                st.lock.is_locked(),
                st.page,
                st.config.clone(),
                st.extra_pages.clone(),
                st.lock.entry().to_string(),
            )
        };

        if locked {
            self.draw_lock_screen(&entry, &extra).await;
            return;
        }

        offsets.sort_unstable();
        offsets.dedup();
        let keys_total = self.driver.info().geometry.keys_total;
        for offset in offsets {
            if offset != 0 && !extra.contains(&offset) {
                continue;
            }
            let images = self.ctx.renderer.page_images(offset_page(page, offset));
            for key in 0..keys_total {
                let image = self
                    .key_to_grid(key, &config)
                    .and_then(|point| images.get(&point).cloned())
                    .unwrap_or_else(RenderedImage::blank);
                self.queue.submit(
                    DrawKey {
                        page_offset: offset,
                        key,
                    },
                    image,
                );
            }
        }
        debug!("{}: redrew page {}", self.id, page);
    }

    async fn draw_lock_screen(&self, entry: &str, extra: &[i32]) {
        if let Err(e) = self.driver.clear_deck().await {
            warn!("{}: clear failed: {}", self.id, e);
            if e.is_fatal() {
                self.ctx.signal(HandlerSignal::Removed {
                    surface_id: self.id.clone(),
                });
                return;
            }
        }

        let info = self.driver.info();
        let layout = pin_layout_for(&info.family, info.geometry);
        let images = self.ctx.renderer.pincode_images(entry);

        let mut screen = HashMap::new();
        for (digit, &(x, y)) in layout.digits.iter().enumerate() {
            if let (Some(key), Some(image)) = (
                xy_to_panel_index(GridPoint::new(x, y), info.geometry),
                images.digits.get(digit),
            ) {
                screen.insert(key, image.clone());
            }
        }
        let (x, y) = layout.code;
        if let Some(key) = xy_to_panel_index(GridPoint::new(x, y), info.geometry) {
            screen.insert(key, images.code);
        }

        // Every key is submitted so stale page images still queued get replaced
        for key in 0..info.geometry.keys_total {
            let image = screen.remove(&key).unwrap_or_else(RenderedImage::blank);
            self.queue.submit(DrawKey::local(key), image);
            for &page_offset in extra {
                self.queue
                    .submit(DrawKey { page_offset, key }, RenderedImage::blank());
            }
        }
        debug!("{}: drew lock screen", self.id);
    }

    fn draw_code_preview(&self, entry: &str) {
        let info = self.driver.info();
        let (x, y) = pin_layout_for(&info.family, info.geometry).code;
        if let Some(key) = xy_to_panel_index(GridPoint::new(x, y), info.geometry) {
            let code = self.ctx.renderer.pincode_images(entry).code;
            self.queue.submit(DrawKey::local(key), code);
        }
    }

    // ---- input path ----

    pub fn handle_device_event(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::Click {
                key,
                pressed,
                page_offset,
            } => {
                self.on_device_click(key, pressed, page_offset);
            }
            DeviceEvent::Rotate {
                key,
                direction,
                page_offset,
            } => {
                self.on_device_rotate(key, direction, page_offset);
            }
            DeviceEvent::Remove => {
                info!("{}: panel removed", self.id);
                self.ctx.signal(HandlerSignal::Removed {
                    surface_id: self.id.clone(),
                });
            }
            DeviceEvent::SetVariable { name, value } => {
                self.ctx.controls.set_custom_variable(&name, &value);
            }
            DeviceEvent::SubscribeExtraPages { offsets } => self.set_extra_pages(offsets),
        }
    }

    /// Key pressed or released on the panel
    ///
    /// The page is resolved when the key goes down and reused when it comes
    /// back up, so a release always reaches the control its press did.
    /// Returns whether a control handled it.
    pub fn on_device_click(&self, key: u32, pressed: bool, page_offset: Option<i32>) -> bool {
        let info = self.driver.info();
        let Some(device) = panel_index_to_xy(key, info.geometry) else {
            debug!("{}: click on unknown key {}", self.id, key);
            return false;
        };

        let mut st = self.state.lock();
        if st.unloaded {
            return false;
        }
        st.last_interaction = Instant::now();

        if st.lock.is_locked() {
            if !pressed {
                return false;
            }
            let layout = pin_layout_for(&info.family, info.geometry);
            let digit = layout.digit_at(device.x, device.y);
            let outcome = st.lock.press(digit, &self.ctx.pin());
            let entry = st.lock.entry().to_string();
            drop(st);
            self.on_pin_outcome(outcome, &entry);
            return false;
        }

        let Some(point) = self.key_to_grid(key, &st.config) else {
            return false;
        };
        let origin = DrawKey {
            page_offset: page_offset.unwrap_or(0),
            key,
        };
        let page = if pressed {
            let page = offset_page(st.page, origin.page_offset);
            st.press_pages.insert(origin, page);
            page
        } else {
            let current = st.page;
            st.press_pages
                .remove(&origin)
                .unwrap_or_else(|| offset_page(current, origin.page_offset))
        };
        drop(st);

        self.ctx
            .controls
            .press_control(page, point, pressed, &self.id)
    }

    /// Encoder turned; resolves its page like a key press
    pub fn on_device_rotate(
        &self,
        key: u32,
        direction: RotateDirection,
        page_offset: Option<i32>,
    ) -> bool {
        let (page, point) = {
            let mut st = self.state.lock();
            if st.unloaded || st.lock.is_locked() {
                return false;
            }
            st.last_interaction = Instant::now();
            let Some(point) = self.key_to_grid(key, &st.config) else {
                return false;
            };
            (offset_page(st.page, page_offset.unwrap_or(0)), point)
        };
        self.ctx
            .controls
            .rotate_control(page, point, direction, &self.id)
    }

    fn on_pin_outcome(&self, outcome: PinOutcome, entry: &str) {
        match outcome {
            PinOutcome::Unlocked => {
                info!("{}: unlocked by PIN", self.id);
                self.ctx.emit(HubEvent::LockChanged {
                    surface_id: self.id.clone(),
                    locked: false,
                });
                self.ctx.signal(HandlerSignal::Unlocked {
                    surface_id: self.id.clone(),
                });
                self.request_redraw();
            }
            PinOutcome::Digit(_) | PinOutcome::Cleared => self.draw_code_preview(entry),
            PinOutcome::Ignored => {}
        }
    }

    fn set_extra_pages(&self, mut offsets: Vec<i32>) {
        offsets.retain(|offset| *offset != 0);
        offsets.sort_unstable();
        offsets.dedup();
        debug!("{}: extra pages {:?}", self.id, offsets);
        self.state.lock().extra_pages = offsets.clone();
        for offset in offsets {
            self.redraw.mark(offset);
        }
    }

    // ---- state changes ----

    /// Lock or unlock the panel
    ///
    /// Never-lock panels refuse to lock. Returns true if the locked flag
    /// changed.
    pub fn set_locked(&self, locked: bool) -> bool {
        let (changed, redraw, held) = {
            let mut st = self.state.lock();
            if st.unloaded || (locked && st.config.never_lock) {
                return false;
            }
            let before = st.lock.state();
            let changed = if locked {
                st.lock.lock()
            } else {
                st.last_interaction = Instant::now();
                st.lock.unlock()
            };
            // Keys still down would never see their release behind the lock
            // screen, so release them now
            let held: Vec<_> = if locked && changed {
                let pressed: Vec<_> = st.press_pages.drain().collect();
                pressed
                    .into_iter()
                    .filter_map(|(origin, page)| {
                        Some((page, self.key_to_grid(origin.key, &st.config)?))
                    })
                    .collect()
            } else {
                Vec::new()
            };
            (changed, st.lock.state() != before, held)
        };

        for (page, point) in held {
            self.ctx.controls.press_control(page, point, false, &self.id);
        }

        if changed {
            debug!("{}: {}", self.id, if locked { "locked" } else { "unlocked" });
            self.ctx.emit(HubEvent::LockChanged {
                surface_id: self.id.clone(),
                locked,
            });
        }
        if redraw {
            self.request_redraw();
        }
        changed
    }

    /// Show a page, wrapping into 1..=99. Persists and redraws.
    pub fn set_current_page(&self, page: u32) -> u32 {
        let page = wrap_page(page as i64);
        {
            let mut st = self.state.lock();
            if st.unloaded {
                return st.page;
            }
            st.page = page;
            st.config.page = page;
        }

        if let Err(e) = self
            .ctx
            .store
            .update_surface(&self.id, |record| record.config.page = page)
        {
            warn!("{}: failed to persist page: {}", self.id, e);
        }
        self.ctx.emit(HubEvent::PageChanged {
            surface_id: self.id.clone(),
            page,
        });
        self.request_redraw();
        page
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        self.state.lock().name = name.to_string();
        self.ctx
            .store
            .update_surface(&self.id, |record| record.name = name.to_string())?;
        self.ctx.signal(HandlerSignal::Changed {
            surface_id: self.id.clone(),
        });
        Ok(())
    }

    /// Replace the panel config
    ///
    /// Offsets are clamped so the panel stays on the grid and the page is
    /// kept (pages belong to the group). Redraws if the layout or lock
    /// behaviour changed.
    pub async fn set_panel_config(&self, mut config: PanelConfig) -> Result<PanelConfig> {
        clamp_offsets(&mut config, self.driver.info().geometry, self.ctx.grid);

        let (layout_changed, unlocked) = {
            let mut st = self.state.lock();
            if st.unloaded {
                return Err(HubError::UnknownSurface(self.id.clone()));
            }
            config.page = st.page;
            let old = std::mem::replace(&mut st.config, config.clone());
            let layout_changed = old.x_offset != config.x_offset
                || old.y_offset != config.y_offset
                || old.rotation != config.rotation
                || old.never_lock != config.never_lock;
            let unlocked = config.never_lock && st.lock.unlock();
            (layout_changed, unlocked)
        };

        self.ctx
            .store
            .update_surface(&self.id, |record| record.config = config.clone())?;

        if unlocked {
            self.ctx.emit(HubEvent::LockChanged {
                surface_id: self.id.clone(),
                locked: false,
            });
        }
        if layout_changed || unlocked {
            self.request_redraw();
        }
        self.ctx.signal(HandlerSignal::Changed {
            surface_id: self.id.clone(),
        });

        if let Err(e) = self.driver.set_config(&config, false).await {
            warn!("{}: driver rejected config: {}", self.id, e);
            self.ctx.signal(HandlerSignal::Removed {
                surface_id: self.id.clone(),
            });
            return Err(e.into());
        }
        Ok(config)
    }

    /// Back to default settings, keeping the page
    pub async fn reset_config(&self) -> Result<PanelConfig> {
        self.set_panel_config(PanelConfig::default()).await
    }

    /// Detach from the render source and release the panel
    ///
    /// Writes already in flight may still land; nothing new is queued. With
    /// `purge` the device record is erased as well. Safe to call twice.
    pub async fn unload(&self, purge: bool) {
        {
            let mut st = self.state.lock();
            if st.unloaded {
                return;
            }
            st.unloaded = true;
            st.lock.remove();
            st.press_pages.clear();
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.redraw.shutdown();
        self.queue.close();

        if let Err(e) = self.driver.quit().await {
            debug!("{}: quit failed: {}", self.id, e);
        }
        if purge {
            if let Err(e) = self.ctx.store.delete_surface(&self.id) {
                warn!("{}: failed to purge record: {}", self.id, e);
            }
        }
        info!("{}: unloaded", self.id);
    }
}

impl Drop for SurfaceHandler {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn run_device_events(handler: Weak<SurfaceHandler>, mut rx: broadcast::Receiver<DeviceEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!("Dropped {} device events", n);
                continue;
            }
            // Sender gone means the driver is gone
            Err(RecvError::Closed) => DeviceEvent::Remove,
        };
        let Some(handler) = handler.upgrade() else {
            break;
        };
        let removed = event == DeviceEvent::Remove;
        handler.handle_device_event(event);
        if removed {
            break;
        }
    }
}

async fn run_render_updates(
    handler: Weak<SurfaceHandler>,
    mut rx: broadcast::Receiver<RenderInvalidation>,
) {
    loop {
        match rx.recv().await {
            Ok(update) => {
                let Some(handler) = handler.upgrade() else {
                    break;
                };
                handler.on_render_invalidated(update.page, update.point, &update.image);
            }
            Err(RecvError::Lagged(n)) => {
                let Some(handler) = handler.upgrade() else {
                    break;
                };
                debug!("{}: missed {} invalidations, redrawing", handler.id, n);
                handler.request_redraw();
            }
            Err(RecvError::Closed) => break,
        }
    }
}
