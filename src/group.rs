//! Surface groups - shared page cursors
//!
//! Every handler sits in exactly one group. An auto group wraps a single
//! ungrouped surface and stores its config inside that surface's record; a
//! manual group is stored on its own and may be empty.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::HubContext;
use crate::error::{HubError, Result};
use crate::handler::SurfaceHandler;
use crate::page::{decrease_page, increase_page, parse_page, wrap_page};

/// Persisted group settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default = "default_group_name")]
    pub name: String,
    #[serde(default = "default_page")]
    pub last_page: u32,
    #[serde(default = "default_page")]
    pub startup_page: u32,
    /// Start on the last shown page instead of `startup_page`
    #[serde(default = "default_use_last_page")]
    pub use_last_page: bool,
}

fn default_group_name() -> String {
    "Auto group".to_string()
}

fn default_page() -> u32 {
    1
}

fn default_use_last_page() -> bool {
    true
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            name: default_group_name(),
            last_page: default_page(),
            startup_page: default_page(),
            use_last_page: default_use_last_page(),
        }
    }
}

impl GroupConfig {
    /// Page a group opens on
    pub fn initial_page(&self) -> u32 {
        let page = if self.use_last_page {
            self.last_page
        } else {
            self.startup_page
        };
        wrap_page(page as i64)
    }
}

struct GroupState {
    config: GroupConfig,
    current_page: u32,
    /// Attached handlers; the controller owns them
    surfaces: Vec<Weak<SurfaceHandler>>,
}

pub struct SurfaceGroup {
    id: String,
    is_auto: bool,
    ctx: Arc<HubContext>,
    state: Mutex<GroupState>,
}

impl SurfaceGroup {
    /// Auto group for a surface, reusing the config nested in its record
    pub fn new_auto(surface_id: &str, ctx: Arc<HubContext>) -> Result<Self> {
        let record = ctx.store.surface(surface_id)?.unwrap_or_default();
        let config = match record.group_config {
            Some(config) => config,
            None => {
                let config = GroupConfig::default();
                ctx.store.update_surface(surface_id, |record| {
                    record.group_config = Some(config.clone())
                })?;
                config
            }
        };
        Ok(Self::with_config(surface_id, true, config, ctx))
    }

    /// Manual group, loaded from the group table or created with defaults
    pub fn new_manual(id: &str, name: Option<&str>, ctx: Arc<HubContext>) -> Result<Self> {
        let config = match ctx.store.group(id)? {
            Some(config) => config,
            None => {
                let config = GroupConfig {
                    name: name.unwrap_or("Group").to_string(),
                    ..Default::default()
                };
                ctx.store.set_group(id, &config)?;
                config
            }
        };
        Ok(Self::with_config(id, false, config, ctx))
    }

    fn with_config(id: &str, is_auto: bool, config: GroupConfig, ctx: Arc<HubContext>) -> Self {
        let current_page = config.initial_page();
        Self {
            id: id.to_string(),
            is_auto,
            ctx,
            state: Mutex::new(GroupState {
                config,
                current_page,
                surfaces: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_auto(&self) -> bool {
        self.is_auto
    }

    pub fn config(&self) -> GroupConfig {
        self.state.lock().config.clone()
    }

    pub fn name(&self) -> String {
        self.state.lock().config.name.clone()
    }

    pub fn current_page(&self) -> u32 {
        self.state.lock().current_page
    }

    /// Live attached handlers, in attach order
    pub fn surfaces(&self) -> Vec<Arc<SurfaceHandler>> {
        let mut st = self.state.lock();
        st.surfaces.retain(|weak| weak.strong_count() > 0);
        st.surfaces.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn surface_ids(&self) -> Vec<String> {
        self.surfaces().iter().map(|h| h.id().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces().is_empty()
    }

    /// Attach a handler and move it to the group's page
    ///
    /// An auto group only ever holds its own surface.
    pub fn attach_surface(&self, handler: &Arc<SurfaceHandler>) -> Result<()> {
        let page = {
            let mut st = self.state.lock();
            st.surfaces.retain(|weak| weak.strong_count() > 0);
            let already = st
                .surfaces
                .iter()
                .any(|weak| weak.upgrade().is_some_and(|h| h.id() == handler.id()));
            if !already {
                if self.is_auto && (!st.surfaces.is_empty() || handler.id() != self.id) {
                    return Err(HubError::AutoGroupOccupied(self.id.clone()));
                }
                st.surfaces.push(Arc::downgrade(handler));
            }
            st.current_page
        };
        debug!("Group {}: attached {}", self.id, handler.id());
        handler.set_current_page(page);
        Ok(())
    }

    /// Detach a handler. Returns true if it was attached.
    pub fn detach_surface(&self, surface_id: &str) -> bool {
        let mut st = self.state.lock();
        st.surfaces.retain(|weak| weak.strong_count() > 0);
        let before = st.surfaces.len();
        st.surfaces
            .retain(|weak| weak.upgrade().is_some_and(|h| h.id() != surface_id));
        let removed = st.surfaces.len() != before;
        if removed {
            debug!("Group {}: detached {}", self.id, surface_id);
        }
        removed
    }

    /// Move every attached surface to a page
    pub fn set_current_page(&self, page: u32) -> u32 {
        let page = wrap_page(page as i64);
        let surfaces = {
            let mut st = self.state.lock();
            st.current_page = page;
            st.config.last_page = page;
            st.surfaces.iter().filter_map(Weak::upgrade).collect::<Vec<_>>()
        };
        if let Err(e) = self.persist() {
            warn!("Group {}: failed to persist page: {}", self.id, e);
        }
        for handler in surfaces {
            handler.set_current_page(page);
        }
        page
    }

    pub fn increase_page(&self) -> u32 {
        self.set_current_page(increase_page(self.current_page()))
    }

    pub fn decrease_page(&self) -> u32 {
        self.set_current_page(decrease_page(self.current_page()))
    }

    /// Page up, honouring the flipped-direction setting
    pub fn do_page_up(&self) -> u32 {
        if self.ctx.page_direction_flipped() {
            self.decrease_page()
        } else {
            self.increase_page()
        }
    }

    pub fn do_page_down(&self) -> u32 {
        if self.ctx.page_direction_flipped() {
            self.increase_page()
        } else {
            self.decrease_page()
        }
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        self.state.lock().config.name = name.to_string();
        self.persist()
    }

    /// Change one setting from user input
    ///
    /// Keys: `use_last_page`, `startup_page`, `last_page` (also moves the
    /// group) and `name`.
    pub fn set_group_config_value(&self, key: &str, value: &str) -> Result<()> {
        match key {
            "use_last_page" => {
                let flag = parse_bool(value).ok_or_else(|| HubError::invalid(key, value))?;
                self.state.lock().config.use_last_page = flag;
            }
            "startup_page" => {
                let page = parse_page(value).ok_or_else(|| HubError::invalid(key, value))?;
                self.state.lock().config.startup_page = page;
            }
            "last_page" => {
                let page = parse_page(value).ok_or_else(|| HubError::invalid(key, value))?;
                self.set_current_page(page);
                return Ok(());
            }
            "name" => {
                self.state.lock().config.name = value.to_string();
            }
            _ => return Err(HubError::InvalidKey(key.to_string())),
        }
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let config = self.config();
        if self.is_auto {
            self.ctx.store.update_surface(&self.id, |record| {
                record.group_config = Some(config.clone())
            })?;
        } else {
            self.ctx.store.set_group(&self.id, &config)?;
        }
        Ok(())
    }

    /// Erase the stored config
    pub fn forget_config(&self) -> Result<()> {
        if self.is_auto {
            self.ctx
                .store
                .update_surface(&self.id, |record| record.group_config = None)?;
        } else {
            self.ctx.store.delete_group(&self.id)?;
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::services::{LoggingDispatch, MemoryRenderer};
    use crate::store::SurfaceStore;
    use crate::coords::GridPoint;
    use std::time::Duration;
    use surface_transport::{DrawKey, EmulatorPanel, PanelGeometry};

    fn context_with(flipped: bool, renderer: Arc<MemoryRenderer>) -> Arc<HubContext> {
        let mut config = HubConfig::default();
        config.paging.page_direction_flipped = flipped;
        let (ctx, _signals) = HubContext::new(
            SurfaceStore::in_memory(),
            renderer,
            Arc::new(LoggingDispatch),
            &config,
        );
        ctx
    }

    fn context(flipped: bool) -> Arc<HubContext> {
        context_with(flipped, Arc::new(MemoryRenderer::new()))
    }

    async fn attach(
        ctx: &Arc<HubContext>,
        id: &str,
    ) -> (Arc<SurfaceHandler>, Arc<EmulatorPanel>) {
        let panel = Arc::new(EmulatorPanel::new(id, PanelGeometry::new(5, 15)));
        let handler = SurfaceHandler::attach(panel.clone(), Arc::clone(ctx), false)
            .await
            .unwrap();
        (handler, panel)
    }

    async fn handler(ctx: &Arc<HubContext>, id: &str) -> Arc<SurfaceHandler> {
        attach(ctx, id).await.0
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_page_fans_out_to_all_surfaces() {
        let renderer = Arc::new(MemoryRenderer::new());
        let ctx = context_with(false, renderer.clone());
        let group = SurfaceGroup::new_manual("group:test", Some("Desk"), Arc::clone(&ctx)).unwrap();
        let (h1, p1) = attach(&ctx, "one").await;
        let (h2, p2) = attach(&ctx, "two").await;
        group.attach_surface(&h1).unwrap();
        group.attach_surface(&h2).unwrap();

        let image = MemoryRenderer::text_image("P5");
        renderer.set_image(5, GridPoint::new(1, 1), image.clone());

        assert_eq!(group.set_current_page(5), 5);
        assert_eq!(h1.current_page(), 5);
        assert_eq!(h2.current_page(), 5);
        assert_eq!(ctx.store.group("group:test").unwrap().unwrap().last_page, 5);

        // Both panels repaint from page 5
        wait_for(|| p1.image(DrawKey::local(6)) == Some(image.clone())).await;
        wait_for(|| p2.image(DrawKey::local(6)) == Some(image.clone())).await;
    }

    #[tokio::test]
    async fn test_auto_group_rejects_second_surface() {
        let ctx = context(false);
        let h1 = handler(&ctx, "one").await;
        let h2 = handler(&ctx, "two").await;
        let group = SurfaceGroup::new_auto(h1.id(), Arc::clone(&ctx)).unwrap();
        group.attach_surface(&h1).unwrap();
        assert!(matches!(
            group.attach_surface(&h2),
            Err(HubError::AutoGroupOccupied(_))
        ));
        // Re-attaching its own surface is harmless
        group.attach_surface(&h1).unwrap();
        assert_eq!(group.surface_ids(), vec!["emulator:one".to_string()]);
    }

    #[tokio::test]
    async fn test_auto_group_config_lives_in_surface_record() {
        let ctx = context(false);
        let h1 = handler(&ctx, "one").await;
        let group = SurfaceGroup::new_auto(h1.id(), Arc::clone(&ctx)).unwrap();
        group.attach_surface(&h1).unwrap();
        group.set_current_page(7);

        let record = ctx.store.surface("emulator:one").unwrap().unwrap();
        assert_eq!(record.group_config.unwrap().last_page, 7);
        assert_eq!(record.config.page, 7);

        // Recreated group resumes on the stored page
        let again = SurfaceGroup::new_auto(h1.id(), Arc::clone(&ctx)).unwrap();
        assert_eq!(again.current_page(), 7);

        again.forget_config().unwrap();
        let record = ctx.store.surface("emulator:one").unwrap().unwrap();
        assert_eq!(record.group_config, None);
    }

    #[tokio::test]
    async fn test_page_up_down_wrap_and_flip() {
        let ctx = context(false);
        let group = SurfaceGroup::new_manual("group:a", None, Arc::clone(&ctx)).unwrap();
        assert_eq!(group.do_page_down(), 99);
        assert_eq!(group.do_page_up(), 1);

        let flipped = SurfaceGroup::new_manual("group:b", None, context(true)).unwrap();
        assert_eq!(flipped.do_page_up(), 99);
    }

    #[tokio::test]
    async fn test_group_config_values() {
        let ctx = context(false);
        let group = SurfaceGroup::new_manual("group:a", None, Arc::clone(&ctx)).unwrap();

        group.set_group_config_value("use_last_page", "false").unwrap();
        group.set_group_config_value("startup_page", "12").unwrap();
        group.set_group_config_value("last_page", "100").unwrap();
        assert_eq!(group.current_page(), 1);

        let stored = ctx.store.group("group:a").unwrap().unwrap();
        assert!(!stored.use_last_page);
        assert_eq!(stored.startup_page, 12);
        assert_eq!(stored.initial_page(), 12);

        assert!(matches!(
            group.set_group_config_value("startup_page", "soon"),
            Err(HubError::InvalidValue { .. })
        ));
        // Extremes wrap like any other number
        group
            .set_group_config_value("startup_page", "-9223372036854775808")
            .unwrap();
        group
            .set_group_config_value("last_page", "9223372036854775807")
            .unwrap();
        let stored = ctx.store.group("group:a").unwrap().unwrap();
        assert!((1..=99).contains(&stored.startup_page));
        assert!((1..=99).contains(&group.current_page()));
        assert!(matches!(
            group.set_group_config_value("use_last_page", "maybe"),
            Err(HubError::InvalidValue { .. })
        ));
        assert!(matches!(
            group.set_group_config_value("colour", "red"),
            Err(HubError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_detach() {
        let ctx = context(false);
        let group = SurfaceGroup::new_manual("group:a", None, Arc::clone(&ctx)).unwrap();
        let h1 = handler(&ctx, "one").await;
        group.attach_surface(&h1).unwrap();
        assert!(group.detach_surface("emulator:one"));
        assert!(!group.detach_surface("emulator:one"));
        assert!(group.is_empty());
    }
}
