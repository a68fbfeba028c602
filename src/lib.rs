//! Surface hub - one logical button grid on many control surfaces
//!
//! The [`SurfaceController`] owns a [`SurfaceHandler`] per attached panel and
//! arranges them into [`SurfaceGroup`]s that share a page cursor. Handlers
//! translate between grid coordinates and device key indexes, push rendered
//! images through a bounded [`ImageWriteQueue`], and gate input behind a PIN
//! lock. Panel I/O lives behind `surface_transport::PanelDriver`.

pub mod config;
pub mod context;
pub mod controller;
pub mod coords;
pub mod error;
pub mod group;
pub mod handler;
pub mod lock;
pub mod page;
pub mod redraw;
pub mod services;
pub mod snapshot;
pub mod store;
pub mod write_queue;

pub use config::{HubConfig, LinkedPolicy, LockoutSettings};
pub use controller::SurfaceController;
pub use coords::GridPoint;
pub use error::{HubError, Result};
pub use group::{GroupConfig, SurfaceGroup};
pub use handler::SurfaceHandler;
pub use lock::{LockState, PinLock};
pub use services::{ControlDispatch, HubEvent, LoggingDispatch, MemoryRenderer, RenderSource};
pub use snapshot::{GroupSummary, Patch, SurfaceSummary};
pub use store::{SledStore, SurfaceStore};
pub use write_queue::ImageWriteQueue;
