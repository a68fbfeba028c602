//! Coordinate mapping between panel-local key indexes, grid positions and
//! legacy bank numbers
//!
//! Panels number their keys linearly, row by row. The hub addresses buttons
//! by (column, row). Older wire protocols (TCP, OSC, Rosstalk, satellite)
//! still use 1-based bank numbers from the fixed 8x4 layout; the conversions
//! here are the compatibility seam for them and must not change silently.

use serde::{Deserialize, Serialize};
use surface_transport::{PanelGeometry, Rotation};

/// A (column, row) position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridPoint {
    pub x: u32,
    pub y: u32,
}

impl GridPoint {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Columns of the historical bank layout
pub const LEGACY_COLUMNS: u32 = 8;
/// Rows of the historical bank layout
pub const LEGACY_ROWS: u32 = 4;
/// Highest legacy bank number
pub const LEGACY_BANK_COUNT: u32 = LEGACY_COLUMNS * LEGACY_ROWS;

/// Position of a panel-local key index
///
/// Returns None for indexes past the last key or a panel without columns.
pub fn panel_index_to_xy(index: u32, geometry: PanelGeometry) -> Option<GridPoint> {
    if geometry.keys_per_row == 0 || index >= geometry.keys_total {
        return None;
    }
    Some(GridPoint::new(
        index % geometry.keys_per_row,
        index / geometry.keys_per_row,
    ))
}

/// Panel-local key index of a position
pub fn xy_to_panel_index(point: GridPoint, geometry: PanelGeometry) -> Option<u32> {
    if point.x >= geometry.keys_per_row {
        return None;
    }
    let index = point
        .y
        .checked_mul(geometry.keys_per_row)?
        .checked_add(point.x)?;
    (index < geometry.keys_total).then_some(index)
}

/// 1-based legacy bank number for a position on the 8x4 layout
pub fn xy_to_legacy_bank(point: GridPoint) -> Option<u32> {
    if point.x >= LEGACY_COLUMNS || point.y >= LEGACY_ROWS {
        return None;
    }
    Some(point.y * LEGACY_COLUMNS + point.x + 1)
}

/// Position on the 8x4 layout for a 1-based legacy bank number
pub fn legacy_bank_to_xy(bank: u32) -> Option<GridPoint> {
    if bank == 0 || bank > LEGACY_BANK_COUNT {
        return None;
    }
    let index = bank - 1;
    Some(GridPoint::new(index % LEGACY_COLUMNS, index / LEGACY_COLUMNS))
}

/// Column/row counts of a panel once its rotation is applied
pub fn logical_size(geometry: PanelGeometry, rotation: Rotation) -> (u32, u32) {
    let (columns, rows) = (geometry.columns(), geometry.rows());
    if rotation.is_quarter_turn() {
        (rows, columns)
    } else {
        (columns, rows)
    }
}

/// Translate a device position into the panel's rotated (logical) frame
pub fn rotate_to_logical(
    point: GridPoint,
    geometry: PanelGeometry,
    rotation: Rotation,
) -> Option<GridPoint> {
    let (columns, rows) = (geometry.columns(), geometry.rows());
    if point.x >= columns || point.y >= rows {
        return None;
    }
    let rotated = match rotation {
        Rotation::None => point,
        Rotation::Cw90 => GridPoint::new(rows - 1 - point.y, point.x),
        Rotation::Half => GridPoint::new(columns - 1 - point.x, rows - 1 - point.y),
        Rotation::Cw270 => GridPoint::new(point.y, columns - 1 - point.x),
    };
    Some(rotated)
}

/// Translate a logical position back into device coordinates
pub fn rotate_to_device(
    point: GridPoint,
    geometry: PanelGeometry,
    rotation: Rotation,
) -> Option<GridPoint> {
    let (columns, rows) = (geometry.columns(), geometry.rows());
    let (logical_columns, logical_rows) = logical_size(geometry, rotation);
    if point.x >= logical_columns || point.y >= logical_rows {
        return None;
    }
    let device = match rotation {
        Rotation::None => point,
        Rotation::Cw90 => GridPoint::new(point.y, rows - 1 - point.x),
        Rotation::Half => GridPoint::new(columns - 1 - point.x, rows - 1 - point.y),
        Rotation::Cw270 => GridPoint::new(columns - 1 - point.y, point.x),
    };
    Some(device)
}
