//! Hardware family registry - geometry and lock-screen layout per panel family
//!
//! Drivers report a family name in `PanelInfo::family`. The handler uses the
//! family to find where the PIN digits sit on the physical keys, since the
//! keypad layout has to be adapted to each panel's shape.

use crate::types::PanelGeometry;

/// Where the ten PIN digits and the entered-code preview are drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinLayout {
    /// Device-local (column, row) for digits 0..=9; index is the digit
    pub digits: [(u32, u32); 10],
    /// Device-local (column, row) showing the entered code
    pub code: (u32, u32),
}

impl PinLayout {
    /// Digit shown at a device-local position, if any
    pub fn digit_at(&self, x: u32, y: u32) -> Option<u8> {
        self.digits
            .iter()
            .position(|&pos| pos == (x, y))
            .map(|digit| digit as u8)
    }

    /// True if every digit and the code preview land on a real key
    pub fn fits(&self, geometry: PanelGeometry) -> bool {
        let on_panel = |&(x, y): &(u32, u32)| {
            x < geometry.keys_per_row
                && y.checked_mul(geometry.keys_per_row)
                    .and_then(|row| row.checked_add(x))
                    .is_some_and(|key| key < geometry.keys_total)
        };
        self.digits.iter().all(on_panel) && on_panel(&self.code)
    }
}

/// Numeric keypad layout for 5x3 and larger panels, 7-8-9 on top
pub const KEYPAD_LAYOUT: PinLayout = PinLayout {
    digits: [
        (4, 1), // 0
        (1, 2), // 1
        (2, 2), // 2
        (3, 2), // 3
        (1, 1), // 4
        (2, 1), // 5
        (3, 1), // 6
        (1, 0), // 7
        (2, 0), // 8
        (3, 0), // 9
    ],
    code: (0, 1),
};

/// Keypad centred on the 8x4 grid with zero on the bottom row
pub const WIDE_LAYOUT: PinLayout = PinLayout {
    digits: [
        (4, 3), // 0
        (3, 2), // 1
        (4, 2), // 2
        (5, 2), // 3
        (3, 1), // 4
        (4, 1), // 5
        (5, 1), // 6
        (3, 0), // 7
        (4, 0), // 8
        (5, 0), // 9
    ],
    code: (0, 0),
};

/// 4x3 panels: keypad on the right three columns, zero bottom left
pub const COMPACT_LAYOUT: PinLayout = PinLayout {
    digits: [
        (0, 2), // 0
        (1, 2), // 1
        (2, 2), // 2
        (3, 2), // 3
        (1, 1), // 4
        (2, 1), // 5
        (3, 1), // 6
        (1, 0), // 7
        (2, 0), // 8
        (3, 0), // 9
    ],
    code: (0, 0),
};

/// 3x2 panels: only digits 1-6 are reachable
pub const MINI_LAYOUT: PinLayout = PinLayout {
    digits: [
        (3, 0), // 0 (off-panel)
        (0, 1), // 1
        (1, 1), // 2
        (2, 1), // 3
        (0, 0), // 4
        (1, 0), // 5
        (2, 0), // 6
        (3, 1), // 7 (off-panel)
        (4, 0), // 8 (off-panel)
        (4, 1), // 9 (off-panel)
    ],
    code: (5, 0),
};

/// Known hardware family
#[derive(Debug, Clone, Copy)]
pub struct HardwareFamily {
    pub name: &'static str,
    pub display_name: &'static str,
    pub keys_per_row: u32,
    pub keys_total: u32,
    pub pin_layout: &'static PinLayout,
}

/// Fallback for panels that report an unknown family
pub const GENERIC_FAMILY: HardwareFamily = HardwareFamily {
    name: "generic",
    display_name: "Generic panel",
    keys_per_row: 5,
    keys_total: 15,
    pin_layout: &KEYPAD_LAYOUT,
};

/// All known families
/// Add new panels here as they are tested
pub const KNOWN_FAMILIES: &[HardwareFamily] = &[
    HardwareFamily {
        name: "emulator",
        display_name: "Emulator",
        keys_per_row: 8,
        keys_total: 32,
        pin_layout: &WIDE_LAYOUT,
    },
    HardwareFamily {
        name: "streamdeck-original",
        display_name: "Stream Deck",
        keys_per_row: 5,
        keys_total: 15,
        pin_layout: &KEYPAD_LAYOUT,
    },
    HardwareFamily {
        name: "streamdeck-xl",
        display_name: "Stream Deck XL",
        keys_per_row: 8,
        keys_total: 32,
        pin_layout: &WIDE_LAYOUT,
    },
    HardwareFamily {
        name: "streamdeck-mini",
        display_name: "Stream Deck Mini",
        keys_per_row: 3,
        keys_total: 6,
        pin_layout: &MINI_LAYOUT,
    },
    HardwareFamily {
        name: "loupedeck-live",
        display_name: "Loupedeck Live",
        keys_per_row: 4,
        keys_total: 12,
        pin_layout: &COMPACT_LAYOUT,
    },
    HardwareFamily {
        name: "satellite",
        display_name: "Satellite panel",
        keys_per_row: 8,
        keys_total: 32,
        pin_layout: &WIDE_LAYOUT,
    },
];

/// Find a family definition by name
pub fn find_family(name: &str) -> Option<&'static HardwareFamily> {
    KNOWN_FAMILIES.iter().find(|f| f.name == name)
}

/// Family definition for a name, falling back to the generic 5x3 layout
pub fn family_or_generic(name: &str) -> &'static HardwareFamily {
    find_family(name).unwrap_or(&GENERIC_FAMILY)
}

/// PIN layout for a family name
#[inline]
pub fn pin_layout(name: &str) -> &'static PinLayout {
    family_or_generic(name).pin_layout
}

/// Full keypads, largest first
const FALLBACK_LAYOUTS: [&PinLayout; 3] = [&WIDE_LAYOUT, &KEYPAD_LAYOUT, &COMPACT_LAYOUT];

/// PIN layout for a panel of a given family and shape
///
/// The family's own layout wins when all of its keys exist on the panel.
/// Otherwise (emulators and satellites can be any size) the layout of a known
/// family with the same shape is used, then the largest keypad that fits.
/// Panels too small for a full keypad get the partial mini layout.
pub fn pin_layout_for(name: &str, geometry: PanelGeometry) -> &'static PinLayout {
    let own = pin_layout(name);
    if own.fits(geometry) {
        return own;
    }
    KNOWN_FAMILIES
        .iter()
        .find(|f| f.keys_per_row == geometry.keys_per_row && f.keys_total == geometry.keys_total)
        .map(|f| f.pin_layout)
        .or_else(|| {
            FALLBACK_LAYOUTS
                .into_iter()
                .find(|layout| layout.fits(geometry))
        })
        .unwrap_or(&MINI_LAYOUT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_family_lookup() {
        let xl = find_family("streamdeck-xl").unwrap();
        assert_eq!(xl.keys_per_row, 8);
        assert_eq!(xl.keys_total, 32);
        assert!(find_family("toaster").is_none());
    }

    #[test]
    fn test_unknown_family_falls_back() {
        assert_eq!(family_or_generic("toaster").name, "generic");
        assert_eq!(pin_layout("toaster"), &KEYPAD_LAYOUT);
    }

    #[test]
    fn test_layout_digits_unique() {
        for family in KNOWN_FAMILIES {
            let digits = &family.pin_layout.digits;
            for (i, a) in digits.iter().enumerate() {
                for b in &digits[i + 1..] {
                    assert_ne!(a, b, "duplicate digit position in {}", family.name);
                }
                assert_ne!(*a, family.pin_layout.code, "{} code overlaps", family.name);
            }
        }
    }

    #[test]
    fn test_layout_follows_panel_shape() {
        // Emulators report one family whatever their size
        assert_eq!(pin_layout_for("emulator", PanelGeometry::new(8, 32)), &WIDE_LAYOUT);
        assert_eq!(pin_layout_for("emulator", PanelGeometry::new(5, 15)), &KEYPAD_LAYOUT);
        assert_eq!(pin_layout_for("emulator", PanelGeometry::new(4, 12)), &COMPACT_LAYOUT);
        assert_eq!(pin_layout_for("emulator", PanelGeometry::new(3, 6)), &MINI_LAYOUT);
        assert_eq!(pin_layout_for("emulator", PanelGeometry::new(10, 50)), &WIDE_LAYOUT);

        // A family whose layout fits keeps it
        assert_eq!(
            pin_layout_for("streamdeck-original", PanelGeometry::new(8, 32)),
            &KEYPAD_LAYOUT
        );
        assert_eq!(pin_layout_for("toaster", PanelGeometry::new(6, 18)), &KEYPAD_LAYOUT);
    }

    #[test]
    fn test_every_digit_reachable_on_keypad_panels() {
        for (columns, rows) in [(5, 3), (8, 4), (4, 3), (6, 5)] {
            let geometry = PanelGeometry::new(columns, columns * rows);
            let layout = pin_layout_for("emulator", geometry);
            let reachable: Vec<u8> = (0..geometry.keys_total)
                .filter_map(|key| layout.digit_at(key % columns, key / columns))
                .collect();
            for digit in 0..=9u8 {
                assert!(reachable.contains(&digit), "{digit} missing on {columns}x{rows}");
            }
        }
    }

    #[test]
    fn test_fits() {
        assert!(KEYPAD_LAYOUT.fits(PanelGeometry::new(5, 15)));
        assert!(!WIDE_LAYOUT.fits(PanelGeometry::new(5, 15)));
        // Short last row
        assert!(!KEYPAD_LAYOUT.fits(PanelGeometry::new(5, 13)));
        assert!(!MINI_LAYOUT.fits(PanelGeometry::new(3, 6)));
    }

    #[test]
    fn test_digit_at() {
        assert_eq!(KEYPAD_LAYOUT.digit_at(1, 2), Some(1));
        assert_eq!(KEYPAD_LAYOUT.digit_at(4, 1), Some(0));
        assert_eq!(KEYPAD_LAYOUT.digit_at(0, 0), None);
    }
}
