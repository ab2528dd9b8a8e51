// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer condition flags ("printer-state-reasons").
//
// Each flag is an independent condition owned by whichever subsystem observes
// it: the supply tracker owns the marker bits, the device arbitrator owns
// `OFFLINE`, identify owns `IDENTIFY_PRINTER_REQUESTED`, and drivers own the
// rest via their status callback.  Updates go through `apply` so that one
// owner never clobbers another owner's bits.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

use serde::{Deserialize, Serialize};

/// Bitmask of printer condition flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrinterReasons(u32);

impl PrinterReasons {
    pub const NONE: Self = Self(0);
    pub const OTHER: Self = Self(1 << 0);
    pub const COVER_OPEN: Self = Self(1 << 1);
    pub const INPUT_TRAY_MISSING: Self = Self(1 << 2);
    pub const MARKER_SUPPLY_EMPTY: Self = Self(1 << 3);
    pub const MARKER_SUPPLY_LOW: Self = Self(1 << 4);
    pub const MARKER_WASTE_ALMOST_FULL: Self = Self(1 << 5);
    pub const MARKER_WASTE_FULL: Self = Self(1 << 6);
    pub const MEDIA_EMPTY: Self = Self(1 << 7);
    pub const MEDIA_JAM: Self = Self(1 << 8);
    pub const MEDIA_LOW: Self = Self(1 << 9);
    pub const MEDIA_NEEDED: Self = Self(1 << 10);
    pub const OFFLINE: Self = Self(1 << 11);
    pub const SPOOL_AREA_FULL: Self = Self(1 << 12);
    pub const TONER_EMPTY: Self = Self(1 << 13);
    pub const TONER_LOW: Self = Self(1 << 14);
    pub const DOOR_OPEN: Self = Self(1 << 15);
    pub const IDENTIFY_PRINTER_REQUESTED: Self = Self(1 << 16);

    /// Bits owned by the supply tracker.
    pub const SUPPLY_MASK: Self = Self(
        Self::MARKER_SUPPLY_EMPTY.0
            | Self::MARKER_SUPPLY_LOW.0
            | Self::MARKER_WASTE_ALMOST_FULL.0
            | Self::MARKER_WASTE_FULL.0,
    );

    /// Keyword table, in bit order.
    const KEYWORDS: [(Self, &'static str); 17] = [
        (Self::OTHER, "other"),
        (Self::COVER_OPEN, "cover-open"),
        (Self::INPUT_TRAY_MISSING, "input-tray-missing"),
        (Self::MARKER_SUPPLY_EMPTY, "marker-supply-empty"),
        (Self::MARKER_SUPPLY_LOW, "marker-supply-low"),
        (Self::MARKER_WASTE_ALMOST_FULL, "marker-waste-almost-full"),
        (Self::MARKER_WASTE_FULL, "marker-waste-full"),
        (Self::MEDIA_EMPTY, "media-empty"),
        (Self::MEDIA_JAM, "media-jam"),
        (Self::MEDIA_LOW, "media-low"),
        (Self::MEDIA_NEEDED, "media-needed"),
        (Self::OFFLINE, "offline"),
        (Self::SPOOL_AREA_FULL, "spool-area-full"),
        (Self::TONER_EMPTY, "toner-empty"),
        (Self::TONER_LOW, "toner-low"),
        (Self::DOOR_OPEN, "door-open"),
        (Self::IDENTIFY_PRINTER_REQUESTED, "identify-printer-requested"),
    ];

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & ((1 << 17) - 1))
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Non-destructive update: `(self | add) & !remove`.
    #[must_use]
    pub const fn apply(self, add: Self, remove: Self) -> Self {
        Self((self.0 | add.0) & !remove.0)
    }

    /// IPP keywords for every set flag, or `["none"]` when empty.
    pub fn keywords(self) -> Vec<&'static str> {
        if self.is_empty() {
            return vec!["none"];
        }
        Self::KEYWORDS
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, kw)| *kw)
            .collect()
    }

    /// Parse a single IPP keyword.  Unknown keywords map to `None`.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        if keyword == "none" {
            return Some(Self::NONE);
        }
        Self::KEYWORDS
            .iter()
            .find(|(_, kw)| *kw == keyword)
            .map(|(flag, _)| *flag)
    }
}

impl BitOr for PrinterReasons {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PrinterReasons {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for PrinterReasons {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for PrinterReasons {
    type Output = Self;
    fn not(self) -> Self {
        Self::from_bits_truncate(!self.0)
    }
}

impl fmt::Display for PrinterReasons {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.keywords().join(","))
    }
}
