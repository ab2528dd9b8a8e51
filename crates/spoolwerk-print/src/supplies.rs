// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Supply level arithmetic and supply-derived printer reasons.
//
// Levels are percentages.  Consumables (ink, toner) run down towards 0;
// accumulators (waste tanks) fill up towards 100.  Whatever the policy,
// stored levels always end within 0..=100.

use serde::{Deserialize, Serialize};
use tracing::warn;

use spoolwerk_core::reasons::PrinterReasons;
use spoolwerk_core::types::Supply;

/// What happens when a delta pushes a level past its bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelPolicy {
    /// Saturate at the bound.
    #[default]
    Clamp,
    /// Simulate a refill: an empty consumable reads 100, an overflowing
    /// accumulator reads 0.
    Wrap,
}

/// Signed change to one supply's level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupplyDelta {
    pub index: usize,
    pub delta: i32,
}

impl SupplyDelta {
    pub fn new(index: usize, delta: i32) -> Self {
        Self { index, delta }
    }
}

/// Apply `deltas` in order.  Deltas naming a missing supply are skipped.
pub fn apply_deltas(supplies: &mut [Supply], deltas: &[SupplyDelta], policy: LevelPolicy) {
    for d in deltas {
        let Some(supply) = supplies.get_mut(d.index) else {
            warn!(index = d.index, count = supplies.len(), "supply delta for unknown index");
            continue;
        };
        let raw = supply.level.saturating_add(d.delta);
        let level = match policy {
            LevelPolicy::Wrap if supply.kind.is_waste() && raw > 100 => 0,
            LevelPolicy::Wrap if !supply.kind.is_waste() && raw < 0 => 100,
            _ => raw,
        };
        supply.level = level.clamp(0, 100);
    }
}

/// Reason flags implied by a single supply.
pub fn level_reasons(supply: &Supply) -> PrinterReasons {
    if supply.kind.is_waste() {
        match supply.level {
            100.. => PrinterReasons::MARKER_WASTE_FULL,
            90..=99 => PrinterReasons::MARKER_WASTE_ALMOST_FULL,
            _ => PrinterReasons::NONE,
        }
    } else if supply.is_consumable {
        match supply.level {
            ..=0 => PrinterReasons::MARKER_SUPPLY_EMPTY,
            1..=9 => PrinterReasons::MARKER_SUPPLY_LOW,
            _ => PrinterReasons::NONE,
        }
    } else {
        PrinterReasons::NONE
    }
}

/// Union of the reason flags implied by every supply.
pub fn supply_reasons(supplies: &[Supply]) -> PrinterReasons {
    supplies
        .iter()
        .fold(PrinterReasons::NONE, |acc, s| acc | level_reasons(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spoolwerk_core::types::{SupplyColor, SupplyType};

    fn ink(level: i32) -> Supply {
        Supply::new(SupplyColor::Black, "Black Ink", true, level, SupplyType::Ink)
    }

    fn waste(level: i32) -> Supply {
        Supply::new(SupplyColor::NoColor, "Waste Tank", false, level, SupplyType::WasteInk)
    }

    #[test]
    fn overdraw_clamps_to_empty_and_flags_it() {
        let mut supplies = vec![ink(5)];
        apply_deltas(&mut supplies, &[SupplyDelta::new(0, -8)], LevelPolicy::Clamp);
        assert_eq!(supplies[0].level, 0);
        assert_eq!(supply_reasons(&supplies), PrinterReasons::MARKER_SUPPLY_EMPTY);
    }

    #[test]
    fn levels_stay_in_range_for_every_delta() {
        for policy in [LevelPolicy::Clamp, LevelPolicy::Wrap] {
            for start in [0, 1, 50, 99, 100] {
                for delta in (-250..=250).step_by(7).chain([i32::MIN, i32::MAX]) {
                    let mut supplies = vec![ink(start), waste(start)];
                    apply_deltas(
                        &mut supplies,
                        &[SupplyDelta::new(0, delta), SupplyDelta::new(1, delta)],
                        policy,
                    );
                    for s in &supplies {
                        assert!((0..=100).contains(&s.level), "{policy:?} {start} {delta}");
                    }
                }
            }
        }
    }

    #[test]
    fn wrap_refills_consumables_and_empties_waste() {
        let mut supplies = vec![ink(3), waste(95)];
        apply_deltas(
            &mut supplies,
            &[SupplyDelta::new(0, -4), SupplyDelta::new(1, 6)],
            LevelPolicy::Wrap,
        );
        assert_eq!(supplies[0].level, 100);
        assert_eq!(supplies[1].level, 0);
    }

    #[test]
    fn reason_thresholds_cover_every_level() {
        for level in 0..=100 {
            let consumable = level_reasons(&ink(level));
            let expected = match level {
                0 => PrinterReasons::MARKER_SUPPLY_EMPTY,
                1..=9 => PrinterReasons::MARKER_SUPPLY_LOW,
                _ => PrinterReasons::NONE,
            };
            assert_eq!(consumable, expected, "ink at {level}");

            let accumulator = level_reasons(&waste(level));
            let expected = match level {
                100 => PrinterReasons::MARKER_WASTE_FULL,
                90..=99 => PrinterReasons::MARKER_WASTE_ALMOST_FULL,
                _ => PrinterReasons::NONE,
            };
            assert_eq!(accumulator, expected, "waste at {level}");
        }
    }

    #[test]
    fn unknown_index_is_ignored() {
        let mut supplies = vec![ink(50)];
        apply_deltas(&mut supplies, &[SupplyDelta::new(3, -10)], LevelPolicy::Clamp);
        assert_eq!(supplies[0].level, 50);
    }
}
