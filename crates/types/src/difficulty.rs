// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of OpenLattice.

// OpenLattice is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// OpenLattice is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with OpenLattice.  If not, see <http://www.gnu.org/licenses/>.

//! Difficulty/multiplier conversions.
//!
//! A difficulty is a 64-bit threshold a work value must meet or exceed. The
//! multiplier expresses how much harder (or easier) a difficulty is relative
//! to a base: `multiplier = (2^64 - base) / (2^64 - difficulty)`.

const TWO_POW_64: f64 = 18_446_744_073_709_551_616.0;

/// Relative difficulty of `difficulty` against `base`. `difficulty` zero is
/// rejected; there is no meaningful multiplier for the empty threshold.
pub fn to_multiplier(difficulty: u64, base: u64) -> f64 {
    assert!(difficulty > 0);
    base.wrapping_neg() as f64 / difficulty.wrapping_neg() as f64
}

/// Difficulty that is `multiplier` times as hard as `base`, saturating at 0
/// and `u64::MAX`.
pub fn from_multiplier(multiplier: f64, base: u64) -> u64 {
    assert!(multiplier > 0f64);
    let reverse = base.wrapping_neg() as f64 / multiplier;
    if reverse >= TWO_POW_64 {
        0
    } else {
        (reverse.round() as u64).wrapping_neg()
    }
}
