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

//! Protocol upgrade tags.
//!
//! An account's epoch gates feature availability and work thresholds. Epoch
//! upgrade blocks are state blocks whose link is one of a small set of
//! released ASCII tags and which are signed by a designated epoch signer
//! rather than the account owner.

use std::collections::HashMap;

use crate::numbers::{Account, Link};

/// Tag for which epoch an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Epoch {
    Invalid = 0,
    Unspecified = 1,
    Epoch0 = 2,
    Epoch1 = 3,
    Epoch2 = 4,
}

impl Epoch {
    pub const MAX: Epoch = Epoch::Epoch2;

    pub fn from_u8(value: u8) -> Option<Epoch> {
        match value {
            0 => Some(Epoch::Invalid),
            1 => Some(Epoch::Unspecified),
            2 => Some(Epoch::Epoch0),
            3 => Some(Epoch::Epoch1),
            4 => Some(Epoch::Epoch2),
            _ => None,
        }
    }

    /// This turns `Epoch0` into 0 for instance.
    pub fn normalized(self) -> u8 {
        debug_assert!(self >= Epoch::Epoch0);
        self as u8 - Epoch::Epoch0 as u8
    }

    /// Checks that `next` is exactly one version above `self`.
    pub fn is_sequential(self, next: Epoch) -> bool {
        self >= Epoch::Epoch0 && next as u8 == self as u8 + 1
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Epoch::Epoch0
    }
}

#[derive(Clone)]
struct EpochInfo {
    signer: Account,
    link: Link,
}

/// Registry of released epoch upgrades.
///
/// A legal block containing an epoch link is not necessarily an epoch block;
/// an identical link can be produced by sending to an address equal to the
/// tag. True epoch blocks are state blocks that keep balance and
/// representative unchanged and are signed by the epoch signer.
#[derive(Clone, Default)]
pub struct Epochs {
    epochs: HashMap<Epoch, EpochInfo>,
}

impl Epochs {
    pub fn add(&mut self, epoch: Epoch, signer: Account, link: Link) {
        debug_assert!(!self.epochs.contains_key(&epoch));
        self.epochs.insert(epoch, EpochInfo { signer, link });
    }

    /// Returns true if `link` matches one of the released epoch links.
    pub fn is_epoch_link(&self, link: &Link) -> bool {
        self.epochs.values().any(|info| info.link == *link)
    }

    pub fn link(&self, epoch: Epoch) -> Option<&Link> {
        self.epochs.get(&epoch).map(|info| &info.link)
    }

    pub fn signer(&self, epoch: Epoch) -> Option<&Account> {
        self.epochs.get(&epoch).map(|info| &info.signer)
    }

    pub fn epoch(&self, link: &Link) -> Option<Epoch> {
        self.epochs
            .iter()
            .find(|(_, info)| info.link == *link)
            .map(|(epoch, _)| *epoch)
    }
}
