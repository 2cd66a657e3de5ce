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

//! Recently seen dependency gaps.
//!
//! Tracks hashes that blocked admission, accumulates the representatives
//! voting for them, and asks for retrieval once enough weight agrees the
//! block should exist.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use lattice_types::{Account, BlockHash, Vote};

use crate::ledger::Ledger;
use crate::online_reps::OnlineReps;

const MAX_ENTRIES: usize = 256;

#[derive(Clone)]
struct GapInformation {
    arrival: Instant,
    hash: BlockHash,
    voters: Vec<Account>,
    bootstrap_started: bool,
}

type BootstrapStart = dyn Fn(BlockHash) + Send + Sync;

pub struct GapCache {
    ledger: Arc<Ledger>,
    online_reps: Arc<OnlineReps>,
    blocks: Mutex<HashMap<BlockHash, GapInformation>>,
    bootstrap_start: Mutex<Option<Arc<BootstrapStart>>>,
}

impl GapCache {
    pub fn new(ledger: Arc<Ledger>, online_reps: Arc<OnlineReps>) -> Self {
        GapCache {
            ledger,
            online_reps,
            blocks: Mutex::new(HashMap::new()),
            bootstrap_start: Mutex::new(None),
        }
    }

    pub fn set_bootstrap_start(&self, callback: Arc<BootstrapStart>) {
        *self.bootstrap_start.lock() = Some(callback);
    }

    pub fn add(&self, hash: BlockHash) {
        let mut blocks = self.blocks.lock();
        let now = Instant::now();
        match blocks.get_mut(&hash) {
            Some(existing) => existing.arrival = now,
            None => {
                blocks.insert(
                    hash,
                    GapInformation {
                        arrival: now,
                        hash,
                        voters: Vec::new(),
                        bootstrap_started: false,
                    },
                );
                if blocks.len() > MAX_ENTRIES {
                    // Evict the oldest arrival.
                    if let Some(oldest) = blocks
                        .values()
                        .min_by_key(|info| info.arrival)
                        .map(|info| info.hash)
                    {
                        blocks.remove(&oldest);
                    }
                }
            }
        }
    }

    pub fn erase(&self, hash: &BlockHash) {
        self.blocks.lock().remove(hash);
    }

    /// Accumulate voters per gapped hash; enough weight starts retrieval.
    pub fn vote(&self, vote: &Vote) {
        let mut check = Vec::new();
        {
            let mut blocks = self.blocks.lock();
            for hash in &vote.hashes {
                if let Some(info) = blocks.get_mut(hash) {
                    if !info.bootstrap_started && !info.voters.contains(&vote.account) {
                        info.voters.push(vote.account);
                        check.push((*hash, info.voters.clone()));
                    }
                }
            }
        }
        for (hash, voters) in check {
            if self.bootstrap_check(&voters, &hash) {
                if let Some(info) = self.blocks.lock().get_mut(&hash) {
                    info.bootstrap_started = true;
                }
            }
        }
    }

    fn bootstrap_check(&self, voters: &[Account], hash: &BlockHash) -> bool {
        let mut tally = ethereum_types::U128::zero();
        for voter in voters {
            tally = tally.saturating_add(self.ledger.weight(voter));
        }
        let start = tally >= self.online_reps.delta();
        if start {
            let txn = self.ledger.store.tx_begin_read();
            if !self.ledger.block_or_pruned_exists(&txn, hash) {
                let callback = self.bootstrap_start.lock().clone();
                if let Some(callback) = callback {
                    callback(*hash);
                }
            }
        }
        start
    }

    pub fn size(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn earliest_arrival(&self) -> Option<Instant> {
        self.blocks.lock().values().map(|info| info.arrival).min()
    }
}
