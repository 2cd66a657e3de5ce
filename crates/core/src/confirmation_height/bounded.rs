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

//! The bounded cementation walker.
//!
//! Memory holds only chain-segment boundaries: for every account touched, a
//! `WriteDetails` records the lowest and highest block to cement. Receive
//! sources are planned depth-first so a segment is always written after the
//! segments it depends on.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::Mutex;

use lattice_db::block_account;
use lattice_types::{Account, Block, BlockHash, ConfirmationHeightInfo};

use crate::ledger::Ledger;
use crate::stats::{DetailType, StatType, Stats};

/// Upper bound on in-memory planning records.
pub const MAX_PENDING_WRITES: usize = 131_072;
/// Target duration of one cementation write transaction.
const TARGET_WRITE_TIME: Duration = Duration::from_millis(250);

/// One contiguous run of blocks to cement in a single account chain.
#[derive(Debug, Clone)]
struct WriteDetails {
    account: Account,
    bottom_height: u64,
    bottom_hash: BlockHash,
    top_height: u64,
    top_hash: BlockHash,
}

enum Step {
    Enter(BlockHash),
    Emit(WriteDetails),
}

#[derive(Default)]
struct Pending {
    writes: Vec<WriteDetails>,
    /// Heights already planned per account, overriding the stored ones.
    planned: HashMap<Account, u64>,
}

pub struct BoundedProcessor {
    ledger: Arc<Ledger>,
    stats: Arc<Stats>,
    batch_write_size: Arc<AtomicU64>,
    pending: Mutex<Pending>,
}

impl BoundedProcessor {
    pub fn new(ledger: Arc<Ledger>, stats: Arc<Stats>, batch_write_size: Arc<AtomicU64>) -> Self {
        BoundedProcessor {
            ledger,
            stats,
            batch_write_size,
            pending: Mutex::new(Pending::default()),
        }
    }

    pub fn pending_empty(&self) -> bool {
        self.pending.lock().writes.is_empty()
    }

    pub fn pending_over_cap(&self) -> bool {
        self.pending.lock().writes.len() >= MAX_PENDING_WRITES
    }

    pub fn clear_process_vars(&self) {
        let mut pending = self.pending.lock();
        pending.writes.clear();
        pending.planned.clear();
    }

    /// Plan the cementation of `original` and its receive-source closure.
    /// Returns `false` when planning stopped early to respect the memory
    /// bound; call again after flushing.
    pub fn process(&self, original: &Arc<Block>) -> bool {
        let txn = self.ledger.store.tx_begin_read();
        let mut pending = self.pending.lock();
        let mut stack: Vec<Step> = vec![Step::Enter(original.hash())];
        let mut complete = true;
        while let Some(step) = stack.pop() {
            if pending.writes.len() >= MAX_PENDING_WRITES {
                // Emit-only from here: anything already planned stays
                // consistent, the remainder reruns after a flush.
                if let Step::Emit(details) = step {
                    pending.writes.push(details);
                }
                complete = false;
                continue;
            }
            match step {
                Step::Emit(details) => pending.writes.push(details),
                Step::Enter(hash) => {
                    let stored = match self.ledger.store.block.get(&txn, &hash) {
                        Some(stored) => stored,
                        None => continue,
                    };
                    let account = block_account(&stored);
                    let planned_height = pending.planned.get(&account).copied().unwrap_or_else(|| {
                        self.ledger
                            .store
                            .confirmation_height
                            .get(&txn, &account)
                            .height
                    });
                    let top_height = stored.sideband.height;
                    if top_height <= planned_height {
                        continue;
                    }
                    // Walk down to the first uncemented block, noting
                    // receive sources on the way.
                    let mut sources = Vec::new();
                    let mut bottom_hash = hash;
                    let mut current = hash;
                    let mut current_height = top_height;
                    loop {
                        let block = match self.ledger.store.block.get(&txn, &current) {
                            Some(block) => block,
                            None => break,
                        };
                        if let Some(source) = self.ledger.block_source(&txn, &block.block) {
                            if !self.ledger.block_confirmed(&txn, &source)
                                && self.ledger.store.block.exists(&txn, &source)
                            {
                                sources.push(source);
                            }
                        }
                        bottom_hash = current;
                        if current_height == planned_height + 1 {
                            break;
                        }
                        current = block.block.previous();
                        current_height -= 1;
                    }
                    pending.planned.insert(account, top_height);
                    stack.push(Step::Emit(WriteDetails {
                        account,
                        bottom_height: planned_height + 1,
                        bottom_hash,
                        top_height,
                        top_hash: hash,
                    }));
                    // Dependencies first: sources are popped before the
                    // emit above.
                    for source in sources {
                        stack.push(Step::Enter(source));
                    }
                }
            }
        }
        complete
    }

    /// Flush planned segments to the store in adaptive batches. The caller
    /// holds the confirmation-height write slot. Returns the cemented
    /// blocks, in cementation order.
    pub fn cement_blocks(&self) -> Vec<Arc<Block>> {
        let writes = {
            let mut pending = self.pending.lock();
            pending.planned.clear();
            std::mem::take(&mut pending.writes)
        };
        let mut cemented = Vec::new();
        let mut batch_remaining = self.batch_write_size.load(Ordering::SeqCst);
        let timer = Instant::now();
        let txn = self.ledger.store.tx_begin_write();
        for details in writes {
            let confirmation = self
                .ledger
                .store
                .confirmation_height
                .get(&txn, &details.account);
            // Another pass may have advanced this account already.
            if confirmation.height >= details.top_height {
                continue;
            }
            let start_height = confirmation.height.max(details.bottom_height - 1) + 1;
            let mut current = if start_height == details.bottom_height {
                details.bottom_hash
            } else {
                match self.ledger.store.block.successor(&txn, &confirmation.frontier) {
                    Some(successor) => successor,
                    None => continue,
                }
            };
            let mut height = start_height;
            while height <= details.top_height {
                let stored = match self.ledger.store.block.get(&txn, &current) {
                    Some(stored) => stored,
                    None => break,
                };
                debug_assert!(stored.sideband.height == height);
                self.ledger.store.confirmation_height.put(
                    &txn,
                    &details.account,
                    &ConfirmationHeightInfo::new(height, current),
                );
                self.ledger.cache.cemented_count.fetch_add(1, Ordering::SeqCst);
                self.stats
                    .inc(StatType::ConfirmationHeight, DetailType::CementedBounded);
                cemented.push(stored.block.clone());
                if details.account == self.ledger.constants.final_votes_canary_account
                    && height >= self.ledger.constants.final_votes_canary_height
                {
                    self.ledger
                        .cache
                        .final_votes_confirmation_canary
                        .store(true, Ordering::SeqCst);
                }
                batch_remaining = batch_remaining.saturating_sub(1);
                if batch_remaining == 0 {
                    // Keep transactions short; commit and continue.
                    txn.commit();
                    self.adjust_batch_size(timer.elapsed());
                    batch_remaining = self.batch_write_size.load(Ordering::SeqCst);
                }
                height += 1;
                current = stored.sideband.successor;
                if current.is_zero() && height <= details.top_height {
                    break;
                }
            }
        }
        drop(txn);
        debug!(target: "conf_height", "cemented {} blocks (bounded)", cemented.len());
        cemented
    }

    // Keep the write burst near the target duration.
    fn adjust_batch_size(&self, elapsed: Duration) {
        let current = self.batch_write_size.load(Ordering::SeqCst);
        let delta = (current / 10).max(1);
        if elapsed > TARGET_WRITE_TIME {
            self.batch_write_size
                .store(current.saturating_sub(delta).max(delta), Ordering::SeqCst);
        } else {
            self.batch_write_size.store(current + delta, Ordering::SeqCst);
        }
    }
}
