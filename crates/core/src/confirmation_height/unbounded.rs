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

//! The unbounded cementation walker.
//!
//! Materializes every block on the path to cementation in a block cache and
//! writes per-account `ConfHeightDetails` records. Fast while the uncemented
//! backlog is small; memory grows with the backlog, hence the name.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use lattice_db::block_account;
use lattice_types::{Account, Block, BlockHash, ConfirmationHeightInfo, StoredBlock};

use crate::ledger::Ledger;
use crate::stats::{DetailType, StatType, Stats};

const MAX_PENDING_WRITES: usize = 65536;

/// Cementation order record for one account advance.
#[derive(Debug, Clone)]
struct ConfHeightDetails {
    account: Account,
    hash: BlockHash,
    height: u64,
    num_blocks_confirmed: u64,
    /// Hashes cemented by this record, bottom-up.
    block_callback_data: Vec<BlockHash>,
}

#[derive(Default)]
struct Pending {
    writes: VecDeque<ConfHeightDetails>,
    /// (confirmed, planned) heights per account seen this traversal.
    confirmed_iterated: HashMap<Account, (u64, u64)>,
    block_cache: HashMap<BlockHash, Arc<Block>>,
}

pub struct UnboundedProcessor {
    ledger: Arc<Ledger>,
    stats: Arc<Stats>,
    batch_write_size: Arc<AtomicU64>,
    pending: Mutex<Pending>,
}

impl UnboundedProcessor {
    pub fn new(ledger: Arc<Ledger>, stats: Arc<Stats>, batch_write_size: Arc<AtomicU64>) -> Self {
        UnboundedProcessor {
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
        pending.confirmed_iterated.clear();
        pending.block_cache.clear();
    }

    pub fn has_iterated_over_block(&self, hash: &BlockHash) -> bool {
        self.pending.lock().block_cache.contains_key(hash)
    }

    fn get_block_and_sideband(
        &self,
        pending: &mut Pending,
        txn: &dyn lattice_db::Transaction,
        hash: &BlockHash,
    ) -> Option<StoredBlock> {
        let stored = self.ledger.store.block.get(txn, hash)?;
        pending.block_cache.insert(*hash, stored.block.clone());
        Some(stored)
    }

    /// Plan cementation of `original` with a full in-memory traversal.
    /// Always completes in one call.
    pub fn process(&self, original: &Arc<Block>) -> bool {
        let txn = self.ledger.store.tx_begin_read();
        let mut pending = self.pending.lock();
        // Depth-first over receive sources, emitting records on unwind.
        enum Step {
            Enter(BlockHash),
            Emit(Account, BlockHash, u64, u64, Vec<BlockHash>),
        }
        let mut stack = vec![Step::Enter(original.hash())];
        while let Some(step) = stack.pop() {
            match step {
                Step::Emit(account, hash, height, count, callback_data) => {
                    pending.writes.push_back(ConfHeightDetails {
                        account,
                        hash,
                        height,
                        num_blocks_confirmed: count,
                        block_callback_data: callback_data,
                    });
                }
                Step::Enter(hash) => {
                    let stored = match self.get_block_and_sideband(&mut pending, &txn, &hash) {
                        Some(stored) => stored,
                        None => continue,
                    };
                    let account = block_account(&stored);
                    let (confirmed, planned) = pending
                        .confirmed_iterated
                        .get(&account)
                        .copied()
                        .unwrap_or_else(|| {
                            let info = self.ledger.store.confirmation_height.get(&txn, &account);
                            (info.height, info.height)
                        });
                    let top_height = stored.sideband.height;
                    if top_height <= planned {
                        continue;
                    }
                    // Gather the uncemented run and its receive sources.
                    let mut hashes = Vec::with_capacity((top_height - planned) as usize);
                    let mut sources = Vec::new();
                    let mut current = hash;
                    let mut current_height = top_height;
                    while current_height > planned {
                        let block = match self.get_block_and_sideband(&mut pending, &txn, &current)
                        {
                            Some(block) => block,
                            None => break,
                        };
                        hashes.push(current);
                        if let Some(source) = self.ledger.block_source(&txn, &block.block) {
                            if !self.ledger.block_confirmed(&txn, &source)
                                && self.ledger.store.block.exists(&txn, &source)
                            {
                                sources.push(source);
                            }
                        }
                        current = block.block.previous();
                        current_height -= 1;
                    }
                    hashes.reverse();
                    pending
                        .confirmed_iterated
                        .insert(account, (confirmed, top_height));
                    stack.push(Step::Emit(
                        account,
                        hash,
                        top_height,
                        top_height - planned,
                        hashes,
                    ));
                    for source in sources {
                        stack.push(Step::Enter(source));
                    }
                }
            }
        }
        true
    }

    /// Write planned records; the caller holds the write slot. Returns the
    /// cemented blocks in order.
    pub fn cement_blocks(&self) -> Vec<Arc<Block>> {
        let (writes, block_cache) = {
            let mut pending = self.pending.lock();
            pending.confirmed_iterated.clear();
            (
                std::mem::take(&mut pending.writes),
                std::mem::take(&mut pending.block_cache),
            )
        };
        let mut cemented = Vec::new();
        let mut batch_remaining = self.batch_write_size.load(Ordering::SeqCst);
        let txn = self.ledger.store.tx_begin_write();
        for details in writes {
            let confirmation = self
                .ledger
                .store
                .confirmation_height
                .get(&txn, &details.account);
            if confirmation.height >= details.height {
                continue;
            }
            let new_blocks = details
                .block_callback_data
                .iter()
                .skip((confirmation.height.saturating_sub(details.height - details.num_blocks_confirmed)) as usize);
            let mut height = confirmation.height;
            for hash in new_blocks {
                height += 1;
                self.ledger.store.confirmation_height.put(
                    &txn,
                    &details.account,
                    &ConfirmationHeightInfo::new(height, *hash),
                );
                self.ledger
                    .cache
                    .cemented_count
                    .fetch_add(1, Ordering::SeqCst);
                self.stats
                    .inc(StatType::ConfirmationHeight, DetailType::CementedUnbounded);
                if details.account == self.ledger.constants.final_votes_canary_account
                    && height >= self.ledger.constants.final_votes_canary_height
                {
                    self.ledger
                        .cache
                        .final_votes_confirmation_canary
                        .store(true, Ordering::SeqCst);
                }
                if let Some(block) = block_cache.get(hash) {
                    cemented.push(block.clone());
                }
                batch_remaining = batch_remaining.saturating_sub(1);
                if batch_remaining == 0 {
                    txn.commit();
                    batch_remaining = self.batch_write_size.load(Ordering::SeqCst);
                }
            }
            debug_assert!(height == details.height);
        }
        drop(txn);
        debug!(target: "conf_height", "cemented {} blocks (unbounded)", cemented.len());
        cemented
    }
}
