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

//! Cementation of confirmed blocks.
//!
//! A confirmed block may depend, through receive sources, on blocks of other
//! accounts that must cement first. Two traversals exist: the bounded walker
//! keeps only segment boundaries in memory and suits large ledgers; the
//! unbounded walker materializes every pending block and is faster while the
//! uncemented backlog is small. Writes from the two are never interleaved.

mod bounded;
mod unbounded;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use lattice_types::{Block, BlockHash};

use crate::ledger::Ledger;
use crate::observer_set::ObserverSet;
use crate::stats::Stats;
use crate::write_queue::{WriteQueue, Writer};

pub use bounded::BoundedProcessor;
pub use unbounded::UnboundedProcessor;

/// Ledgers below this uncemented backlog use the unbounded walker.
pub const UNBOUNDED_CUTOFF: u64 = 16384;
/// Blocks cemented per write transaction, adjusted adaptively.
pub const BATCH_WRITE_SIZE: u64 = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationHeightMode {
    Automatic,
    Unbounded,
    Bounded,
}

struct State {
    awaiting: VecDeque<Arc<Block>>,
    awaiting_hashes: HashSet<BlockHash>,
    original: Option<BlockHash>,
    stopped: bool,
}

pub struct ConfirmationHeightProcessor {
    ledger: Arc<Ledger>,
    write_queue: Arc<WriteQueue>,
    mode: ConfirmationHeightMode,
    state: Mutex<State>,
    condition: Condvar,
    bounded: BoundedProcessor,
    unbounded: UnboundedProcessor,
    /// Fired in block order for every newly cemented block.
    pub cemented_observers: ObserverSet<Arc<Block>>,
    /// Fired for blocks requested again at or below the cemented frontier.
    pub already_cemented_observers: ObserverSet<BlockHash>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ConfirmationHeightProcessor {
    pub fn new(
        ledger: Arc<Ledger>,
        write_queue: Arc<WriteQueue>,
        stats: Arc<Stats>,
        mode: ConfirmationHeightMode,
    ) -> Arc<Self> {
        let batch_write_size = Arc::new(AtomicU64::new(BATCH_WRITE_SIZE));
        let processor = Arc::new(ConfirmationHeightProcessor {
            bounded: BoundedProcessor::new(
                ledger.clone(),
                stats.clone(),
                batch_write_size.clone(),
            ),
            unbounded: UnboundedProcessor::new(ledger.clone(), stats, batch_write_size),
            ledger,
            write_queue,
            mode,
            state: Mutex::new(State {
                awaiting: VecDeque::new(),
                awaiting_hashes: HashSet::new(),
                original: None,
                stopped: false,
            }),
            condition: Condvar::new(),
            cemented_observers: ObserverSet::default(),
            already_cemented_observers: ObserverSet::default(),
            thread: Mutex::new(None),
        });
        let run = processor.clone();
        let handle = std::thread::Builder::new()
            .name("conf height".to_string())
            .spawn(move || run.run())
            .expect("confirmation height thread spawn");
        *processor.thread.lock() = Some(handle);
        processor
    }

    /// Queue a confirmed block for cementation.
    pub fn add(&self, block: Arc<Block>) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            if state.awaiting_hashes.insert(block.hash()) {
                state.awaiting.push_back(block);
            }
        }
        self.condition.notify_all();
    }

    pub fn awaiting_processing_size(&self) -> usize {
        self.state.lock().awaiting.len()
    }

    /// Whether `hash` is queued or currently being cemented.
    pub fn is_processing_block(&self, hash: &BlockHash) -> bool {
        let state = self.state.lock();
        state.awaiting_hashes.contains(hash) || state.original == Some(*hash)
    }

    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        self.condition.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn run(&self) {
        let mut state = self.state.lock();
        while !state.stopped {
            if let Some(block) = state.awaiting.pop_front() {
                let hash = block.hash();
                state.awaiting_hashes.remove(&hash);
                state.original = Some(hash);
                let awaiting_more = !state.awaiting.is_empty();
                drop(state);
                self.process(block, awaiting_more);
                state = self.state.lock();
                state.original = None;
            } else {
                drop(state);
                // Queue drained: flush whichever walker holds residue.
                self.flush_pending();
                state = self.state.lock();
                if state.awaiting.is_empty() && !state.stopped {
                    self.condition.wait(&mut state);
                }
            }
        }
        drop(state);
        self.flush_pending();
    }

    fn process(&self, block: Arc<Block>, awaiting_more: bool) {
        {
            let txn = self.ledger.store.tx_begin_read();
            if self.ledger.block_confirmed(&txn, &block.hash()) {
                self.already_cemented_observers.notify(&block.hash());
                return;
            }
        }
        // Choose a walker; never mix their pending writes.
        let force_unbounded =
            !self.unbounded.pending_empty() || self.mode == ConfirmationHeightMode::Unbounded;
        let valid_unbounded = self.mode == ConfirmationHeightMode::Automatic
            && self.within_unbounded_selection()
            && self.bounded.pending_empty();
        let use_unbounded = force_unbounded || valid_unbounded;
        loop {
            let done = if use_unbounded {
                debug_assert!(self.bounded.pending_empty());
                self.unbounded.process(&block)
            } else {
                debug_assert!(self.unbounded.pending_empty());
                self.bounded.process(&block)
            };
            // Accumulate while more confirmations queue up behind us.
            let pending_over_cap = if use_unbounded {
                self.unbounded.pending_over_cap()
            } else {
                self.bounded.pending_over_cap()
            };
            if !awaiting_more || pending_over_cap {
                self.flush_pending();
            }
            if done {
                break;
            }
        }
    }

    fn within_unbounded_selection(&self) -> bool {
        let block_count = self.ledger.cache.block_count.load(Ordering::SeqCst);
        let cemented_count = self.ledger.cache.cemented_count.load(Ordering::SeqCst);
        block_count < UNBOUNDED_CUTOFF || block_count - UNBOUNDED_CUTOFF < cemented_count
    }

    fn flush_pending(&self) {
        if !self.bounded.pending_empty() {
            debug_assert!(self.unbounded.pending_empty());
            let guard = self.write_queue.wait(Writer::ConfirmationHeight);
            let cemented = self.bounded.cement_blocks();
            guard.release();
            self.notify_cemented(&cemented);
        } else if !self.unbounded.pending_empty() {
            debug_assert!(self.bounded.pending_empty());
            let guard = self.write_queue.wait(Writer::ConfirmationHeight);
            let cemented = self.unbounded.cement_blocks();
            guard.release();
            self.notify_cemented(&cemented);
        }
    }

    fn notify_cemented(&self, blocks: &[Arc<Block>]) {
        for block in blocks {
            self.cemented_observers.notify(block);
        }
    }
}

impl Drop for ConfirmationHeightProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}
