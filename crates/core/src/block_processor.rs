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

//! Ordered admission of blocks to the ledger.
//!
//! Processing blocks is a potentially long I/O operation, isolated here from
//! network servicing. Blocks are admitted in batches under one write
//! transaction; forced blocks (fork resolutions) drain first and may roll
//! back the losing chain. Missing-dependency blocks route to the unchecked
//! staging area and return when their dependency lands.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use lattice_types::{
    Account, Block, SignatureVerification, UncheckedInfo,
};

use crate::config::NodeConfig;
use crate::ledger::{Ledger, ProcessResult};
use crate::observer_set::ObserverSet;
use crate::signature_checker::SignatureChecker;
use crate::state_block_signature_verification::StateBlockSignatureVerification;
use crate::stats::{DetailType, StatType, Stats};
use crate::unchecked_map::UncheckedMap;
use crate::write_queue::{WriteQueue, Writer};

/// Queue bound beyond which producers must back off.
const FLUSH_MAX: usize = 64 * 1024;

struct State {
    blocks: VecDeque<(Arc<Block>, SignatureVerification)>,
    forced: VecDeque<Arc<Block>>,
    active: bool,
    stopped: bool,
}

pub struct BlockProcessor {
    ledger: Arc<Ledger>,
    write_queue: Arc<WriteQueue>,
    unchecked: Arc<UncheckedMap>,
    config: NodeConfig,
    stats: Arc<Stats>,
    verification: Arc<StateBlockSignatureVerification>,
    state: Mutex<State>,
    condition: Condvar,
    /// Fired after each batch commits, once per admitted or rejected block.
    pub processed: ObserverSet<(Arc<Block>, ProcessResult)>,
    /// Fired for each block removed by a forced fork resolution.
    pub rolled_back: ObserverSet<Arc<Block>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl BlockProcessor {
    pub fn new(
        ledger: Arc<Ledger>,
        write_queue: Arc<WriteQueue>,
        unchecked: Arc<UncheckedMap>,
        checker: Arc<SignatureChecker>,
        config: NodeConfig,
        stats: Arc<Stats>,
    ) -> Arc<Self> {
        let verification = StateBlockSignatureVerification::new(
            checker,
            ledger.constants.clone(),
            config.signature_checker_threads,
        );
        let processor = Arc::new(BlockProcessor {
            ledger,
            write_queue,
            unchecked,
            config,
            stats,
            verification,
            state: Mutex::new(State {
                blocks: VecDeque::new(),
                forced: VecDeque::new(),
                active: false,
                stopped: false,
            }),
            condition: Condvar::new(),
            processed: ObserverSet::default(),
            rolled_back: ObserverSet::default(),
            thread: Mutex::new(None),
        });
        // Verified state blocks feed back into the admission queue.
        let feedback = Arc::downgrade(&processor);
        processor
            .verification
            .set_verified_callback(Arc::new(move |batch| {
                if let Some(processor) = feedback.upgrade() {
                    processor.add_verified(batch);
                }
            }));
        // Blocks released from staging re-enter the queue.
        let requeue = Arc::downgrade(&processor);
        processor.unchecked.set_satisfied(Arc::new(move |info| {
            if let Some(processor) = requeue.upgrade() {
                processor.add_unchecked(info);
            }
        }));
        let run = processor.clone();
        let handle = std::thread::Builder::new()
            .name("blck proc".to_string())
            .spawn(move || run.process_blocks())
            .expect("block processor thread spawn");
        *processor.thread.lock() = Some(handle);
        processor
    }

    /// Queue a block arriving from the network or a local publish.
    pub fn add(&self, block: Arc<Block>) {
        match &*block {
            Block::State(_) => self.verification.add(block),
            _ => self.add_with_verification(block, SignatureVerification::Unknown),
        }
    }

    fn add_verified(&self, batch: Vec<(Arc<Block>, SignatureVerification)>) {
        for (block, verification) in batch {
            if verification == SignatureVerification::Invalid {
                self.stats
                    .inc(StatType::BlockProcessor, DetailType::BadSignature);
                debug!(target: "blockproc", "dropping {:?}: bad signature", block.hash());
                continue;
            }
            self.add_with_verification(block, verification);
        }
    }

    fn add_unchecked(&self, info: UncheckedInfo) {
        self.add_with_verification(info.block, info.verified);
    }

    fn add_with_verification(&self, block: Arc<Block>, verification: SignatureVerification) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.blocks.push_back((block, verification));
        }
        self.condition.notify_all();
    }

    /// Queue a locally decided block; forced blocks evict any competing
    /// chain before application.
    pub fn force(&self, block: Arc<Block>) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.forced.push_back(block);
        }
        self.condition.notify_all();
    }

    pub fn size(&self) -> usize {
        let state = self.state.lock();
        state.blocks.len() + state.forced.len() + self.verification.size()
    }

    /// Producers must stop offering work.
    pub fn full(&self) -> bool {
        self.size() >= FLUSH_MAX
    }

    /// Soft backpressure for non-essential traffic.
    pub fn half_full(&self) -> bool {
        self.size() >= FLUSH_MAX / 2
    }

    /// Wait for everything queued so far to be admitted or rejected.
    pub fn flush(&self) {
        while self.verification.size() > 0 || self.verification.is_active() {
            std::thread::sleep(Duration::from_millis(1));
        }
        let mut state = self.state.lock();
        while !state.stopped
            && (state.active || !state.blocks.is_empty() || !state.forced.is_empty())
        {
            self.condition.wait(&mut state);
        }
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
        self.verification.stop();
    }

    fn process_blocks(&self) {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                break;
            }
            if !state.blocks.is_empty() || !state.forced.is_empty() {
                state.active = true;
                drop(state);
                self.process_batch();
                state = self.state.lock();
                state.active = false;
                // flush() waits on this.
                self.condition.notify_all();
            } else {
                self.condition.notify_all();
                self.condition.wait(&mut state);
            }
        }
    }

    fn process_batch(&self) {
        let mut events: Vec<(Arc<Block>, ProcessResult)> = Vec::new();
        let mut rollbacks: Vec<Arc<Block>> = Vec::new();
        let guard = self.write_queue.wait(Writer::ProcessBatch);
        {
            let txn = self.ledger.store.tx_begin_write();
            let deadline = Instant::now() + self.config.block_processor_batch_max_time();
            let mut count = 0usize;
            loop {
                if count >= self.config.block_processor_batch_size || Instant::now() > deadline {
                    break;
                }
                let (block, verification, forced) = {
                    let mut state = self.state.lock();
                    if let Some(block) = state.forced.pop_front() {
                        (block, SignatureVerification::Unknown, true)
                    } else if let Some((block, verification)) = state.blocks.pop_front() {
                        (block, verification, false)
                    } else {
                        break;
                    }
                };
                if forced {
                    // Evict whatever currently occupies the root.
                    if let Some(successor) = self.ledger.forked_block(&txn, &block) {
                        info!(target: "blockproc", "rolling back {:?} in favour of {:?}", successor.hash(), block.hash());
                        match self.ledger.rollback(&txn, &successor.hash()) {
                            Ok(rolled) => rollbacks.extend(rolled),
                            Err(()) => {
                                debug!(target: "blockproc", "rollback of {:?} failed", successor.hash());
                            }
                        }
                    }
                }
                let result = self.process_one(&txn, &block, verification);
                events.push((block, result));
                count += 1;
            }
        }
        guard.release();
        // Post-batch events run outside the write transaction.
        for block in rollbacks {
            self.rolled_back.notify(&block);
        }
        for event in &events {
            self.processed.notify(event);
        }
    }

    fn process_one(
        &self,
        txn: &lattice_db::WriteTransaction,
        block: &Arc<Block>,
        verification: SignatureVerification,
    ) -> ProcessResult {
        let hash = block.hash();
        let result = self.ledger.process(txn, block, verification);
        match result {
            ProcessResult::Progress => {
                self.stats.inc(StatType::BlockProcessor, DetailType::Process);
                // Anything staged behind this hash can run now.
                self.unchecked.trigger(hash);
            }
            ProcessResult::GapPrevious => {
                self.unchecked.put(
                    block.previous(),
                    UncheckedInfo::new(block.clone(), Account::zero(), verification),
                );
                self.stats
                    .inc(StatType::BlockProcessor, DetailType::GapPrevious);
            }
            ProcessResult::GapSource => {
                let dependency = self
                    .ledger
                    .block_source(txn, block)
                    .unwrap_or_else(|| block.previous());
                self.unchecked.put(
                    dependency,
                    UncheckedInfo::new(block.clone(), Account::zero(), verification),
                );
                self.stats
                    .inc(StatType::BlockProcessor, DetailType::GapSource);
            }
            ProcessResult::GapEpochOpenPending => {
                // Keyed by account: the pending arrival unblocks it.
                let dependency = block.account_field().unwrap_or_default();
                self.unchecked.put(
                    dependency,
                    UncheckedInfo::new(block.clone(), Account::zero(), verification),
                );
            }
            ProcessResult::Old => {
                self.stats.inc(StatType::BlockProcessor, DetailType::Old);
            }
            ProcessResult::Fork => {
                self.stats.inc(StatType::BlockProcessor, DetailType::Fork);
            }
            ProcessResult::BadSignature => {
                self.stats
                    .inc(StatType::BlockProcessor, DetailType::BadSignature);
            }
            ProcessResult::InsufficientWork => {
                self.stats
                    .inc(StatType::BlockProcessor, DetailType::InsufficientWork);
            }
            _ => {}
        }
        result
    }
}

impl Drop for BlockProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::LedgerContext;
    use ethereum_types::U128;
    use lattice_types::KeyPair;

    struct ProcessorContext {
        ctx: LedgerContext,
        processor: Arc<BlockProcessor>,
        unchecked: Arc<UncheckedMap>,
    }

    fn processor_context() -> ProcessorContext {
        let ctx = LedgerContext::new();
        let unchecked = UncheckedMap::new(ctx.store.clone());
        let processor = BlockProcessor::new(
            ctx.ledger.clone(),
            Arc::new(WriteQueue::default()),
            unchecked.clone(),
            Arc::new(SignatureChecker::new(1)),
            NodeConfig::dev_default(),
            ctx.stats.clone(),
        );
        ProcessorContext {
            ctx,
            processor,
            unchecked,
        }
    }

    fn settle(context: &ProcessorContext) {
        // Admission can bounce between the unchecked staging area and the
        // queue a few times before settling.
        for _ in 0..5 {
            context.processor.flush();
            context.unchecked.flush();
        }
        context.processor.flush();
    }

    #[test]
    fn admits_a_chain_arriving_out_of_order() {
        let context = processor_context();
        let ctx = &context.ctx;
        let key = KeyPair::generate();
        let genesis_amount = ctx.params.ledger.genesis_amount;
        let send = ctx.state_block(
            ctx.genesis_key(),
            ctx.genesis_account(),
            ctx.genesis_hash(),
            ctx.genesis_account(),
            genesis_amount - U128::from(10u64),
            key.public_key(),
        );
        let open = ctx.state_block(
            &key,
            key.public_key(),
            lattice_types::BlockHash::zero(),
            key.public_key(),
            U128::from(10u64),
            send.hash(),
        );
        // Dependent first: it gaps, then returns when the send lands.
        context.processor.add(open.clone());
        settle(&context);
        {
            let txn = ctx.store.tx_begin_read();
            assert!(!ctx.ledger.block_exists(&txn, &open.hash()));
            assert_eq!(context.unchecked.count(&txn), 1);
        }
        context.processor.add(send.clone());
        settle(&context);
        let txn = ctx.store.tx_begin_read();
        assert!(ctx.ledger.block_exists(&txn, &send.hash()));
        assert!(ctx.ledger.block_exists(&txn, &open.hash()));
        assert_eq!(context.unchecked.count(&txn), 0);
    }

    #[test]
    fn forced_block_rolls_back_the_loser() {
        let context = processor_context();
        let ctx = &context.ctx;
        let key_1 = KeyPair::generate();
        let key_2 = KeyPair::generate();
        let genesis_amount = ctx.params.ledger.genesis_amount;
        let send_a = ctx.state_block(
            ctx.genesis_key(),
            ctx.genesis_account(),
            ctx.genesis_hash(),
            ctx.genesis_account(),
            genesis_amount - U128::one(),
            key_1.public_key(),
        );
        let send_b = ctx.state_block(
            ctx.genesis_key(),
            ctx.genesis_account(),
            ctx.genesis_hash(),
            ctx.genesis_account(),
            genesis_amount - U128::from(2u64),
            key_2.public_key(),
        );
        let rolled_back = Arc::new(Mutex::new(Vec::new()));
        let rolled_back_clone = rolled_back.clone();
        context.processor.rolled_back.add(move |block: &Arc<Block>| {
            rolled_back_clone.lock().push(block.hash());
        });
        context.processor.add(send_a.clone());
        settle(&context);
        context.processor.force(send_b.clone());
        settle(&context);
        let txn = ctx.store.tx_begin_read();
        assert!(!ctx.ledger.block_exists(&txn, &send_a.hash()));
        assert!(ctx.ledger.block_exists(&txn, &send_b.hash()));
        assert_eq!(rolled_back.lock().as_slice(), &[send_a.hash()]);
    }

    #[test]
    fn bad_signature_never_reaches_the_ledger() {
        let context = processor_context();
        let ctx = &context.ctx;
        let key = KeyPair::generate();
        let forged = ctx.state_block(
            &key,
            ctx.genesis_account(),
            ctx.genesis_hash(),
            ctx.genesis_account(),
            U128::one(),
            key.public_key(),
        );
        context.processor.add(forged.clone());
        settle(&context);
        let txn = ctx.store.tx_begin_read();
        assert!(!ctx.ledger.block_exists(&txn, &forged.hash()));
        assert_eq!(
            ctx.stats
                .count(StatType::BlockProcessor, DetailType::BadSignature),
            1
        );
    }

    #[test]
    fn processed_observers_fire_per_block() {
        let context = processor_context();
        let ctx = &context.ctx;
        let key = KeyPair::generate();
        let results = Arc::new(Mutex::new(Vec::new()));
        let results_clone = results.clone();
        context
            .processor
            .processed
            .add(move |(block, result): &(Arc<Block>, ProcessResult)| {
                results_clone.lock().push((block.hash(), *result));
            });
        let send = ctx.state_block(
            ctx.genesis_key(),
            ctx.genesis_account(),
            ctx.genesis_hash(),
            ctx.genesis_account(),
            ctx.params.ledger.genesis_amount - U128::one(),
            key.public_key(),
        );
        context.processor.add(send.clone());
        settle(&context);
        context.processor.add(send.clone());
        settle(&context);
        let results = results.lock();
        assert_eq!(results[0], (send.hash(), ProcessResult::Progress));
        assert_eq!(results[1], (send.hash(), ProcessResult::Old));
    }
}
