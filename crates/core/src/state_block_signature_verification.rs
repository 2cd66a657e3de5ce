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

//! Batched signature pre-verification for state blocks.
//!
//! Epoch-link blocks are checked against the epoch signer first and fall
//! back to the account key, so both true epoch blocks and self-sends to an
//! epoch address verify in one pass.

use std::collections::VecDeque;
use std::sync::Arc;

use log::trace;
use parking_lot::{Condvar, Mutex};

use lattice_types::{
    validate_message, Account, Block, LedgerConstants, SignatureVerification,
};

use crate::signature_checker::{SignatureCheckSet, SignatureChecker, BATCH_SIZE};

pub type VerifiedCallback =
    dyn Fn(Vec<(Arc<Block>, SignatureVerification)>) + Send + Sync;

struct State {
    blocks: VecDeque<Arc<Block>>,
    active: bool,
    stopped: bool,
}

pub struct StateBlockSignatureVerification {
    checker: Arc<SignatureChecker>,
    constants: LedgerConstants,
    max_batch: usize,
    state: Mutex<State>,
    condition: Condvar,
    verified: Mutex<Option<Arc<VerifiedCallback>>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl StateBlockSignatureVerification {
    pub fn new(
        checker: Arc<SignatureChecker>,
        constants: LedgerConstants,
        verification_threads: usize,
    ) -> Arc<Self> {
        let verification = Arc::new(StateBlockSignatureVerification {
            checker,
            constants,
            max_batch: BATCH_SIZE * (verification_threads + 1),
            state: Mutex::new(State {
                blocks: VecDeque::new(),
                active: false,
                stopped: false,
            }),
            condition: Condvar::new(),
            verified: Mutex::new(None),
            thread: Mutex::new(None),
        });
        let clone = verification.clone();
        let handle = std::thread::Builder::new()
            .name("sig check".to_string())
            .spawn(move || clone.run())
            .expect("verification thread spawn");
        *verification.thread.lock() = Some(handle);
        verification
    }

    pub fn set_verified_callback(&self, callback: Arc<VerifiedCallback>) {
        *self.verified.lock() = Some(callback);
    }

    pub fn add(&self, block: Arc<Block>) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.blocks.push_back(block);
        }
        self.condition.notify_one();
    }

    pub fn size(&self) -> usize {
        self.state.lock().blocks.len()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
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
            if !state.blocks.is_empty() {
                state.active = true;
                while !state.blocks.is_empty() && !state.stopped {
                    let count = state.blocks.len().min(self.max_batch);
                    let items: Vec<Arc<Block>> = state.blocks.drain(..count).collect();
                    drop(state);
                    self.verify_batch(items);
                    state = self.state.lock();
                }
                state.active = false;
            } else {
                self.condition.wait(&mut state);
            }
        }
    }

    fn verify_batch(&self, items: Vec<Arc<Block>>) {
        let mut messages = Vec::with_capacity(items.len());
        let mut keys = Vec::with_capacity(items.len());
        let mut signatures = Vec::with_capacity(items.len());
        let mut epoch_checked = vec![false; items.len()];
        for (index, block) in items.iter().enumerate() {
            let mut key = block.account_field().unwrap_or_default();
            if let Some(link) = block.link_field() {
                if !link.is_zero() && self.constants.epochs.is_epoch_link(&link) {
                    if let Some(signer) = self.constants.epochs.epoch(&link).and_then(|epoch| {
                        self.constants.epochs.signer(epoch).copied()
                    }) {
                        key = signer;
                        epoch_checked[index] = true;
                    }
                }
            }
            messages.push(block.hash().as_bytes().to_vec());
            keys.push(key);
            signatures.push(*block.signature());
        }
        let mut check = SignatureCheckSet::new(messages, keys, signatures);
        self.checker.verify(&mut check);
        let results: Vec<(Arc<Block>, SignatureVerification)> = items
            .into_iter()
            .enumerate()
            .map(|(index, block)| {
                let verification = if check.verifications[index] {
                    if epoch_checked[index] {
                        SignatureVerification::ValidEpoch
                    } else {
                        SignatureVerification::Valid
                    }
                } else if epoch_checked[index] {
                    // Not the epoch signer; maybe a plain send to the epoch
                    // address signed by the account.
                    let account = block.account_field().unwrap_or_default();
                    if validate_message(&account, block.hash().as_bytes(), block.signature()) {
                        SignatureVerification::Valid
                    } else {
                        SignatureVerification::Invalid
                    }
                } else {
                    SignatureVerification::Invalid
                };
                (block, verification)
            })
            .collect();
        trace!(target: "blockproc", "verified batch of {}", results.len());
        let callback = self.verified.lock().clone();
        if let Some(callback) = callback {
            callback(results);
        }
    }
}

impl Drop for StateBlockSignatureVerification {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::LedgerContext;
    use ethereum_types::U128;
    use lattice_types::{Epoch, KeyPair};

    fn collect_results(
        verification: &StateBlockSignatureVerification,
    ) -> Arc<Mutex<Vec<(Arc<Block>, SignatureVerification)>>> {
        let results = Arc::new(Mutex::new(Vec::new()));
        let results_clone = results.clone();
        verification.set_verified_callback(Arc::new(move |batch| {
            results_clone.lock().extend(batch);
        }));
        results
    }

    fn wait_for_len(results: &Mutex<Vec<(Arc<Block>, SignatureVerification)>>, len: usize) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while results.lock().len() < len {
            assert!(std::time::Instant::now() < deadline, "timed out");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    #[test]
    fn classifies_account_epoch_and_invalid() {
        let ctx = LedgerContext::new();
        let checker = Arc::new(SignatureChecker::new(1));
        let verification = StateBlockSignatureVerification::new(
            checker,
            ctx.params.ledger.clone(),
            1,
        );
        let results = collect_results(&verification);

        let key = KeyPair::generate();
        let plain = ctx.state_block(
            ctx.genesis_key(),
            ctx.genesis_account(),
            ctx.genesis_hash(),
            ctx.genesis_account(),
            U128::from(1u64),
            key.public_key(),
        );
        let epoch = ctx.epoch_block(ctx.genesis_account(), ctx.genesis_hash(), Epoch::Epoch1);
        let forged = ctx.state_block(
            &key,
            ctx.genesis_account(),
            ctx.genesis_hash(),
            ctx.genesis_account(),
            U128::from(1u64),
            key.public_key(),
        );
        verification.add(plain.clone());
        verification.add(epoch.clone());
        verification.add(forged.clone());
        wait_for_len(&results, 3);
        let results = results.lock();
        let result_for = |block: &Arc<Block>| {
            results
                .iter()
                .find(|(b, _)| b.hash() == block.hash())
                .map(|(_, v)| *v)
                .unwrap()
        };
        assert_eq!(result_for(&plain), SignatureVerification::Valid);
        assert_eq!(result_for(&epoch), SignatureVerification::ValidEpoch);
        assert_eq!(result_for(&forged), SignatureVerification::Invalid);
        verification.stop();
    }
}
