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

//! The block-lattice ledger.
//!
//! Classifies candidate blocks and applies them atomically under a write
//! transaction, maintaining account heads, pending entries, representative
//! weights and the cemented frontier. Rollback is the exact inverse of
//! apply, restricted to uncemented blocks.

mod processor;
mod rollback;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ethereum_types::U128;
use log::debug;

use lattice_db::{Store, Transaction, WriteTransaction};
use lattice_types::{
    Account, Amount, Block, BlockHash, BlockSideband, ConfirmationHeightInfo, Epoch,
    LedgerConstants, Link, QualifiedRoot, Root, SignatureVerification,
};

use crate::rep_weights::RepWeights;
use crate::stats::{DetailType, StatType, Stats};

/// Classification of a candidate block. Only `Progress` mutates the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    Progress,
    /// Already present.
    Old,
    /// Another block already occupies this qualified root.
    Fork,
    /// The previous block is missing.
    GapPrevious,
    /// The source block of a receive is missing.
    GapSource,
    /// Epoch-opening an account with no pending entries.
    GapEpochOpenPending,
    BadSignature,
    /// A send that would increase the balance.
    NegativeSpend,
    /// No matching pending entry for a receive.
    Unreceivable,
    OpenedBurnAccount,
    /// Receive amount does not match the pending entry, or balance changed
    /// where it must not.
    BalanceMismatch,
    /// Epoch blocks must not change the representative.
    RepresentativeMismatch,
    /// Block type not allowed at this position in the chain.
    BlockPosition,
    InsufficientWork,
}

/// Aggregate counters mirroring the store, cheap to read from any thread.
#[derive(Default)]
pub struct LedgerCache {
    pub block_count: AtomicU64,
    pub cemented_count: AtomicU64,
    pub account_count: AtomicU64,
    pub pruned_count: AtomicU64,
    pub final_votes_confirmation_canary: AtomicBool,
}

/// An account whose frontier is ahead of its cemented height.
#[derive(Debug, Clone)]
pub struct UncementedInfo {
    pub cemented_frontier: BlockHash,
    pub frontier: BlockHash,
    pub account: Account,
    pub height_delta: u64,
}

pub struct Ledger {
    pub store: Arc<Store>,
    pub constants: LedgerConstants,
    pub cache: LedgerCache,
    pub stats: Arc<Stats>,
    weights: RepWeights,
    pub pruning: AtomicBool,
}

impl Ledger {
    pub fn new(store: Arc<Store>, constants: LedgerConstants, stats: Arc<Stats>) -> Self {
        let ledger = Ledger {
            store,
            constants,
            cache: LedgerCache::default(),
            stats,
            weights: RepWeights::default(),
            pruning: AtomicBool::new(false),
        };
        ledger.initialize();
        ledger
    }

    // Seed genesis on first open and rebuild the in-memory caches.
    fn initialize(&self) {
        {
            let txn = self.store.tx_begin_write();
            if self.store.account.count(&txn) == 0 {
                let genesis = &self.constants.genesis;
                let hash = genesis.hash();
                let account = self.constants.genesis_account;
                let sideband = BlockSideband::new(
                    account,
                    BlockHash::zero(),
                    self.constants.genesis_amount,
                    1,
                    lattice_types::utils::seconds_since_epoch(),
                    Default::default(),
                    Epoch::Epoch0,
                );
                self.store.block.put(&txn, &hash, genesis, &sideband);
                self.store.frontier.put(&txn, &hash, &account);
                self.store.account.put(
                    &txn,
                    &account,
                    &lattice_types::AccountInfo {
                        head: hash,
                        representative: account,
                        open_block: hash,
                        balance: self.constants.genesis_amount,
                        modified: lattice_types::utils::seconds_since_epoch(),
                        block_count: 1,
                        epoch: Epoch::Epoch0,
                    },
                );
                // Genesis is born cemented.
                self.store.confirmation_height.put(
                    &txn,
                    &account,
                    &ConfirmationHeightInfo::new(1, hash),
                );
                debug!(target: "ledger", "initialized genesis {:?}", hash);
            }
        }
        let txn = self.store.tx_begin_read();
        let mut cemented = 0u64;
        for (_, info) in self.store.confirmation_height.iter(&txn) {
            cemented += info.height;
        }
        self.cache
            .block_count
            .store(self.store.block.count(&txn) as u64, Ordering::SeqCst);
        self.cache.cemented_count.store(cemented, Ordering::SeqCst);
        self.cache
            .account_count
            .store(self.store.account.count(&txn) as u64, Ordering::SeqCst);
        self.cache
            .pruned_count
            .store(self.store.pruned.count(&txn) as u64, Ordering::SeqCst);
        for (_, info) in self.store.account.iter(&txn) {
            self.weights
                .representation_add(info.representative, info.balance, false);
        }
        let canary = self
            .store
            .confirmation_height
            .get(&txn, &self.constants.final_votes_canary_account);
        self.cache.final_votes_confirmation_canary.store(
            canary.height >= self.constants.final_votes_canary_height,
            Ordering::SeqCst,
        );
    }

    /// Classify `block` and, on `Progress`, apply it.
    pub fn process(
        &self,
        txn: &WriteTransaction,
        block: &Arc<Block>,
        verification: SignatureVerification,
    ) -> ProcessResult {
        let result = processor::process(self, txn, block, verification);
        self.stats.inc(
            StatType::Ledger,
            match result {
                ProcessResult::Progress => DetailType::Process,
                ProcessResult::Old => DetailType::Old,
                ProcessResult::Fork => DetailType::Fork,
                ProcessResult::GapPrevious => DetailType::GapPrevious,
                ProcessResult::GapSource => DetailType::GapSource,
                ProcessResult::BadSignature => DetailType::BadSignature,
                ProcessResult::InsufficientWork => DetailType::InsufficientWork,
                _ => DetailType::All,
            },
        );
        result
    }

    /// Remove `hash` and everything above it in its account chain, undoing
    /// each block's effects. Fails on cemented blocks. Returns the blocks
    /// removed, newest first.
    pub fn rollback(&self, txn: &WriteTransaction, hash: &BlockHash) -> Result<Vec<Arc<Block>>, ()> {
        let mut list = Vec::new();
        rollback::rollback(self, txn, hash, &mut list).map(|_| list)
    }

    pub(crate) fn weights(&self) -> &RepWeights {
        &self.weights
    }

    /// Voting weight delegated to `account`.
    pub fn weight(&self, account: &Account) -> Amount {
        self.weights.representation_get(account)
    }

    pub fn rep_amounts(&self) -> std::collections::HashMap<Account, Amount> {
        self.weights.rep_amounts()
    }

    /// Balance at `hash`, if the block exists.
    pub fn balance(&self, txn: &dyn Transaction, hash: &BlockHash) -> Option<Amount> {
        if hash.is_zero() {
            return Some(U128::zero());
        }
        self.store.block.get(txn, hash).map(|stored| {
            stored
                .block
                .balance_field()
                .unwrap_or(stored.sideband.balance)
        })
    }

    /// Amount transferred by the block at `hash`.
    pub fn amount(&self, txn: &dyn Transaction, hash: &BlockHash) -> Option<Amount> {
        let stored = self.store.block.get(txn, hash)?;
        let balance = self.balance(txn, hash)?;
        let previous_balance = self.balance(txn, &stored.block.previous())?;
        Some(if balance > previous_balance {
            balance - previous_balance
        } else {
            previous_balance - balance
        })
    }

    /// Owning account of the block at `hash`.
    pub fn account(&self, txn: &dyn Transaction, hash: &BlockHash) -> Option<Account> {
        self.store.block.account(txn, hash)
    }

    pub fn account_balance(&self, txn: &dyn Transaction, account: &Account) -> Amount {
        self.store
            .account
            .get(txn, account)
            .map(|info| info.balance)
            .unwrap_or_else(U128::zero)
    }

    /// Sum of pending entries destined for `account`.
    pub fn account_receivable(&self, txn: &dyn Transaction, account: &Account) -> Amount {
        self.store
            .pending
            .account_range(txn, account)
            .iter()
            .fold(U128::zero(), |sum, (_, info)| {
                sum.saturating_add(info.amount)
            })
    }

    pub fn latest(&self, txn: &dyn Transaction, account: &Account) -> Option<BlockHash> {
        self.store.account.get(txn, account).map(|info| info.head)
    }

    /// The root a fresh block for `account` must use: the head when the
    /// account exists, the account itself otherwise.
    pub fn latest_root(&self, txn: &dyn Transaction, account: &Account) -> Root {
        match self.latest(txn, account) {
            Some(head) => head,
            None => *account,
        }
    }

    pub fn block_exists(&self, txn: &dyn Transaction, hash: &BlockHash) -> bool {
        self.store.block.exists(txn, hash)
    }

    pub fn block_or_pruned_exists(&self, txn: &dyn Transaction, hash: &BlockHash) -> bool {
        self.store.block.exists(txn, hash) || self.store.pruned.exists(txn, hash)
    }

    /// Whether the block at `hash` is at or below its account's cemented
    /// frontier. Pruned blocks are cemented by construction.
    pub fn block_confirmed(&self, txn: &dyn Transaction, hash: &BlockHash) -> bool {
        if self.store.pruned.exists(txn, hash) {
            return true;
        }
        match self.store.block.get(txn, hash) {
            Some(stored) => {
                let account = lattice_db::block_account(&stored);
                let info = self.store.confirmation_height.get(txn, &account);
                stored.sideband.height <= info.height
            }
            None => false,
        }
    }

    /// The block currently occupying a qualified root, if any.
    pub fn successor(&self, txn: &dyn Transaction, root: &QualifiedRoot) -> Option<Arc<Block>> {
        let hash = if root.previous.is_zero() {
            // An open position; the root is the account.
            self.store
                .account
                .get(txn, &root.root)
                .map(|info| info.open_block)
        } else {
            self.store.block.successor(txn, &root.previous)
        }?;
        self.store.block.get(txn, &hash).map(|stored| stored.block)
    }

    /// The existing block a candidate forks against, if different.
    pub fn forked_block(&self, txn: &dyn Transaction, block: &Block) -> Option<Arc<Block>> {
        let existing = self.successor(txn, &block.qualified_root())?;
        if existing.hash() != block.hash() {
            Some(existing)
        } else {
            None
        }
    }

    /// The blocks `block` depends on: previous, and the receive source.
    pub fn dependent_blocks(&self, txn: &dyn Transaction, block: &Block) -> [BlockHash; 2] {
        let previous = block.previous();
        let source = match block {
            Block::Receive(b) => b.source,
            Block::Open(b) => b.source,
            Block::State(b) => {
                if !self.constants.epochs.is_epoch_link(&b.link) && !self.is_send(txn, block) {
                    b.link
                } else {
                    BlockHash::zero()
                }
            }
            _ => BlockHash::zero(),
        };
        [previous, source]
    }

    /// Whether every dependency of `block` is cemented.
    pub fn dependents_confirmed(&self, txn: &dyn Transaction, block: &Block) -> bool {
        self.dependent_blocks(txn, block)
            .iter()
            .all(|hash| hash.is_zero() || self.block_confirmed(txn, hash))
    }

    /// Whether `block` lowers its account balance. False for anything
    /// without a previous.
    pub fn is_send(&self, txn: &dyn Transaction, block: &Block) -> bool {
        match block {
            Block::Send(_) => true,
            Block::State(b) => {
                if b.previous.is_zero() {
                    false
                } else {
                    match self.balance(txn, &b.previous) {
                        Some(previous_balance) => b.balance < previous_balance,
                        None => false,
                    }
                }
            }
            _ => false,
        }
    }

    /// Destination account of a send, when `block` is one.
    pub fn block_destination(&self, txn: &dyn Transaction, block: &Block) -> Option<Account> {
        match block {
            Block::Send(b) => Some(b.destination),
            Block::State(b) if self.is_send(txn, block) => Some(b.link),
            _ => None,
        }
    }

    /// Source hash of a receive, when `block` is one.
    pub fn block_source(&self, txn: &dyn Transaction, block: &Block) -> Option<BlockHash> {
        match block {
            Block::Receive(b) => Some(b.source),
            Block::Open(b) => Some(b.source),
            Block::State(b) if !self.is_send(txn, block) && !b.link.is_zero() => Some(b.link),
            _ => None,
        }
    }

    /// Whether all dependencies of `block` merely exist (confirmed or not).
    pub fn could_fit(&self, txn: &dyn Transaction, block: &Block) -> bool {
        self.dependent_blocks(txn, block)
            .iter()
            .all(|hash| hash.is_zero() || self.block_or_pruned_exists(txn, hash))
    }

    pub fn is_epoch_link(&self, link: &Link) -> bool {
        self.constants.epochs.is_epoch_link(link)
    }

    pub fn epoch_signer(&self, link: &Link) -> Option<Account> {
        self.constants
            .epochs
            .epoch(link)
            .and_then(|epoch| self.constants.epochs.signer(epoch).copied())
    }

    /// The representative in effect at `hash`, walking back to the nearest
    /// block that names one.
    pub fn representative_calculated(&self, txn: &dyn Transaction, hash: &BlockHash) -> Account {
        let mut current = *hash;
        while !current.is_zero() {
            match self.store.block.get(txn, &current) {
                Some(stored) => match stored.block.representative_field() {
                    Some(representative) => return representative,
                    None => current = stored.block.previous(),
                },
                None => break,
            }
        }
        Account::zero()
    }

    /// Search the destination chain for the receive matching a send.
    pub fn find_receive_block_by_send_hash(
        &self,
        txn: &dyn Transaction,
        destination: &Account,
        send_hash: &BlockHash,
    ) -> Option<Arc<Block>> {
        let mut current = self.latest(txn, destination)?;
        while !current.is_zero() {
            let stored = self.store.block.get(txn, &current)?;
            match &*stored.block {
                Block::Receive(b) if b.source == *send_hash => return Some(stored.block),
                Block::Open(b) if b.source == *send_hash => return Some(stored.block),
                Block::State(b) if b.link == *send_hash && stored.sideband.details.is_receive => {
                    return Some(stored.block)
                }
                _ => {}
            }
            current = stored.block.previous();
        }
        None
    }

    /// A random (hash, root) pair for backlog sampling.
    pub fn hash_root_random(&self, txn: &dyn Transaction) -> Option<(BlockHash, Root)> {
        self.store
            .block
            .random(txn)
            .map(|stored| (stored.block.hash(), stored.block.root()))
    }

    /// Accounts with uncemented blocks, largest backlog first.
    pub fn unconfirmed_frontiers(&self, txn: &dyn Transaction) -> Vec<UncementedInfo> {
        let mut result: Vec<UncementedInfo> = self
            .store
            .account
            .iter(txn)
            .filter_map(|(account, info)| {
                let conf = self.store.confirmation_height.get(txn, &account);
                if conf.height < info.block_count {
                    Some(UncementedInfo {
                        cemented_frontier: conf.frontier,
                        frontier: info.head,
                        account,
                        height_delta: info.block_count - conf.height,
                    })
                } else {
                    None
                }
            })
            .collect();
        result.sort_by(|a, b| b.height_delta.cmp(&a.height_delta));
        result
    }

    /// Compact cemented history below `hash`, replacing block bodies with
    /// pruned markers. Returns the number of blocks pruned.
    pub fn pruning_action(&self, txn: &WriteTransaction, hash: &BlockHash, batch_size: u64) -> u64 {
        let mut pruned = 0u64;
        let mut current = *hash;
        let genesis = self.constants.genesis.hash();
        while pruned < batch_size && !current.is_zero() && current != genesis {
            let stored = match self.store.block.get(txn, &current) {
                Some(stored) => stored,
                None => break,
            };
            debug_assert!(self.block_confirmed(txn, &current));
            self.store.block.del(txn, &current);
            self.store.pruned.put(txn, &current);
            self.cache.pruned_count.fetch_add(1, Ordering::SeqCst);
            pruned += 1;
            current = stored.block.previous();
        }
        pruned
    }

    /// Update both sides of a representation change under one lock.
    pub(crate) fn representation_add_dual(
        &self,
        rep_sub: Account,
        amount_sub: Amount,
        rep_add: Account,
        amount_add: Amount,
    ) {
        self.weights
            .representation_add_dual(rep_sub, amount_sub, true, rep_add, amount_add, false);
    }
}

#[cfg(test)]
mod tests;
