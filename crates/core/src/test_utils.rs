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

//! Shared helpers for the unit tests.

use std::sync::Arc;

use ethereum_types::U128;

use lattice_db::Store;
use lattice_types::{
    work_value, Account, Amount, Block, BlockHash, ChangeBlock, Epoch, KeyPair, Link,
    NetworkParams, OpenBlock, ReceiveBlock, Root, SendBlock, StateBlock,
};

use crate::ledger::Ledger;
use crate::stats::Stats;

/// Deterministic dev-network work for a root, strong enough for any epoch.
pub fn work_for(params: &NetworkParams, root: &Root) -> u64 {
    let mut nonce = 0u64;
    while work_value(root, nonce) < params.work.base {
        nonce += 1;
    }
    nonce
}

/// A dev ledger over a fresh in-memory store.
pub struct LedgerContext {
    pub params: NetworkParams,
    pub store: Arc<Store>,
    pub ledger: Arc<Ledger>,
    pub stats: Arc<Stats>,
}

impl LedgerContext {
    pub fn new() -> Self {
        let params = NetworkParams::dev();
        let store = Arc::new(Store::open_memory());
        let stats = Arc::new(Stats::default());
        let ledger = Arc::new(Ledger::new(
            store.clone(),
            params.ledger.clone(),
            stats.clone(),
        ));
        LedgerContext {
            params,
            store,
            ledger,
            stats,
        }
    }

    pub fn genesis_key(&self) -> &KeyPair {
        &self.params.ledger.genesis_key
    }

    pub fn genesis_account(&self) -> Account {
        self.params.ledger.genesis_account
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.params.ledger.genesis.hash()
    }

    pub fn send_block(
        &self,
        key: &KeyPair,
        previous: BlockHash,
        destination: Account,
        balance: Amount,
    ) -> Arc<Block> {
        Arc::new(Block::Send(SendBlock::new(
            previous,
            destination,
            balance,
            key.secret_key(),
            &key.public_key(),
            work_for(&self.params, &previous),
        )))
    }

    pub fn receive_block(&self, key: &KeyPair, previous: BlockHash, source: BlockHash) -> Arc<Block> {
        Arc::new(Block::Receive(ReceiveBlock::new(
            previous,
            source,
            key.secret_key(),
            &key.public_key(),
            work_for(&self.params, &previous),
        )))
    }

    pub fn open_block(&self, key: &KeyPair, source: BlockHash, representative: Account) -> Arc<Block> {
        Arc::new(Block::Open(OpenBlock::new(
            source,
            representative,
            key.public_key(),
            key.secret_key(),
            &key.public_key(),
            work_for(&self.params, &key.public_key()),
        )))
    }

    pub fn change_block(&self, key: &KeyPair, previous: BlockHash, representative: Account) -> Arc<Block> {
        Arc::new(Block::Change(ChangeBlock::new(
            previous,
            representative,
            key.secret_key(),
            &key.public_key(),
            work_for(&self.params, &previous),
        )))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn state_block(
        &self,
        key: &KeyPair,
        account: Account,
        previous: BlockHash,
        representative: Account,
        balance: Amount,
        link: Link,
    ) -> Arc<Block> {
        let root = if previous.is_zero() { account } else { previous };
        Arc::new(Block::State(StateBlock::new(
            account,
            previous,
            representative,
            balance,
            link,
            key.secret_key(),
            &key.public_key(),
            work_for(&self.params, &root),
        )))
    }

    /// Epoch upgrade block signed by the epoch signer.
    pub fn epoch_block(&self, account: Account, previous: BlockHash, epoch: Epoch) -> Arc<Block> {
        let txn = self.store.tx_begin_read();
        let (balance, representative) = match self.store.account.get(&txn, &account) {
            Some(info) => (info.balance, info.representative),
            None => (U128::zero(), Account::zero()),
        };
        drop(txn);
        let root = if previous.is_zero() { account } else { previous };
        let signer = self.params.ledger.genesis_key.clone();
        Arc::new(Block::State(StateBlock::new(
            account,
            previous,
            representative,
            balance,
            *self.params.ledger.epochs.link(epoch).unwrap(),
            signer.secret_key(),
            &signer.public_key(),
            work_for(&self.params, &root),
        )))
    }

    /// Genesis sends `amount` to `key`, and `key` opens with itself as
    /// representative. Returns (send, open).
    pub fn fund(&self, key: &KeyPair, amount: Amount) -> (Arc<Block>, Arc<Block>) {
        use crate::ledger::ProcessResult;
        use lattice_types::SignatureVerification;
        let txn = self.store.tx_begin_write();
        let genesis_info = self
            .store
            .account
            .get(&txn, &self.genesis_account())
            .expect("genesis account");
        let send = self.state_block(
            self.genesis_key(),
            self.genesis_account(),
            genesis_info.head,
            self.genesis_account(),
            genesis_info.balance - amount,
            key.public_key(),
        );
        assert_eq!(
            self.ledger
                .process(&txn, &send, SignatureVerification::Unknown),
            ProcessResult::Progress
        );
        let open = self.state_block(
            key,
            key.public_key(),
            BlockHash::zero(),
            key.public_key(),
            amount,
            send.hash(),
        );
        assert_eq!(
            self.ledger
                .process(&txn, &open, SignatureVerification::Unknown),
            ProcessResult::Progress
        );
        (send, open)
    }
}
