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

//! Typed, transactional table layer over a `kvdb` column store.
//!
//! Reads are served from the committed state; a write transaction buffers an
//! ordered overlay with read-your-writes and commits atomically across
//! tables. At most one write transaction exists at a time, mirroring the
//! single-writer guarantee of the underlying engines.

use std::sync::Arc;

use kvdb::KeyValueDB;

mod stores;
mod transaction;

pub use stores::{
    block_account, AccountStore, BlockStore, ConfirmationHeightStore, FinalVoteStore,
    FrontierStore, OnlineWeightStore, PeerStore, PendingStore, PrunedStore, UncheckedStore,
    VersionStore,
};
pub use transaction::{ReadTransaction, Transaction, WriteTransaction};

/// Logical tables, one per database column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Table {
    Accounts = 0,
    Blocks = 1,
    Pending = 2,
    Frontiers = 3,
    Pruned = 4,
    ConfirmationHeight = 5,
    FinalVotes = 6,
    Unchecked = 7,
    Peers = 8,
    OnlineWeight = 9,
    Meta = 10,
}

pub const NUM_COLUMNS: u32 = 11;

impl Table {
    pub(crate) fn column(self) -> Option<u32> {
        Some(self as u32)
    }
}

/// Current schema version, stored under `meta[1]`. Migrations are
/// forward-only.
pub const SCHEMA_VERSION: u64 = 1;

/// The ledger database: one typed sub-store per table.
pub struct Store {
    db: Arc<dyn KeyValueDB>,
    write_lock: parking_lot::Mutex<()>,
    pub block: BlockStore,
    pub account: AccountStore,
    pub pending: PendingStore,
    pub frontier: FrontierStore,
    pub pruned: PrunedStore,
    pub confirmation_height: ConfirmationHeightStore,
    pub final_vote: FinalVoteStore,
    pub unchecked: UncheckedStore,
    pub peer: PeerStore,
    pub online_weight: OnlineWeightStore,
    pub version: VersionStore,
}

impl Store {
    pub fn new(db: Arc<dyn KeyValueDB>) -> Self {
        let store = Store {
            db: db.clone(),
            write_lock: parking_lot::Mutex::new(()),
            block: BlockStore,
            account: AccountStore,
            pending: PendingStore,
            frontier: FrontierStore,
            pruned: PrunedStore,
            confirmation_height: ConfirmationHeightStore,
            final_vote: FinalVoteStore,
            unchecked: UncheckedStore,
            peer: PeerStore,
            online_weight: OnlineWeightStore,
            version: VersionStore,
        };
        store.ensure_version();
        store
    }

    /// In-memory backend, the default for tests and ephemeral nodes.
    pub fn open_memory() -> Self {
        Self::new(Arc::new(kvdb_memorydb::create(NUM_COLUMNS)))
    }

    fn ensure_version(&self) {
        let txn = self.tx_begin_write();
        match self.version.get(&txn) {
            Some(version) => {
                // Forward-only; refusing to open newer schemas is the
                // migration hook.
                assert!(
                    version <= SCHEMA_VERSION,
                    "database schema {} is newer than this node ({})",
                    version,
                    SCHEMA_VERSION
                );
            }
            None => self.version.put(&txn, SCHEMA_VERSION),
        }
    }

    /// Snapshot-consistent read access.
    pub fn tx_begin_read(&self) -> ReadTransaction {
        ReadTransaction::new(self.db.clone())
    }

    /// Exclusive, atomic write access; commits on drop.
    pub fn tx_begin_write(&self) -> WriteTransaction {
        WriteTransaction::new(self.db.clone(), self.write_lock.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::H256;

    #[test]
    fn version_is_initialized_once() {
        let store = Store::open_memory();
        let txn = store.tx_begin_read();
        assert_eq!(store.version.get(&txn), Some(SCHEMA_VERSION));
    }

    #[test]
    fn write_overlay_is_read_back_within_the_transaction() {
        let store = Store::open_memory();
        let txn = store.tx_begin_write();
        let frontier = H256::repeat_byte(1);
        let account = H256::repeat_byte(2);
        store.frontier.put(&txn, &frontier, &account);
        assert_eq!(store.frontier.get(&txn, &frontier), Some(account));
        store.frontier.del(&txn, &frontier);
        assert_eq!(store.frontier.get(&txn, &frontier), None);
    }

    #[test]
    fn commit_is_atomic_across_tables() {
        let store = Store::open_memory();
        let frontier = H256::repeat_byte(1);
        let account = H256::repeat_byte(2);
        {
            let txn = store.tx_begin_write();
            store.frontier.put(&txn, &frontier, &account);
            store.pruned.put(&txn, &frontier);
            // Nothing is visible to readers until the transaction drops.
            let read = store.tx_begin_read();
            assert_eq!(store.frontier.get(&read, &frontier), None);
            assert!(!store.pruned.exists(&read, &frontier));
        }
        let read = store.tx_begin_read();
        assert_eq!(store.frontier.get(&read, &frontier), Some(account));
        assert!(store.pruned.exists(&read, &frontier));
    }
}
