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

//! Typed accessors, one per table.
//!
//! Values are the byte-exact codecs from `lattice-types`; keys are fixed
//! width so ordered iteration doubles as range query.

use std::sync::Arc;

use lattice_types::{
    Account, AccountInfo, Amount, Block, BlockHash, BlockSideband, BlockType,
    ConfirmationHeightInfo, EndpointKey, PendingInfo, PendingKey, QualifiedRoot, Root, StoredBlock,
    UncheckedInfo, UncheckedKey,
};

use crate::transaction::{Transaction, WriteTransaction};
use crate::Table;

fn be_u64(bytes: &[u8]) -> u64 {
    let mut array = [0u8; 8];
    array.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(array)
}

/// Canonical block rows: `hash → type ‖ block ‖ sideband`.
pub struct BlockStore;

impl BlockStore {
    pub fn put(
        &self,
        txn: &WriteTransaction,
        hash: &BlockHash,
        block: &Block,
        sideband: &BlockSideband,
    ) {
        let mut value = Vec::new();
        block.serialize_with_type(&mut value).expect("vec write");
        sideband
            .serialize(&mut value, block.block_type())
            .expect("vec write");
        txn.put(Table::Blocks, hash.as_bytes(), &value);
    }

    pub fn get(&self, txn: &dyn Transaction, hash: &BlockHash) -> Option<StoredBlock> {
        let value = txn.get(Table::Blocks, hash.as_bytes())?;
        Some(Self::decode(&value))
    }

    fn decode(value: &[u8]) -> StoredBlock {
        let mut stream = value;
        let block = Block::deserialize_with_type(&mut stream).expect("corrupt block row");
        let mut sideband = BlockSideband::deserialize(&mut stream, block.block_type())
            .expect("corrupt block sideband");
        // Send and state sidebands do not persist the balance; the block
        // itself carries it.
        if let Some(balance) = block.balance_field() {
            sideband.balance = balance;
        }
        if let Some(account) = block.account_field() {
            sideband.account = account;
        }
        StoredBlock::new(Arc::new(block), sideband)
    }

    pub fn exists(&self, txn: &dyn Transaction, hash: &BlockHash) -> bool {
        txn.exists(Table::Blocks, hash.as_bytes())
    }

    pub fn del(&self, txn: &WriteTransaction, hash: &BlockHash) {
        txn.delete(Table::Blocks, hash.as_bytes());
    }

    pub fn count(&self, txn: &dyn Transaction) -> usize {
        txn.count(Table::Blocks)
    }

    /// Chain successor recorded in the sideband, if one was linked yet.
    pub fn successor(&self, txn: &dyn Transaction, hash: &BlockHash) -> Option<BlockHash> {
        let stored = self.get(txn, hash)?;
        if stored.sideband.successor.is_zero() {
            None
        } else {
            Some(stored.sideband.successor)
        }
    }

    /// Rewrite the successor pointer of an existing row.
    pub fn put_successor(&self, txn: &WriteTransaction, hash: &BlockHash, successor: &BlockHash) {
        if let Some(mut stored) = self.get(txn, hash) {
            stored.sideband.successor = *successor;
            self.put(txn, hash, &stored.block, &stored.sideband);
        }
    }

    /// Owning account of a block row, from the sideband or the block itself.
    pub fn account(&self, txn: &dyn Transaction, hash: &BlockHash) -> Option<Account> {
        let stored = self.get(txn, hash)?;
        Some(block_account(&stored))
    }

    /// A uniformly random block row, for backlog sampling.
    pub fn random(&self, txn: &dyn Transaction) -> Option<StoredBlock> {
        use rand::RngCore;
        let mut start = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut start);
        txn.iter_from(Table::Blocks, &start)
            .next()
            .or_else(|| txn.iter(Table::Blocks).next())
            .map(|(_, value)| Self::decode(&value))
    }

    pub fn iter<'a>(
        &self,
        txn: &'a dyn Transaction,
    ) -> Box<dyn Iterator<Item = (BlockHash, StoredBlock)> + 'a> {
        Box::new(txn.iter(Table::Blocks).map(|(key, value)| {
            (BlockHash::from_slice(&key), Self::decode(&value))
        }))
    }
}

/// Account of a stored block, preferring the sideband for legacy rows.
pub fn block_account(stored: &StoredBlock) -> Account {
    stored
        .block
        .account_field()
        .unwrap_or(stored.sideband.account)
}

/// Account head pointers.
pub struct AccountStore;

impl AccountStore {
    pub fn put(&self, txn: &WriteTransaction, account: &Account, info: &AccountInfo) {
        txn.put(Table::Accounts, account.as_bytes(), &info.to_bytes());
    }

    pub fn get(&self, txn: &dyn Transaction, account: &Account) -> Option<AccountInfo> {
        let value = txn.get(Table::Accounts, account.as_bytes())?;
        Some(AccountInfo::deserialize(&mut value.as_slice()).expect("corrupt account row"))
    }

    pub fn exists(&self, txn: &dyn Transaction, account: &Account) -> bool {
        txn.exists(Table::Accounts, account.as_bytes())
    }

    pub fn del(&self, txn: &WriteTransaction, account: &Account) {
        txn.delete(Table::Accounts, account.as_bytes());
    }

    pub fn count(&self, txn: &dyn Transaction) -> usize {
        txn.count(Table::Accounts)
    }

    pub fn iter<'a>(
        &self,
        txn: &'a dyn Transaction,
    ) -> Box<dyn Iterator<Item = (Account, AccountInfo)> + 'a> {
        Box::new(txn.iter(Table::Accounts).map(|(key, value)| {
            (
                Account::from_slice(&key),
                AccountInfo::deserialize(&mut value.as_slice()).expect("corrupt account row"),
            )
        }))
    }
}

/// Unreceived transfers keyed by (destination, send hash).
pub struct PendingStore;

impl PendingStore {
    pub fn put(&self, txn: &WriteTransaction, key: &PendingKey, info: &PendingInfo) {
        txn.put(Table::Pending, &key.to_bytes(), &info.to_bytes());
    }

    pub fn get(&self, txn: &dyn Transaction, key: &PendingKey) -> Option<PendingInfo> {
        let value = txn.get(Table::Pending, &key.to_bytes())?;
        Some(PendingInfo::deserialize(&mut value.as_slice()).expect("corrupt pending row"))
    }

    pub fn exists(&self, txn: &dyn Transaction, key: &PendingKey) -> bool {
        txn.exists(Table::Pending, &key.to_bytes())
    }

    pub fn del(&self, txn: &WriteTransaction, key: &PendingKey) {
        txn.delete(Table::Pending, &key.to_bytes());
    }

    pub fn count(&self, txn: &dyn Transaction) -> usize {
        txn.count(Table::Pending)
    }

    /// All pending entries destined for `account`.
    pub fn account_range(
        &self,
        txn: &dyn Transaction,
        account: &Account,
    ) -> Vec<(PendingKey, PendingInfo)> {
        txn.iter_from(Table::Pending, account.as_bytes())
            .take_while(|(key, _)| &key[..32] == account.as_bytes())
            .map(|(key, value)| {
                (
                    PendingKey::from_bytes(&key).expect("corrupt pending key"),
                    PendingInfo::deserialize(&mut value.as_slice()).expect("corrupt pending row"),
                )
            })
            .collect()
    }

    pub fn iter<'a>(
        &self,
        txn: &'a dyn Transaction,
    ) -> Box<dyn Iterator<Item = (PendingKey, PendingInfo)> + 'a> {
        Box::new(txn.iter(Table::Pending).map(|(key, value)| {
            (
                PendingKey::from_bytes(&key).expect("corrupt pending key"),
                PendingInfo::deserialize(&mut value.as_slice()).expect("corrupt pending row"),
            )
        }))
    }
}

/// Legacy head-block → account index.
pub struct FrontierStore;

impl FrontierStore {
    pub fn put(&self, txn: &WriteTransaction, hash: &BlockHash, account: &Account) {
        txn.put(Table::Frontiers, hash.as_bytes(), account.as_bytes());
    }

    pub fn get(&self, txn: &dyn Transaction, hash: &BlockHash) -> Option<Account> {
        txn.get(Table::Frontiers, hash.as_bytes())
            .map(|value| Account::from_slice(&value))
    }

    pub fn del(&self, txn: &WriteTransaction, hash: &BlockHash) {
        txn.delete(Table::Frontiers, hash.as_bytes());
    }

    pub fn count(&self, txn: &dyn Transaction) -> usize {
        txn.count(Table::Frontiers)
    }
}

/// Hashes whose bodies were compacted away.
pub struct PrunedStore;

impl PrunedStore {
    pub fn put(&self, txn: &WriteTransaction, hash: &BlockHash) {
        txn.put(Table::Pruned, hash.as_bytes(), &[]);
    }

    pub fn exists(&self, txn: &dyn Transaction, hash: &BlockHash) -> bool {
        txn.exists(Table::Pruned, hash.as_bytes())
    }

    pub fn del(&self, txn: &WriteTransaction, hash: &BlockHash) {
        txn.delete(Table::Pruned, hash.as_bytes());
    }

    pub fn count(&self, txn: &dyn Transaction) -> usize {
        txn.count(Table::Pruned)
    }
}

/// Cemented tip per account.
pub struct ConfirmationHeightStore;

impl ConfirmationHeightStore {
    pub fn put(&self, txn: &WriteTransaction, account: &Account, info: &ConfirmationHeightInfo) {
        txn.put(Table::ConfirmationHeight, account.as_bytes(), &info.to_bytes());
    }

    /// Missing rows read as height zero.
    pub fn get(&self, txn: &dyn Transaction, account: &Account) -> ConfirmationHeightInfo {
        txn.get(Table::ConfirmationHeight, account.as_bytes())
            .map(|value| {
                ConfirmationHeightInfo::deserialize(&mut value.as_slice())
                    .expect("corrupt confirmation height row")
            })
            .unwrap_or_default()
    }

    pub fn exists(&self, txn: &dyn Transaction, account: &Account) -> bool {
        txn.exists(Table::ConfirmationHeight, account.as_bytes())
    }

    pub fn del(&self, txn: &WriteTransaction, account: &Account) {
        txn.delete(Table::ConfirmationHeight, account.as_bytes());
    }

    pub fn count(&self, txn: &dyn Transaction) -> usize {
        txn.count(Table::ConfirmationHeight)
    }

    pub fn iter<'a>(
        &self,
        txn: &'a dyn Transaction,
    ) -> Box<dyn Iterator<Item = (Account, ConfirmationHeightInfo)> + 'a> {
        Box::new(txn.iter(Table::ConfirmationHeight).map(|(key, value)| {
            (
                Account::from_slice(&key),
                ConfirmationHeightInfo::deserialize(&mut value.as_slice())
                    .expect("corrupt confirmation height row"),
            )
        }))
    }
}

/// Irrevocable final-vote commitments per qualified root.
pub struct FinalVoteStore;

impl FinalVoteStore {
    /// Record a final vote. Returns `true` when the stored hash matches the
    /// given one (inserting if absent); `false` means a conflicting final
    /// vote already exists and must win.
    pub fn put(&self, txn: &WriteTransaction, root: &QualifiedRoot, hash: &BlockHash) -> bool {
        let key = root.to_bytes();
        match txn.get(Table::FinalVotes, &key) {
            Some(existing) => BlockHash::from_slice(&existing) == *hash,
            None => {
                txn.put(Table::FinalVotes, &key, hash.as_bytes());
                true
            }
        }
    }

    /// All final-vote hashes recorded under `root`, any previous.
    pub fn get(&self, txn: &dyn Transaction, root: &Root) -> Vec<BlockHash> {
        txn.iter_from(Table::FinalVotes, root.as_bytes())
            .take_while(|(key, _)| &key[..32] == root.as_bytes())
            .map(|(_, value)| BlockHash::from_slice(&value))
            .collect()
    }

    /// Clear every final vote recorded under `root`; used by rollback.
    pub fn del(&self, txn: &WriteTransaction, root: &Root) {
        let keys: Vec<Vec<u8>> = txn
            .iter_from(Table::FinalVotes, root.as_bytes())
            .take_while(|(key, _)| &key[..32] == root.as_bytes())
            .map(|(key, _)| key)
            .collect();
        for key in keys {
            txn.delete(Table::FinalVotes, &key);
        }
    }

    pub fn count(&self, txn: &dyn Transaction) -> usize {
        txn.count(Table::FinalVotes)
    }
}

/// Staging area for blocks with a missing dependency.
pub struct UncheckedStore;

impl UncheckedStore {
    pub fn put(&self, txn: &WriteTransaction, dependency: &BlockHash, info: &UncheckedInfo) {
        let key = UncheckedKey::new(*dependency, info.block.hash());
        txn.put(Table::Unchecked, &key.to_bytes(), &info.to_bytes());
    }

    pub fn exists(&self, txn: &dyn Transaction, key: &UncheckedKey) -> bool {
        txn.exists(Table::Unchecked, &key.to_bytes())
    }

    pub fn del(&self, txn: &WriteTransaction, key: &UncheckedKey) {
        txn.delete(Table::Unchecked, &key.to_bytes());
    }

    /// Everything waiting on `dependency`.
    pub fn get(&self, txn: &dyn Transaction, dependency: &BlockHash) -> Vec<UncheckedInfo> {
        self.equal_range(txn, dependency)
            .into_iter()
            .map(|(_, info)| info)
            .collect()
    }

    pub fn equal_range(
        &self,
        txn: &dyn Transaction,
        dependency: &BlockHash,
    ) -> Vec<(UncheckedKey, UncheckedInfo)> {
        txn.iter_from(Table::Unchecked, dependency.as_bytes())
            .take_while(|(key, _)| &key[..32] == dependency.as_bytes())
            .map(|(key, value)| {
                (
                    UncheckedKey::from_bytes(&key).expect("corrupt unchecked key"),
                    UncheckedInfo::deserialize(&mut value.as_slice())
                        .expect("corrupt unchecked row"),
                )
            })
            .collect()
    }

    pub fn iter<'a>(
        &self,
        txn: &'a dyn Transaction,
    ) -> Box<dyn Iterator<Item = (UncheckedKey, UncheckedInfo)> + 'a> {
        Box::new(txn.iter(Table::Unchecked).map(|(key, value)| {
            (
                UncheckedKey::from_bytes(&key).expect("corrupt unchecked key"),
                UncheckedInfo::deserialize(&mut value.as_slice()).expect("corrupt unchecked row"),
            )
        }))
    }

    pub fn count(&self, txn: &dyn Transaction) -> usize {
        txn.count(Table::Unchecked)
    }

    pub fn clear(&self, txn: &WriteTransaction) {
        let keys: Vec<Vec<u8>> = txn.iter(Table::Unchecked).map(|(key, _)| key).collect();
        for key in keys {
            txn.delete(Table::Unchecked, &key);
        }
    }
}

/// Persisted peer endpoints.
pub struct PeerStore;

impl PeerStore {
    pub fn put(&self, txn: &WriteTransaction, endpoint: &EndpointKey) {
        txn.put(Table::Peers, &endpoint.to_bytes(), &[]);
    }

    pub fn del(&self, txn: &WriteTransaction, endpoint: &EndpointKey) {
        txn.delete(Table::Peers, &endpoint.to_bytes());
    }

    pub fn exists(&self, txn: &dyn Transaction, endpoint: &EndpointKey) -> bool {
        txn.exists(Table::Peers, &endpoint.to_bytes())
    }

    pub fn iter<'a>(&self, txn: &'a dyn Transaction) -> Box<dyn Iterator<Item = EndpointKey> + 'a> {
        Box::new(
            txn.iter(Table::Peers)
                .map(|(key, _)| EndpointKey::from_bytes(&key).expect("corrupt peer key")),
        )
    }

    pub fn count(&self, txn: &dyn Transaction) -> usize {
        txn.count(Table::Peers)
    }

    pub fn clear(&self, txn: &WriteTransaction) {
        let keys: Vec<Vec<u8>> = txn.iter(Table::Peers).map(|(key, _)| key).collect();
        for key in keys {
            txn.delete(Table::Peers, &key);
        }
    }
}

/// Trended online weight samples, keyed by sample time.
pub struct OnlineWeightStore;

impl OnlineWeightStore {
    pub fn put(&self, txn: &WriteTransaction, time: u64, amount: &Amount) {
        let mut value = [0u8; 16];
        amount.to_big_endian(&mut value);
        txn.put(Table::OnlineWeight, &time.to_be_bytes(), &value);
    }

    pub fn del(&self, txn: &WriteTransaction, time: u64) {
        txn.delete(Table::OnlineWeight, &time.to_be_bytes());
    }

    /// Samples in time order.
    pub fn iter<'a>(&self, txn: &'a dyn Transaction) -> Box<dyn Iterator<Item = (u64, Amount)> + 'a> {
        Box::new(
            txn.iter(Table::OnlineWeight)
                .map(|(key, value)| (be_u64(&key), Amount::from_big_endian(&value))),
        )
    }

    pub fn count(&self, txn: &dyn Transaction) -> usize {
        txn.count(Table::OnlineWeight)
    }

    pub fn clear(&self, txn: &WriteTransaction) {
        let keys: Vec<Vec<u8>> = txn.iter(Table::OnlineWeight).map(|(key, _)| key).collect();
        for key in keys {
            txn.delete(Table::OnlineWeight, &key);
        }
    }
}

const VERSION_KEY: [u8; 1] = [1];

/// Schema version under `meta[1]`.
pub struct VersionStore;

impl VersionStore {
    pub fn put(&self, txn: &WriteTransaction, version: u64) {
        txn.put(Table::Meta, &VERSION_KEY, &version.to_be_bytes());
    }

    pub fn get(&self, txn: &dyn Transaction) -> Option<u64> {
        txn.get(Table::Meta, &VERSION_KEY).map(|value| be_u64(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use ethereum_types::{H256, U128};
    use lattice_types::{Epoch, KeyPair, SendBlock};

    fn stored_send(key: &KeyPair) -> (BlockHash, Block, BlockSideband) {
        let block = Block::Send(SendBlock::new(
            H256::repeat_byte(9),
            H256::repeat_byte(2),
            U128::from(5u64),
            key.secret_key(),
            &key.public_key(),
            3,
        ));
        let sideband = BlockSideband::new(
            key.public_key(),
            BlockHash::zero(),
            U128::from(5u64),
            2,
            1000,
            Default::default(),
            Epoch::Epoch0,
        );
        (block.hash(), block, sideband)
    }

    #[test]
    fn block_row_round_trip() {
        let store = Store::open_memory();
        let key = KeyPair::generate();
        let (hash, block, sideband) = stored_send(&key);
        {
            let txn = store.tx_begin_write();
            store.block.put(&txn, &hash, &block, &sideband);
        }
        let txn = store.tx_begin_read();
        let stored = store.block.get(&txn, &hash).unwrap();
        assert_eq!(*stored.block, block);
        assert_eq!(stored.sideband, sideband);
        assert_eq!(store.block.account(&txn, &hash), Some(key.public_key()));
        assert_eq!(store.block.count(&txn), 1);
    }

    #[test]
    fn successor_updates_in_place() {
        let store = Store::open_memory();
        let key = KeyPair::generate();
        let (hash, block, sideband) = stored_send(&key);
        let successor = H256::repeat_byte(7);
        let txn = store.tx_begin_write();
        store.block.put(&txn, &hash, &block, &sideband);
        assert_eq!(store.block.successor(&txn, &hash), None);
        store.block.put_successor(&txn, &hash, &successor);
        assert_eq!(store.block.successor(&txn, &hash), Some(successor));
    }

    #[test]
    fn pending_account_range_stops_at_the_account_boundary() {
        let store = Store::open_memory();
        let low = H256::repeat_byte(1);
        let high = H256::repeat_byte(2);
        let txn = store.tx_begin_write();
        for (account, tag) in [(low, 1u8), (low, 2), (high, 3)].iter() {
            store.pending.put(
                &txn,
                &PendingKey::new(*account, H256::repeat_byte(*tag)),
                &PendingInfo::new(H256::repeat_byte(9), U128::one(), Epoch::Epoch0),
            );
        }
        assert_eq!(store.pending.account_range(&txn, &low).len(), 2);
        assert_eq!(store.pending.account_range(&txn, &high).len(), 1);
        assert_eq!(store.pending.account_range(&txn, &H256::repeat_byte(3)).len(), 0);
    }

    #[test]
    fn final_vote_put_rejects_conflicts() {
        let store = Store::open_memory();
        let root = QualifiedRoot::new(H256::repeat_byte(1), H256::repeat_byte(2));
        let txn = store.tx_begin_write();
        assert!(store.final_vote.put(&txn, &root, &H256::repeat_byte(3)));
        // Same hash is idempotent, a different one is refused.
        assert!(store.final_vote.put(&txn, &root, &H256::repeat_byte(3)));
        assert!(!store.final_vote.put(&txn, &root, &H256::repeat_byte(4)));
        assert_eq!(store.final_vote.get(&txn, &root.root), vec![H256::repeat_byte(3)]);
        store.final_vote.del(&txn, &root.root);
        assert_eq!(store.final_vote.count(&txn), 0);
    }

    #[test]
    fn online_weight_iterates_in_time_order() {
        let store = Store::open_memory();
        let txn = store.tx_begin_write();
        store.online_weight.put(&txn, 20, &U128::from(2u64));
        store.online_weight.put(&txn, 10, &U128::from(1u64));
        store.online_weight.put(&txn, 30, &U128::from(3u64));
        let times: Vec<u64> = store.online_weight.iter(&txn).map(|(time, _)| time).collect();
        assert_eq!(times, vec![10, 20, 30]);
    }

    #[test]
    fn unchecked_equal_range() {
        let store = Store::open_memory();
        let key = KeyPair::generate();
        let (_, block, _) = stored_send(&key);
        let dependency = H256::repeat_byte(4);
        let other = H256::repeat_byte(5);
        let txn = store.tx_begin_write();
        let info = UncheckedInfo::new(
            Arc::new(block),
            key.public_key(),
            lattice_types::SignatureVerification::Unknown,
        );
        store.unchecked.put(&txn, &dependency, &info);
        store.unchecked.put(&txn, &other, &info);
        assert_eq!(store.unchecked.get(&txn, &dependency).len(), 1);
        assert_eq!(store.unchecked.count(&txn), 2);
        store.unchecked.clear(&txn);
        assert_eq!(store.unchecked.count(&txn), 0);
    }
}
