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

//! Block variants and their ledger sidebands.
//!
//! Each account authors its own chain of blocks. Legacy variants (send,
//! receive, open, change) encode one operation each; the state variant
//! subsumes all of them plus epoch upgrades. Blocks hash their canonical
//! serialized form with Blake2b-256; the signature covers the hash, the work
//! nonce covers the root and is excluded from the hash.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};

use blake2::digest::Digest;
use ethereum_types::{H256, U128};
use parking_lot::Mutex;

use crate::epoch::Epoch;
use crate::numbers::{
    sign_message, Account, Amount, BlockHash, Link, QualifiedRoot, RawKey, Root, Signature,
};
use crate::utils;

type Blake2b256 = blake2::Blake2b<blake2::digest::consts::U32>;

/// Wire and database tag for each block variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockType {
    Invalid = 0,
    NotABlock = 1,
    Send = 2,
    Receive = 3,
    Open = 4,
    Change = 5,
    State = 6,
}

impl BlockType {
    pub fn from_u8(value: u8) -> Option<BlockType> {
        match value {
            0 => Some(BlockType::Invalid),
            1 => Some(BlockType::NotABlock),
            2 => Some(BlockType::Send),
            3 => Some(BlockType::Receive),
            4 => Some(BlockType::Open),
            5 => Some(BlockType::Change),
            6 => Some(BlockType::State),
            _ => None,
        }
    }
}

/// The ledger's classification of a block, packed into the sideband.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockDetails {
    pub epoch: Epoch,
    pub is_send: bool,
    pub is_receive: bool,
    pub is_epoch: bool,
}

impl BlockDetails {
    pub fn new(epoch: Epoch, is_send: bool, is_receive: bool, is_epoch: bool) -> Self {
        BlockDetails {
            epoch,
            is_send,
            is_receive,
            is_epoch,
        }
    }

    // Epoch fits the low five bits; flags take the top three.
    pub fn packed(&self) -> u8 {
        debug_assert!((self.epoch as u8) < 32);
        (self.epoch as u8)
            | (u8::from(self.is_send) << 7)
            | (u8::from(self.is_receive) << 6)
            | (u8::from(self.is_epoch) << 5)
    }

    pub fn unpack(packed: u8) -> Option<Self> {
        let epoch = Epoch::from_u8(packed & 0x1f)?;
        Some(BlockDetails {
            epoch,
            is_send: packed & 0x80 != 0,
            is_receive: packed & 0x40 != 0,
            is_epoch: packed & 0x20 != 0,
        })
    }
}

/// Metadata the ledger computes when a block is admitted; immutable after.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockSideband {
    pub successor: BlockHash,
    /// Chain owner; implied by the block itself for open and state blocks.
    pub account: Account,
    pub balance: Amount,
    pub height: u64,
    pub timestamp: u64,
    pub details: BlockDetails,
    /// Epoch of the pending entry consumed by a receive, if any.
    pub source_epoch: Epoch,
}

impl BlockSideband {
    pub fn new(
        account: Account,
        successor: BlockHash,
        balance: Amount,
        height: u64,
        timestamp: u64,
        details: BlockDetails,
        source_epoch: Epoch,
    ) -> Self {
        BlockSideband {
            successor,
            account,
            balance,
            height,
            timestamp,
            details,
            source_epoch,
        }
    }

    /// The encoding is block-type-dependent: fields the block itself implies
    /// are omitted, and must stay byte-exact across schema versions.
    pub fn serialize(&self, stream: &mut dyn io::Write, block_type: BlockType) -> io::Result<()> {
        utils::write_h256(stream, &self.successor)?;
        if block_type != BlockType::State && block_type != BlockType::Open {
            utils::write_h256(stream, &self.account)?;
        }
        if block_type != BlockType::Open {
            utils::write_u64_be(stream, self.height)?;
        }
        if block_type == BlockType::Receive
            || block_type == BlockType::Change
            || block_type == BlockType::Open
        {
            utils::write_u128_be(stream, &self.balance)?;
        }
        utils::write_u64_be(stream, self.timestamp)?;
        if block_type == BlockType::State {
            stream.write_all(&[self.details.packed(), self.source_epoch as u8])?;
        }
        Ok(())
    }

    pub fn deserialize(stream: &mut dyn io::Read, block_type: BlockType) -> io::Result<Self> {
        let successor = utils::read_h256(stream)?;
        let account = if block_type != BlockType::State && block_type != BlockType::Open {
            utils::read_h256(stream)?
        } else {
            Account::zero()
        };
        let height = if block_type != BlockType::Open {
            utils::read_u64_be(stream)?
        } else {
            1
        };
        let balance = if block_type == BlockType::Receive
            || block_type == BlockType::Change
            || block_type == BlockType::Open
        {
            utils::read_u128_be(stream)?
        } else {
            Amount::zero()
        };
        let timestamp = utils::read_u64_be(stream)?;
        let (details, source_epoch) = if block_type == BlockType::State {
            let mut bytes = [0u8; 2];
            stream.read_exact(&mut bytes)?;
            let details =
                BlockDetails::unpack(bytes[0]).ok_or_else(|| utils::invalid_data("details"))?;
            let source_epoch =
                Epoch::from_u8(bytes[1]).ok_or_else(|| utils::invalid_data("source epoch"))?;
            (details, source_epoch)
        } else {
            (BlockDetails::default(), Epoch::Epoch0)
        };
        Ok(BlockSideband {
            successor,
            account,
            balance,
            height,
            timestamp,
            details,
            source_epoch,
        })
    }
}

fn hash_parts(parts: &[&[u8]]) -> BlockHash {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&hasher.finalize());
    H256(bytes)
}

fn amount_be(value: &Amount) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    value.to_big_endian(&mut bytes);
    bytes
}

macro_rules! impl_block_common {
    ($name:ident) => {
        impl $name {
            pub fn hash(&self) -> BlockHash {
                self.hash
            }

            pub fn work(&self) -> u64 {
                self.work
            }

            pub fn set_work(&mut self, work: u64) {
                self.work = work;
            }

            pub fn signature(&self) -> &Signature {
                &self.signature
            }

            pub fn set_signature(&mut self, signature: Signature) {
                self.signature = signature;
            }
        }
    };
}

/// Debits the account; `balance` is the remainder after the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendBlock {
    pub previous: BlockHash,
    pub destination: Account,
    pub balance: Amount,
    signature: Signature,
    work: u64,
    hash: BlockHash,
}

impl_block_common!(SendBlock);

impl SendBlock {
    pub const SERIALIZED_SIZE: usize = 32 + 32 + 16 + 64 + 8;

    pub fn new(
        previous: BlockHash,
        destination: Account,
        balance: Amount,
        secret: &RawKey,
        public: &Account,
        work: u64,
    ) -> Self {
        let hash = Self::hash_for(&previous, &destination, &balance);
        let signature = sign_message(secret, public, hash.as_bytes());
        SendBlock {
            previous,
            destination,
            balance,
            signature,
            work,
            hash,
        }
    }

    fn hash_for(previous: &BlockHash, destination: &Account, balance: &Amount) -> BlockHash {
        hash_parts(&[
            previous.as_bytes(),
            destination.as_bytes(),
            &amount_be(balance),
        ])
    }

    pub fn serialize(&self, stream: &mut dyn io::Write) -> io::Result<()> {
        utils::write_h256(stream, &self.previous)?;
        utils::write_h256(stream, &self.destination)?;
        utils::write_u128_be(stream, &self.balance)?;
        utils::write_h512(stream, &self.signature)?;
        utils::write_u64_le(stream, self.work)
    }

    pub fn deserialize(stream: &mut dyn io::Read) -> io::Result<Self> {
        let previous = utils::read_h256(stream)?;
        let destination = utils::read_h256(stream)?;
        let balance = utils::read_u128_be(stream)?;
        let signature = utils::read_h512(stream)?;
        let work = utils::read_u64_le(stream)?;
        let hash = Self::hash_for(&previous, &destination, &balance);
        Ok(SendBlock {
            previous,
            destination,
            balance,
            signature,
            work,
            hash,
        })
    }
}

/// Credits the account with the pending amount of the `source` send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveBlock {
    pub previous: BlockHash,
    pub source: BlockHash,
    signature: Signature,
    work: u64,
    hash: BlockHash,
}

impl_block_common!(ReceiveBlock);

impl ReceiveBlock {
    pub const SERIALIZED_SIZE: usize = 32 + 32 + 64 + 8;

    pub fn new(
        previous: BlockHash,
        source: BlockHash,
        secret: &RawKey,
        public: &Account,
        work: u64,
    ) -> Self {
        let hash = hash_parts(&[previous.as_bytes(), source.as_bytes()]);
        let signature = sign_message(secret, public, hash.as_bytes());
        ReceiveBlock {
            previous,
            source,
            signature,
            work,
            hash,
        }
    }

    pub fn serialize(&self, stream: &mut dyn io::Write) -> io::Result<()> {
        utils::write_h256(stream, &self.previous)?;
        utils::write_h256(stream, &self.source)?;
        utils::write_h512(stream, &self.signature)?;
        utils::write_u64_le(stream, self.work)
    }

    pub fn deserialize(stream: &mut dyn io::Read) -> io::Result<Self> {
        let previous = utils::read_h256(stream)?;
        let source = utils::read_h256(stream)?;
        let signature = utils::read_h512(stream)?;
        let work = utils::read_u64_le(stream)?;
        let hash = hash_parts(&[previous.as_bytes(), source.as_bytes()]);
        Ok(ReceiveBlock {
            previous,
            source,
            signature,
            work,
            hash,
        })
    }
}

/// First block of a chain; receives from `source` and sets the initial
/// representative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenBlock {
    pub source: BlockHash,
    pub representative: Account,
    pub account: Account,
    signature: Signature,
    work: u64,
    hash: BlockHash,
}

impl_block_common!(OpenBlock);

impl OpenBlock {
    pub const SERIALIZED_SIZE: usize = 32 + 32 + 32 + 64 + 8;

    pub fn new(
        source: BlockHash,
        representative: Account,
        account: Account,
        secret: &RawKey,
        public: &Account,
        work: u64,
    ) -> Self {
        let hash = hash_parts(&[
            source.as_bytes(),
            representative.as_bytes(),
            account.as_bytes(),
        ]);
        let signature = sign_message(secret, public, hash.as_bytes());
        OpenBlock {
            source,
            representative,
            account,
            signature,
            work,
            hash,
        }
    }

    pub fn serialize(&self, stream: &mut dyn io::Write) -> io::Result<()> {
        utils::write_h256(stream, &self.source)?;
        utils::write_h256(stream, &self.representative)?;
        utils::write_h256(stream, &self.account)?;
        utils::write_h512(stream, &self.signature)?;
        utils::write_u64_le(stream, self.work)
    }

    pub fn deserialize(stream: &mut dyn io::Read) -> io::Result<Self> {
        let source = utils::read_h256(stream)?;
        let representative = utils::read_h256(stream)?;
        let account = utils::read_h256(stream)?;
        let signature = utils::read_h512(stream)?;
        let work = utils::read_u64_le(stream)?;
        let hash = hash_parts(&[
            source.as_bytes(),
            representative.as_bytes(),
            account.as_bytes(),
        ]);
        Ok(OpenBlock {
            source,
            representative,
            account,
            signature,
            work,
            hash,
        })
    }
}

/// Switches representative without moving balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBlock {
    pub previous: BlockHash,
    pub representative: Account,
    signature: Signature,
    work: u64,
    hash: BlockHash,
}

impl_block_common!(ChangeBlock);

impl ChangeBlock {
    pub const SERIALIZED_SIZE: usize = 32 + 32 + 64 + 8;

    pub fn new(
        previous: BlockHash,
        representative: Account,
        secret: &RawKey,
        public: &Account,
        work: u64,
    ) -> Self {
        let hash = hash_parts(&[previous.as_bytes(), representative.as_bytes()]);
        let signature = sign_message(secret, public, hash.as_bytes());
        ChangeBlock {
            previous,
            representative,
            signature,
            work,
            hash,
        }
    }

    pub fn serialize(&self, stream: &mut dyn io::Write) -> io::Result<()> {
        utils::write_h256(stream, &self.previous)?;
        utils::write_h256(stream, &self.representative)?;
        utils::write_h512(stream, &self.signature)?;
        utils::write_u64_le(stream, self.work)
    }

    pub fn deserialize(stream: &mut dyn io::Read) -> io::Result<Self> {
        let previous = utils::read_h256(stream)?;
        let representative = utils::read_h256(stream)?;
        let signature = utils::read_h512(stream)?;
        let work = utils::read_u64_le(stream)?;
        let hash = hash_parts(&[previous.as_bytes(), representative.as_bytes()]);
        Ok(ChangeBlock {
            previous,
            representative,
            signature,
            work,
            hash,
        })
    }
}

/// Universal block: send, receive, change or epoch depending on the balance
/// delta and link. The hash preamble pins the variant tag so a state block
/// can never collide with a legacy block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateBlock {
    pub account: Account,
    pub previous: BlockHash,
    pub representative: Account,
    pub balance: Amount,
    pub link: Link,
    signature: Signature,
    work: u64,
    hash: BlockHash,
}

impl_block_common!(StateBlock);

impl StateBlock {
    pub const SERIALIZED_SIZE: usize = 32 + 32 + 32 + 16 + 32 + 64 + 8;

    pub fn new(
        account: Account,
        previous: BlockHash,
        representative: Account,
        balance: Amount,
        link: Link,
        secret: &RawKey,
        public: &Account,
        work: u64,
    ) -> Self {
        let hash = Self::hash_for(&account, &previous, &representative, &balance, &link);
        let signature = sign_message(secret, public, hash.as_bytes());
        StateBlock {
            account,
            previous,
            representative,
            balance,
            link,
            signature,
            work,
            hash,
        }
    }

    fn hash_for(
        account: &Account,
        previous: &BlockHash,
        representative: &Account,
        balance: &Amount,
        link: &Link,
    ) -> BlockHash {
        let mut preamble = [0u8; 32];
        preamble[31] = BlockType::State as u8;
        hash_parts(&[
            &preamble,
            account.as_bytes(),
            previous.as_bytes(),
            representative.as_bytes(),
            &amount_be(balance),
            link.as_bytes(),
        ])
    }

    pub fn serialize(&self, stream: &mut dyn io::Write) -> io::Result<()> {
        utils::write_h256(stream, &self.account)?;
        utils::write_h256(stream, &self.previous)?;
        utils::write_h256(stream, &self.representative)?;
        utils::write_u128_be(stream, &self.balance)?;
        utils::write_h256(stream, &self.link)?;
        utils::write_h512(stream, &self.signature)?;
        // State blocks write their work big-endian, unlike legacy blocks.
        utils::write_u64_be(stream, self.work)
    }

    pub fn deserialize(stream: &mut dyn io::Read) -> io::Result<Self> {
        let account = utils::read_h256(stream)?;
        let previous = utils::read_h256(stream)?;
        let representative = utils::read_h256(stream)?;
        let balance = utils::read_u128_be(stream)?;
        let link = utils::read_h256(stream)?;
        let signature = utils::read_h512(stream)?;
        let work = utils::read_u64_be(stream)?;
        let hash = Self::hash_for(&account, &previous, &representative, &balance, &link);
        Ok(StateBlock {
            account,
            previous,
            representative,
            balance,
            link,
            signature,
            work,
            hash,
        })
    }
}

/// A block of any variant. Dispatch is an exhaustive match on the tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Send(SendBlock),
    Receive(ReceiveBlock),
    Open(OpenBlock),
    Change(ChangeBlock),
    State(StateBlock),
}

impl Block {
    pub fn block_type(&self) -> BlockType {
        match self {
            Block::Send(_) => BlockType::Send,
            Block::Receive(_) => BlockType::Receive,
            Block::Open(_) => BlockType::Open,
            Block::Change(_) => BlockType::Change,
            Block::State(_) => BlockType::State,
        }
    }

    pub fn hash(&self) -> BlockHash {
        match self {
            Block::Send(b) => b.hash(),
            Block::Receive(b) => b.hash(),
            Block::Open(b) => b.hash(),
            Block::Change(b) => b.hash(),
            Block::State(b) => b.hash(),
        }
    }

    /// Previous block in the account chain; zero for the first block.
    pub fn previous(&self) -> BlockHash {
        match self {
            Block::Send(b) => b.previous,
            Block::Receive(b) => b.previous,
            Block::Open(_) => BlockHash::zero(),
            Block::Change(b) => b.previous,
            Block::State(b) => b.previous,
        }
    }

    /// The work root: previous for successor blocks, the account for first
    /// blocks.
    pub fn root(&self) -> Root {
        let previous = self.previous();
        if !previous.is_zero() {
            previous
        } else {
            match self {
                Block::Open(b) => b.account,
                Block::State(b) => b.account,
                // Legacy non-open blocks always carry a previous.
                _ => previous,
            }
        }
    }

    pub fn qualified_root(&self) -> QualifiedRoot {
        QualifiedRoot::new(self.root(), self.previous())
    }

    pub fn account_field(&self) -> Option<Account> {
        match self {
            Block::Open(b) => Some(b.account),
            Block::State(b) => Some(b.account),
            _ => None,
        }
    }

    pub fn representative_field(&self) -> Option<Account> {
        match self {
            Block::Open(b) => Some(b.representative),
            Block::Change(b) => Some(b.representative),
            Block::State(b) => Some(b.representative),
            _ => None,
        }
    }

    pub fn balance_field(&self) -> Option<Amount> {
        match self {
            Block::Send(b) => Some(b.balance),
            Block::State(b) => Some(b.balance),
            _ => None,
        }
    }

    /// Source block hash for legacy receives and opens.
    pub fn source_field(&self) -> Option<BlockHash> {
        match self {
            Block::Receive(b) => Some(b.source),
            Block::Open(b) => Some(b.source),
            _ => None,
        }
    }

    pub fn destination_field(&self) -> Option<Account> {
        match self {
            Block::Send(b) => Some(b.destination),
            _ => None,
        }
    }

    pub fn link_field(&self) -> Option<Link> {
        match self {
            Block::State(b) => Some(b.link),
            _ => None,
        }
    }

    pub fn work(&self) -> u64 {
        match self {
            Block::Send(b) => b.work(),
            Block::Receive(b) => b.work(),
            Block::Open(b) => b.work(),
            Block::Change(b) => b.work(),
            Block::State(b) => b.work(),
        }
    }

    pub fn set_work(&mut self, work: u64) {
        match self {
            Block::Send(b) => b.set_work(work),
            Block::Receive(b) => b.set_work(work),
            Block::Open(b) => b.set_work(work),
            Block::Change(b) => b.set_work(work),
            Block::State(b) => b.set_work(work),
        }
    }

    pub fn signature(&self) -> &Signature {
        match self {
            Block::Send(b) => b.signature(),
            Block::Receive(b) => b.signature(),
            Block::Open(b) => b.signature(),
            Block::Change(b) => b.signature(),
            Block::State(b) => b.signature(),
        }
    }

    pub fn serialize(&self, stream: &mut dyn io::Write) -> io::Result<()> {
        match self {
            Block::Send(b) => b.serialize(stream),
            Block::Receive(b) => b.serialize(stream),
            Block::Open(b) => b.serialize(stream),
            Block::Change(b) => b.serialize(stream),
            Block::State(b) => b.serialize(stream),
        }
    }

    /// Serialize prefixed with the type tag.
    pub fn serialize_with_type(&self, stream: &mut dyn io::Write) -> io::Result<()> {
        stream.write_all(&[self.block_type() as u8])?;
        self.serialize(stream)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::serialized_size(self.block_type()));
        self.serialize(&mut bytes).expect("vec write");
        bytes
    }

    pub fn serialized_size(block_type: BlockType) -> usize {
        match block_type {
            BlockType::Send => SendBlock::SERIALIZED_SIZE,
            BlockType::Receive => ReceiveBlock::SERIALIZED_SIZE,
            BlockType::Open => OpenBlock::SERIALIZED_SIZE,
            BlockType::Change => ChangeBlock::SERIALIZED_SIZE,
            BlockType::State => StateBlock::SERIALIZED_SIZE,
            BlockType::Invalid | BlockType::NotABlock => 0,
        }
    }

    pub fn deserialize(block_type: BlockType, stream: &mut dyn io::Read) -> io::Result<Block> {
        match block_type {
            BlockType::Send => Ok(Block::Send(SendBlock::deserialize(stream)?)),
            BlockType::Receive => Ok(Block::Receive(ReceiveBlock::deserialize(stream)?)),
            BlockType::Open => Ok(Block::Open(OpenBlock::deserialize(stream)?)),
            BlockType::Change => Ok(Block::Change(ChangeBlock::deserialize(stream)?)),
            BlockType::State => Ok(Block::State(StateBlock::deserialize(stream)?)),
            BlockType::Invalid | BlockType::NotABlock => Err(utils::invalid_data("block type")),
        }
    }

    /// Deserialize a type-prefixed block.
    pub fn deserialize_with_type(stream: &mut dyn io::Read) -> io::Result<Block> {
        let mut tag = [0u8; 1];
        stream.read_exact(&mut tag)?;
        let block_type = BlockType::from_u8(tag[0]).ok_or_else(|| utils::invalid_data("tag"))?;
        Self::deserialize(block_type, stream)
    }

    /// Digest over hash, signature and work; distinguishes otherwise equal
    /// blocks republished with different nonces.
    pub fn full_hash(&self) -> BlockHash {
        hash_parts(&[
            self.hash().as_bytes(),
            self.signature().as_bytes(),
            &self.work().to_le_bytes(),
        ])
    }

    /// Whether a block of `previous_type` may precede this block in a chain.
    pub fn valid_predecessor(&self, previous_type: BlockType) -> bool {
        if matches!(self, Block::Open(_)) {
            return false;
        }
        !matches!(previous_type, BlockType::Invalid | BlockType::NotABlock)
    }
}

/// A block row as read back from the store: the block plus its sideband.
#[derive(Debug, Clone)]
pub struct StoredBlock {
    pub block: Arc<Block>,
    pub sideband: BlockSideband,
}

impl StoredBlock {
    pub fn new(block: Arc<Block>, sideband: BlockSideband) -> Self {
        StoredBlock { block, sideband }
    }
}

const UNIQUER_CLEANUP_INTERVAL: usize = 256;

/// Deduplicates structurally identical blocks behind weak references so
/// repeated publishes resolve to one allocation (and one signature check).
#[derive(Default)]
pub struct BlockUniquer {
    blocks: Mutex<HashMap<BlockHash, Weak<Block>>>,
}

impl BlockUniquer {
    pub fn unique(&self, block: &Arc<Block>) -> Arc<Block> {
        let key = block.full_hash();
        let mut blocks = self.blocks.lock();
        let result = match blocks.get(&key).and_then(Weak::upgrade) {
            Some(existing) => existing,
            None => {
                blocks.insert(key, Arc::downgrade(block));
                block.clone()
            }
        };
        if blocks.len() % UNIQUER_CLEANUP_INTERVAL == 0 {
            blocks.retain(|_, weak| weak.strong_count() > 0);
        }
        result
    }

    pub fn size(&self) -> usize {
        self.blocks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numbers::KeyPair;

    fn test_send(key: &KeyPair) -> SendBlock {
        SendBlock::new(
            H256::repeat_byte(1),
            H256::repeat_byte(2),
            U128::from(100u64),
            key.secret_key(),
            &key.public_key(),
            7,
        )
    }

    #[test]
    fn send_round_trip_preserves_hash_and_signature() {
        let key = KeyPair::generate();
        let block = Block::Send(test_send(&key));
        let mut bytes = Vec::new();
        block.serialize(&mut bytes).unwrap();
        assert_eq!(bytes.len(), SendBlock::SERIALIZED_SIZE);
        let restored = Block::deserialize(BlockType::Send, &mut bytes.as_slice()).unwrap();
        assert_eq!(block, restored);
        assert_eq!(block.hash(), restored.hash());
        assert_eq!(block.signature(), restored.signature());
    }

    #[test]
    fn state_round_trip() {
        let key = KeyPair::generate();
        let block = Block::State(StateBlock::new(
            key.public_key(),
            H256::repeat_byte(4),
            H256::repeat_byte(5),
            U128::from(42u64),
            H256::repeat_byte(6),
            key.secret_key(),
            &key.public_key(),
            0x0102_0304_0506_0708,
        ));
        let mut bytes = Vec::new();
        block.serialize_with_type(&mut bytes).unwrap();
        assert_eq!(bytes.len(), StateBlock::SERIALIZED_SIZE + 1);
        let restored = Block::deserialize_with_type(&mut bytes.as_slice()).unwrap();
        assert_eq!(block, restored);
    }

    #[test]
    fn state_hash_differs_from_legacy_shape() {
        // The preamble keeps a state block from colliding with an open block
        // over the same field bytes.
        let key = KeyPair::generate();
        let state = StateBlock::new(
            key.public_key(),
            BlockHash::zero(),
            H256::repeat_byte(5),
            U128::zero(),
            H256::repeat_byte(6),
            key.secret_key(),
            &key.public_key(),
            0,
        );
        let open = OpenBlock::new(
            H256::repeat_byte(6),
            H256::repeat_byte(5),
            key.public_key(),
            key.secret_key(),
            &key.public_key(),
            0,
        );
        assert_ne!(state.hash(), open.hash());
    }

    #[test]
    fn signature_covers_hash() {
        let key = KeyPair::generate();
        let block = test_send(&key);
        assert!(crate::numbers::validate_message(
            &key.public_key(),
            block.hash().as_bytes(),
            block.signature()
        ));
    }

    #[test]
    fn work_is_not_part_of_the_hash() {
        let key = KeyPair::generate();
        let mut block = test_send(&key);
        let hash = block.hash();
        block.set_work(0xdead_beef);
        assert_eq!(hash, block.hash());
    }

    #[test]
    fn root_of_open_is_the_account() {
        let key = KeyPair::generate();
        let open = Block::Open(OpenBlock::new(
            H256::repeat_byte(1),
            H256::repeat_byte(2),
            key.public_key(),
            key.secret_key(),
            &key.public_key(),
            0,
        ));
        assert_eq!(open.root(), key.public_key());
        assert_eq!(open.previous(), BlockHash::zero());
    }

    #[test]
    fn sideband_round_trip_state() {
        let sideband = BlockSideband::new(
            H256::repeat_byte(1),
            H256::repeat_byte(2),
            U128::from(3u64),
            4,
            5,
            BlockDetails::new(Epoch::Epoch2, true, false, false),
            Epoch::Epoch1,
        );
        let mut bytes = Vec::new();
        sideband.serialize(&mut bytes, BlockType::State).unwrap();
        let restored = BlockSideband::deserialize(&mut bytes.as_slice(), BlockType::State).unwrap();
        assert_eq!(sideband, restored);
    }

    #[test]
    fn sideband_open_omits_account_and_height() {
        let sideband = BlockSideband::new(
            H256::repeat_byte(1),
            H256::repeat_byte(2),
            U128::from(3u64),
            1,
            5,
            BlockDetails::default(),
            Epoch::Epoch0,
        );
        let mut bytes = Vec::new();
        sideband.serialize(&mut bytes, BlockType::Open).unwrap();
        // successor + balance + timestamp only
        assert_eq!(bytes.len(), 32 + 16 + 8);
        let restored = BlockSideband::deserialize(&mut bytes.as_slice(), BlockType::Open).unwrap();
        assert_eq!(restored.height, 1);
        assert_eq!(restored.balance, sideband.balance);
        assert_eq!(restored.successor, sideband.successor);
    }

    #[test]
    fn details_pack_round_trip() {
        for &(epoch, is_send, is_receive, is_epoch) in &[
            (Epoch::Epoch0, false, false, false),
            (Epoch::Epoch1, true, false, false),
            (Epoch::Epoch2, false, true, false),
            (Epoch::Epoch2, false, false, true),
        ] {
            let details = BlockDetails::new(epoch, is_send, is_receive, is_epoch);
            assert_eq!(BlockDetails::unpack(details.packed()), Some(details));
        }
    }

    #[test]
    fn uniquer_returns_the_first_instance() {
        let key = KeyPair::generate();
        let uniquer = BlockUniquer::default();
        let first = Arc::new(Block::Send(test_send(&key)));
        let second = Arc::new(Block::Send(test_send(&key)));
        let unique_first = uniquer.unique(&first);
        let unique_second = uniquer.unique(&second);
        assert!(Arc::ptr_eq(&unique_first, &first));
        assert!(Arc::ptr_eq(&unique_second, &first));
    }
}
