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

//! Ledger metadata records and their database codecs.

use std::io;
use std::sync::Arc;

use crate::blocks::Block;
use crate::epoch::Epoch;
use crate::numbers::{Account, Amount, BlockHash};
use crate::utils;

/// Per-account head pointers and counters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AccountInfo {
    pub head: BlockHash,
    pub representative: Account,
    pub open_block: BlockHash,
    pub balance: Amount,
    /// Seconds since unix epoch of the last head change.
    pub modified: u64,
    pub block_count: u64,
    pub epoch: Epoch,
}

impl AccountInfo {
    pub fn serialize(&self, stream: &mut dyn io::Write) -> io::Result<()> {
        utils::write_h256(stream, &self.head)?;
        utils::write_h256(stream, &self.representative)?;
        utils::write_h256(stream, &self.open_block)?;
        utils::write_u128_be(stream, &self.balance)?;
        utils::write_u64_be(stream, self.modified)?;
        utils::write_u64_be(stream, self.block_count)?;
        stream.write_all(&[self.epoch as u8])
    }

    pub fn deserialize(stream: &mut dyn io::Read) -> io::Result<Self> {
        let head = utils::read_h256(stream)?;
        let representative = utils::read_h256(stream)?;
        let open_block = utils::read_h256(stream)?;
        let balance = utils::read_u128_be(stream)?;
        let modified = utils::read_u64_be(stream)?;
        let block_count = utils::read_u64_be(stream)?;
        let mut epoch = [0u8; 1];
        stream.read_exact(&mut epoch)?;
        Ok(AccountInfo {
            head,
            representative,
            open_block,
            balance,
            modified,
            block_count,
            epoch: Epoch::from_u8(epoch[0]).ok_or_else(|| utils::invalid_data("epoch"))?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32 * 3 + 16 + 8 + 8 + 1);
        self.serialize(&mut bytes).expect("vec write");
        bytes
    }
}

/// Key of an unreceived transfer: destination account plus send block hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PendingKey {
    pub account: Account,
    pub hash: BlockHash,
}

impl PendingKey {
    pub fn new(account: Account, hash: BlockHash) -> Self {
        PendingKey { account, hash }
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(self.account.as_bytes());
        bytes[32..].copy_from_slice(self.hash.as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() != 64 {
            return Err(utils::invalid_data("pending key length"));
        }
        Ok(PendingKey {
            account: Account::from_slice(&bytes[..32]),
            hash: BlockHash::from_slice(&bytes[32..]),
        })
    }
}

/// Value of an unreceived transfer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PendingInfo {
    pub source: Account,
    pub amount: Amount,
    pub epoch: Epoch,
}

impl PendingInfo {
    pub fn new(source: Account, amount: Amount, epoch: Epoch) -> Self {
        PendingInfo {
            source,
            amount,
            epoch,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32 + 16 + 1);
        utils::write_h256(&mut bytes, &self.source).expect("vec write");
        utils::write_u128_be(&mut bytes, &self.amount).expect("vec write");
        bytes.push(self.epoch as u8);
        bytes
    }

    pub fn deserialize(stream: &mut dyn io::Read) -> io::Result<Self> {
        let source = utils::read_h256(stream)?;
        let amount = utils::read_u128_be(stream)?;
        let mut epoch = [0u8; 1];
        stream.read_exact(&mut epoch)?;
        Ok(PendingInfo {
            source,
            amount,
            epoch: Epoch::from_u8(epoch[0]).ok_or_else(|| utils::invalid_data("epoch"))?,
        })
    }
}

/// The cemented tip of an account chain.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfirmationHeightInfo {
    pub height: u64,
    pub frontier: BlockHash,
}

impl ConfirmationHeightInfo {
    pub fn new(height: u64, frontier: BlockHash) -> Self {
        ConfirmationHeightInfo { height, frontier }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + 32);
        utils::write_u64_be(&mut bytes, self.height).expect("vec write");
        utils::write_h256(&mut bytes, &self.frontier).expect("vec write");
        bytes
    }

    pub fn deserialize(stream: &mut dyn io::Read) -> io::Result<Self> {
        let height = utils::read_u64_be(stream)?;
        let frontier = utils::read_h256(stream)?;
        Ok(ConfirmationHeightInfo { height, frontier })
    }
}

/// How far signature checking has progressed for a queued block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SignatureVerification {
    Unknown = 0,
    Invalid = 1,
    Valid = 2,
    /// Valid as an epoch block, signed by the epoch signer.
    ValidEpoch = 3,
}

impl SignatureVerification {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SignatureVerification::Unknown),
            1 => Some(SignatureVerification::Invalid),
            2 => Some(SignatureVerification::Valid),
            3 => Some(SignatureVerification::ValidEpoch),
            _ => None,
        }
    }
}

impl Default for SignatureVerification {
    fn default() -> Self {
        SignatureVerification::Unknown
    }
}

/// Key of the staging area for blocks with a missing dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UncheckedKey {
    /// The dependency the block is waiting for.
    pub previous: BlockHash,
    pub hash: BlockHash,
}

impl UncheckedKey {
    pub fn new(previous: BlockHash, hash: BlockHash) -> Self {
        UncheckedKey { previous, hash }
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(self.previous.as_bytes());
        bytes[32..].copy_from_slice(self.hash.as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() != 64 {
            return Err(utils::invalid_data("unchecked key length"));
        }
        Ok(UncheckedKey {
            previous: BlockHash::from_slice(&bytes[..32]),
            hash: BlockHash::from_slice(&bytes[32..]),
        })
    }
}

/// A block waiting in the staging area, with what was known on arrival.
#[derive(Debug, Clone)]
pub struct UncheckedInfo {
    pub block: Arc<Block>,
    /// Chain owner when known ahead of admission, zero otherwise.
    pub account: Account,
    /// Seconds since unix epoch of arrival.
    pub modified: u64,
    pub verified: SignatureVerification,
}

impl UncheckedInfo {
    pub fn new(block: Arc<Block>, account: Account, verified: SignatureVerification) -> Self {
        UncheckedInfo {
            block,
            account,
            modified: utils::seconds_since_epoch(),
            verified,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.block.serialize_with_type(&mut bytes).expect("vec write");
        utils::write_h256(&mut bytes, &self.account).expect("vec write");
        utils::write_u64_be(&mut bytes, self.modified).expect("vec write");
        bytes.push(self.verified as u8);
        bytes
    }

    pub fn deserialize(stream: &mut dyn io::Read) -> io::Result<Self> {
        let block = Block::deserialize_with_type(stream)?;
        let account = utils::read_h256(stream)?;
        let modified = utils::read_u64_be(stream)?;
        let mut verified = [0u8; 1];
        stream.read_exact(&mut verified)?;
        Ok(UncheckedInfo {
            block: Arc::new(block),
            account,
            modified,
            verified: SignatureVerification::from_u8(verified[0])
                .ok_or_else(|| utils::invalid_data("verification"))?,
        })
    }
}

/// Persisted peer address: IPv6 bytes plus port, both big-endian on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointKey {
    pub address: [u8; 16],
    pub port: u16,
}

impl EndpointKey {
    pub fn new(address: [u8; 16], port: u16) -> Self {
        EndpointKey { address, port }
    }

    pub fn to_bytes(&self) -> [u8; 18] {
        let mut bytes = [0u8; 18];
        bytes[..16].copy_from_slice(&self.address);
        bytes[16..].copy_from_slice(&self.port.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() != 18 {
            return Err(utils::invalid_data("endpoint key length"));
        }
        let mut address = [0u8; 16];
        address.copy_from_slice(&bytes[..16]);
        let port = u16::from_be_bytes([bytes[16], bytes[17]]);
        Ok(EndpointKey { address, port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::SendBlock;
    use crate::numbers::KeyPair;
    use ethereum_types::{H256, U128};

    #[test]
    fn account_info_round_trip() {
        let info = AccountInfo {
            head: H256::repeat_byte(1),
            representative: H256::repeat_byte(2),
            open_block: H256::repeat_byte(3),
            balance: U128::from(12345u64),
            modified: 99,
            block_count: 7,
            epoch: Epoch::Epoch1,
        };
        let bytes = info.to_bytes();
        assert_eq!(AccountInfo::deserialize(&mut bytes.as_slice()).unwrap(), info);
    }

    #[test]
    fn pending_round_trip() {
        let key = PendingKey::new(H256::repeat_byte(1), H256::repeat_byte(2));
        assert_eq!(PendingKey::from_bytes(&key.to_bytes()).unwrap(), key);
        let info = PendingInfo::new(H256::repeat_byte(3), U128::one(), Epoch::Epoch2);
        assert_eq!(
            PendingInfo::deserialize(&mut info.to_bytes().as_slice()).unwrap(),
            info
        );
    }

    #[test]
    fn unchecked_round_trip() {
        let keypair = KeyPair::generate();
        let block = Arc::new(Block::Send(SendBlock::new(
            H256::repeat_byte(1),
            H256::repeat_byte(2),
            U128::from(10u64),
            keypair.secret_key(),
            &keypair.public_key(),
            11,
        )));
        let info = UncheckedInfo::new(block.clone(), keypair.public_key(), SignatureVerification::Valid);
        let bytes = info.to_bytes();
        let restored = UncheckedInfo::deserialize(&mut bytes.as_slice()).unwrap();
        assert_eq!(*restored.block, *block);
        assert_eq!(restored.account, info.account);
        assert_eq!(restored.verified, SignatureVerification::Valid);
    }

    #[test]
    fn endpoint_key_ordering_is_stable() {
        let low = EndpointKey::new([0u8; 16], 1);
        let high = EndpointKey::new([0u8; 16], 2);
        assert!(low < high);
        assert_eq!(EndpointKey::from_bytes(&low.to_bytes()).unwrap(), low);
    }
}
