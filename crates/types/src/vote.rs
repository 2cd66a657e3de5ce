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

//! Representative votes.
//!
//! A vote is a timestamped, signed set of block hashes. The low 63 bits of
//! the timestamp form a logical clock per (representative, root); bit 63 is
//! the sticky final flag. Once a representative issues a final vote for a
//! root it must never vote for a different hash at that root.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};

use blake2::digest::Digest;
use ethereum_types::H256;
use parking_lot::Mutex;

use crate::numbers::{sign_message, validate_message, Account, BlockHash, RawKey, Signature};
use crate::utils;

/// Bit 63 of the timestamp marks an irrevocable commitment.
pub const FINAL_FLAG: u64 = 1 << 63;
/// Timestamp of a final vote: maximal clock plus the final flag.
pub const FINAL_TIMESTAMP: u64 = u64::MAX;

/// Maximum hashes a single vote may carry on the wire.
pub const MAX_VOTE_HASHES: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub account: Account,
    pub signature: Signature,
    /// Raw timestamp including the final bit.
    timestamp: u64,
    pub hashes: Vec<BlockHash>,
}

impl Vote {
    /// Create and sign a vote. `timestamp` must carry the final bit already
    /// if intended; use [`FINAL_TIMESTAMP`] for final votes.
    pub fn new(secret: &RawKey, account: Account, timestamp: u64, hashes: Vec<BlockHash>) -> Self {
        debug_assert!(hashes.len() <= MAX_VOTE_HASHES);
        let mut vote = Vote {
            account,
            signature: Signature::zero(),
            timestamp,
            hashes,
        };
        vote.signature = sign_message(secret, &vote.account, vote.hash().as_bytes());
        vote
    }

    /// Logical clock with the final bit cleared; this is what ordering
    /// compares.
    pub fn timestamp(&self) -> u64 {
        self.timestamp & !FINAL_FLAG
    }

    pub fn raw_timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn is_final(&self) -> bool {
        self.timestamp & FINAL_FLAG != 0
    }

    /// Digest the signature covers.
    pub fn hash(&self) -> BlockHash {
        let mut hasher = blake2::Blake2b::<blake2::digest::consts::U32>::new();
        hasher.update(b"vote ");
        for hash in &self.hashes {
            hasher.update(hash.as_bytes());
        }
        hasher.update(self.timestamp.to_le_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hasher.finalize());
        H256(bytes)
    }

    /// Digest over the full serialized form, for uniquing and filtering.
    pub fn full_hash(&self) -> BlockHash {
        let mut hasher = blake2::Blake2b::<blake2::digest::consts::U32>::new();
        hasher.update(self.hash().as_bytes());
        hasher.update(self.account.as_bytes());
        hasher.update(self.signature.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hasher.finalize());
        H256(bytes)
    }

    /// Returns `true` when the signature matches the payload.
    pub fn validate(&self) -> bool {
        validate_message(&self.account, self.hash().as_bytes(), &self.signature)
    }

    pub fn serialize(&self, stream: &mut dyn io::Write) -> io::Result<()> {
        utils::write_h256(stream, &self.account)?;
        utils::write_h512(stream, &self.signature)?;
        utils::write_u64_le(stream, self.timestamp)?;
        for hash in &self.hashes {
            utils::write_h256(stream, hash)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32 + 64 + 8 + self.hashes.len() * 32);
        self.serialize(&mut bytes).expect("vec write");
        bytes
    }

    /// Deserialize with the hash count taken from the message header.
    pub fn deserialize(stream: &mut dyn io::Read, count: usize) -> io::Result<Self> {
        if count > MAX_VOTE_HASHES {
            return Err(utils::invalid_data("vote hash count"));
        }
        let account = utils::read_h256(stream)?;
        let signature = utils::read_h512(stream)?;
        let timestamp = utils::read_u64_le(stream)?;
        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            hashes.push(utils::read_h256(stream)?);
        }
        Ok(Vote {
            account,
            signature,
            timestamp,
            hashes,
        })
    }
}

const UNIQUER_CLEANUP_INTERVAL: usize = 256;

/// Resolves structurally identical votes to one shared allocation; the pool
/// holds weak references and reaps dead entries periodically, keeping memory
/// bounded while preserving identity semantics.
#[derive(Default)]
pub struct VoteUniquer {
    votes: Mutex<HashMap<BlockHash, Weak<Vote>>>,
}

impl VoteUniquer {
    pub fn unique(&self, vote: &Arc<Vote>) -> Arc<Vote> {
        let key = vote.full_hash();
        let mut votes = self.votes.lock();
        let result = match votes.get(&key).and_then(Weak::upgrade) {
            Some(existing) => existing,
            None => {
                votes.insert(key, Arc::downgrade(vote));
                vote.clone()
            }
        };
        if votes.len() % UNIQUER_CLEANUP_INTERVAL == 0 {
            votes.retain(|_, weak| weak.strong_count() > 0);
        }
        result
    }

    pub fn size(&self) -> usize {
        self.votes.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numbers::KeyPair;

    #[test]
    fn vote_round_trip() {
        let key = KeyPair::generate();
        let vote = Vote::new(
            key.secret_key(),
            key.public_key(),
            3,
            vec![H256::repeat_byte(1), H256::repeat_byte(2)],
        );
        let bytes = vote.to_bytes();
        let restored = Vote::deserialize(&mut bytes.as_slice(), 2).unwrap();
        assert_eq!(vote, restored);
        assert!(restored.validate());
    }

    #[test]
    fn final_bit_is_separate_from_the_clock() {
        let key = KeyPair::generate();
        let vote = Vote::new(
            key.secret_key(),
            key.public_key(),
            FINAL_TIMESTAMP,
            vec![H256::repeat_byte(1)],
        );
        assert!(vote.is_final());
        assert_eq!(vote.timestamp(), u64::MAX & !FINAL_FLAG);
        let plain = Vote::new(key.secret_key(), key.public_key(), 5, vec![H256::repeat_byte(1)]);
        assert!(!plain.is_final());
        assert_eq!(plain.timestamp(), 5);
    }

    #[test]
    fn tampering_invalidates() {
        let key = KeyPair::generate();
        let mut vote = Vote::new(
            key.secret_key(),
            key.public_key(),
            1,
            vec![H256::repeat_byte(1)],
        );
        vote.hashes[0] = H256::repeat_byte(9);
        assert!(!vote.validate());
    }

    #[test]
    fn uniquer_deduplicates() {
        let key = KeyPair::generate();
        let uniquer = VoteUniquer::default();
        let first = Arc::new(Vote::new(
            key.secret_key(),
            key.public_key(),
            1,
            vec![H256::repeat_byte(1)],
        ));
        let second = Arc::new(Vote::new(
            key.secret_key(),
            key.public_key(),
            1,
            vec![H256::repeat_byte(1)],
        ));
        assert!(Arc::ptr_eq(&uniquer.unique(&first), &first));
        assert!(Arc::ptr_eq(&uniquer.unique(&second), &first));
        assert_eq!(uniquer.size(), 1);
    }
}
