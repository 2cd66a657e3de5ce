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

//! Numeric and key primitives.
//!
//! Balances are 128 bit. All keys, hashes, roots and links are 256 bit;
//! signatures are 512 bit. A qualified root is the (root, previous) pair that
//! identifies an election independently of block content.

use std::fmt;
use std::io;

use ethereum_types::{H256, H512, U128};
use rand::RngCore;

use crate::ed25519;
use crate::utils;

/// Monetary amount, 128-bit unsigned.
pub type Amount = U128;
/// Ed25519 public key identifying an account.
pub type Account = H256;
/// Blake2b-256 digest of a block's canonical form.
pub type BlockHash = H256;
/// Either an open block's account or a successor block's previous hash.
pub type Root = H256;
/// Either a destination account (send) or a source block hash (receive).
pub type Link = H256;
/// Detached Ed25519 signature.
pub type Signature = H512;

/// One raw unit of currency.
pub fn raw_ratio() -> Amount {
    U128::one()
}

/// (root, previous) pair uniquely identifying an election across forks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct QualifiedRoot {
    pub root: Root,
    pub previous: BlockHash,
}

impl QualifiedRoot {
    pub fn new(root: Root, previous: BlockHash) -> Self {
        QualifiedRoot { root, previous }
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(self.root.as_bytes());
        bytes[32..].copy_from_slice(self.previous.as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() != 64 {
            return Err(utils::invalid_data("qualified root length"));
        }
        Ok(QualifiedRoot {
            root: H256::from_slice(&bytes[..32]),
            previous: H256::from_slice(&bytes[32..]),
        })
    }
}

impl fmt::Display for QualifiedRoot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}{:x}", self.root, self.previous)
    }
}

/// A private key. The seed and the signing key share this representation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RawKey(pub H256);

impl RawKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        RawKey(H256(bytes))
    }

    pub fn decode_hex(input: &str) -> Option<Self> {
        let bytes = hex::decode(input).ok()?;
        if bytes.len() != 32 {
            return None;
        }
        Some(RawKey(H256::from_slice(&bytes)))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_fixed_bytes()
    }
}

impl fmt::Debug for RawKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Never print key material.
        write!(f, "RawKey(..)")
    }
}

/// A signing key pair.
#[derive(Clone)]
pub struct KeyPair {
    public: Account,
    secret: RawKey,
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_secret(RawKey::from_bytes(bytes))
    }

    pub fn from_secret(secret: RawKey) -> Self {
        let public = H256(ed25519::public_key(secret.as_bytes()));
        KeyPair { public, secret }
    }

    /// Build from a 64-character hex private key. Panics on malformed input;
    /// only used for baked-in network constants and tests.
    pub fn from_hex(input: &str) -> Self {
        Self::from_secret(RawKey::decode_hex(input).expect("invalid key hex"))
    }

    pub fn public_key(&self) -> Account {
        self.public
    }

    pub fn secret_key(&self) -> &RawKey {
        &self.secret
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "KeyPair({:x})", self.public)
    }
}

/// Derive the public key of a private key.
pub fn pub_key(secret: &RawKey) -> Account {
    H256(ed25519::public_key(secret.as_bytes()))
}

/// Derive the private key at `index` of a wallet seed.
pub fn deterministic_key(seed: &RawKey, index: u32) -> RawKey {
    use blake2::digest::Digest;
    let mut hasher = blake2::Blake2b::<blake2::digest::consts::U32>::new();
    hasher.update(seed.as_bytes());
    hasher.update(index.to_be_bytes());
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&hasher.finalize());
    RawKey::from_bytes(bytes)
}

/// Sign an arbitrary message with the given key pair.
pub fn sign_message(secret: &RawKey, public: &Account, message: &[u8]) -> Signature {
    H512(ed25519::sign(
        secret.as_bytes(),
        public.as_fixed_bytes(),
        message,
    ))
}

/// Check a signature; returns `true` when the signature is valid.
pub fn validate_message(public: &Account, message: &[u8], signature: &Signature) -> bool {
    ed25519::verify(public.as_fixed_bytes(), message, signature.as_fixed_bytes())
}

/// Check a batch of signatures, one result per entry.
///
/// The slices must be of equal length; the caller assembles them from a
/// signature check set.
pub fn validate_message_batch(
    messages: &[&[u8]],
    public_keys: &[Account],
    signatures: &[Signature],
) -> Vec<bool> {
    debug_assert!(messages.len() == public_keys.len() && messages.len() == signatures.len());
    messages
        .iter()
        .zip(public_keys.iter())
        .zip(signatures.iter())
        .map(|((message, public), signature)| validate_message(public, message, signature))
        .collect()
}
