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

//! Ed25519 with Blake2b-512 as the internal digest.
//!
//! The lattice signature scheme is standard Ed25519 with SHA-512 swapped for
//! Blake2b-512, so the stock verifier types cannot be used; the scheme is
//! assembled from the curve primitives instead.

use blake2::digest::Digest;
use blake2::Blake2b512;
use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;

fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let mut hasher = Blake2b512::new();
    for part in parts {
        hasher.update(part);
    }
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hasher.finalize());
    Scalar::from_bytes_mod_order_wide(&wide)
}

// Expanded secret: clamped scalar plus the nonce prefix.
fn expand(secret: &[u8; 32]) -> (Scalar, [u8; 32]) {
    let digest = Blake2b512::digest(secret);
    let mut lower = [0u8; 32];
    let mut upper = [0u8; 32];
    lower.copy_from_slice(&digest[..32]);
    upper.copy_from_slice(&digest[32..]);
    lower[0] &= 248;
    lower[31] &= 127;
    lower[31] |= 64;
    (Scalar::from_bits(lower), upper)
}

/// Derive the public key for a secret key.
pub fn public_key(secret: &[u8; 32]) -> [u8; 32] {
    let (scalar, _) = expand(secret);
    (&scalar * &ED25519_BASEPOINT_TABLE).compress().to_bytes()
}

/// Produce a detached 64-byte signature over `message`.
pub fn sign(secret: &[u8; 32], public: &[u8; 32], message: &[u8]) -> [u8; 64] {
    let (scalar, prefix) = expand(secret);
    let r = hash_to_scalar(&[&prefix, message]);
    let big_r = (&r * &ED25519_BASEPOINT_TABLE).compress();
    let k = hash_to_scalar(&[big_r.as_bytes(), public, message]);
    let s = k * scalar + r;
    let mut signature = [0u8; 64];
    signature[..32].copy_from_slice(big_r.as_bytes());
    signature[32..].copy_from_slice(s.as_bytes());
    signature
}

/// Verify a detached signature. Returns `true` when valid.
pub fn verify(public: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    let point = match CompressedEdwardsY::from_slice(public).decompress() {
        Some(point) => point,
        None => return false,
    };
    let mut s_bytes = [0u8; 32];
    s_bytes.copy_from_slice(&signature[32..]);
    let s = match Scalar::from_canonical_bytes(s_bytes) {
        Some(s) => s,
        None => return false,
    };
    let k = hash_to_scalar(&[&signature[..32], public, message]);
    let expected_r = EdwardsPoint::vartime_double_scalar_mul_basepoint(&k, &(-point), &s);
    expected_r.compress().as_bytes() == &signature[..32]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let secret = [42u8; 32];
        let public = public_key(&secret);
        let signature = sign(&secret, &public, b"lattice");
        assert!(verify(&public, b"lattice", &signature));
        assert!(!verify(&public, b"lettuce", &signature));
    }

    #[test]
    fn tampered_signature_fails() {
        let secret = [7u8; 32];
        let public = public_key(&secret);
        let mut signature = sign(&secret, &public, b"message");
        signature[0] ^= 1;
        assert!(!verify(&public, b"message", &signature));
    }

    #[test]
    fn wrong_key_fails() {
        let secret = [1u8; 32];
        let public = public_key(&[2u8; 32]);
        let signature = sign(&secret, &public_key(&secret), b"message");
        assert!(!verify(&public, b"message", &signature));
    }
}
