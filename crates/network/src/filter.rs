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

//! Duplicate detection for inbound payloads.
//!
//! A fixed-size vector of keyed 128-bit SipHash digests. Inserting indexes by
//! digest modulo the table size, so new entries probabilistically evict old
//! ones; a lookup within the table-size window reports the duplicate.

use std::hash::Hasher;

use parking_lot::Mutex;
use rand::RngCore;
use siphasher::sip128::{Hasher128, SipHasher24};

pub struct NetworkFilter {
    items: Mutex<Vec<u128>>,
    key: (u64, u64),
}

impl NetworkFilter {
    pub fn new(size: usize) -> Self {
        debug_assert!(size > 0);
        let mut rng = rand::thread_rng();
        NetworkFilter {
            items: Mutex::new(vec![0u128; size]),
            key: (rng.next_u64(), rng.next_u64()),
        }
    }

    /// Record `bytes`, returning whether they were already present and the
    /// digest under which they were filed.
    pub fn apply(&self, bytes: &[u8]) -> (bool, u128) {
        let digest = self.hash(bytes);
        let mut items = self.items.lock();
        let index = (digest % items.len() as u128) as usize;
        let existed = items[index] == digest;
        if !existed {
            // Replace the likely-old occupant.
            items[index] = digest;
        }
        (existed, digest)
    }

    /// Forget a digest so the payload may be accepted again.
    pub fn clear(&self, digest: u128) {
        let mut items = self.items.lock();
        let index = (digest % items.len() as u128) as usize;
        if items[index] == digest {
            items[index] = 0;
        }
    }

    pub fn clear_bytes(&self, bytes: &[u8]) {
        self.clear(self.hash(bytes));
    }

    pub fn clear_all(&self) {
        let mut items = self.items.lock();
        let size = items.len();
        items.clear();
        items.resize(size, 0);
    }

    pub fn hash(&self, bytes: &[u8]) -> u128 {
        let mut hasher = SipHasher24::new_with_keys(self.key.0, self.key.1);
        hasher.write(bytes);
        hasher.finish128().as_u128()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_payload_is_a_duplicate() {
        let filter = NetworkFilter::new(16);
        let (existed, digest) = filter.apply(b"payload");
        assert!(!existed);
        assert_ne!(digest, 0);
        let (existed, second_digest) = filter.apply(b"payload");
        assert!(existed);
        assert_eq!(digest, second_digest);
    }

    #[test]
    fn distinct_payloads_have_distinct_digests() {
        let filter = NetworkFilter::new(16);
        let (_, first) = filter.apply(b"one");
        let (_, second) = filter.apply(b"two");
        assert_ne!(first, second);
    }

    #[test]
    fn clear_forgets_an_entry() {
        let filter = NetworkFilter::new(16);
        let (_, digest) = filter.apply(b"payload");
        filter.clear(digest);
        let (existed, _) = filter.apply(b"payload");
        assert!(!existed);
    }

    #[test]
    fn clear_leaves_other_entries_alone() {
        let filter = NetworkFilter::new(16);
        filter.apply(b"keep");
        filter.clear_bytes(b"absent");
        let (existed, _) = filter.apply(b"keep");
        assert!(existed);
    }

    #[test]
    fn keys_differ_between_instances() {
        let first = NetworkFilter::new(16);
        let second = NetworkFilter::new(16);
        assert_ne!(first.hash(b"payload"), second.hash(b"payload"));
    }
}
