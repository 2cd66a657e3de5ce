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

//! Multi-threaded signature checking.
//!
//! Verifications are batched; batches beyond [`BATCH_SIZE`] are split across
//! a fixed worker pool and verified in parallel.

use std::sync::Arc;

use crossbeam_channel::{bounded, unbounded, Sender};

use lattice_types::{validate_message, Account, Signature};

pub const BATCH_SIZE: usize = 256;

/// One batch of signature checks; `verifications` is filled with the result
/// for each entry.
pub struct SignatureCheckSet {
    pub messages: Vec<Vec<u8>>,
    pub pub_keys: Vec<Account>,
    pub signatures: Vec<Signature>,
    pub verifications: Vec<bool>,
}

impl SignatureCheckSet {
    pub fn new(messages: Vec<Vec<u8>>, pub_keys: Vec<Account>, signatures: Vec<Signature>) -> Self {
        let size = messages.len();
        debug_assert!(pub_keys.len() == size && signatures.len() == size);
        SignatureCheckSet {
            messages,
            pub_keys,
            signatures,
            verifications: vec![false; size],
        }
    }

    pub fn size(&self) -> usize {
        self.messages.len()
    }
}

struct Task {
    messages: Vec<Vec<u8>>,
    pub_keys: Vec<Account>,
    signatures: Vec<Signature>,
    offset: usize,
    results: Sender<(usize, Vec<bool>)>,
}

pub struct SignatureChecker {
    workers: Vec<std::thread::JoinHandle<()>>,
    tasks: Option<Sender<Task>>,
}

impl SignatureChecker {
    pub fn new(num_threads: usize) -> Self {
        let (sender, receiver) = unbounded::<Task>();
        let workers = (0..num_threads.max(1))
            .map(|_| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name("sig check".to_string())
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            let results: Vec<bool> = task
                                .messages
                                .iter()
                                .zip(task.pub_keys.iter())
                                .zip(task.signatures.iter())
                                .map(|((message, key), signature)| {
                                    validate_message(key, message, signature)
                                })
                                .collect();
                            let _ = task.results.send((task.offset, results));
                        }
                    })
                    .expect("signature checker thread spawn")
            })
            .collect();
        SignatureChecker {
            workers,
            tasks: Some(sender),
        }
    }

    /// Verify the whole set, blocking until every entry is decided.
    pub fn verify(&self, check: &mut SignatureCheckSet) {
        let size = check.size();
        if size == 0 {
            return;
        }
        let tasks = match &self.tasks {
            Some(tasks) => tasks,
            None => return,
        };
        let chunks = (size + BATCH_SIZE - 1) / BATCH_SIZE;
        let (results_sender, results_receiver) = bounded(chunks);
        for chunk in 0..chunks {
            let start = chunk * BATCH_SIZE;
            let end = (start + BATCH_SIZE).min(size);
            let task = Task {
                messages: check.messages[start..end].to_vec(),
                pub_keys: check.pub_keys[start..end].to_vec(),
                signatures: check.signatures[start..end].to_vec(),
                offset: start,
                results: results_sender.clone(),
            };
            tasks.send(task).expect("signature checker stopped");
        }
        drop(results_sender);
        while let Ok((offset, results)) = results_receiver.recv() {
            check.verifications[offset..offset + results.len()].copy_from_slice(&results);
        }
    }

    pub fn stop(&mut self) {
        self.tasks = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for SignatureChecker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_types::{sign_message, KeyPair};

    fn signed_entry(key: &KeyPair, message: &[u8]) -> (Vec<u8>, Account, Signature) {
        (
            message.to_vec(),
            key.public_key(),
            sign_message(key.secret_key(), &key.public_key(), message),
        )
    }

    #[test]
    fn verifies_a_mixed_batch() {
        let checker = SignatureChecker::new(2);
        let key = KeyPair::generate();
        let mut messages = Vec::new();
        let mut keys = Vec::new();
        let mut signatures = Vec::new();
        // Larger than one internal batch to exercise splitting.
        for index in 0..(BATCH_SIZE + 10) {
            let message = format!("message {}", index).into_bytes();
            let (message, account, signature) = signed_entry(&key, &message);
            messages.push(message);
            keys.push(account);
            signatures.push(signature);
        }
        // Corrupt one entry in each half.
        signatures[3] = Signature::zero();
        signatures[BATCH_SIZE + 5] = Signature::zero();
        let mut check = SignatureCheckSet::new(messages, keys, signatures);
        checker.verify(&mut check);
        for (index, valid) in check.verifications.iter().enumerate() {
            let expected = index != 3 && index != BATCH_SIZE + 5;
            assert_eq!(*valid, expected, "entry {}", index);
        }
    }

    #[test]
    fn empty_batch_is_a_noop() {
        let checker = SignatureChecker::new(1);
        let mut check = SignatureCheckSet::new(Vec::new(), Vec::new(), Vec::new());
        checker.verify(&mut check);
        assert!(check.verifications.is_empty());
    }
}
