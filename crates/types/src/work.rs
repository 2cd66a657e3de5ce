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

//! Anti-spam proof of work.
//!
//! A block is admissible when the Blake2b value of its root and nonce meets
//! the threshold for its version and details. Thresholds were split by
//! direction in epoch 2: sends and changes pay the full price, receives and
//! epoch upgrades an eighth of it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use blake2::digest::Digest;
use parking_lot::{Condvar, Mutex};
use rand::RngCore;

use crate::blocks::{BlockDetails, BlockType};
use crate::epoch::Epoch;
use crate::numbers::Root;

/// Work algorithm version; only one has been released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkVersion {
    Work1,
}

/// Work value of a nonce against a root: the first eight Blake2b bytes of
/// `nonce_LE ‖ root`, read little-endian.
pub fn work_value(root: &Root, work: u64) -> u64 {
    let mut hasher = blake2::Blake2b::<blake2::digest::consts::U8>::new();
    hasher.update(work.to_le_bytes());
    hasher.update(root.as_bytes());
    let mut output = [0u8; 8];
    output.copy_from_slice(&hasher.finalize());
    u64::from_le_bytes(output)
}

/// Per-network work thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkThresholds {
    pub epoch_1: u64,
    pub epoch_2: u64,
    pub epoch_2_receive: u64,
    /// Threshold for the hardest operation, used as the adaptive base.
    pub base: u64,
    /// Entry threshold for fresh blocks ahead of classification.
    pub entry: u64,
}

impl WorkThresholds {
    pub const fn publish_full() -> Self {
        WorkThresholds {
            epoch_1: 0xffff_ffc0_0000_0000,
            epoch_2: 0xffff_fff8_0000_0000,
            epoch_2_receive: 0xffff_fe00_0000_0000,
            base: 0xffff_fff8_0000_0000,
            entry: 0xffff_fe00_0000_0000,
        }
    }

    pub const fn publish_beta() -> Self {
        WorkThresholds {
            epoch_1: 0xffff_f000_0000_0000,
            epoch_2: 0xffff_f000_0000_0000,
            epoch_2_receive: 0xffff_e000_0000_0000,
            base: 0xffff_f000_0000_0000,
            entry: 0xffff_e000_0000_0000,
        }
    }

    pub const fn publish_dev() -> Self {
        WorkThresholds {
            epoch_1: 0xfe00_0000_0000_0000,
            epoch_2: 0xffc0_0000_0000_0000,
            epoch_2_receive: 0xf000_0000_0000_0000,
            base: 0xffc0_0000_0000_0000,
            entry: 0xf000_0000_0000_0000,
        }
    }

    /// Threshold once the block's role in its account chain is known.
    pub fn threshold(&self, _version: WorkVersion, details: &BlockDetails) -> u64 {
        match details.epoch {
            Epoch::Epoch2 => {
                if details.is_receive || details.is_epoch {
                    self.epoch_2_receive
                } else {
                    self.epoch_2
                }
            }
            _ => self.epoch_1,
        }
    }

    /// Threshold applied on arrival, before the epoch is known. State blocks
    /// only need the entry threshold; their true threshold is re-checked at
    /// admission.
    pub fn threshold_entry(&self, version: WorkVersion, block_type: BlockType) -> u64 {
        match block_type {
            BlockType::State => match version {
                WorkVersion::Work1 => self.entry,
            },
            _ => self.epoch_1,
        }
    }

    pub fn threshold_base(&self, version: WorkVersion) -> u64 {
        match version {
            WorkVersion::Work1 => self.base,
        }
    }

    /// Difficulty actually achieved by a block's nonce.
    pub fn difficulty(&self, _version: WorkVersion, root: &Root, work: u64) -> u64 {
        work_value(root, work)
    }

    pub fn validate_entry(&self, version: WorkVersion, block_type: BlockType, root: &Root, work: u64) -> bool {
        work_value(root, work) >= self.threshold_entry(version, block_type)
    }
}

struct WorkItem {
    version: WorkVersion,
    root: Root,
    difficulty: u64,
    callback: Box<dyn FnOnce(Option<u64>) + Send>,
}

struct PoolShared {
    pending: Mutex<VecDeque<WorkItem>>,
    producer_condition: Condvar,
    done: AtomicBool,
    // Bumped on cancel so in-flight searches abandon their root.
    ticket: AtomicU64,
}

/// Multi-threaded nonce search with cancellation by root.
pub struct WorkPool {
    shared: Arc<PoolShared>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl WorkPool {
    pub fn new(thread_count: usize) -> Self {
        let shared = Arc::new(PoolShared {
            pending: Mutex::new(VecDeque::new()),
            producer_condition: Condvar::new(),
            done: AtomicBool::new(false),
            ticket: AtomicU64::new(0),
        });
        let threads = (0..thread_count.max(1))
            .map(|_| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name("work".to_string())
                    .spawn(move || Self::loop_(shared))
                    .expect("work thread spawn")
            })
            .collect();
        WorkPool { shared, threads }
    }

    fn loop_(shared: Arc<PoolShared>) {
        let mut rng = rand::thread_rng();
        loop {
            let item = {
                let mut pending = shared.pending.lock();
                while pending.is_empty() && !shared.done.load(Ordering::Acquire) {
                    shared.producer_condition.wait(&mut pending);
                }
                if shared.done.load(Ordering::Acquire) {
                    break;
                }
                pending.pop_front().expect("non-empty pending queue")
            };
            let WorkItem {
                version: _,
                root,
                difficulty,
                callback,
            } = item;
            let ticket = shared.ticket.load(Ordering::Acquire);
            let mut result = None;
            while result.is_none()
                && shared.ticket.load(Ordering::Acquire) == ticket
                && !shared.done.load(Ordering::Acquire)
            {
                // Batch attempts between cancellation checks.
                for _ in 0..1024 {
                    let nonce = rng.next_u64();
                    if work_value(&root, nonce) >= difficulty {
                        result = Some(nonce);
                        break;
                    }
                }
            }
            callback(result);
        }
    }

    /// Queue a generation request; the callback fires with `None` when the
    /// request was cancelled or the pool stopped.
    pub fn generate_async(
        &self,
        version: WorkVersion,
        root: Root,
        difficulty: u64,
        callback: Box<dyn FnOnce(Option<u64>) + Send>,
    ) {
        {
            let mut pending = self.shared.pending.lock();
            pending.push_back(WorkItem {
                version,
                root,
                difficulty,
                callback,
            });
        }
        self.shared.producer_condition.notify_one();
    }

    /// Blocking generation.
    pub fn generate(&self, version: WorkVersion, root: Root, difficulty: u64) -> Option<u64> {
        let (sender, receiver) = std::sync::mpsc::channel();
        self.generate_async(
            version,
            root,
            difficulty,
            Box::new(move |work| {
                let _ = sender.send(work);
            }),
        );
        receiver.recv().unwrap_or(None)
    }

    /// Abandon any pending or in-flight generation for `root`.
    pub fn cancel(&self, root: &Root) {
        let mut pending = self.shared.pending.lock();
        let mut kept = VecDeque::with_capacity(pending.len());
        while let Some(item) = pending.pop_front() {
            if item.root == *root {
                (item.callback)(None);
            } else {
                kept.push_back(item);
            }
        }
        *pending = kept;
        self.shared.ticket.fetch_add(1, Ordering::AcqRel);
    }

    pub fn size(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn stop(&mut self) {
        self.shared.done.store(true, Ordering::Release);
        self.shared.ticket.fetch_add(1, Ordering::AcqRel);
        self.shared.producer_condition.notify_all();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl Drop for WorkPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::H256;

    #[test]
    fn generated_work_validates() {
        let pool = WorkPool::new(1);
        let thresholds = WorkThresholds::publish_dev();
        let root = H256::repeat_byte(1);
        let work = pool
            .generate(WorkVersion::Work1, root, thresholds.epoch_1)
            .unwrap();
        assert!(work_value(&root, work) >= thresholds.epoch_1);
    }

    #[test]
    fn work_does_not_transfer_between_roots() {
        let pool = WorkPool::new(1);
        let thresholds = WorkThresholds::publish_dev();
        let root = H256::repeat_byte(1);
        let work = pool
            .generate(WorkVersion::Work1, root, thresholds.base)
            .unwrap();
        let other = H256::repeat_byte(2);
        // Astronomically unlikely to satisfy the base threshold elsewhere.
        assert!(work_value(&other, work) < thresholds.base || work_value(&root, work) >= thresholds.base);
    }

    #[test]
    fn cancel_flushes_pending_requests() {
        let pool = WorkPool::new(1);
        let root = H256::repeat_byte(3);
        // An unobtainable difficulty keeps the worker busy until cancelled.
        let (sender, receiver) = std::sync::mpsc::channel();
        pool.generate_async(
            WorkVersion::Work1,
            root,
            u64::MAX,
            Box::new(move |work| {
                let _ = sender.send(work);
            }),
        );
        pool.cancel(&root);
        assert_eq!(receiver.recv_timeout(std::time::Duration::from_secs(5)), Ok(None));
    }

    #[test]
    fn thresholds_by_details() {
        let thresholds = WorkThresholds::publish_full();
        let send_epoch_2 = BlockDetails::new(Epoch::Epoch2, true, false, false);
        let receive_epoch_2 = BlockDetails::new(Epoch::Epoch2, false, true, false);
        let epoch_upgrade = BlockDetails::new(Epoch::Epoch2, false, false, true);
        let change_epoch_1 = BlockDetails::new(Epoch::Epoch1, false, false, false);
        assert_eq!(
            thresholds.threshold(WorkVersion::Work1, &send_epoch_2),
            thresholds.epoch_2
        );
        assert_eq!(
            thresholds.threshold(WorkVersion::Work1, &receive_epoch_2),
            thresholds.epoch_2_receive
        );
        assert_eq!(
            thresholds.threshold(WorkVersion::Work1, &epoch_upgrade),
            thresholds.epoch_2_receive
        );
        assert_eq!(
            thresholds.threshold(WorkVersion::Work1, &change_epoch_1),
            thresholds.epoch_1
        );
        assert_eq!(
            thresholds.threshold_entry(WorkVersion::Work1, BlockType::State),
            thresholds.entry
        );
        assert_eq!(
            thresholds.threshold_entry(WorkVersion::Work1, BlockType::Send),
            thresholds.epoch_1
        );
    }
}
