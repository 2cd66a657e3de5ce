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

//! Feeding elections into the container.
//!
//! Activation picks the next uncemented, dependency-clear block of an
//! account and queues it by priority (least recently touched accounts
//! first); the scheduler thread inserts while the container has vacancy and
//! evicts the oldest election when overfilled.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use lattice_db::Transaction;
use lattice_types::{Account, Block};

use crate::active_elections::ActiveElections;
use crate::ledger::Ledger;

struct PriorityEntry {
    modified: u64,
    block: Arc<Block>,
}

impl PartialEq for PriorityEntry {
    fn eq(&self, other: &Self) -> bool {
        self.modified == other.modified && self.block.hash() == other.block.hash()
    }
}

impl Eq for PriorityEntry {}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: oldest modification time wins.
        (Reverse(self.modified), self.block.hash())
            .cmp(&(Reverse(other.modified), other.block.hash()))
    }
}

struct State {
    priority: BinaryHeap<PriorityEntry>,
    manual: VecDeque<Arc<Block>>,
    stopped: bool,
}

pub struct ElectionScheduler {
    ledger: Arc<Ledger>,
    active: Arc<ActiveElections>,
    state: Mutex<State>,
    condition: Condvar,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ElectionScheduler {
    pub fn new(ledger: Arc<Ledger>, active: Arc<ActiveElections>) -> Arc<Self> {
        let scheduler = Arc::new(ElectionScheduler {
            ledger,
            active: active.clone(),
            state: Mutex::new(State {
                priority: BinaryHeap::new(),
                manual: VecDeque::new(),
                stopped: false,
            }),
            condition: Condvar::new(),
            thread: Mutex::new(None),
        });
        // Wake on every vacancy change in the container.
        let weak = Arc::downgrade(&scheduler);
        active.set_vacancy_update(Arc::new(move || {
            if let Some(scheduler) = weak.upgrade() {
                scheduler.notify();
            }
        }));
        let run = scheduler.clone();
        let handle = std::thread::Builder::new()
            .name("elec sched".to_string())
            .spawn(move || run.run())
            .expect("election scheduler thread spawn");
        *scheduler.thread.lock() = Some(handle);
        scheduler
    }

    /// Queue the next confirmable block of `account`, if any.
    pub fn activate(&self, account: &Account, txn: &dyn Transaction) {
        debug_assert!(!account.is_zero());
        let info = match self.ledger.store.account.get(txn, account) {
            Some(info) => info,
            None => return,
        };
        let conf_info = self.ledger.store.confirmation_height.get(txn, account);
        if conf_info.height >= info.block_count {
            return;
        }
        let hash = if conf_info.height == 0 {
            info.open_block
        } else {
            match self.ledger.store.block.successor(txn, &conf_info.frontier) {
                Some(successor) => successor,
                None => return,
            }
        };
        let block = match self.ledger.store.block.get(txn, &hash) {
            Some(stored) => stored.block,
            None => return,
        };
        if !self.ledger.dependents_confirmed(txn, &block) {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.priority.push(PriorityEntry {
                modified: info.modified,
                block,
            });
        }
        self.notify();
    }

    /// Queue a block unconditionally; used for locally originated blocks.
    pub fn manual(&self, block: Arc<Block>) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.manual.push_back(block);
        }
        self.notify();
    }

    pub fn notify(&self) {
        self.condition.notify_all();
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.priority.len() + state.manual.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn run(&self) {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                break;
            }
            let overfill = self.active.vacancy() < 0;
            let can_insert = self.active.vacancy() > 0;
            if overfill {
                drop(state);
                self.active.erase_oldest();
                state = self.state.lock();
            } else if !state.manual.is_empty() {
                let block = state.manual.pop_front().expect("non-empty manual queue");
                drop(state);
                self.active.insert(&block);
                state = self.state.lock();
            } else if can_insert && !state.priority.is_empty() {
                let entry = state.priority.pop().expect("non-empty priority queue");
                drop(state);
                let (_, election) = self.active.insert(&entry.block);
                if let Some(election) = election {
                    election.transition_active();
                }
                state = self.state.lock();
            } else {
                self.condition.wait(&mut state);
            }
        }
    }

    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        self.condition.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ElectionScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
