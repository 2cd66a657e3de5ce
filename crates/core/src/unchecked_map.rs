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

//! Staging for blocks whose dependency has not arrived yet.
//!
//! Inserts and dependency triggers are buffered and written by a dedicated
//! thread so the block processor never stalls on staging I/O. When a
//! dependency is satisfied the waiting blocks are handed to the `satisfied`
//! callback and removed.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use lattice_db::{Store, Transaction, WriteTransaction};
use lattice_types::{BlockHash, UncheckedInfo, UncheckedKey};

enum Item {
    Insert(BlockHash, UncheckedInfo),
    Query(BlockHash),
}

type Satisfied = dyn Fn(UncheckedInfo) + Send + Sync;

struct State {
    buffer: VecDeque<Item>,
    writing_back_buffer: bool,
    stopped: bool,
}

pub struct UncheckedMap {
    store: Arc<Store>,
    state: Mutex<State>,
    condition: Condvar,
    satisfied: Mutex<Option<Arc<Satisfied>>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl UncheckedMap {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        let map = Arc::new(UncheckedMap {
            store,
            state: Mutex::new(State {
                buffer: VecDeque::new(),
                writing_back_buffer: false,
                stopped: false,
            }),
            condition: Condvar::new(),
            satisfied: Mutex::new(None),
            thread: Mutex::new(None),
        });
        let map_clone = map.clone();
        let handle = std::thread::Builder::new()
            .name("unchecked".to_string())
            .spawn(move || map_clone.run())
            .expect("unchecked thread spawn");
        *map.thread.lock() = Some(handle);
        map
    }

    pub fn set_satisfied(&self, callback: Arc<Satisfied>) {
        *self.satisfied.lock() = Some(callback);
    }

    /// Stage `info` until `dependency` arrives.
    pub fn put(&self, dependency: BlockHash, info: UncheckedInfo) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.buffer.push_back(Item::Insert(dependency, info));
        }
        self.condition.notify_all();
    }

    /// Announce that `dependency` is now in the ledger; anything waiting on
    /// it is released to the `satisfied` callback.
    pub fn trigger(&self, dependency: BlockHash) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.buffer.push_back(Item::Query(dependency));
        }
        self.condition.notify_all();
    }

    pub fn get(&self, txn: &dyn Transaction, dependency: &BlockHash) -> Vec<UncheckedInfo> {
        self.store.unchecked.get(txn, dependency)
    }

    pub fn exists(&self, txn: &dyn Transaction, key: &UncheckedKey) -> bool {
        self.store.unchecked.exists(txn, key)
    }

    pub fn del(&self, txn: &WriteTransaction, key: &UncheckedKey) {
        self.store.unchecked.del(txn, key);
    }

    pub fn clear(&self, txn: &WriteTransaction) {
        self.store.unchecked.clear(txn);
    }

    pub fn count(&self, txn: &dyn Transaction) -> usize {
        self.store.unchecked.count(txn)
    }

    /// Block until the buffer has drained; tests rely on this.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        while !state.stopped && (!state.buffer.is_empty() || state.writing_back_buffer) {
            self.condition.wait(&mut state);
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

    fn run(&self) {
        let mut state = self.state.lock();
        while !state.stopped {
            if !state.buffer.is_empty() {
                let back_buffer = std::mem::take(&mut state.buffer);
                state.writing_back_buffer = true;
                drop(state);
                self.write_buffer(back_buffer);
                state = self.state.lock();
                state.writing_back_buffer = false;
            } else {
                // Notify flush() waiters before sleeping.
                self.condition.notify_all();
                self.condition.wait(&mut state);
            }
        }
    }

    fn write_buffer(&self, items: VecDeque<Item>) {
        let satisfied = self.satisfied.lock().clone();
        let mut released = Vec::new();
        {
            let txn = self.store.tx_begin_write();
            for item in items {
                match item {
                    Item::Insert(dependency, info) => {
                        self.store.unchecked.put(&txn, &dependency, &info);
                    }
                    Item::Query(dependency) => {
                        for (key, info) in self.store.unchecked.equal_range(&txn, &dependency) {
                            self.store.unchecked.del(&txn, &key);
                            released.push(info);
                        }
                    }
                }
            }
        }
        if let Some(satisfied) = satisfied {
            for info in released {
                satisfied(info);
            }
        }
    }
}

impl Drop for UncheckedMap {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::{H256, U128};
    use lattice_types::{Block, KeyPair, SendBlock, SignatureVerification};

    fn test_info(key: &KeyPair) -> UncheckedInfo {
        let block = Arc::new(Block::Send(SendBlock::new(
            H256::repeat_byte(1),
            H256::repeat_byte(2),
            U128::one(),
            key.secret_key(),
            &key.public_key(),
            0,
        )));
        UncheckedInfo::new(block, key.public_key(), SignatureVerification::Unknown)
    }

    #[test]
    fn put_then_trigger_releases() {
        let store = Arc::new(lattice_db::Store::open_memory());
        let map = UncheckedMap::new(store.clone());
        let released = Arc::new(Mutex::new(Vec::new()));
        let released_clone = released.clone();
        map.set_satisfied(Arc::new(move |info: UncheckedInfo| {
            released_clone.lock().push(info.block.hash());
        }));
        let key = KeyPair::generate();
        let info = test_info(&key);
        let dependency = H256::repeat_byte(9);
        map.put(dependency, info.clone());
        map.flush();
        {
            let txn = store.tx_begin_read();
            assert_eq!(map.count(&txn), 1);
            assert_eq!(map.get(&txn, &dependency).len(), 1);
        }
        map.trigger(dependency);
        map.flush();
        assert_eq!(released.lock().as_slice(), &[info.block.hash()]);
        let txn = store.tx_begin_read();
        assert_eq!(map.count(&txn), 0);
        map.stop();
    }

    #[test]
    fn trigger_for_unknown_dependency_is_silent() {
        let store = Arc::new(lattice_db::Store::open_memory());
        let map = UncheckedMap::new(store);
        map.trigger(H256::repeat_byte(5));
        map.flush();
        map.stop();
    }
}
