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

//! Role-ordered serialization of database writers.
//!
//! Each writer takes a ticket and blocks until every earlier ticket has
//! finished, so bursts of writes land in request order regardless of which
//! component produced them. Lock order: a write slot is always acquired
//! before any component mutex.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Writer roles, named for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writer {
    ConfirmationHeight,
    ProcessBatch,
    Voting,
    Pruning,
    Testing,
}

struct Entry {
    writer: Writer,
    ticket: u64,
}

struct Queue {
    entries: VecDeque<Entry>,
    next_ticket: u64,
}

pub struct WriteQueue {
    queue: Mutex<Queue>,
    condition: Condvar,
}

impl Default for WriteQueue {
    fn default() -> Self {
        WriteQueue {
            queue: Mutex::new(Queue {
                entries: VecDeque::new(),
                next_ticket: 0,
            }),
            condition: Condvar::new(),
        }
    }
}

impl WriteQueue {
    /// Block until this request reaches the front of the queue.
    pub fn wait(&self, writer: Writer) -> WriteGuard {
        let mut queue = self.queue.lock();
        let ticket = queue.next_ticket;
        queue.next_ticket += 1;
        queue.entries.push_back(Entry { writer, ticket });
        while queue.entries.front().map(|entry| entry.ticket) != Some(ticket) {
            self.condition.wait(&mut queue);
        }
        WriteGuard {
            queue: self,
            owns: true,
        }
    }

    /// Whether any writer of this role is queued or active.
    pub fn contains(&self, writer: Writer) -> bool {
        self.queue
            .lock()
            .entries
            .iter()
            .any(|entry| entry.writer == writer)
    }

    fn release(&self) {
        {
            let mut queue = self.queue.lock();
            queue.entries.pop_front();
        }
        self.condition.notify_all();
    }
}

/// Holds the write slot; releasing pops the queue and wakes the next writer.
pub struct WriteGuard<'a> {
    queue: &'a WriteQueue,
    owns: bool,
}

impl<'a> WriteGuard<'a> {
    pub fn release(mut self) {
        debug_assert!(self.owns);
        self.owns = false;
        self.queue.release();
    }

    pub fn is_owned(&self) -> bool {
        self.owns
    }
}

impl<'a> Drop for WriteGuard<'a> {
    fn drop(&mut self) {
        if self.owns {
            self.queue.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn waiters_are_served_in_request_order() {
        let queue = Arc::new(WriteQueue::default());
        let first = queue.wait(Writer::ProcessBatch);
        let queue_clone = queue.clone();
        let handle = std::thread::spawn(move || {
            let _guard = queue_clone.wait(Writer::Voting);
        });
        // Give the spawned thread time to enqueue.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(queue.contains(Writer::Voting));
        first.release();
        handle.join().unwrap();
        assert!(!queue.contains(Writer::Voting));
    }

    #[test]
    fn same_role_waiters_are_distinct() {
        let queue = Arc::new(WriteQueue::default());
        let first = queue.wait(Writer::Voting);
        let queue_clone = queue.clone();
        let handle = std::thread::spawn(move || {
            let guard = queue_clone.wait(Writer::Voting);
            guard.release();
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        // The second voting writer is queued behind the first.
        assert!(queue.contains(Writer::Voting));
        first.release();
        handle.join().unwrap();
        assert!(!queue.contains(Writer::Voting));
    }

    #[test]
    fn guard_releases_on_drop() {
        let queue = WriteQueue::default();
        {
            let _guard = queue.wait(Writer::Testing);
            assert!(queue.contains(Writer::Testing));
        }
        assert!(!queue.contains(Writer::Testing));
    }
}
