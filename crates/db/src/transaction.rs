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

//! Read and write transactions.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use kvdb::KeyValueDB;
use parking_lot::MutexGuard;

use crate::Table;

const DB_ERROR: &str = "low-level database error";

/// Uniform read access for both transaction kinds. Iteration is ordered by
/// key bytes.
pub trait Transaction {
    fn get(&self, table: Table, key: &[u8]) -> Option<Vec<u8>>;

    fn exists(&self, table: Table, key: &[u8]) -> bool {
        self.get(table, key).is_some()
    }

    fn iter<'a>(&'a self, table: Table) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

    /// Iterate entries whose key is `>= start`.
    fn iter_from<'a>(
        &'a self,
        table: Table,
        start: &[u8],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        let start = start.to_vec();
        Box::new(self.iter(table).skip_while(move |(key, _)| key[..] < start[..]))
    }

    fn count(&self, table: Table) -> usize {
        self.iter(table).count()
    }
}

/// Reads the committed state directly.
pub struct ReadTransaction {
    db: Arc<dyn KeyValueDB>,
}

impl ReadTransaction {
    pub(crate) fn new(db: Arc<dyn KeyValueDB>) -> Self {
        ReadTransaction { db }
    }
}

impl Transaction for ReadTransaction {
    fn get(&self, table: Table, key: &[u8]) -> Option<Vec<u8>> {
        self.db
            .get(table.column(), key)
            .expect(DB_ERROR)
            .map(|value| value.to_vec())
    }

    fn iter<'a>(&'a self, table: Table) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        Box::new(
            self.db
                .iter(table.column())
                .map(|(key, value)| (key.into_vec(), value.into_vec())),
        )
    }
}

type OverlayKey = (u32, Vec<u8>);

/// Exclusive writer with an ordered overlay. Reads see the overlay first, so
/// a batch observes its own effects; everything commits atomically when the
/// transaction drops.
pub struct WriteTransaction<'a> {
    db: Arc<dyn KeyValueDB>,
    overlay: RefCell<BTreeMap<OverlayKey, Option<Vec<u8>>>>,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> WriteTransaction<'a> {
    pub(crate) fn new(db: Arc<dyn KeyValueDB>, guard: MutexGuard<'a, ()>) -> Self {
        WriteTransaction {
            db,
            overlay: RefCell::new(BTreeMap::new()),
            _guard: guard,
        }
    }

    pub(crate) fn put(&self, table: Table, key: &[u8], value: &[u8]) {
        self.overlay
            .borrow_mut()
            .insert((table as u32, key.to_vec()), Some(value.to_vec()));
    }

    pub(crate) fn delete(&self, table: Table, key: &[u8]) {
        self.overlay
            .borrow_mut()
            .insert((table as u32, key.to_vec()), None);
    }

    /// Flush the overlay early; the transaction remains usable.
    pub fn commit(&self) {
        let mut overlay = self.overlay.borrow_mut();
        if overlay.is_empty() {
            return;
        }
        let mut batch = self.db.transaction();
        for ((table, key), value) in overlay.iter() {
            let column = Some(*table);
            match value {
                Some(value) => batch.put(column, key, value),
                None => batch.delete(column, key),
            }
        }
        self.db.write(batch).expect(DB_ERROR);
        overlay.clear();
    }

    fn overlay_snapshot(&self, table: Table) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        let overlay = self.overlay.borrow();
        overlay
            .range((table as u32, Vec::new())..(table as u32 + 1, Vec::new()))
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl<'a> Drop for WriteTransaction<'a> {
    fn drop(&mut self) {
        self.commit();
    }
}

impl<'a> Transaction for WriteTransaction<'a> {
    fn get(&self, table: Table, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(value) = self
            .overlay
            .borrow()
            .get(&(table as u32, key.to_vec()))
        {
            return value.clone();
        }
        self.db
            .get(table.column(), key)
            .expect(DB_ERROR)
            .map(|value| value.to_vec())
    }

    fn iter<'b>(&'b self, table: Table) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'b> {
        let overlay = self.overlay_snapshot(table);
        let committed = self
            .db
            .iter(table.column())
            .map(|(key, value)| (key.into_vec(), value.into_vec()));
        Box::new(MergeIter {
            committed: committed.peekable(),
            overlay: overlay.into_iter().peekable(),
        })
    }
}

// Two-way merge of the committed iterator and the overlay; the overlay wins
// on equal keys and its deletions suppress committed entries.
struct MergeIter<C: Iterator<Item = (Vec<u8>, Vec<u8>)>> {
    committed: std::iter::Peekable<C>,
    overlay: std::iter::Peekable<std::vec::IntoIter<(Vec<u8>, Option<Vec<u8>>)>>,
}

impl<C: Iterator<Item = (Vec<u8>, Vec<u8>)>> Iterator for MergeIter<C> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        use std::cmp::Ordering;
        loop {
            let order = match (self.committed.peek(), self.overlay.peek()) {
                (None, None) => return None,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some((committed_key, _)), Some((overlay_key, _))) => {
                    committed_key.cmp(overlay_key)
                }
            };
            if order == Ordering::Less {
                return self.committed.next();
            }
            if order == Ordering::Equal {
                // Overlay supersedes the committed row.
                self.committed.next();
            }
            match self.overlay.next() {
                Some((key, Some(value))) => return Some((key, value)),
                // Deleted in the overlay; skip.
                Some((_, None)) => continue,
                None => unreachable!(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    fn pairs(iter: Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>) -> Vec<(u8, u8)> {
        iter.map(|(key, value)| (key[0], value[0])).collect()
    }

    #[test]
    fn merge_iteration_is_ordered_and_overlay_wins() {
        let store = Store::open_memory();
        {
            let txn = store.tx_begin_write();
            txn.put(Table::Frontiers, &[2], &[20]);
            txn.put(Table::Frontiers, &[4], &[40]);
        }
        let txn = store.tx_begin_write();
        txn.put(Table::Frontiers, &[1], &[10]);
        txn.put(Table::Frontiers, &[2], &[21]);
        txn.delete(Table::Frontiers, &[4]);
        txn.put(Table::Frontiers, &[5], &[50]);
        assert_eq!(
            pairs(txn.iter(Table::Frontiers)),
            vec![(1, 10), (2, 21), (5, 50)]
        );
    }

    #[test]
    fn iter_from_skips_lower_keys() {
        let store = Store::open_memory();
        {
            let txn = store.tx_begin_write();
            for key in 1..=5u8 {
                txn.put(Table::Frontiers, &[key], &[key]);
            }
        }
        let txn = store.tx_begin_read();
        assert_eq!(
            pairs(txn.iter_from(Table::Frontiers, &[3])),
            vec![(3, 3), (4, 4), (5, 5)]
        );
    }

    #[test]
    fn explicit_commit_then_more_writes() {
        let store = Store::open_memory();
        let txn = store.tx_begin_write();
        txn.put(Table::Frontiers, &[1], &[1]);
        txn.commit();
        txn.put(Table::Frontiers, &[2], &[2]);
        drop(txn);
        let read = store.tx_begin_read();
        assert_eq!(read.count(Table::Frontiers), 2);
    }
}
