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

//! Undoing blocks from an account head.
//!
//! Rollback walks an account chain from the head down to the target block,
//! inverting each block's effects. Rolling back a send whose funds were
//! already received first rolls back the receiving chain, recursively.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ethereum_types::U128;
use log::debug;

use lattice_db::WriteTransaction;
use lattice_types::{
    utils, AccountInfo, Block, BlockHash, Epoch, PendingInfo, PendingKey, StoredBlock,
};

use super::Ledger;

pub(super) fn rollback(
    ledger: &Ledger,
    txn: &WriteTransaction,
    target: &BlockHash,
    list: &mut Vec<Arc<Block>>,
) -> Result<(), ()> {
    if !ledger.store.block.exists(txn, target) {
        return Err(());
    }
    let account = ledger.account(txn, target).ok_or(())?;
    while ledger.store.block.exists(txn, target) {
        let info = ledger.store.account.get(txn, &account).ok_or(())?;
        let head = info.head;
        let stored = ledger.store.block.get(txn, &head).ok_or(())?;
        // Cemented blocks are irrevocable.
        let confirmation = ledger.store.confirmation_height.get(txn, &account);
        if confirmation.height >= stored.sideband.height {
            debug!(target: "ledger", "refusing rollback of cemented block {:?}", head);
            return Err(());
        }
        roll_back_head(ledger, txn, &account, &info, &stored, list)?;
    }
    Ok(())
}

fn roll_back_head(
    ledger: &Ledger,
    txn: &WriteTransaction,
    account: &lattice_types::Account,
    info: &AccountInfo,
    stored: &StoredBlock,
    list: &mut Vec<Arc<Block>>,
) -> Result<(), ()> {
    let hash = stored.block.hash();
    let block = stored.block.clone();
    let previous = block.previous();
    let previous_stored = if previous.is_zero() {
        None
    } else {
        Some(ledger.store.block.get(txn, &previous).ok_or(())?)
    };
    let previous_balance = previous_stored
        .as_ref()
        .map(|stored| {
            stored
                .block
                .balance_field()
                .unwrap_or(stored.sideband.balance)
        })
        .unwrap_or_else(U128::zero);
    let balance = block.balance_field().unwrap_or(stored.sideband.balance);
    let previous_representative = if previous.is_zero() {
        lattice_types::Account::zero()
    } else {
        ledger.representative_calculated(txn, &previous)
    };

    // Undo the transfer, which may require undoing the other side first.
    if ledger.is_send(txn, &block) {
        let destination = ledger.block_destination(txn, &block).ok_or(())?;
        let key = PendingKey::new(destination, hash);
        while ledger.store.pending.get(txn, &key).is_none() {
            // Already received; the receiving chain goes first.
            let receive = ledger
                .find_receive_block_by_send_hash(txn, &destination, &hash)
                .ok_or(())?;
            rollback(ledger, txn, &receive.hash(), list)?;
        }
        ledger.store.pending.del(txn, &key);
    } else if let Some(source) = ledger.block_source(txn, &block) {
        // A receive: restore the pending entry it consumed.
        let amount = balance - previous_balance;
        let source_account = ledger.account(txn, &source).unwrap_or_default();
        ledger.store.pending.put(
            txn,
            &PendingKey::new(*account, source),
            &PendingInfo::new(source_account, amount, stored.sideband.source_epoch),
        );
    }

    // Exact inverse of apply's weight movement: the head's representative
    // loses the head balance, the predecessor's gets the old balance back.
    if previous.is_zero() {
        ledger
            .weights()
            .representation_add(info.representative, balance, true);
    } else {
        ledger.representation_add_dual(
            info.representative,
            balance,
            previous_representative,
            previous_balance,
        );
    }

    // Frontier index: the head entry disappears, legacy predecessors get
    // theirs back.
    if ledger.store.frontier.get(txn, &hash).is_some() {
        ledger.store.frontier.del(txn, &hash);
    }
    if let Some(previous_stored) = &previous_stored {
        if previous_stored.block.block_type() != lattice_types::BlockType::State {
            ledger.store.frontier.put(txn, &previous, account);
        }
        // The predecessor no longer has a successor.
        ledger
            .store
            .block
            .put_successor(txn, &previous, &BlockHash::zero());
    }

    match &previous_stored {
        Some(previous_stored) => {
            let epoch = match &*previous_stored.block {
                Block::State(_) => previous_stored.sideband.details.epoch,
                _ => Epoch::Epoch0,
            };
            let new_info = AccountInfo {
                head: previous,
                representative: previous_representative,
                open_block: info.open_block,
                balance: previous_balance,
                modified: utils::seconds_since_epoch(),
                block_count: info.block_count - 1,
                epoch,
            };
            ledger.store.account.put(txn, account, &new_info);
        }
        None => {
            ledger.store.account.del(txn, account);
            ledger.cache.account_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    ledger.store.block.del(txn, &hash);
    ledger.cache.block_count.fetch_sub(1, Ordering::SeqCst);
    // Any final vote at this root is void with the block gone.
    ledger.store.final_vote.del(txn, &block.root());
    debug!(target: "ledger", "rolled back {:?}", hash);
    list.push(block);
    Ok(())
}
