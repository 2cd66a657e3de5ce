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

//! Block classification and application.
//!
//! Checks run cheapest-first and every failure is an early return; only a
//! fully validated block reaches the effects section of its variant.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ethereum_types::U128;

use lattice_db::WriteTransaction;
use lattice_types::{
    utils, validate_message, AccountInfo, Block, BlockDetails, BlockSideband, ChangeBlock, Epoch,
    OpenBlock, PendingInfo, PendingKey, ReceiveBlock, SendBlock, SignatureVerification, StateBlock,
    WorkVersion,
};

use super::{Ledger, ProcessResult};

pub(super) fn process(
    ledger: &Ledger,
    txn: &WriteTransaction,
    block: &Arc<Block>,
    verification: SignatureVerification,
) -> ProcessResult {
    match &**block {
        Block::Send(b) => send_block(ledger, txn, block, b, verification),
        Block::Receive(b) => receive_block(ledger, txn, block, b, verification),
        Block::Open(b) => open_block(ledger, txn, block, b, verification),
        Block::Change(b) => change_block(ledger, txn, block, b, verification),
        Block::State(b) => state_block(ledger, txn, block, b, verification),
    }
}

fn work_valid(ledger: &Ledger, root: &lattice_types::Root, work: u64, details: &BlockDetails) -> bool {
    ledger.constants.work.difficulty(WorkVersion::Work1, root, work)
        >= ledger.constants.work.threshold(WorkVersion::Work1, details)
}

// Store the block, link it behind its predecessor and advance the account.
#[allow(clippy::too_many_arguments)]
fn apply_block(
    ledger: &Ledger,
    txn: &WriteTransaction,
    block: &Arc<Block>,
    old_info: &Option<AccountInfo>,
    new_info: &AccountInfo,
    account: lattice_types::Account,
    details: BlockDetails,
    source_epoch: Epoch,
) {
    let hash = block.hash();
    let height = old_info.as_ref().map(|info| info.block_count).unwrap_or(0) + 1;
    let sideband = BlockSideband::new(
        account,
        lattice_types::BlockHash::zero(),
        new_info.balance,
        height,
        utils::seconds_since_epoch(),
        details,
        source_epoch,
    );
    ledger.store.block.put(txn, &hash, block, &sideband);
    let previous = block.previous();
    if !previous.is_zero() {
        ledger.store.block.put_successor(txn, &previous, &hash);
    }
    ledger.store.account.put(txn, &account, new_info);
    if old_info.is_none() {
        ledger.cache.account_count.fetch_add(1, Ordering::SeqCst);
    }
    ledger.cache.block_count.fetch_add(1, Ordering::SeqCst);
}

fn state_block(
    ledger: &Ledger,
    txn: &WriteTransaction,
    block: &Arc<Block>,
    b: &StateBlock,
    verification: SignatureVerification,
) -> ProcessResult {
    if ledger.block_or_pruned_exists(txn, &b.hash()) {
        return ProcessResult::Old;
    }
    let mut is_epoch = false;
    if ledger.constants.epochs.is_epoch_link(&b.link) {
        // An epoch candidate keeps the balance of its predecessor; anything
        // else sending to the epoch address is a plain send.
        let previous_balance = if b.previous.is_zero() {
            U128::zero()
        } else {
            match ledger.balance(txn, &b.previous) {
                Some(balance) => balance,
                None => return ProcessResult::GapPrevious,
            }
        };
        is_epoch = b.balance == previous_balance;
    }
    if is_epoch {
        epoch_block_impl(ledger, txn, block, b, verification)
    } else {
        state_block_impl(ledger, txn, block, b, verification)
    }
}

fn state_block_impl(
    ledger: &Ledger,
    txn: &WriteTransaction,
    block: &Arc<Block>,
    b: &StateBlock,
    verification: SignatureVerification,
) -> ProcessResult {
    let hash = b.hash();
    if b.account == ledger.constants.burn_account {
        return ProcessResult::OpenedBurnAccount;
    }
    if verification != SignatureVerification::Valid
        && !validate_message(&b.account, hash.as_bytes(), b.signature())
    {
        return ProcessResult::BadSignature;
    }
    let old_info = ledger.store.account.get(txn, &b.account);
    let previous_balance;
    match &old_info {
        Some(info) => {
            if b.previous.is_zero() {
                return ProcessResult::Fork;
            }
            if !ledger.block_or_pruned_exists(txn, &b.previous) {
                return ProcessResult::GapPrevious;
            }
            if b.previous != info.head {
                return ProcessResult::Fork;
            }
            previous_balance = info.balance;
        }
        None => {
            if !b.previous.is_zero() {
                return ProcessResult::GapPrevious;
            }
            previous_balance = U128::zero();
        }
    }
    let is_send = b.balance < previous_balance;
    let is_receive = !is_send && !b.link.is_zero();
    let mut epoch = old_info
        .as_ref()
        .map(|info| info.epoch)
        .unwrap_or(Epoch::Epoch0);
    let mut source_epoch = Epoch::Epoch0;
    if is_receive {
        if !ledger.block_or_pruned_exists(txn, &b.link) {
            return ProcessResult::GapSource;
        }
        let key = PendingKey::new(b.account, b.link);
        let pending = match ledger.store.pending.get(txn, &key) {
            Some(pending) => pending,
            None => return ProcessResult::Unreceivable,
        };
        if b.balance != previous_balance.saturating_add(pending.amount) {
            return ProcessResult::BalanceMismatch;
        }
        // Receiving funds sent under a newer epoch upgrades the account.
        epoch = epoch.max(pending.epoch);
        source_epoch = pending.epoch;
    } else if !is_send && b.balance != previous_balance {
        // Balance rose with no source to receive from.
        return ProcessResult::BalanceMismatch;
    }
    let details = BlockDetails::new(epoch, is_send, is_receive, false);
    if !work_valid(ledger, &block.root(), b.work(), &details) {
        return ProcessResult::InsufficientWork;
    }

    // Effects.
    if is_receive {
        ledger
            .store
            .pending
            .del(txn, &PendingKey::new(b.account, b.link));
    }
    if is_send {
        let amount = previous_balance - b.balance;
        ledger.store.pending.put(
            txn,
            &PendingKey::new(b.link, hash),
            &PendingInfo::new(b.account, amount, epoch),
        );
    }
    let new_info = AccountInfo {
        head: hash,
        representative: b.representative,
        open_block: old_info
            .as_ref()
            .map(|info| info.open_block)
            .unwrap_or(hash),
        balance: b.balance,
        modified: utils::seconds_since_epoch(),
        block_count: old_info.as_ref().map(|info| info.block_count).unwrap_or(0) + 1,
        epoch,
    };
    match &old_info {
        Some(info) => {
            ledger.representation_add_dual(
                info.representative,
                info.balance,
                b.representative,
                b.balance,
            );
            // A state block supersedes any legacy frontier entry.
            if ledger.store.frontier.get(txn, &info.head).is_some() {
                ledger.store.frontier.del(txn, &info.head);
            }
        }
        None => {
            ledger
                .weights()
                .representation_add(b.representative, b.balance, false);
        }
    }
    apply_block(
        ledger,
        txn,
        block,
        &old_info,
        &new_info,
        b.account,
        details,
        source_epoch,
    );
    ProcessResult::Progress
}

fn epoch_block_impl(
    ledger: &Ledger,
    txn: &WriteTransaction,
    block: &Arc<Block>,
    b: &StateBlock,
    verification: SignatureVerification,
) -> ProcessResult {
    let hash = b.hash();
    let epoch = match ledger.constants.epochs.epoch(&b.link) {
        Some(epoch) => epoch,
        None => return ProcessResult::BadSignature,
    };
    if verification != SignatureVerification::ValidEpoch {
        let signer = match ledger.constants.epochs.signer(epoch) {
            Some(signer) => *signer,
            None => return ProcessResult::BadSignature,
        };
        if !validate_message(&signer, hash.as_bytes(), b.signature()) {
            return ProcessResult::BadSignature;
        }
    }
    if b.account == ledger.constants.burn_account {
        return ProcessResult::OpenedBurnAccount;
    }
    let old_info = ledger.store.account.get(txn, &b.account);
    match &old_info {
        Some(info) => {
            if b.previous.is_zero() {
                return ProcessResult::Fork;
            }
            if !ledger.block_or_pruned_exists(txn, &b.previous) {
                return ProcessResult::GapPrevious;
            }
            if b.previous != info.head {
                return ProcessResult::Fork;
            }
            if b.representative != info.representative {
                return ProcessResult::RepresentativeMismatch;
            }
            if !info.epoch.is_sequential(epoch) {
                return ProcessResult::BlockPosition;
            }
            if b.balance != info.balance {
                return ProcessResult::BalanceMismatch;
            }
        }
        None => {
            if !b.previous.is_zero() {
                return ProcessResult::GapPrevious;
            }
            if !b.representative.is_zero() {
                return ProcessResult::RepresentativeMismatch;
            }
            if !b.balance.is_zero() {
                return ProcessResult::BalanceMismatch;
            }
            // An epoch open only makes sense ahead of incoming funds.
            if ledger.store.pending.account_range(txn, &b.account).is_empty() {
                return ProcessResult::GapEpochOpenPending;
            }
        }
    }
    let details = BlockDetails::new(epoch, false, false, true);
    if !work_valid(ledger, &block.root(), b.work(), &details) {
        return ProcessResult::InsufficientWork;
    }

    let new_info = AccountInfo {
        head: hash,
        representative: b.representative,
        open_block: old_info
            .as_ref()
            .map(|info| info.open_block)
            .unwrap_or(hash),
        balance: b.balance,
        modified: utils::seconds_since_epoch(),
        block_count: old_info.as_ref().map(|info| info.block_count).unwrap_or(0) + 1,
        epoch,
    };
    if let Some(info) = &old_info {
        if ledger.store.frontier.get(txn, &info.head).is_some() {
            ledger.store.frontier.del(txn, &info.head);
        }
    }
    apply_block(
        ledger,
        txn,
        block,
        &old_info,
        &new_info,
        b.account,
        details,
        Epoch::Epoch0,
    );
    ProcessResult::Progress
}

// Legacy blocks live strictly in epoch 0 and maintain the frontier index.
fn legacy_account_for(
    ledger: &Ledger,
    txn: &WriteTransaction,
    previous: &lattice_types::BlockHash,
) -> Result<lattice_types::Account, ProcessResult> {
    if !ledger.store.block.exists(txn, previous) {
        return Err(ProcessResult::GapPrevious);
    }
    // Only chain heads have frontier entries; a miss means the position is
    // already taken (or the chain is state-based, which legacy blocks may
    // not extend).
    ledger
        .store
        .frontier
        .get(txn, previous)
        .ok_or(ProcessResult::Fork)
}

fn send_block(
    ledger: &Ledger,
    txn: &WriteTransaction,
    block: &Arc<Block>,
    b: &SendBlock,
    verification: SignatureVerification,
) -> ProcessResult {
    let hash = b.hash();
    if ledger.block_or_pruned_exists(txn, &hash) {
        return ProcessResult::Old;
    }
    let account = match legacy_account_for(ledger, txn, &b.previous) {
        Ok(account) => account,
        Err(result) => return result,
    };
    if verification != SignatureVerification::Valid
        && !validate_message(&account, hash.as_bytes(), b.signature())
    {
        return ProcessResult::BadSignature;
    }
    let info = ledger
        .store
        .account
        .get(txn, &account)
        .expect("frontier without account");
    debug_assert!(info.head == b.previous);
    if info.epoch != Epoch::Epoch0 {
        return ProcessResult::BlockPosition;
    }
    if b.balance >= info.balance {
        return ProcessResult::NegativeSpend;
    }
    let details = BlockDetails::new(Epoch::Epoch0, true, false, false);
    if !work_valid(ledger, &block.root(), b.work(), &details) {
        return ProcessResult::InsufficientWork;
    }

    let amount = info.balance - b.balance;
    ledger.store.frontier.del(txn, &b.previous);
    ledger.store.frontier.put(txn, &hash, &account);
    ledger.store.pending.put(
        txn,
        &PendingKey::new(b.destination, hash),
        &PendingInfo::new(account, amount, Epoch::Epoch0),
    );
    ledger
        .weights()
        .representation_add(info.representative, amount, true);
    let new_info = AccountInfo {
        head: hash,
        balance: b.balance,
        modified: utils::seconds_since_epoch(),
        block_count: info.block_count + 1,
        ..info.clone()
    };
    apply_block(
        ledger,
        txn,
        block,
        &Some(info),
        &new_info,
        account,
        details,
        Epoch::Epoch0,
    );
    ProcessResult::Progress
}

fn receive_like_checks(
    ledger: &Ledger,
    txn: &WriteTransaction,
    account: &lattice_types::Account,
    source: &lattice_types::BlockHash,
) -> Result<PendingInfo, ProcessResult> {
    if !ledger.block_or_pruned_exists(txn, source) {
        return Err(ProcessResult::GapSource);
    }
    let pending = ledger
        .store
        .pending
        .get(txn, &PendingKey::new(*account, *source))
        .ok_or(ProcessResult::Unreceivable)?;
    // Legacy receives cannot claim funds sent under a newer epoch.
    if pending.epoch != Epoch::Epoch0 {
        return Err(ProcessResult::Unreceivable);
    }
    Ok(pending)
}

fn receive_block(
    ledger: &Ledger,
    txn: &WriteTransaction,
    block: &Arc<Block>,
    b: &ReceiveBlock,
    verification: SignatureVerification,
) -> ProcessResult {
    let hash = b.hash();
    if ledger.block_or_pruned_exists(txn, &hash) {
        return ProcessResult::Old;
    }
    let account = match legacy_account_for(ledger, txn, &b.previous) {
        Ok(account) => account,
        Err(result) => return result,
    };
    if verification != SignatureVerification::Valid
        && !validate_message(&account, hash.as_bytes(), b.signature())
    {
        return ProcessResult::BadSignature;
    }
    let info = ledger
        .store
        .account
        .get(txn, &account)
        .expect("frontier without account");
    if info.epoch != Epoch::Epoch0 {
        return ProcessResult::BlockPosition;
    }
    let pending = match receive_like_checks(ledger, txn, &account, &b.source) {
        Ok(pending) => pending,
        Err(result) => return result,
    };
    let details = BlockDetails::new(Epoch::Epoch0, false, true, false);
    if !work_valid(ledger, &block.root(), b.work(), &details) {
        return ProcessResult::InsufficientWork;
    }

    ledger
        .store
        .pending
        .del(txn, &PendingKey::new(account, b.source));
    ledger.store.frontier.del(txn, &b.previous);
    ledger.store.frontier.put(txn, &hash, &account);
    ledger
        .weights()
        .representation_add(info.representative, pending.amount, false);
    let new_info = AccountInfo {
        head: hash,
        balance: info.balance.saturating_add(pending.amount),
        modified: utils::seconds_since_epoch(),
        block_count: info.block_count + 1,
        ..info.clone()
    };
    apply_block(
        ledger,
        txn,
        block,
        &Some(info),
        &new_info,
        account,
        details,
        Epoch::Epoch0,
    );
    ProcessResult::Progress
}

fn open_block(
    ledger: &Ledger,
    txn: &WriteTransaction,
    block: &Arc<Block>,
    b: &OpenBlock,
    verification: SignatureVerification,
) -> ProcessResult {
    let hash = b.hash();
    if ledger.block_or_pruned_exists(txn, &hash) {
        return ProcessResult::Old;
    }
    if b.account == ledger.constants.burn_account {
        return ProcessResult::OpenedBurnAccount;
    }
    if verification != SignatureVerification::Valid
        && !validate_message(&b.account, hash.as_bytes(), b.signature())
    {
        return ProcessResult::BadSignature;
    }
    if ledger.store.account.get(txn, &b.account).is_some() {
        return ProcessResult::Fork;
    }
    let pending = match receive_like_checks(ledger, txn, &b.account, &b.source) {
        Ok(pending) => pending,
        Err(result) => return result,
    };
    let details = BlockDetails::new(Epoch::Epoch0, false, true, false);
    if !work_valid(ledger, &block.root(), b.work(), &details) {
        return ProcessResult::InsufficientWork;
    }

    ledger
        .store
        .pending
        .del(txn, &PendingKey::new(b.account, b.source));
    ledger.store.frontier.put(txn, &hash, &b.account);
    ledger
        .weights()
        .representation_add(b.representative, pending.amount, false);
    let new_info = AccountInfo {
        head: hash,
        representative: b.representative,
        open_block: hash,
        balance: pending.amount,
        modified: utils::seconds_since_epoch(),
        block_count: 1,
        epoch: Epoch::Epoch0,
    };
    apply_block(
        ledger,
        txn,
        block,
        &None,
        &new_info,
        b.account,
        details,
        Epoch::Epoch0,
    );
    ProcessResult::Progress
}

fn change_block(
    ledger: &Ledger,
    txn: &WriteTransaction,
    block: &Arc<Block>,
    b: &ChangeBlock,
    verification: SignatureVerification,
) -> ProcessResult {
    let hash = b.hash();
    if ledger.block_or_pruned_exists(txn, &hash) {
        return ProcessResult::Old;
    }
    let account = match legacy_account_for(ledger, txn, &b.previous) {
        Ok(account) => account,
        Err(result) => return result,
    };
    if verification != SignatureVerification::Valid
        && !validate_message(&account, hash.as_bytes(), b.signature())
    {
        return ProcessResult::BadSignature;
    }
    let info = ledger
        .store
        .account
        .get(txn, &account)
        .expect("frontier without account");
    if info.epoch != Epoch::Epoch0 {
        return ProcessResult::BlockPosition;
    }
    let details = BlockDetails::new(Epoch::Epoch0, false, false, false);
    if !work_valid(ledger, &block.root(), b.work(), &details) {
        return ProcessResult::InsufficientWork;
    }

    ledger.store.frontier.del(txn, &b.previous);
    ledger.store.frontier.put(txn, &hash, &account);
    ledger.representation_add_dual(
        info.representative,
        info.balance,
        b.representative,
        info.balance,
    );
    let new_info = AccountInfo {
        head: hash,
        representative: b.representative,
        modified: utils::seconds_since_epoch(),
        block_count: info.block_count + 1,
        ..info.clone()
    };
    apply_block(
        ledger,
        txn,
        block,
        &Some(info),
        &new_info,
        account,
        details,
        Epoch::Epoch0,
    );
    ProcessResult::Progress
}
