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

use super::*;
use crate::test_utils::{work_for, LedgerContext};
use lattice_types::{Epoch, KeyPair, PendingKey, SignatureVerification, StateBlock};

fn process(ctx: &LedgerContext, block: &Arc<Block>) -> ProcessResult {
    let txn = ctx.store.tx_begin_write();
    ctx.ledger
        .process(&txn, block, SignatureVerification::Unknown)
}

#[test]
fn genesis_is_seeded_once() {
    let ctx = LedgerContext::new();
    let txn = ctx.store.tx_begin_read();
    let info = ctx
        .store
        .account
        .get(&txn, &ctx.genesis_account())
        .expect("genesis account");
    assert_eq!(info.head, ctx.genesis_hash());
    assert_eq!(info.balance, ctx.params.ledger.genesis_amount);
    assert_eq!(info.block_count, 1);
    assert_eq!(
        ctx.ledger.weight(&ctx.genesis_account()),
        ctx.params.ledger.genesis_amount
    );
    assert_eq!(ctx.ledger.cache.block_count.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.ledger.cache.cemented_count.load(Ordering::SeqCst), 1);
    assert!(ctx.ledger.block_confirmed(&txn, &ctx.genesis_hash()));
}

// Send one raw to a fresh key with legacy blocks; the classic round trip.
#[test]
fn legacy_send_receive_round_trip() {
    let ctx = LedgerContext::new();
    let genesis_amount = ctx.params.ledger.genesis_amount;
    let key = KeyPair::generate();
    let send = ctx.send_block(
        ctx.genesis_key(),
        ctx.genesis_hash(),
        key.public_key(),
        genesis_amount - U128::one(),
    );
    assert_eq!(process(&ctx, &send), ProcessResult::Progress);
    {
        let txn = ctx.store.tx_begin_read();
        let pending = ctx
            .store
            .pending
            .get(&txn, &PendingKey::new(key.public_key(), send.hash()))
            .expect("pending entry");
        assert_eq!(pending.source, ctx.genesis_account());
        assert_eq!(pending.amount, U128::one());
        assert_eq!(pending.epoch, Epoch::Epoch0);
    }
    assert_eq!(
        ctx.ledger.weight(&ctx.genesis_account()),
        genesis_amount - U128::one()
    );

    let open = ctx.open_block(&key, send.hash(), key.public_key());
    assert_eq!(process(&ctx, &open), ProcessResult::Progress);
    let txn = ctx.store.tx_begin_read();
    assert_eq!(ctx.store.pending.count(&txn), 0);
    assert_eq!(ctx.ledger.account_balance(&txn, &key.public_key()), U128::one());
    assert_eq!(ctx.ledger.weight(&key.public_key()), U128::one());
    assert_eq!(
        ctx.ledger.weight(&ctx.genesis_account()),
        genesis_amount - U128::one()
    );
    // Both blocks are retrievable and carry sane sidebands.
    let stored = ctx.store.block.get(&txn, &open.hash()).unwrap();
    assert_eq!(stored.sideband.height, 1);
    assert_eq!(stored.sideband.account, key.public_key());
    assert_eq!(ctx.store.block.successor(&txn, &ctx.genesis_hash()), Some(send.hash()));
}

#[test]
fn duplicate_is_old() {
    let ctx = LedgerContext::new();
    let key = KeyPair::generate();
    let send = ctx.send_block(
        ctx.genesis_key(),
        ctx.genesis_hash(),
        key.public_key(),
        ctx.params.ledger.genesis_amount - U128::one(),
    );
    assert_eq!(process(&ctx, &send), ProcessResult::Progress);
    assert_eq!(process(&ctx, &send), ProcessResult::Old);
}

#[test]
fn fork_is_detected_and_harmless() {
    let ctx = LedgerContext::new();
    let genesis_amount = ctx.params.ledger.genesis_amount;
    let key_1 = KeyPair::generate();
    let key_2 = KeyPair::generate();
    let send = ctx.send_block(
        ctx.genesis_key(),
        ctx.genesis_hash(),
        key_1.public_key(),
        genesis_amount - U128::one(),
    );
    assert_eq!(process(&ctx, &send), ProcessResult::Progress);
    let send_a = ctx.send_block(
        ctx.genesis_key(),
        send.hash(),
        key_2.public_key(),
        genesis_amount - U128::from(2u64),
    );
    let send_b = ctx.send_block(
        ctx.genesis_key(),
        send.hash(),
        key_1.public_key(),
        genesis_amount - U128::from(2u64),
    );
    assert_eq!(process(&ctx, &send_a), ProcessResult::Progress);
    let weight_before = ctx.ledger.weight(&ctx.genesis_account());
    assert_eq!(process(&ctx, &send_b), ProcessResult::Fork);
    // No mutation happened for the loser.
    assert_eq!(ctx.ledger.weight(&ctx.genesis_account()), weight_before);
    let txn = ctx.store.tx_begin_read();
    assert!(!ctx.ledger.block_exists(&txn, &send_b.hash()));
    let forked = ctx.ledger.forked_block(&txn, &send_b).expect("forked block");
    assert_eq!(forked.hash(), send_a.hash());
}

#[test]
fn open_fork_resolves_to_the_first_open() {
    let ctx = LedgerContext::new();
    let key = KeyPair::generate();
    let (send, open) = {
        let (send, open) = ctx.fund(&key, U128::from(10u64));
        (send, open)
    };
    drop(send);
    // A competing open at the same root (the account).
    let other_open = ctx.state_block(
        &key,
        key.public_key(),
        BlockHash::zero(),
        ctx.genesis_account(),
        U128::from(10u64),
        open.source_field().unwrap_or_else(|| match &*open {
            Block::State(b) => b.link,
            _ => unreachable!(),
        }),
    );
    assert_eq!(process(&ctx, &other_open), ProcessResult::Fork);
    let txn = ctx.store.tx_begin_read();
    let forked = ctx.ledger.forked_block(&txn, &other_open).expect("fork");
    assert_eq!(forked.hash(), open.hash());
}

#[test]
fn bad_signature_is_rejected() {
    let ctx = LedgerContext::new();
    let wrong = KeyPair::generate();
    let send = ctx.send_block(
        &wrong,
        ctx.genesis_hash(),
        wrong.public_key(),
        ctx.params.ledger.genesis_amount - U128::one(),
    );
    assert_eq!(process(&ctx, &send), ProcessResult::BadSignature);
}

#[test]
fn negative_spend_is_rejected() {
    let ctx = LedgerContext::new();
    let key = KeyPair::generate();
    let send = ctx.send_block(
        ctx.genesis_key(),
        ctx.genesis_hash(),
        key.public_key(),
        ctx.params.ledger.genesis_amount, // no decrease
    );
    assert_eq!(process(&ctx, &send), ProcessResult::NegativeSpend);
}

#[test]
fn state_send_to_burn_account_stays_pending_forever() {
    let ctx = LedgerContext::new();
    let send = ctx.state_block(
        ctx.genesis_key(),
        ctx.genesis_account(),
        ctx.genesis_hash(),
        ctx.genesis_account(),
        ctx.params.ledger.genesis_amount - U128::from(5u64),
        ctx.params.ledger.burn_account,
    );
    assert_eq!(process(&ctx, &send), ProcessResult::Progress);
    // Burn account itself can never open.
    let burn_open = ctx.state_block(
        &ctx.params.ledger.zero_key,
        ctx.params.ledger.burn_account,
        BlockHash::zero(),
        ctx.genesis_account(),
        U128::from(5u64),
        send.hash(),
    );
    assert_eq!(process(&ctx, &burn_open), ProcessResult::OpenedBurnAccount);
}

#[test]
fn gap_previous_and_gap_source() {
    let ctx = LedgerContext::new();
    let key = KeyPair::generate();
    let missing = BlockHash::repeat_byte(0xab);
    let send = ctx.send_block(
        ctx.genesis_key(),
        missing,
        key.public_key(),
        U128::from(1u64),
    );
    assert_eq!(process(&ctx, &send), ProcessResult::GapPrevious);
    let open = ctx.open_block(&key, missing, key.public_key());
    assert_eq!(process(&ctx, &open), ProcessResult::GapSource);
}

#[test]
fn receive_without_pending_is_unreceivable() {
    let ctx = LedgerContext::new();
    let key = KeyPair::generate();
    let (_, open) = ctx.fund(&key, U128::from(10u64));
    // The only send is already received; receiving it again must fail.
    let source = match &*open {
        Block::State(b) => b.link,
        _ => unreachable!(),
    };
    let duplicate_receive = ctx.state_block(
        &key,
        key.public_key(),
        open.hash(),
        key.public_key(),
        U128::from(20u64),
        source,
    );
    assert_eq!(process(&ctx, &duplicate_receive), ProcessResult::Unreceivable);
}

#[test]
fn state_receive_amount_must_match() {
    let ctx = LedgerContext::new();
    let key = KeyPair::generate();
    let txn = ctx.store.tx_begin_write();
    let info = ctx
        .store
        .account
        .get(&txn, &ctx.genesis_account())
        .unwrap();
    let send = ctx.state_block(
        ctx.genesis_key(),
        ctx.genesis_account(),
        info.head,
        ctx.genesis_account(),
        info.balance - U128::from(10u64),
        key.public_key(),
    );
    assert_eq!(
        ctx.ledger.process(&txn, &send, SignatureVerification::Unknown),
        ProcessResult::Progress
    );
    // Claims 11 where 10 were sent.
    let open = ctx.state_block(
        &key,
        key.public_key(),
        BlockHash::zero(),
        key.public_key(),
        U128::from(11u64),
        send.hash(),
    );
    assert_eq!(
        ctx.ledger.process(&txn, &open, SignatureVerification::Unknown),
        ProcessResult::BalanceMismatch
    );
}

#[test]
fn legacy_after_state_is_rejected() {
    let ctx = LedgerContext::new();
    let key = KeyPair::generate();
    // Genesis chain becomes state-based.
    let send = ctx.state_block(
        ctx.genesis_key(),
        ctx.genesis_account(),
        ctx.genesis_hash(),
        ctx.genesis_account(),
        ctx.params.ledger.genesis_amount - U128::one(),
        key.public_key(),
    );
    assert_eq!(process(&ctx, &send), ProcessResult::Progress);
    let legacy = ctx.send_block(
        ctx.genesis_key(),
        send.hash(),
        key.public_key(),
        ctx.params.ledger.genesis_amount - U128::from(2u64),
    );
    assert_eq!(process(&ctx, &legacy), ProcessResult::Fork);
}

#[test]
fn epoch_upgrade_and_thresholds() {
    let ctx = LedgerContext::new();
    // Scenario: epoch 1 upgrade of genesis.
    let epoch_1 = ctx.epoch_block(ctx.genesis_account(), ctx.genesis_hash(), Epoch::Epoch1);
    assert_eq!(process(&ctx, &epoch_1), ProcessResult::Progress);
    {
        let txn = ctx.store.tx_begin_read();
        let info = ctx
            .store
            .account
            .get(&txn, &ctx.genesis_account())
            .unwrap();
        assert_eq!(info.epoch, Epoch::Epoch1);
        assert_eq!(info.balance, ctx.params.ledger.genesis_amount);
        // Weights unchanged by the upgrade.
        assert_eq!(
            ctx.ledger.weight(&ctx.genesis_account()),
            ctx.params.ledger.genesis_amount
        );
        let stored = ctx.store.block.get(&txn, &epoch_1.hash()).unwrap();
        assert!(stored.sideband.details.is_epoch);
        assert_eq!(stored.sideband.details.epoch, Epoch::Epoch1);
    }
    // Skipping a version is out of order.
    let bad_epoch = ctx.epoch_block(ctx.genesis_account(), epoch_1.hash(), Epoch::Epoch1);
    assert_eq!(process(&ctx, &bad_epoch), ProcessResult::BlockPosition);
    let epoch_2 = ctx.epoch_block(ctx.genesis_account(), epoch_1.hash(), Epoch::Epoch2);
    assert_eq!(process(&ctx, &epoch_2), ProcessResult::Progress);

    // Under epoch 2 a send must meet the raised threshold.
    let key = KeyPair::generate();
    let work = ctx.params.work;
    let mut nonce = 0u64;
    let root = epoch_2.hash();
    // A nonce in the receive band but below the send band.
    let weak = loop {
        let value = lattice_types::work_value(&root, nonce);
        if value >= work.epoch_2_receive && value < work.epoch_2 {
            break nonce;
        }
        nonce += 1;
    };
    let weak_send = Arc::new(Block::State(StateBlock::new(
        ctx.genesis_account(),
        root,
        ctx.genesis_account(),
        ctx.params.ledger.genesis_amount - U128::one(),
        key.public_key(),
        ctx.genesis_key().secret_key(),
        &ctx.genesis_account(),
        weak,
    )));
    assert_eq!(process(&ctx, &weak_send), ProcessResult::InsufficientWork);
    let strong_send = ctx.state_block(
        ctx.genesis_key(),
        ctx.genesis_account(),
        root,
        ctx.genesis_account(),
        ctx.params.ledger.genesis_amount - U128::one(),
        key.public_key(),
    );
    assert_eq!(process(&ctx, &strong_send), ProcessResult::Progress);
    // The pending entry carries the sender's epoch.
    let txn = ctx.store.tx_begin_read();
    let pending = ctx
        .store
        .pending
        .get(&txn, &PendingKey::new(key.public_key(), strong_send.hash()))
        .unwrap();
    assert_eq!(pending.epoch, Epoch::Epoch2);
}

#[test]
fn epoch_block_must_not_change_representative() {
    let ctx = LedgerContext::new();
    let link = *ctx.params.ledger.epochs.link(Epoch::Epoch1).unwrap();
    let signer = ctx.genesis_key().clone();
    let tampered = Arc::new(Block::State(StateBlock::new(
        ctx.genesis_account(),
        ctx.genesis_hash(),
        KeyPair::generate().public_key(), // different representative
        ctx.params.ledger.genesis_amount,
        link,
        signer.secret_key(),
        &signer.public_key(),
        work_for(&ctx.params, &ctx.genesis_hash()),
    )));
    assert_eq!(process(&ctx, &tampered), ProcessResult::RepresentativeMismatch);
}

#[test]
fn epoch_open_requires_pending() {
    let ctx = LedgerContext::new();
    let key = KeyPair::generate();
    let link = *ctx.params.ledger.epochs.link(Epoch::Epoch1).unwrap();
    let signer = ctx.genesis_key().clone();
    let epoch_open = Arc::new(Block::State(StateBlock::new(
        key.public_key(),
        BlockHash::zero(),
        Account::zero(),
        U128::zero(),
        link,
        signer.secret_key(),
        &signer.public_key(),
        work_for(&ctx.params, &key.public_key()),
    )));
    assert_eq!(process(&ctx, &epoch_open), ProcessResult::GapEpochOpenPending);
    // After a send to the account the same block applies.
    let txn = ctx.store.tx_begin_write();
    let info = ctx.store.account.get(&txn, &ctx.genesis_account()).unwrap();
    let send = ctx.state_block(
        ctx.genesis_key(),
        ctx.genesis_account(),
        info.head,
        ctx.genesis_account(),
        info.balance - U128::from(7u64),
        key.public_key(),
    );
    assert_eq!(
        ctx.ledger.process(&txn, &send, SignatureVerification::Unknown),
        ProcessResult::Progress
    );
    assert_eq!(
        ctx.ledger
            .process(&txn, &epoch_open, SignatureVerification::Unknown),
        ProcessResult::Progress
    );
    let info = ctx.store.account.get(&txn, &key.public_key()).unwrap();
    assert_eq!(info.epoch, Epoch::Epoch1);
    assert_eq!(info.balance, U128::zero());
    assert_eq!(info.block_count, 1);
}

#[test]
fn rollback_is_the_exact_inverse_of_apply() {
    let ctx = LedgerContext::new();
    let key = KeyPair::generate();
    let rep = KeyPair::generate();

    let snapshot = |ctx: &LedgerContext| {
        let txn = ctx.store.tx_begin_read();
        (
            ctx.store
                .account
                .iter(&txn)
                .map(|(account, mut info)| {
                    // Wall-clock noise is not part of ledger state.
                    info.modified = 0;
                    (account, info)
                })
                .collect::<Vec<_>>(),
            ctx.store.pending.iter(&txn).collect::<Vec<_>>(),
            ctx.ledger.rep_amounts(),
            ctx.store.block.count(&txn),
            ctx.store.frontier.count(&txn),
        )
    };
    let before = snapshot(&ctx);

    // send → open → change representative, then unwind the lot.
    let (send, open) = ctx.fund(&key, U128::from(50u64));
    let change = ctx.state_block(
        &key,
        key.public_key(),
        open.hash(),
        rep.public_key(),
        U128::from(50u64),
        lattice_types::Link::zero(),
    );
    assert_eq!(process(&ctx, &change), ProcessResult::Progress);
    assert_eq!(ctx.ledger.weight(&rep.public_key()), U128::from(50u64));

    {
        let txn = ctx.store.tx_begin_write();
        let rolled = ctx.ledger.rollback(&txn, &send.hash()).expect("rollback");
        // Recursive: the whole receiving chain went first.
        assert_eq!(rolled.len(), 3);
        assert_eq!(rolled[0].hash(), change.hash());
        assert_eq!(rolled[1].hash(), open.hash());
        assert_eq!(rolled[2].hash(), send.hash());
    }
    let after = snapshot(&ctx);
    assert_eq!(before.0, after.0);
    assert_eq!(before.1, after.1);
    assert_eq!(before.2, after.2);
    assert_eq!(before.3, after.3);
    assert_eq!(before.4, after.4);
    assert_eq!(ctx.ledger.weight(&rep.public_key()), U128::zero());
}

#[test]
fn rollback_restores_pending() {
    let ctx = LedgerContext::new();
    let key = KeyPair::generate();
    let (send, open) = ctx.fund(&key, U128::from(5u64));
    drop(send);
    let txn = ctx.store.tx_begin_write();
    ctx.ledger.rollback(&txn, &open.hash()).expect("rollback");
    let pending = ctx
        .store
        .pending
        .get(
            &txn,
            &PendingKey::new(
                key.public_key(),
                match &*open {
                    Block::State(b) => b.link,
                    _ => unreachable!(),
                },
            ),
        )
        .expect("pending restored");
    assert_eq!(pending.amount, U128::from(5u64));
    assert_eq!(pending.source, ctx.genesis_account());
    assert!(ctx.store.account.get(&txn, &key.public_key()).is_none());
}

#[test]
fn rollback_refuses_cemented_blocks() {
    let ctx = LedgerContext::new();
    let txn = ctx.store.tx_begin_write();
    assert!(ctx.ledger.rollback(&txn, &ctx.genesis_hash()).is_err());
}

#[test]
fn weights_match_account_table() {
    let ctx = LedgerContext::new();
    let key_1 = KeyPair::generate();
    let key_2 = KeyPair::generate();
    ctx.fund(&key_1, U128::from(100u64));
    ctx.fund(&key_2, U128::from(200u64));
    // Every representative's weight equals the sum of delegated balances.
    let txn = ctx.store.tx_begin_read();
    let mut expected: std::collections::HashMap<Account, lattice_types::Amount> =
        std::collections::HashMap::new();
    for (_, info) in ctx.store.account.iter(&txn) {
        let entry = expected
            .entry(info.representative)
            .or_insert_with(U128::zero);
        *entry = entry.saturating_add(info.balance);
    }
    assert_eq!(ctx.ledger.rep_amounts(), expected);
}

#[test]
fn account_heights_are_dense() {
    let ctx = LedgerContext::new();
    let key = KeyPair::generate();
    let (_, open) = ctx.fund(&key, U128::from(10u64));
    let change = ctx.state_block(
        &key,
        key.public_key(),
        open.hash(),
        ctx.genesis_account(),
        U128::from(10u64),
        lattice_types::Link::zero(),
    );
    assert_eq!(process(&ctx, &change), ProcessResult::Progress);
    let txn = ctx.store.tx_begin_read();
    let info = ctx.store.account.get(&txn, &key.public_key()).unwrap();
    assert_eq!(info.block_count, 2);
    // Walk the chain: heights 1..=count all present.
    let mut current = info.head;
    let mut height = info.block_count;
    while !current.is_zero() {
        let stored = ctx.store.block.get(&txn, &current).unwrap();
        assert_eq!(stored.sideband.height, height);
        height -= 1;
        current = stored.block.previous();
    }
    assert_eq!(height, 0);
}

#[test]
fn dependents_confirmed_follows_cementation() {
    let ctx = LedgerContext::new();
    let key = KeyPair::generate();
    let (send, open) = ctx.fund(&key, U128::from(10u64));
    let txn = ctx.store.tx_begin_write();
    // Open depends on the uncemented send.
    assert!(!ctx.ledger.dependents_confirmed(&txn, &open));
    // Send's only dependency is cemented genesis.
    assert!(ctx.ledger.dependents_confirmed(&txn, &send));
    ctx.store.confirmation_height.put(
        &txn,
        &ctx.genesis_account(),
        &lattice_types::ConfirmationHeightInfo::new(2, send.hash()),
    );
    assert!(ctx.ledger.dependents_confirmed(&txn, &open));
}

#[test]
fn unconfirmed_frontiers_reports_backlog() {
    let ctx = LedgerContext::new();
    {
        let txn = ctx.store.tx_begin_read();
        assert!(ctx.ledger.unconfirmed_frontiers(&txn).is_empty());
    }
    let key = KeyPair::generate();
    ctx.fund(&key, U128::from(10u64));
    let txn = ctx.store.tx_begin_read();
    let frontiers = ctx.ledger.unconfirmed_frontiers(&txn);
    assert_eq!(frontiers.len(), 2);
    // Genesis has one uncemented block, the new account one as well.
    assert!(frontiers.iter().all(|info| info.height_delta == 1));
}

#[test]
fn pruning_compacts_cemented_history() {
    let ctx = LedgerContext::new();
    let key = KeyPair::generate();
    let (send, _) = ctx.fund(&key, U128::from(10u64));
    let txn = ctx.store.tx_begin_write();
    // Cement genesis + send, then prune the send.
    ctx.store.confirmation_height.put(
        &txn,
        &ctx.genesis_account(),
        &lattice_types::ConfirmationHeightInfo::new(2, send.hash()),
    );
    let pruned = ctx.ledger.pruning_action(&txn, &send.hash(), 64);
    assert_eq!(pruned, 1);
    assert!(!ctx.store.block.exists(&txn, &send.hash()));
    assert!(ctx.store.pruned.exists(&txn, &send.hash()));
    assert!(ctx.ledger.block_or_pruned_exists(&txn, &send.hash()));
    assert!(ctx.ledger.block_confirmed(&txn, &send.hash()));
}
