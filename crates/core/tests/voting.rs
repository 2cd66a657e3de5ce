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

//! Vote generation and request aggregation scenarios.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ethereum_types::U128;
use parking_lot::Mutex;

use lattice_core::{Node, NodeConfig, NodeFlags, ProcessResult, Writer};
use lattice_network::{LoopbackChannel, Message};
use lattice_types::{
    work_value, Block, BlockHash, ConfirmationHeightInfo, KeyPair, NetworkParams, Networks,
    StateBlock, Vote,
};

fn work_for(params: &NetworkParams, root: &lattice_types::Root) -> u64 {
    let mut nonce = 0u64;
    while work_value(root, nonce) < params.work.base {
        nonce += 1;
    }
    nonce
}

fn state_block(
    params: &NetworkParams,
    key: &KeyPair,
    account: lattice_types::Account,
    previous: BlockHash,
    representative: lattice_types::Account,
    balance: U128,
    link: lattice_types::Link,
) -> Arc<Block> {
    let root = if previous.is_zero() { account } else { previous };
    Arc::new(Block::State(StateBlock::new(
        account,
        previous,
        representative,
        balance,
        link,
        key.secret_key(),
        &key.public_key(),
        work_for(params, &root),
    )))
}

fn quiet_node() -> (Arc<Node>, NetworkParams) {
    let _ = env_logger::builder().is_test(true).try_init();
    let params = NetworkParams::new(Networks::DevNetwork);
    let mut config = NodeConfig::dev_default();
    config.add_representative(&params.ledger.genesis_key);
    let flags = NodeFlags {
        disable_request_loop: true,
        disable_ongoing_tasks: true,
        disable_tcp_realtime: true,
        ..Default::default()
    };
    let node = Node::new(params.clone(), config, flags);
    (node, params)
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

// Spacing: a second vote for the same root is held back for the delay.
#[test]
fn vote_spacing_defers_the_second_hash() {
    let (node, params) = quiet_node();
    let genesis = params.ledger.genesis_account;
    let root = params.ledger.genesis.hash();
    let key_1 = KeyPair::generate();
    let key_2 = KeyPair::generate();
    let send_a = state_block(
        &params,
        &params.ledger.genesis_key,
        genesis,
        root,
        genesis,
        params.ledger.genesis_amount - U128::one(),
        key_1.public_key(),
    );
    let send_b = state_block(
        &params,
        &params.ledger.genesis_key,
        genesis,
        root,
        genesis,
        params.ledger.genesis_amount - U128::from(2u64),
        key_2.public_key(),
    );
    let votes: Arc<Mutex<Vec<(Instant, Vec<BlockHash>)>>> = Arc::new(Mutex::new(Vec::new()));
    let votes_clone = votes.clone();
    node.generator
        .set_broadcast_action(Arc::new(move |vote: Arc<Vote>| {
            votes_clone.lock().push((Instant::now(), vote.hashes.clone()));
        }));

    assert_eq!(node.process_local(send_a.clone()), ProcessResult::Progress);
    let started = Instant::now();
    node.generator.add(root, send_a.hash());
    // Swap the chain head to the fork and ask again immediately.
    {
        let guard = node.write_queue.wait(Writer::Testing);
        let txn = node.store.tx_begin_write();
        node.ledger.rollback(&txn, &send_a.hash()).unwrap();
        drop(txn);
        guard.release();
    }
    assert_eq!(node.process_local(send_b.clone()), ProcessResult::Progress);
    node.generator.add(root, send_b.hash());

    wait_until("both votes", || votes.lock().len() >= 2);
    let votes = votes.lock();
    assert_eq!(votes[0].1, vec![send_a.hash()]);
    assert_eq!(votes[1].1, vec![send_b.hash()]);
    // The second vote respected the spacing window.
    assert!(votes[1].0.duration_since(started) >= params.voting.delay - Duration::from_millis(20));
    node.stop();
}

// Aggregation: duplicate requests collapse, cached votes answer instantly,
// the rest goes through vote generation.
#[test]
fn request_aggregator_deduplicates_and_reuses_cached_votes() {
    let (node, params) = quiet_node();
    let genesis = params.ledger.genesis_account;
    let key = KeyPair::generate();
    let send = state_block(
        &params,
        &params.ledger.genesis_key,
        genesis,
        params.ledger.genesis.hash(),
        genesis,
        params.ledger.genesis_amount - U128::from(10u64),
        key.public_key(),
    );
    let open = state_block(
        &params,
        &key,
        key.public_key(),
        BlockHash::zero(),
        key.public_key(),
        U128::from(10u64),
        send.hash(),
    );
    assert_eq!(node.process_local(send.clone()), ProcessResult::Progress);
    assert_eq!(node.process_local(open.clone()), ProcessResult::Progress);
    // Cement both chains so votes may be generated.
    {
        let guard = node.write_queue.wait(Writer::Testing);
        let txn = node.store.tx_begin_write();
        node.store.confirmation_height.put(
            &txn,
            &genesis,
            &ConfirmationHeightInfo::new(2, send.hash()),
        );
        node.store.confirmation_height.put(
            &txn,
            &key.public_key(),
            &ConfirmationHeightInfo::new(1, open.hash()),
        );
        drop(txn);
        guard.release();
    }
    // A cached local vote exists for the send only.
    let cached = Arc::new(Vote::new(
        params.ledger.genesis_key.secret_key(),
        genesis,
        1,
        vec![send.hash()],
    ));
    node.history
        .add(params.ledger.genesis.hash(), send.hash(), &cached);

    let channel = Arc::new(LoopbackChannel::new("127.0.0.1:9999".parse().unwrap()));
    let requests = vec![
        (send.hash(), send.root()),
        (send.hash(), send.root()),
        (open.hash(), open.root()),
    ];
    node.aggregator.add(channel.clone(), &requests);
    wait_until("aggregated replies", || {
        let acks: Vec<Vec<BlockHash>> = channel
            .sent()
            .iter()
            .filter_map(|message| match message {
                Message::ConfirmAck { vote } => Some(vote.hashes.clone()),
                _ => None,
            })
            .collect();
        let cached_sent = acks.iter().filter(|hashes| hashes.contains(&send.hash())).count();
        let generated_sent = acks.iter().any(|hashes| hashes.contains(&open.hash()));
        cached_sent >= 1 && generated_sent
    });
    // The duplicate (send, root) pair produced exactly one cached reply.
    let acks: Vec<Vec<BlockHash>> = channel
        .sent()
        .iter()
        .filter_map(|message| match message {
            Message::ConfirmAck { vote } => Some(vote.hashes.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        acks.iter()
            .filter(|hashes| hashes.as_slice() == [send.hash()])
            .count(),
        1
    );
    node.stop();
}

// Election vote ordering: timestamps must strictly increase per
// representative, with the final bit as the only upgrade path.
#[test]
fn election_votes_are_ordered_by_timestamp() {
    let (node, params) = quiet_node();
    let key = KeyPair::generate();
    let send = state_block(
        &params,
        &params.ledger.genesis_key,
        params.ledger.genesis_account,
        params.ledger.genesis.hash(),
        params.ledger.genesis_account,
        params.ledger.genesis_amount - U128::one(),
        key.public_key(),
    );
    assert_eq!(node.process_local(send.clone()), ProcessResult::Progress);
    let (inserted, election) = node.active.insert(&send);
    assert!(inserted);
    let election = election.unwrap();
    let rep = KeyPair::generate().public_key();
    let hash = send.hash();
    assert!(election.vote(rep, 2, hash).processed);
    // Equal and older timestamps replay.
    assert!(election.vote(rep, 2, hash).replay);
    assert!(election.vote(rep, 1, hash).replay);
    // Newer timestamps process.
    assert!(election.vote(rep, 3, hash).processed);
    // A final vote upgrades the same hash at the same timestamp.
    assert!(election.vote(rep, 3 | lattice_types::vote::FINAL_FLAG, hash).processed);
    // But never downgrades back.
    assert!(election.vote(rep, 3, hash).replay);
    node.stop();
}

// Final votes are irrevocable: a recorded commitment for a different hash
// at the same root silences the final generator.
#[test]
fn final_votes_stick_to_one_hash_per_root() {
    let (node, params) = quiet_node();
    let genesis = params.ledger.genesis_account;
    let root = params.ledger.genesis.hash();
    let key = KeyPair::generate();
    let send = state_block(
        &params,
        &params.ledger.genesis_key,
        genesis,
        root,
        genesis,
        params.ledger.genesis_amount - U128::one(),
        key.public_key(),
    );
    let votes: Arc<Mutex<Vec<Vec<BlockHash>>>> = Arc::new(Mutex::new(Vec::new()));
    let votes_clone = votes.clone();
    node.final_generator
        .set_broadcast_action(Arc::new(move |vote: Arc<Vote>| {
            assert!(vote.is_final());
            votes_clone.lock().push(vote.hashes.clone());
        }));
    assert_eq!(node.process_local(send.clone()), ProcessResult::Progress);
    // A conflicting commitment already exists at this root.
    let conflicting = BlockHash::repeat_byte(0xee);
    {
        let guard = node.write_queue.wait(Writer::Testing);
        let txn = node.store.tx_begin_write();
        assert!(node
            .store
            .final_vote
            .put(&txn, &send.qualified_root(), &conflicting));
        drop(txn);
        guard.release();
    }
    node.final_generator.add(root, send.hash());
    std::thread::sleep(params.voting.delay * 3);
    assert!(votes.lock().is_empty());
    // Clearing the commitment releases the vote.
    {
        let guard = node.write_queue.wait(Writer::Testing);
        let txn = node.store.tx_begin_write();
        node.store.final_vote.del(&txn, &root);
        drop(txn);
        guard.release();
    }
    node.final_generator.add(root, send.hash());
    wait_until("final vote", || !votes.lock().is_empty());
    assert_eq!(votes.lock().as_slice(), &[vec![send.hash()]]);
    let txn = node.store.tx_begin_read();
    assert_eq!(node.store.final_vote.get(&txn, &root), vec![send.hash()]);
    drop(txn);
    node.stop();
}
