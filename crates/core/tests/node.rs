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

//! End-to-end scenarios over whole nodes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ethereum_types::U128;

use lattice_core::{Node, NodeConfig, NodeFlags};
use lattice_types::{
    work_value, Block, BlockHash, KeyPair, NetworkParams, Networks, StateBlock,
};

fn work_for(params: &NetworkParams, root: &lattice_types::Root) -> u64 {
    let mut nonce = 0u64;
    while work_value(root, nonce) < params.work.base {
        nonce += 1;
    }
    nonce
}

fn state_send(
    params: &NetworkParams,
    key: &KeyPair,
    account: lattice_types::Account,
    previous: BlockHash,
    balance: U128,
    link: lattice_types::Link,
) -> Arc<Block> {
    let root = if previous.is_zero() { account } else { previous };
    Arc::new(Block::State(StateBlock::new(
        account,
        previous,
        account,
        balance,
        link,
        key.secret_key(),
        &key.public_key(),
        work_for(params, &root),
    )))
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn dev_node(with_genesis_rep: bool) -> (Arc<Node>, NetworkParams) {
    let _ = env_logger::builder().is_test(true).try_init();
    let params = NetworkParams::new(Networks::DevNetwork);
    let mut config = NodeConfig::dev_default();
    if with_genesis_rep {
        config.add_representative(&params.ledger.genesis_key);
    }
    let node = Node::new(params.clone(), config, NodeFlags::default());
    node.start().unwrap();
    (node, params)
}

// A single representative holding the genesis supply confirms and cements a
// published send on its own.
#[test]
fn quorum_confirms_a_published_send() {
    let (node, params) = dev_node(true);
    let key = KeyPair::generate();
    let send = state_send(
        &params,
        &params.ledger.genesis_key,
        params.ledger.genesis_account,
        params.ledger.genesis.hash(),
        params.ledger.genesis_amount - U128::one(),
        key.public_key(),
    );
    node.process_active(send.clone());
    wait_until("block admission", || {
        let txn = node.store.tx_begin_read();
        node.ledger.block_exists(&txn, &send.hash())
    });
    wait_until("confirmation", || node.block_confirmed(&send.hash()));
    let txn = node.store.tx_begin_read();
    let conf = node
        .store
        .confirmation_height
        .get(&txn, &params.ledger.genesis_account);
    assert_eq!(conf.height, 2);
    assert_eq!(conf.frontier, send.hash());
    drop(txn);
    node.stop();
}

// Without any voting weight nothing confirms.
#[test]
fn no_quorum_without_representatives() {
    let (node, params) = dev_node(false);
    let key = KeyPair::generate();
    let send = state_send(
        &params,
        &params.ledger.genesis_key,
        params.ledger.genesis_account,
        params.ledger.genesis.hash(),
        params.ledger.genesis_amount - U128::one(),
        key.public_key(),
    );
    node.process_active(send.clone());
    wait_until("block admission", || {
        let txn = node.store.tx_begin_read();
        node.ledger.block_exists(&txn, &send.hash())
    });
    std::thread::sleep(Duration::from_millis(500));
    assert!(!node.block_confirmed(&send.hash()));
    node.stop();
}

// A block published to one node spreads to a connected peer.
#[test]
fn published_blocks_propagate_between_nodes() {
    let (alpha, params) = dev_node(true);
    let (beta, _) = dev_node(false);
    beta.network.connect(alpha.network.endpoint());
    wait_until("handshake", || {
        alpha.network.channels.len() == 1 && beta.network.channels.len() == 1
    });
    let key = KeyPair::generate();
    let send = state_send(
        &params,
        &params.ledger.genesis_key,
        params.ledger.genesis_account,
        params.ledger.genesis.hash(),
        params.ledger.genesis_amount - U128::from(7u64),
        key.public_key(),
    );
    alpha.process_active(send.clone());
    wait_until("propagation", || {
        let txn = beta.store.tx_begin_read();
        beta.ledger.block_exists(&txn, &send.hash())
    });
    // The voting node's confirm_acks reach the peer as well.
    wait_until("remote confirmation", || beta.block_confirmed(&send.hash()));
    beta.stop();
    alpha.stop();
}

// A fork loses to the first-seen block under a lone full-weight rep.
#[test]
fn fork_resolution_keeps_the_first_block() {
    let (node, params) = dev_node(true);
    let key_1 = KeyPair::generate();
    let key_2 = KeyPair::generate();
    let send_a = state_send(
        &params,
        &params.ledger.genesis_key,
        params.ledger.genesis_account,
        params.ledger.genesis.hash(),
        params.ledger.genesis_amount - U128::one(),
        key_1.public_key(),
    );
    let send_b = state_send(
        &params,
        &params.ledger.genesis_key,
        params.ledger.genesis_account,
        params.ledger.genesis.hash(),
        params.ledger.genesis_amount - U128::from(2u64),
        key_2.public_key(),
    );
    node.process_active(send_a.clone());
    wait_until("block admission", || {
        let txn = node.store.tx_begin_read();
        node.ledger.block_exists(&txn, &send_a.hash())
    });
    node.process_active(send_b.clone());
    wait_until("confirmation", || node.block_confirmed(&send_a.hash()));
    let txn = node.store.tx_begin_read();
    assert!(!node.ledger.block_exists(&txn, &send_b.hash()));
    drop(txn);
    node.stop();
}

// Telemetry requests are answered with a signed snapshot.
#[test]
fn telemetry_is_signed_and_answered() {
    let (node, _) = dev_node(false);
    let data = node.telemetry.local_telemetry_data();
    assert!(data.validate_signature());
    assert_eq!(data.block_count, 1);
    assert_eq!(data.cemented_count, 1);
    assert_eq!(data.genesis_block, node.params.ledger.genesis.hash());
    node.stop();
}
