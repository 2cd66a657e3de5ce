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

//! Per-network constant tables.
//!
//! Everything here is plain data passed through construction; no component
//! reads network parameters from process-wide state. Genesis blocks are
//! derived from the network's genesis key at first use so the chain data is
//! internally consistent for every network flavor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ethereum_types::{H256, U128};
use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::blocks::{Block, OpenBlock};
use crate::epoch::{Epoch, Epochs};
use crate::numbers::{deterministic_key, Account, Amount, KeyPair, RawKey};
use crate::work::{work_value, WorkThresholds};

/// Which chain this node participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Networks {
    DevNetwork,
    BetaNetwork,
    LiveNetwork,
}

impl Networks {
    /// Wire magic, first header byte is shared, second selects the network.
    pub fn id(self) -> u16 {
        let tag = match self {
            Networks::DevNetwork => b'X',
            Networks::BetaNetwork => b'B',
            Networks::LiveNetwork => b'C',
        };
        u16::from_be_bytes([b'L', tag])
    }
}

/// Timings and protocol identity.
#[derive(Debug, Clone)]
pub struct NetworkConstants {
    pub current_network: Networks,
    pub protocol_version: u8,
    pub protocol_version_min: u8,
    pub default_node_port: u16,
    /// Cadence of the election request loop.
    pub request_interval: Duration,
    /// Minimum time between directed confirmation requests per election.
    pub confirmation_request_delay: Duration,
    /// Elections use multiples of this for state transitions.
    pub base_latency: Duration,
    pub cleanup_period: Duration,
    pub keepalive_period: Duration,
    pub syn_cookie_cutoff: Duration,
    /// Channels idle beyond this are purged.
    pub idle_cutoff: Duration,
}

impl NetworkConstants {
    pub fn new(network: Networks) -> Self {
        let is_dev = network == Networks::DevNetwork;
        let cleanup_period = if is_dev {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(60)
        };
        NetworkConstants {
            current_network: network,
            protocol_version: 0x12,
            protocol_version_min: 0x12,
            default_node_port: match network {
                Networks::DevNetwork => 44000,
                Networks::BetaNetwork => 54000,
                Networks::LiveNetwork => 7075,
            },
            request_interval: if is_dev {
                Duration::from_millis(20)
            } else {
                Duration::from_millis(500)
            },
            confirmation_request_delay: if is_dev {
                Duration::from_millis(50)
            } else {
                Duration::from_millis(1500)
            },
            base_latency: if is_dev {
                Duration::from_millis(25)
            } else {
                Duration::from_millis(1000)
            },
            cleanup_period,
            keepalive_period: cleanup_period / 2,
            syn_cookie_cutoff: Duration::from_secs(5),
            idle_cutoff: cleanup_period * 5,
        }
    }

    pub fn is_dev_network(&self) -> bool {
        self.current_network == Networks::DevNetwork
    }

    pub fn id(&self) -> u16 {
        self.current_network.id()
    }
}

/// Genesis, epochs and monetary constants.
#[derive(Clone)]
pub struct LedgerConstants {
    pub work: WorkThresholds,
    pub zero_key: KeyPair,
    pub genesis_key: KeyPair,
    pub genesis_account: Account,
    pub genesis: Arc<Block>,
    pub genesis_amount: Amount,
    /// Funds sent here are destroyed.
    pub burn_account: Account,
    pub epochs: Epochs,
    /// Final vote generation is enabled once this account reaches the height.
    pub final_votes_canary_account: Account,
    pub final_votes_canary_height: u64,
}

// Well-known development genesis key; balances on the dev network are
// worthless by construction.
const DEV_GENESIS_KEY: &str = "34f0a37aad20f4a260f0a5b3cb3d7fb50673212263e58a380bc10474bb039ce4";

fn ascii_link(tag: &[u8]) -> H256 {
    debug_assert!(tag.len() <= 32);
    let mut bytes = [0u8; 32];
    bytes[..tag.len()].copy_from_slice(tag);
    H256(bytes)
}

// Deterministic nonce search keeps genesis identical across processes.
fn genesis_work(root: &H256, threshold: u64) -> u64 {
    let mut nonce = 0u64;
    while work_value(root, nonce) < threshold {
        nonce += 1;
    }
    nonce
}

lazy_static! {
    // Built once per network per process; the live-network nonce search is
    // not cheap.
    static ref GENESIS_CACHE: Mutex<HashMap<u16, Arc<Block>>> = Mutex::new(HashMap::new());
}

fn genesis_block(network: Networks, work: &WorkThresholds, key: &KeyPair) -> Arc<Block> {
    let mut cache = GENESIS_CACHE.lock();
    if let Some(cached) = cache.get(&network.id()) {
        return cached.clone();
    }
    let account = key.public_key();
    let nonce = genesis_work(&account, work.epoch_1);
    let genesis = Arc::new(Block::Open(OpenBlock::new(
        // Genesis receives from itself.
        account,
        account,
        account,
        key.secret_key(),
        &account,
        nonce,
    )));
    cache.insert(network.id(), genesis.clone());
    genesis
}

impl LedgerConstants {
    pub fn new(work: WorkThresholds, network: Networks) -> Self {
        let genesis_key = match network {
            Networks::DevNetwork => KeyPair::from_hex(DEV_GENESIS_KEY),
            // Network launch rotates these to offline-held keys; derived
            // deterministically until then.
            Networks::BetaNetwork => {
                KeyPair::from_secret(deterministic_key(&RawKey::from_bytes([0xBE; 32]), 0))
            }
            Networks::LiveNetwork => {
                KeyPair::from_secret(deterministic_key(&RawKey::from_bytes([0x1A; 32]), 0))
            }
        };
        let genesis_account = genesis_key.public_key();
        let genesis = genesis_block(network, &work, &genesis_key);
        let mut epochs = Epochs::default();
        epochs.add(
            Epoch::Epoch1,
            genesis_account,
            ascii_link(b"epoch v1 block"),
        );
        epochs.add(
            Epoch::Epoch2,
            genesis_account,
            ascii_link(b"epoch v2 block"),
        );
        LedgerConstants {
            work,
            zero_key: KeyPair::from_secret(RawKey::from_bytes([0u8; 32])),
            genesis_key,
            genesis_account,
            genesis,
            genesis_amount: U128::max_value(),
            burn_account: Account::zero(),
            epochs,
            final_votes_canary_account: genesis_account,
            final_votes_canary_height: 1,
        }
    }
}

/// Voting cadence.
#[derive(Debug, Clone)]
pub struct VotingConstants {
    /// Per-root entries retained by the local vote history.
    pub max_cache: usize,
    /// Minimum spacing between votes for the same root.
    pub delay: Duration,
}

impl VotingConstants {
    pub fn new(network: Networks) -> Self {
        let is_dev = network == Networks::DevNetwork;
        VotingConstants {
            max_cache: if is_dev { 2 } else { 64 * 1024 },
            delay: if is_dev {
                Duration::from_millis(100)
            } else {
                Duration::from_millis(500)
            },
        }
    }
}

/// Node housekeeping cadence.
#[derive(Debug, Clone)]
pub struct NodeConstants {
    pub weight_period: Duration,
    pub max_weight_samples: usize,
    pub weight_sample_interval: Duration,
    pub process_confirmed_interval: Duration,
    pub unchecked_cleaning_interval: Duration,
}

impl NodeConstants {
    pub fn new(network: Networks) -> Self {
        let is_dev = network == Networks::DevNetwork;
        NodeConstants {
            weight_period: Duration::from_secs(5 * 60),
            max_weight_samples: if is_dev { 288 } else { 4032 },
            weight_sample_interval: if is_dev {
                Duration::from_secs(1)
            } else {
                Duration::from_secs(5 * 60)
            },
            process_confirmed_interval: if is_dev {
                Duration::from_millis(50)
            } else {
                Duration::from_millis(500)
            },
            unchecked_cleaning_interval: Duration::from_secs(if is_dev { 1 } else { 30 }),
        }
    }
}

/// The complete constant set handed to every component at construction.
#[derive(Clone)]
pub struct NetworkParams {
    pub network: NetworkConstants,
    pub work: WorkThresholds,
    pub ledger: LedgerConstants,
    pub voting: VotingConstants,
    pub node: NodeConstants,
}

impl NetworkParams {
    pub fn new(network: Networks) -> Self {
        let work = match network {
            Networks::DevNetwork => WorkThresholds::publish_dev(),
            Networks::BetaNetwork => WorkThresholds::publish_beta(),
            Networks::LiveNetwork => WorkThresholds::publish_full(),
        };
        NetworkParams {
            network: NetworkConstants::new(network),
            work,
            ledger: LedgerConstants::new(work, network),
            voting: VotingConstants::new(network),
            node: NodeConstants::new(network),
        }
    }

    pub fn dev() -> Self {
        Self::new(Networks::DevNetwork)
    }
}
