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

//! Node configuration.

use std::time::Duration;

use ethereum_types::U128;
use serde_derive::{Deserialize, Serialize};

use lattice_types::{Amount, KeyPair, RawKey};

/// Tunable node parameters. Everything an operator may want to change lives
/// here; protocol constants stay in `NetworkParams`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub peering_port: u16,
    /// Outbound bytes per second; zero disables the limiter.
    pub bandwidth_limit: usize,
    /// Concurrent elections before the scheduler stalls.
    pub active_elections_size: usize,
    /// Directed confirmation requests an election may issue before expiring
    /// unconfirmed.
    pub confirmation_request_cap: u32,
    /// Global cap on winner re-broadcasts per solicitation round.
    pub max_block_broadcasts: usize,
    /// Per-election cap on directed requests per round.
    pub max_election_requests: usize,
    /// Per-election cap on random floods per round; zero means √(peers).
    pub max_election_broadcasts: usize,
    /// Milliseconds the vote generator waits to fill a batch.
    pub vote_generator_delay_ms: u64,
    /// Candidates that trigger an immediate batch.
    pub vote_generator_threshold: usize,
    /// Representatives below this weight are never voted for locally.
    pub vote_minimum: Amount,
    /// Floor for the online weight used in quorum math.
    pub online_weight_minimum: Amount,
    pub signature_checker_threads: usize,
    /// Upper bound on blocks admitted under one write transaction.
    pub block_processor_batch_size: usize,
    pub block_processor_batch_max_time_ms: u64,
    pub vote_processor_capacity: usize,
    /// Hex private keys this node votes with.
    pub representatives: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            peering_port: 0,
            bandwidth_limit: 10 * 1024 * 1024,
            active_elections_size: 5000,
            confirmation_request_cap: 100,
            max_block_broadcasts: 30,
            max_election_requests: 50,
            max_election_broadcasts: 0,
            vote_generator_delay_ms: 100,
            vote_generator_threshold: 3,
            vote_minimum: U128::from(1_000_000_000_000u64),
            online_weight_minimum: U128::from(1_000_000_000_000u64),
            signature_checker_threads: 1,
            block_processor_batch_size: 250,
            block_processor_batch_max_time_ms: 500,
            vote_processor_capacity: 144 * 1024,
            representatives: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Development preset: small containers, no bandwidth cap, instant
    /// housekeeping. The online weight floor stays high so zero-weight
    /// voters can never reach quorum by themselves.
    pub fn dev_default() -> Self {
        NodeConfig {
            bandwidth_limit: 0,
            active_elections_size: 128,
            vote_minimum: U128::zero(),
            online_weight_minimum: U128::max_value() / U128::from(8u64),
            block_processor_batch_max_time_ms: 100,
            ..Default::default()
        }
    }

    pub fn vote_generator_delay(&self) -> Duration {
        Duration::from_millis(self.vote_generator_delay_ms)
    }

    pub fn block_processor_batch_max_time(&self) -> Duration {
        Duration::from_millis(self.block_processor_batch_max_time_ms)
    }

    /// Decode the configured voting keys; malformed entries are skipped.
    pub fn representative_keys(&self) -> Vec<KeyPair> {
        self.representatives
            .iter()
            .filter_map(|hex| RawKey::decode_hex(hex).map(KeyPair::from_secret))
            .collect()
    }

    pub fn add_representative(&mut self, key: &KeyPair) {
        self.representatives
            .push(hex::encode(key.secret_key().as_bytes()));
    }
}

/// Switches that disable whole subsystems, mostly for tests.
#[derive(Debug, Clone, Default)]
pub struct NodeFlags {
    pub disable_request_loop: bool,
    pub disable_ongoing_tasks: bool,
    pub disable_vote_processor: bool,
    pub disable_block_processor_republishing: bool,
    pub disable_tcp_realtime: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn representative_keys_round_trip() {
        let mut config = NodeConfig::dev_default();
        let key = KeyPair::generate();
        config.add_representative(&key);
        config.representatives.push("zz-not-hex".to_string());
        let keys = config.representative_keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].public_key(), key.public_key());
    }

    #[test]
    fn config_serializes() {
        let config = NodeConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        let restored: NodeConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(restored.active_elections_size, config.active_elections_size);
        assert_eq!(restored.vote_minimum, config.vote_minimum);
    }
}
