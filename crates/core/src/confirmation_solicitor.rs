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

//! Bundling of confirmation requests.
//!
//! One solicitor instance lives for one request-loop round. Elections that
//! still need votes add their winner; requests to each representative
//! channel are packed seven (hash, root) pairs to a message. A
//! representative voting for a different hash bypasses the per-election
//! request cap, since its view must be corrected regardless of budget.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use lattice_network::{
    BufferDropPolicy, Channel, Message, Network, CONFIRM_REQ_HASHES_MAX,
};
use lattice_types::{Account, Block, BlockHash, Root};

use crate::config::NodeConfig;
use crate::election::VoteInfo;
use crate::rep_crawler::Representative;

pub struct ConfirmationSolicitor<'a> {
    network: &'a Network,
    /// Global maximum amount of block broadcasts per round.
    max_block_broadcasts: usize,
    /// Maximum amount of requests to be sent per election.
    max_election_requests: usize,
    /// Maximum amount of directed broadcasts per election.
    max_election_broadcasts: usize,
    representatives_requests: Vec<Representative>,
    representatives_broadcasts: Vec<Representative>,
    requests: HashMap<SocketAddr, (Arc<dyn Channel>, Vec<(BlockHash, Root)>)>,
    rebroadcasted: usize,
    prepared: bool,
}

impl<'a> ConfirmationSolicitor<'a> {
    pub fn new(network: &'a Network, config: &NodeConfig) -> Self {
        let max_election_broadcasts = if config.max_election_broadcasts > 0 {
            config.max_election_broadcasts
        } else {
            network.channels.fanout(1.0).max(1)
        };
        ConfirmationSolicitor {
            network,
            max_block_broadcasts: config.max_block_broadcasts,
            max_election_requests: config.max_election_requests,
            max_election_broadcasts,
            representatives_requests: Vec::new(),
            representatives_broadcasts: Vec::new(),
            requests: HashMap::new(),
            rebroadcasted: 0,
            prepared: false,
        }
    }

    /// Prepare for a round of batching with the current representative set.
    pub fn prepare(&mut self, representatives: &[Representative]) {
        debug_assert!(!self.prepared);
        self.requests.clear();
        self.rebroadcasted = 0;
        self.representatives_requests = representatives.to_vec();
        self.representatives_broadcasts = representatives
            .iter()
            .take(self.max_election_broadcasts)
            .cloned()
            .collect();
        self.prepared = true;
    }

    /// Re-broadcast an election winner, to representatives that have not
    /// voted for it plus a random flood. Errs when the global budget is
    /// spent.
    pub fn broadcast(
        &mut self,
        winner: &Arc<Block>,
        votes: &HashMap<Account, VoteInfo>,
    ) -> Result<(), ()> {
        debug_assert!(self.prepared);
        if self.rebroadcasted >= self.max_block_broadcasts {
            return Err(());
        }
        self.rebroadcasted += 1;
        let winner_hash = winner.hash();
        let publish = Message::Publish {
            block: winner.clone(),
            digest: 0,
        };
        for representative in &self.representatives_broadcasts {
            let missing_or_different = votes
                .get(&representative.account)
                .map(|vote| vote.hash != winner_hash)
                .unwrap_or(true);
            if missing_or_different {
                representative
                    .channel
                    .send(&publish, BufferDropPolicy::Limiter);
            }
        }
        self.network.flood_block(winner, BufferDropPolicy::Limiter);
        Ok(())
    }

    /// Queue directed confirmation requests for an election winner. Errs
    /// when no request could be queued.
    pub fn add(
        &mut self,
        winner_hash: BlockHash,
        root: Root,
        votes: &HashMap<Account, VoteInfo>,
    ) -> Result<(), ()> {
        debug_assert!(self.prepared);
        let mut count = 0usize;
        let mut added = false;
        for representative in &self.representatives_requests {
            match votes.get(&representative.account) {
                Some(vote) if vote.hash == winner_hash => continue,
                existing => {
                    // A rep on a different hash is always corrected,
                    // outside the cap.
                    let different = existing.is_some();
                    if !different {
                        if count >= self.max_election_requests {
                            continue;
                        }
                        count += 1;
                    }
                    let (channel, batch) = self
                        .requests
                        .entry(representative.channel.endpoint())
                        .or_insert_with(|| (representative.channel.clone(), Vec::new()));
                    batch.push((winner_hash, root));
                    added = true;
                    if batch.len() >= CONFIRM_REQ_HASHES_MAX {
                        let message = Message::ConfirmReq {
                            block: None,
                            roots_hashes: std::mem::take(batch),
                        };
                        channel.send(&message, BufferDropPolicy::Limiter);
                    }
                }
            }
        }
        if added {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Dispatch the residual batches of the round.
    pub fn flush(&mut self) {
        debug_assert!(self.prepared);
        for (_, (channel, batch)) in self.requests.drain() {
            if !batch.is_empty() {
                let message = Message::ConfirmReq {
                    block: None,
                    roots_hashes: batch,
                };
                channel.send(&message, BufferDropPolicy::Limiter);
            }
        }
        self.prepared = false;
    }
}
