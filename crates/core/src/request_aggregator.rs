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

//! Pooling of confirmation requests.
//!
//! Requests are pooled per endpoint and answered as one batch when the
//! pool's deadline lapses: duplicates collapse, hashes with a cached local
//! vote are answered from the history, and the rest are split between the
//! normal and final vote generators.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::trace;
use parking_lot::{Condvar, Mutex};

use lattice_network::{BufferDropPolicy, Channel, Message};
use lattice_types::{Block, BlockHash, Root, Vote};

use crate::ledger::Ledger;
use crate::stats::{DetailType, StatType, Stats};
use crate::voting::{LocalVoteHistory, VoteGenerator};

/// Hard ceiling on queued pairs per endpoint.
const MAX_CHANNEL_REQUESTS: usize = 4096;

struct ChannelPool {
    channel: Arc<dyn Channel>,
    hashes_roots: Vec<(BlockHash, Root)>,
    deadline: Instant,
}

struct State {
    pools: HashMap<SocketAddr, ChannelPool>,
    stopped: bool,
}

pub struct RequestAggregator {
    ledger: Arc<Ledger>,
    history: Arc<LocalVoteHistory>,
    generator: Arc<VoteGenerator>,
    final_generator: Arc<VoteGenerator>,
    stats: Arc<Stats>,
    pub max_delay: Duration,
    pub small_delay: Duration,
    state: Mutex<State>,
    condition: Condvar,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl RequestAggregator {
    pub fn new(
        ledger: Arc<Ledger>,
        history: Arc<LocalVoteHistory>,
        generator: Arc<VoteGenerator>,
        final_generator: Arc<VoteGenerator>,
        stats: Arc<Stats>,
        is_dev_network: bool,
    ) -> Arc<Self> {
        let aggregator = Arc::new(RequestAggregator {
            ledger,
            history,
            generator: generator.clone(),
            final_generator: final_generator.clone(),
            stats,
            max_delay: if is_dev_network {
                Duration::from_millis(50)
            } else {
                Duration::from_millis(90)
            },
            small_delay: if is_dev_network {
                Duration::from_millis(10)
            } else {
                Duration::from_millis(20)
            },
            state: Mutex::new(State {
                pools: HashMap::new(),
                stopped: false,
            }),
            condition: Condvar::new(),
            thread: Mutex::new(None),
        });
        // Replies generated on demand route back through the aggregator's
        // reply action.
        let reply = Arc::new(
            move |vote: Arc<Vote>, channel: Arc<dyn Channel>| {
                let message = Message::ConfirmAck { vote };
                channel.send(&message, BufferDropPolicy::Limiter);
            },
        );
        generator.set_reply_action(reply.clone());
        final_generator.set_reply_action(reply);
        let run = aggregator.clone();
        let handle = std::thread::Builder::new()
            .name("aggregator".to_string())
            .spawn(move || run.run())
            .expect("aggregator thread spawn");
        *aggregator.thread.lock() = Some(handle);
        aggregator
    }

    /// Pool a request from `channel` for the given (hash, root) pairs.
    pub fn add(&self, channel: Arc<dyn Channel>, hashes_roots: &[(BlockHash, Root)]) {
        let endpoint = channel.endpoint();
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            let small_delay = self.small_delay;
            let pool = state.pools.entry(endpoint).or_insert_with(|| ChannelPool {
                channel: channel.clone(),
                hashes_roots: Vec::new(),
                deadline: Instant::now() + small_delay,
            });
            // The newest channel for the endpoint wins.
            pool.channel = channel;
            if pool.hashes_roots.len() + hashes_roots.len() <= MAX_CHANNEL_REQUESTS {
                pool.hashes_roots.extend_from_slice(hashes_roots);
                self.stats
                    .inc(StatType::Aggregator, DetailType::AggregatorAccepted);
            } else {
                self.stats
                    .inc(StatType::Aggregator, DetailType::AggregatorDropped);
            }
        }
        self.condition.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn run(&self) {
        let mut state = self.state.lock();
        while !state.stopped {
            let now = Instant::now();
            let expired: Vec<SocketAddr> = state
                .pools
                .iter()
                .filter(|(_, pool)| pool.deadline <= now)
                .map(|(endpoint, _)| *endpoint)
                .collect();
            if expired.is_empty() {
                let timeout = state
                    .pools
                    .values()
                    .map(|pool| pool.deadline)
                    .min()
                    .map(|deadline| deadline.saturating_duration_since(now))
                    .unwrap_or(self.max_delay);
                self.condition.notify_all();
                self.condition.wait_for(&mut state, timeout);
                continue;
            }
            for endpoint in expired {
                if let Some(pool) = state.pools.remove(&endpoint) {
                    drop(state);
                    self.aggregate(pool);
                    state = self.state.lock();
                }
            }
        }
    }

    // Answer one pool: cached votes immediately, the rest to the
    // generators.
    fn aggregate(&self, pool: ChannelPool) {
        let txn = self.ledger.store.tx_begin_read();
        let mut requests = pool.hashes_roots;
        requests.sort();
        requests.dedup();
        let mut cached_votes: Vec<Arc<Vote>> = Vec::new();
        let mut to_generate: Vec<Arc<Block>> = Vec::new();
        let mut to_generate_final: Vec<Arc<Block>> = Vec::new();
        for (hash, root) in &requests {
            let cached = self.history.votes(root, hash, false);
            if !cached.is_empty() {
                self.stats
                    .inc(StatType::Aggregator, DetailType::AggregatorCachedHashes);
                for vote in cached {
                    if !cached_votes
                        .iter()
                        .any(|existing| existing.full_hash() == vote.full_hash())
                    {
                        cached_votes.push(vote);
                    }
                }
                continue;
            }
            match self.ledger.store.block.get(&txn, hash) {
                Some(stored) => {
                    // A prior final vote marks the root final for everyone.
                    let finals = self
                        .ledger
                        .store
                        .final_vote
                        .get(&txn, &stored.block.root());
                    if finals.iter().any(|final_hash| final_hash == hash) {
                        self.stats
                            .inc(StatType::Aggregator, DetailType::RequestsFinal);
                        to_generate_final.push(stored.block);
                    } else {
                        self.stats
                            .inc(StatType::Aggregator, DetailType::RequestsGenerated);
                        to_generate.push(stored.block);
                    }
                }
                None => {
                    self.stats
                        .inc(StatType::Aggregator, DetailType::RequestsUnknown);
                    trace!(target: "aggregator", "no block for requested hash {:?}", hash);
                }
            }
        }
        drop(txn);
        for vote in cached_votes {
            self.stats
                .inc(StatType::Aggregator, DetailType::AggregatorCachedVotes);
            let message = Message::ConfirmAck { vote };
            pool.channel.send(&message, BufferDropPolicy::Limiter);
        }
        if !to_generate.is_empty() {
            self.generator.generate(&to_generate, pool.channel.clone());
        }
        if !to_generate_final.is_empty() {
            self.final_generator
                .generate(&to_generate_final, pool.channel.clone());
        }
    }

    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        self.condition.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RequestAggregator {
    fn drop(&mut self) {
        self.stop();
    }
}
