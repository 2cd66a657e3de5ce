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

//! Node assembly.
//!
//! Construction wires the observer graph: admitted blocks activate the
//! election scheduler, confirmed winners enter the cementation pipeline,
//! cemented blocks finish their elections and activate successors, and
//! inbound network messages fan out to the processing queues. Shutdown stops
//! components in reverse start order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::info;
use parking_lot::Mutex;

use lattice_db::{Store, Transaction};
use lattice_network::{BufferDropPolicy, Channel, Message, Network};
use lattice_types::{
    Block, BlockHash, BlockUniquer, NetworkParams, Vote, VoteUniquer,
};

use crate::active_elections::ActiveElections;
use crate::block_processor::BlockProcessor;
use crate::config::{NodeConfig, NodeFlags};
use crate::confirmation_height::{ConfirmationHeightMode, ConfirmationHeightProcessor};
use crate::election_scheduler::ElectionScheduler;
use crate::gap_cache::GapCache;
use crate::ledger::{Ledger, ProcessResult};
use crate::online_reps::OnlineReps;
use crate::rep_crawler::RepCrawler;
use crate::request_aggregator::RequestAggregator;
use crate::signature_checker::SignatureChecker;
use crate::stats::{DetailType, StatType, Stats};
use crate::telemetry::Telemetry;
use crate::unchecked_map::UncheckedMap;
use crate::vote_processor::VoteProcessor;
use crate::voting::{LocalVoteHistory, VoteGenerator};
use crate::write_queue::WriteQueue;

/// Staged blocks older than this are discarded by housekeeping.
const UNCHECKED_CUTOFF_SECONDS: u64 = 3600;

pub struct Node {
    pub params: NetworkParams,
    pub config: NodeConfig,
    pub flags: NodeFlags,
    pub stats: Arc<Stats>,
    pub store: Arc<Store>,
    pub ledger: Arc<Ledger>,
    pub network: Arc<Network>,
    pub write_queue: Arc<WriteQueue>,
    pub unchecked: Arc<UncheckedMap>,
    pub checker: Arc<SignatureChecker>,
    pub history: Arc<LocalVoteHistory>,
    pub generator: Arc<VoteGenerator>,
    pub final_generator: Arc<VoteGenerator>,
    pub online_reps: Arc<OnlineReps>,
    pub rep_crawler: Arc<RepCrawler>,
    pub active: Arc<ActiveElections>,
    pub scheduler: Arc<ElectionScheduler>,
    pub block_processor: Arc<BlockProcessor>,
    pub vote_processor: Arc<VoteProcessor>,
    pub confirmation_height_processor: Arc<ConfirmationHeightProcessor>,
    pub aggregator: Arc<RequestAggregator>,
    pub gap_cache: Arc<GapCache>,
    pub telemetry: Arc<Telemetry>,
    pub vote_uniquer: Arc<VoteUniquer>,
    pub block_uniquer: Arc<BlockUniquer>,
    stopped: AtomicBool,
    ongoing_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Node {
    pub fn new(params: NetworkParams, config: NodeConfig, flags: NodeFlags) -> Arc<Self> {
        let stats = Arc::new(Stats::default());
        let store = Arc::new(Store::open_memory());
        let ledger = Arc::new(Ledger::new(
            store.clone(),
            params.ledger.clone(),
            stats.clone(),
        ));
        let write_queue = Arc::new(WriteQueue::default());
        let network = Network::new(&params, config.peering_port, config.bandwidth_limit);
        let unchecked = UncheckedMap::new(store.clone());
        let checker = Arc::new(SignatureChecker::new(config.signature_checker_threads));
        let history = Arc::new(LocalVoteHistory::new(params.voting.max_cache));
        let generator = VoteGenerator::new(
            ledger.clone(),
            history.clone(),
            write_queue.clone(),
            stats.clone(),
            config.clone(),
            params.clone(),
            false,
        );
        let final_generator = VoteGenerator::new(
            ledger.clone(),
            history.clone(),
            write_queue.clone(),
            stats.clone(),
            config.clone(),
            params.clone(),
            true,
        );
        let online_reps = Arc::new(OnlineReps::new(
            ledger.clone(),
            params.clone(),
            config.online_weight_minimum,
        ));
        let rep_crawler = Arc::new(RepCrawler::new(ledger.clone(), online_reps.clone()));
        let active = ActiveElections::new(
            config.clone(),
            params.clone(),
            flags.clone(),
            ledger.clone(),
            online_reps.clone(),
            write_queue.clone(),
            generator.clone(),
            final_generator.clone(),
            rep_crawler.clone(),
            network.clone(),
            stats.clone(),
        );
        let scheduler = ElectionScheduler::new(ledger.clone(), active.clone());
        let block_processor = BlockProcessor::new(
            ledger.clone(),
            write_queue.clone(),
            unchecked.clone(),
            checker.clone(),
            config.clone(),
            stats.clone(),
        );
        let vote_uniquer = Arc::new(VoteUniquer::default());
        let block_uniquer = Arc::new(BlockUniquer::default());
        let vote_processor = VoteProcessor::new(
            active.clone(),
            ledger.clone(),
            online_reps.clone(),
            rep_crawler.clone(),
            checker.clone(),
            vote_uniquer.clone(),
            stats.clone(),
            config.clone(),
        );
        let confirmation_height_processor = ConfirmationHeightProcessor::new(
            ledger.clone(),
            write_queue.clone(),
            stats.clone(),
            ConfirmationHeightMode::Automatic,
        );
        let aggregator = RequestAggregator::new(
            ledger.clone(),
            history.clone(),
            generator.clone(),
            final_generator.clone(),
            stats.clone(),
            params.network.is_dev_network(),
        );
        let gap_cache = Arc::new(GapCache::new(ledger.clone(), online_reps.clone()));
        let telemetry = Arc::new(Telemetry::new(
            ledger.clone(),
            network.clone(),
            active.clone(),
            config.bandwidth_limit as u64,
        ));
        let node = Arc::new(Node {
            params,
            config,
            flags,
            stats,
            store,
            ledger,
            network,
            write_queue,
            unchecked,
            checker,
            history,
            generator,
            final_generator,
            online_reps,
            rep_crawler,
            active,
            scheduler,
            block_processor,
            vote_processor,
            confirmation_height_processor,
            aggregator,
            gap_cache,
            telemetry,
            vote_uniquer,
            block_uniquer,
            stopped: AtomicBool::new(false),
            ongoing_thread: Mutex::new(None),
        });
        node.wire_observers();
        node
    }

    fn wire_observers(self: &Arc<Self>) {
        // Admitted blocks: republish, schedule an election, feed forks into
        // the container, remember gaps.
        let weak = Arc::downgrade(self);
        self.block_processor
            .processed
            .add(move |(block, result): &(Arc<Block>, ProcessResult)| {
                let node = match weak.upgrade() {
                    Some(node) => node,
                    None => return,
                };
                match result {
                    ProcessResult::Progress => {
                        if !node.flags.disable_block_processor_republishing {
                            node.network.flood_block(block, BufferDropPolicy::Limiter);
                        }
                        node.gap_cache.erase(&block.hash());
                        let txn = node.store.tx_begin_read();
                        if let Some(account) = node.ledger.account(&txn, &block.hash()) {
                            node.scheduler.activate(&account, &txn);
                        }
                    }
                    ProcessResult::Fork => {
                        node.active.publish(block);
                    }
                    ProcessResult::GapPrevious => {
                        node.gap_cache.add(block.previous());
                    }
                    ProcessResult::GapSource => {
                        let txn = node.store.tx_begin_read();
                        if let Some(source) = node.ledger.block_source(&txn, block) {
                            node.gap_cache.add(source);
                        }
                    }
                    _ => {}
                }
            });

        // Confirmed winners enter the cementation pipeline.
        let conf_height = self.confirmation_height_processor.clone();
        self.active
            .set_start_cementation(Arc::new(move |block| conf_height.add(block)));

        // Cemented blocks finish elections and pull successors in.
        let weak = Arc::downgrade(self);
        self.confirmation_height_processor
            .cemented_observers
            .add(move |block: &Arc<Block>| {
                let node = match weak.upgrade() {
                    Some(node) => node,
                    None => return,
                };
                node.active.block_cemented_callback(block);
                let txn = node.store.tx_begin_read();
                if let Some(account) = node.ledger.account(&txn, &block.hash()) {
                    node.scheduler.activate(&account, &txn);
                }
                // A cemented send frees its destination to cement too.
                if let Some(destination) = node.ledger.block_destination(&txn, block) {
                    if !destination.is_zero() && node.store.account.exists(&txn, &destination) {
                        node.scheduler.activate(&destination, &txn);
                    }
                }
            });
        let weak = Arc::downgrade(self);
        self.confirmation_height_processor
            .already_cemented_observers
            .add(move |hash: &BlockHash| {
                let node = match weak.upgrade() {
                    Some(node) => node,
                    None => return,
                };
                let block = {
                    let txn = node.store.tx_begin_read();
                    node.store.block.get(&txn, hash).map(|stored| stored.block)
                };
                if let Some(block) = block {
                    node.active.block_cemented_callback(&block);
                }
            });

        // Locally generated votes flood out and count locally.
        for generator in [&self.generator, &self.final_generator] {
            let weak = Arc::downgrade(self);
            generator.set_broadcast_action(Arc::new(move |vote: Arc<Vote>| {
                let node = match weak.upgrade() {
                    Some(node) => node,
                    None => return,
                };
                node.network.flood_vote(&vote, 2.0);
                node.vote_processor.vote(vote, None);
            }));
        }

        // Votes for missing blocks feed the gap cache.
        let weak = Arc::downgrade(self);
        self.vote_processor
            .vote_processed
            .add(move |(vote, _code): &(Arc<Vote>, crate::active_elections::VoteCode)| {
                if let Some(node) = weak.upgrade() {
                    node.gap_cache.vote(vote);
                }
            });

        // Realtime messages.
        let weak = Arc::downgrade(self);
        self.network
            .set_inbound(Arc::new(move |message, channel| {
                if let Some(node) = weak.upgrade() {
                    node.inbound(message, channel);
                }
            }));
        let weak = Arc::downgrade(self);
        self.network
            .set_channel_observer(Arc::new(move |channel: Arc<dyn Channel>| {
                if let Some(node) = weak.upgrade() {
                    let message = Message::Keepalive {
                        peers: node.network.random_fill(),
                    };
                    channel.send(&message, BufferDropPolicy::Limiter);
                }
            }));
    }

    fn inbound(self: &Arc<Self>, message: Message, channel: Arc<dyn Channel>) {
        match message {
            Message::Keepalive { peers } => {
                self.stats.inc(StatType::Message, DetailType::Keepalive);
                self.network.merge_peers(&peers);
            }
            Message::Publish { block, digest } => {
                self.stats.inc(StatType::Message, DetailType::Publish);
                if self.block_processor.full() {
                    // Back off; let the peer retry after the filter ages out.
                    self.network.publish_filter.clear(digest);
                    self.stats.inc(StatType::Drop, DetailType::Publish);
                } else {
                    self.block_processor.add(self.block_uniquer.unique(&block));
                }
            }
            Message::ConfirmReq {
                block,
                roots_hashes,
            } => {
                self.stats.inc(StatType::Message, DetailType::ConfirmReq);
                let pairs = match block {
                    Some(block) => vec![(block.hash(), block.root())],
                    None => roots_hashes,
                };
                if !pairs.is_empty() {
                    self.aggregator.add(channel, &pairs);
                }
            }
            Message::ConfirmAck { vote } => {
                self.stats.inc(StatType::Message, DetailType::ConfirmAck);
                if !self.flags.disable_vote_processor && !vote.hashes.is_empty() {
                    self.vote_processor
                        .vote(self.vote_uniquer.unique(&vote), Some(channel));
                }
            }
            Message::TelemetryReq => {
                self.stats.inc(StatType::Message, DetailType::Telemetry);
                let data = self.telemetry.local_telemetry_data();
                channel.send(
                    &Message::TelemetryAck(data),
                    BufferDropPolicy::NoSocketDrop,
                );
            }
            Message::TelemetryAck(data) => {
                self.stats.inc(StatType::Message, DetailType::Telemetry);
                if !data.validate_signature() {
                    self.stats.inc(StatType::Drop, DetailType::Telemetry);
                }
            }
            // The streaming bootstrap surfaces are outside the core.
            Message::BulkPull { .. }
            | Message::BulkPullAccount { .. }
            | Message::BulkPush
            | Message::FrontierReq { .. }
            | Message::NodeIdHandshake { .. } => {}
        }
    }

    /// Bind the listener and start housekeeping.
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        if !self.flags.disable_tcp_realtime {
            self.network.start()?;
            // Reach out to peers remembered from the previous run.
            let stored_peers: Vec<_> = {
                let txn = self.store.tx_begin_read();
                self.store.peer.iter(&txn).collect()
            };
            self.network.merge_peers(&stored_peers);
        }
        info!(
            target: "node",
            "node {:?} starting on port {}",
            self.network.node_id().public_key(),
            self.network.port()
        );
        if !self.flags.disable_ongoing_tasks {
            let weak = Arc::downgrade(self);
            let interval = self.params.node.weight_sample_interval;
            let handle = std::thread::Builder::new()
                .name("ongoing".to_string())
                .spawn(move || loop {
                    std::thread::sleep(interval);
                    let node = match weak.upgrade() {
                        Some(node) => node,
                        None => break,
                    };
                    if node.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    node.ongoing_tasks();
                })
                .expect("ongoing thread spawn");
            *self.ongoing_thread.lock() = Some(handle);
        }
        Ok(())
    }

    fn ongoing_tasks(&self) {
        self.online_reps.sample();
        self.network.flood_keepalive();
        let now = Instant::now();
        self.network.cleanup(
            now - self.params.network.idle_cutoff,
            now - self.params.network.syn_cookie_cutoff,
        );
        let channels = &self.network.channels;
        self.rep_crawler
            .purge(|channel| channels.find(&channel.endpoint()).is_some());
        // Persist the realtime peer set for the next start.
        {
            let guard = self.write_queue.wait(crate::write_queue::Writer::Pruning);
            let txn = self.store.tx_begin_write();
            for channel in self.network.channels.all() {
                self.store
                    .peer
                    .put(&txn, &lattice_network::endpoint_key(&channel.endpoint()));
            }
            drop(txn);
            guard.release();
        }
        // Drop staged blocks whose dependency never arrived.
        {
            let cutoff = lattice_types::utils::seconds_since_epoch()
                .saturating_sub(UNCHECKED_CUTOFF_SECONDS);
            let stale: Vec<_> = {
                let txn = self.store.tx_begin_read();
                self.store
                    .unchecked
                    .iter(&txn)
                    .filter(|(_, info)| info.modified < cutoff)
                    .map(|(key, _)| key)
                    .collect()
            };
            if !stale.is_empty() {
                let guard = self.write_queue.wait(crate::write_queue::Writer::Pruning);
                let txn = self.store.tx_begin_write();
                for key in stale {
                    self.store.unchecked.del(&txn, &key);
                }
                drop(txn);
                guard.release();
            }
        }
        // Nudge stalled cementation backlog.
        let txn = self.store.tx_begin_read();
        for info in self.ledger.unconfirmed_frontiers(&txn).into_iter().take(16) {
            self.scheduler.activate(&info.account, &txn);
        }
    }

    /// Submit a block as if it arrived from the network.
    pub fn process_active(&self, block: Arc<Block>) {
        self.block_processor.add(block);
    }

    /// Synchronously admit a block, bypassing the queues; test and local
    /// wallet paths.
    pub fn process_local(&self, block: Arc<Block>) -> ProcessResult {
        let guard = self
            .write_queue
            .wait(crate::write_queue::Writer::Testing);
        let result = {
            let txn = self.store.tx_begin_write();
            self.ledger
                .process(&txn, &block, lattice_types::SignatureVerification::Unknown)
        };
        guard.release();
        if result == ProcessResult::Progress {
            let txn = self.store.tx_begin_read();
            if let Some(account) = self.ledger.account(&txn, &block.hash()) {
                self.scheduler.activate(&account, &txn);
            }
        }
        result
    }

    pub fn block_confirmed(&self, hash: &BlockHash) -> bool {
        let txn = self.store.tx_begin_read();
        self.ledger.block_confirmed(&txn, hash)
    }

    /// Stop every component, reverse start order, and join all threads.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "node", "node stopping");
        if let Some(handle) = self.ongoing_thread.lock().take() {
            let _ = handle.join();
        }
        self.aggregator.stop();
        self.scheduler.stop();
        self.active.stop();
        self.confirmation_height_processor.stop();
        self.vote_processor.stop();
        self.block_processor.stop();
        self.generator.stop();
        self.final_generator.stop();
        self.unchecked.stop();
        self.network.stop();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}
