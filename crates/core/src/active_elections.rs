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

//! The election container.
//!
//! Owns every live election, routes incoming votes by hash, remembers
//! recently confirmed roots to classify replays, caches votes that arrive
//! ahead of their block, and drives the periodic request loop that
//! broadcasts winners and solicits missing representatives.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use log::debug;
use parking_lot::{Condvar, Mutex};

use lattice_network::Network;
use lattice_types::{Account, Block, BlockHash, NetworkParams, QualifiedRoot, Vote};

use crate::config::{NodeConfig, NodeFlags};
use crate::confirmation_solicitor::ConfirmationSolicitor;
use crate::election::{Election, ElectionStatus, ElectionStatusType};
use crate::ledger::Ledger;
use crate::observer_set::ObserverSet;
use crate::online_reps::OnlineReps;
use crate::rep_crawler::RepCrawler;
use crate::stats::{DetailType, StatType, Stats};
use crate::voting::VoteGenerator;
use crate::write_queue::WriteQueue;

const RECENTLY_CONFIRMED_SIZE: usize = 65536;
const RECENTLY_CEMENTED_SIZE: usize = 1024;
const INACTIVE_VOTES_CACHE_SIZE: usize = 16384;
const MAX_CACHED_VOTERS: usize = 40;
const REPRESENTATIVES_PER_ROUND: usize = 128;

/// Outcome of processing one vote message against the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteCode {
    /// At least one hash was processed by a live election.
    Vote,
    /// Every hash was old news.
    Replay,
    /// No election and no recent confirmation; cached for later.
    Indeterminate,
}

struct InactiveCacheInformation {
    arrival: Instant,
    voters: Vec<(Account, u64)>,
}

struct Inner {
    roots: HashMap<QualifiedRoot, Arc<Election>>,
    blocks: HashMap<BlockHash, Arc<Election>>,
}

type Cementation = dyn Fn(Arc<Block>) + Send + Sync;
type VacancyUpdate = dyn Fn() + Send + Sync;

pub struct ActiveElections {
    pub config: NodeConfig,
    params: NetworkParams,
    flags: NodeFlags,
    ledger: Arc<Ledger>,
    online_reps: Arc<OnlineReps>,
    write_queue: Arc<WriteQueue>,
    generator: Arc<VoteGenerator>,
    final_generator: Arc<VoteGenerator>,
    rep_crawler: Arc<RepCrawler>,
    network: Arc<Network>,
    stats: Arc<Stats>,
    mutex: Mutex<Inner>,
    condition: Condvar,
    stopped: AtomicBool,
    recently_confirmed: Mutex<VecDeque<(QualifiedRoot, BlockHash)>>,
    recently_cemented: Mutex<VecDeque<ElectionStatus>>,
    inactive_votes_cache: Mutex<HashMap<BlockHash, InactiveCacheInformation>>,
    election_winner_details: Mutex<HashMap<BlockHash, Arc<Election>>>,
    start_cementation: Mutex<Option<Arc<Cementation>>>,
    vacancy_update: Mutex<Option<Arc<VacancyUpdate>>>,
    /// Fired for every election that reaches its final (cemented) status.
    pub election_status_observers: ObserverSet<ElectionStatus>,
    weak_self: Mutex<Weak<ActiveElections>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ActiveElections {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: NodeConfig,
        params: NetworkParams,
        flags: NodeFlags,
        ledger: Arc<Ledger>,
        online_reps: Arc<OnlineReps>,
        write_queue: Arc<WriteQueue>,
        generator: Arc<VoteGenerator>,
        final_generator: Arc<VoteGenerator>,
        rep_crawler: Arc<RepCrawler>,
        network: Arc<Network>,
        stats: Arc<Stats>,
    ) -> Arc<Self> {
        let active = Arc::new(ActiveElections {
            config,
            params,
            flags,
            ledger,
            online_reps,
            write_queue,
            generator,
            final_generator,
            rep_crawler,
            network,
            stats,
            mutex: Mutex::new(Inner {
                roots: HashMap::new(),
                blocks: HashMap::new(),
            }),
            condition: Condvar::new(),
            stopped: AtomicBool::new(false),
            recently_confirmed: Mutex::new(VecDeque::new()),
            recently_cemented: Mutex::new(VecDeque::new()),
            inactive_votes_cache: Mutex::new(HashMap::new()),
            election_winner_details: Mutex::new(HashMap::new()),
            start_cementation: Mutex::new(None),
            vacancy_update: Mutex::new(None),
            election_status_observers: ObserverSet::default(),
            weak_self: Mutex::new(Weak::new()),
            thread: Mutex::new(None),
        });
        *active.weak_self.lock() = Arc::downgrade(&active);
        if !active.flags.disable_request_loop {
            let run = active.clone();
            let handle = std::thread::Builder::new()
                .name("request loop".to_string())
                .spawn(move || run.request_loop())
                .expect("request loop thread spawn");
            *active.thread.lock() = Some(handle);
        }
        active
    }

    /// Where confirmed winners go to be cemented; set by the node.
    pub fn set_start_cementation(&self, callback: Arc<Cementation>) {
        *self.start_cementation.lock() = Some(callback);
    }

    /// Notified whenever room for elections changes; set by the scheduler.
    pub fn set_vacancy_update(&self, callback: Arc<VacancyUpdate>) {
        *self.vacancy_update.lock() = Some(callback);
    }

    fn notify_vacancy(&self) {
        let callback = self.vacancy_update.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Free election slots; negative when overfilled.
    pub fn vacancy(&self) -> i64 {
        self.config.active_elections_size as i64 - self.mutex.lock().roots.len() as i64
    }

    pub fn len(&self) -> usize {
        self.mutex.lock().roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start an election for `block` unless one exists or the root was
    /// recently decided.
    pub fn insert(&self, block: &Arc<Block>) -> (bool, Option<Arc<Election>>) {
        if self.stopped.load(Ordering::SeqCst) {
            return (false, None);
        }
        let qualified_root = block.qualified_root();
        let hash = block.hash();
        let election = {
            let mut inner = self.mutex.lock();
            if let Some(existing) = inner.roots.get(&qualified_root) {
                return (false, Some(existing.clone()));
            }
            if self.recently_confirmed_by_root(&qualified_root) {
                return (false, None);
            }
            let weak = self.weak_self.lock().clone();
            let election = Election::new(
                block.clone(),
                self.ledger.clone(),
                self.online_reps.clone(),
                self.write_queue.clone(),
                self.generator.clone(),
                self.final_generator.clone(),
                self.stats.clone(),
                self.config.clone(),
                self.params.clone(),
                Box::new(move |status| {
                    if let Some(active) = weak.upgrade() {
                        active.election_confirmed(status);
                    }
                }),
            );
            inner.roots.insert(qualified_root, election.clone());
            inner.blocks.insert(hash, election.clone());
            election
        };
        self.stats.inc(StatType::Election, DetailType::ElectionStart);
        // Votes that arrived ahead of the block now count.
        let cached = self.inactive_votes_cache.lock().remove(&hash);
        if let Some(cached) = cached {
            for (account, timestamp) in cached.voters {
                election.vote(account, timestamp, hash);
            }
        }
        self.notify_vacancy();
        (true, Some(election))
    }

    /// Route a fork candidate into its election.
    pub fn publish(&self, block: &Arc<Block>) -> bool {
        let election = {
            let inner = self.mutex.lock();
            inner.roots.get(&block.qualified_root()).cloned()
        };
        match election {
            Some(election) => {
                if !election.publish(block.clone()) {
                    self.mutex
                        .lock()
                        .blocks
                        .insert(block.hash(), election.clone());
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Apply each hash of a vote to its election.
    pub fn vote(&self, vote: &Arc<Vote>) -> VoteCode {
        let mut processed = false;
        let mut replay = false;
        for hash in &vote.hashes {
            let election = { self.mutex.lock().blocks.get(hash).cloned() };
            match election {
                Some(election) => {
                    let result = election.vote(vote.account, vote.raw_timestamp(), *hash);
                    replay |= result.replay;
                    processed |= result.processed;
                }
                None => {
                    if self.recently_confirmed_by_hash(hash) {
                        replay = true;
                    } else {
                        self.add_inactive_vote(*hash, vote.account, vote.raw_timestamp());
                    }
                }
            }
        }
        if processed {
            VoteCode::Vote
        } else if replay {
            VoteCode::Replay
        } else {
            VoteCode::Indeterminate
        }
    }

    fn add_inactive_vote(&self, hash: BlockHash, account: Account, timestamp: u64) {
        let mut cache = self.inactive_votes_cache.lock();
        let entry = cache.entry(hash).or_insert_with(|| InactiveCacheInformation {
            arrival: Instant::now(),
            voters: Vec::new(),
        });
        if entry.voters.len() < MAX_CACHED_VOTERS
            && !entry.voters.iter().any(|(voter, _)| voter == &account)
        {
            entry.voters.push((account, timestamp));
        }
        if cache.len() > INACTIVE_VOTES_CACHE_SIZE {
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, info)| info.arrival)
                .map(|(hash, _)| *hash)
            {
                cache.remove(&oldest);
            }
        }
    }

    pub fn inactive_votes_cache_size(&self) -> usize {
        self.inactive_votes_cache.lock().len()
    }

    pub fn active_root(&self, root: &QualifiedRoot) -> bool {
        self.mutex.lock().roots.contains_key(root)
    }

    pub fn active_block(&self, hash: &BlockHash) -> bool {
        self.mutex.lock().blocks.contains_key(hash)
    }

    pub fn election(&self, root: &QualifiedRoot) -> Option<Arc<Election>> {
        self.mutex.lock().roots.get(root).cloned()
    }

    pub fn list_active(&self, count: usize) -> Vec<Arc<Election>> {
        self.mutex
            .lock()
            .roots
            .values()
            .take(count)
            .cloned()
            .collect()
    }

    pub fn erase(&self, election: &Arc<Election>) {
        let mut inner = self.mutex.lock();
        inner.roots.remove(&election.qualified_root);
        for hash in election.blocks().keys() {
            inner.blocks.remove(hash);
        }
        drop(inner);
        self.notify_vacancy();
    }

    pub fn erase_oldest(&self) {
        let oldest = {
            let inner = self.mutex.lock();
            inner.roots.values().next().cloned()
        };
        if let Some(election) = oldest {
            self.stats
                .inc(StatType::Election, DetailType::ElectionDropAll);
            self.erase(&election);
        }
    }

    pub fn recently_confirmed_by_root(&self, root: &QualifiedRoot) -> bool {
        self.recently_confirmed
            .lock()
            .iter()
            .any(|(confirmed_root, _)| confirmed_root == root)
    }

    pub fn recently_confirmed_by_hash(&self, hash: &BlockHash) -> bool {
        self.recently_confirmed
            .lock()
            .iter()
            .any(|(_, confirmed_hash)| confirmed_hash == hash)
    }

    pub fn recently_cemented(&self) -> Vec<ElectionStatus> {
        self.recently_cemented.lock().iter().cloned().collect()
    }

    /// Median work difficulty of recently decided winners, defaulting to the
    /// base threshold. A monotone signal of recent network work, for
    /// telemetry and prioritization only.
    pub fn active_difficulty(&self) -> u64 {
        let mut difficulties: Vec<u64> = self
            .recently_cemented
            .lock()
            .iter()
            .filter_map(|status| status.winner.as_ref())
            .map(|winner| {
                lattice_types::work_value(&winner.root(), winner.work())
            })
            .collect();
        if difficulties.is_empty() {
            return self
                .params
                .work
                .threshold_base(lattice_types::WorkVersion::Work1);
        }
        difficulties.sort_unstable();
        difficulties[difficulties.len() / 2]
    }

    // An election hit quorum: remember the root, hold the election for the
    // cementation callback and start cementing the winner.
    fn election_confirmed(&self, status: ElectionStatus) {
        let winner = match &status.winner {
            Some(winner) => winner.clone(),
            None => return,
        };
        let qualified_root = winner.qualified_root();
        {
            let mut recently = self.recently_confirmed.lock();
            recently.push_back((qualified_root, winner.hash()));
            while recently.len() > RECENTLY_CONFIRMED_SIZE {
                recently.pop_front();
            }
        }
        if let Some(election) = self.election(&qualified_root) {
            self.election_winner_details
                .lock()
                .insert(winner.hash(), election);
        }
        let cementation = self.start_cementation.lock().clone();
        if let Some(cementation) = cementation {
            cementation(winner);
        }
    }

    /// Called by the cementation pipeline for every cemented block.
    pub fn block_cemented_callback(&self, block: &Arc<Block>) {
        let election = self.election_winner_details.lock().remove(&block.hash());
        if let Some(election) = election {
            let status = election.current_status();
            {
                let mut cemented = self.recently_cemented.lock();
                cemented.push_back(status.clone());
                while cemented.len() > RECENTLY_CEMENTED_SIZE {
                    cemented.pop_front();
                }
            }
            self.erase(&election);
            self.election_status_observers.notify(&status);
        } else {
            // Cemented as a dependency, without its own election.
            let mut status = ElectionStatus::default();
            status.winner = Some(block.clone());
            status.status_type = ElectionStatusType::Ongoing;
            self.election_status_observers.notify(&status);
        }
        self.stats
            .inc(StatType::Election, DetailType::BlockConfirmed);
    }

    pub fn election_winner_details_len(&self) -> usize {
        self.election_winner_details.lock().len()
    }

    fn request_loop(&self) {
        while !self.stopped.load(Ordering::SeqCst) {
            let round_start = Instant::now();
            self.request_confirm();
            let elapsed = round_start.elapsed();
            let interval = self.params.network.request_interval;
            let mut guard = self.mutex.lock();
            if !self.stopped.load(Ordering::SeqCst) && elapsed < interval {
                self.condition
                    .wait_for(&mut guard, interval - elapsed);
            }
        }
    }

    fn request_confirm(&self) {
        let elections: Vec<Arc<Election>> =
            { self.mutex.lock().roots.values().cloned().collect() };
        let mut solicitor = ConfirmationSolicitor::new(&self.network, &self.config);
        solicitor.prepare(
            &self
                .rep_crawler
                .representatives(REPRESENTATIVES_PER_ROUND, self.config.vote_minimum),
        );
        let mut erased = 0usize;
        for election in &elections {
            if election.transition_time(&mut solicitor) {
                self.erase(election);
                erased += 1;
            }
        }
        solicitor.flush();
        if erased > 0 {
            debug!(target: "election", "request loop erased {} elections", erased);
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.condition.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        self.mutex.lock().roots.clear();
        self.mutex.lock().blocks.clear();
    }
}

impl Drop for ActiveElections {
    fn drop(&mut self) {
        self.stop();
    }
}
